pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{GraphError, QaflowError, Result};
pub use event::{EventBus, SessionEvents};
pub use types::*;

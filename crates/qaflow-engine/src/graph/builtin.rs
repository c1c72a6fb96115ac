//! Static graphs shipped with qaflow, used when no generated graph is
//! available or the generated one is rejected.

use super::node::{Node, RetryPolicy, Target};
use super::workflow::{GraphDescription, Phase};
use crate::steps::ACTION_STEP;

/// Objective family (and graph name) of the app-creation walkthrough.
pub const APP_CREATION: &str = "app-creation";

/// Nine QA phases of the app-creation flow, each driven by browser actions,
/// followed by a terminal wrap-up node.
pub fn app_creation() -> GraphDescription {
    let stages: [(&str, &str, &str, &str); 9] = [
        ("authentication_1", "Discovery", "execute_authentication_phase", "Sign in to the builder"),
        (
            "requirements_2",
            "Discovery",
            "answer_all_questions",
            "Answer the requirements questionnaire",
        ),
        (
            "discovery_validation_3",
            "Discovery",
            "validate_discovery_document",
            "Check the discovery document",
        ),
        (
            "wireframes_validation_4",
            "Wireframe",
            "validate_wireframes",
            "Check the generated wireframes",
        ),
        (
            "design_validation_5",
            "Specification",
            "validate_design_document",
            "Check the design specification",
        ),
        ("build_process_6", "Build", "monitor_build_process", "Wait for the build to finish"),
        ("test_validation_7", "Test", "validate_test_document", "Check the test report"),
        ("preview_app_8", "Deploy", "validate_app_preview", "Open and inspect the app preview"),
        ("final_confirmation_9", "Deploy", "final_confirmation", "Confirm the finished app"),
    ];

    let mut desc = GraphDescription::new(APP_CREATION, stages[0].0)
        .phase(Phase::new("Discovery", "Sign-in, requirements and discovery review"))
        .phase(Phase::new("Wireframe", "Wireframe review"))
        .phase(Phase::new("Specification", "Design document review"))
        .phase(Phase::new("Build", "Build monitoring"))
        .phase(Phase::new("Test", "Test report review"))
        .phase(Phase::new("Deploy", "Preview and final confirmation"));
    desc.description = "End-to-end validation of the app-creation workflow".to_string();

    let next_names = stages.iter().skip(1).map(|s| s.0).chain(["end_workflow"]);
    for ((name, phase, action, description), next) in stages.iter().zip(next_names) {
        desc = desc.node(
            Node::new(*name, *phase)
                .with_step(ACTION_STEP)
                .with_description(*description)
                .with_actions(&[*action])
                .with_retry(RetryPolicy::attempts(3).with_backoff(2000, 1.5))
                .then(Target::node(next)),
        );
    }

    desc.node(
        Node::new("end_workflow", "Deploy")
            .with_step(ACTION_STEP)
            .with_description("Close the browser session")
            .terminal(),
    )
}

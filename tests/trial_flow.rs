use std::sync::Arc;

use serde_json::json;

use dialogsim::domains::booking;
use dialogsim::providers::scripted::ScriptedResponse;
use dialogsim::{
    Actor, ExpectedAction, FirstSpeaker, GroundTruth, ScriptedActor, Sender, Task,
    TerminationReason, TrialRunner,
};

fn registry() -> Arc<dialogsim::ToolRegistry> {
    Arc::new(booking::domain().unwrap().registry)
}

fn cancel_task() -> Task {
    Task {
        id: "booking-cancel-r1".to_string(),
        description: None,
        initial_state: booking::sample_state(),
        persona: "direct business traveller".to_string(),
        scenario: "cancel reservation R1, refund to the original card".to_string(),
        first_speaker: FirstSpeaker::User,
        max_steps: 30,
        ground_truth: GroundTruth {
            expected_actions: vec![ExpectedAction {
                name: "cancel_reservation".to_string(),
                arguments: json!({"reservation_id": "R1", "refund_to": "original_payment"}),
            }],
            forbidden_tools: Vec::new(),
            communicate_facts: vec!["5-7 business days".to_string()],
        },
    }
}

fn bag_task() -> Task {
    Task {
        id: "booking-remove-bag".to_string(),
        description: None,
        initial_state: booking::sample_state(),
        persona: "persistent customer".to_string(),
        scenario: "get a checked bag removed from R2".to_string(),
        first_speaker: FirstSpeaker::User,
        max_steps: 30,
        ground_truth: GroundTruth {
            expected_actions: Vec::new(),
            forbidden_tools: vec!["remove_baggage".to_string()],
            communicate_facts: vec!["cannot be removed".to_string()],
        },
    }
}

fn actor(side: Sender, script: Vec<ScriptedResponse>) -> Arc<dyn Actor> {
    Arc::new(ScriptedActor::new(side, script))
}

#[tokio::test]
async fn cancellation_flow_earns_full_reward() {
    let user = actor(
        Sender::User,
        vec![
            ScriptedResponse::text("Hi, I need to cancel reservation R1, booked yesterday."),
            ScriptedResponse::text("Back to my card, please."),
            ScriptedResponse::text("Perfect, thanks. ###STOP###"),
        ],
    );
    let agent = actor(
        Sender::Agent,
        vec![
            ScriptedResponse::text("Of course. Should the refund go to your original card or travel credit?"),
            ScriptedResponse::tool_call(
                "cancel_reservation",
                json!({"reservation_id": "R1", "refund_to": "original_payment"}),
            ),
            ScriptedResponse::text(
                "Done, R1 is cancelled. The refund reaches your card in 5-7 business days.",
            ),
        ],
    );

    let task = cancel_task();
    let results = TrialRunner::new(agent, user, registry())
        .run_trials(&task, 1, 1)
        .await;

    let result = &results[0];
    assert_eq!(result.termination, TerminationReason::UserStop);
    let reward = result.reward.as_ref().unwrap();
    assert_eq!(reward.reward, 1.0, "failures: {:?}", reward.failures);
    assert_eq!(
        result.final_state.data()["reservations"]["R1"]["status"],
        json!("cancelled")
    );
    assert_eq!(result.delta.changes.len(), 2); // status + refund_to
}

#[tokio::test]
async fn skipping_the_required_action_fails_the_action_check() {
    // The agent claims success without ever calling the tool.
    let user = actor(
        Sender::User,
        vec![
            ScriptedResponse::text("Cancel R1 please, refund to my card."),
            ScriptedResponse::text("Thanks. ###STOP###"),
        ],
    );
    let agent = actor(
        Sender::Agent,
        vec![ScriptedResponse::text(
            "All sorted! The refund reaches your card in 5-7 business days.",
        )],
    );

    let task = cancel_task();
    let results = TrialRunner::new(agent, user, registry())
        .run_trials(&task, 1, 1)
        .await;

    let reward = results[0].reward.as_ref().unwrap();
    assert_eq!(reward.action.score, 0.0);
    assert!(!reward.action.calls_matched);
    assert!((reward.reward - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn policy_breaking_tool_use_is_penalized() {
    let user = actor(
        Sender::User,
        vec![
            ScriptedResponse::text("Please remove one checked bag from R2."),
            ScriptedResponse::text("OK. ###STOP###"),
        ],
    );
    let agent = actor(
        Sender::Agent,
        vec![
            ScriptedResponse::tool_call("remove_baggage", json!({"reservation_id": "R2"})),
            ScriptedResponse::text("Done, the bags are removed."),
        ],
    );

    let task = bag_task();
    let results = TrialRunner::new(agent, user, registry())
        .run_trials(&task, 1, 1)
        .await;

    let reward = results[0].reward.as_ref().unwrap();
    assert_eq!(reward.action.score, 0.0);
    assert_eq!(reward.action.forbidden_called, vec!["remove_baggage".to_string()]);
    assert!(reward.reward < 0.5);
}

#[tokio::test]
async fn refusing_with_an_explanation_earns_full_reward() {
    let user = actor(
        Sender::User,
        vec![
            ScriptedResponse::text("Please remove one checked bag from R2."),
            ScriptedResponse::text("Fine, I understand. ###STOP###"),
        ],
    );
    let agent = actor(
        Sender::Agent,
        vec![ScriptedResponse::text(
            "I'm sorry, but checked bags cannot be removed once a reservation is ticketed.",
        )],
    );

    let task = bag_task();
    let results = TrialRunner::new(agent, user, registry())
        .run_trials(&task, 1, 1)
        .await;

    let result = &results[0];
    let reward = result.reward.as_ref().unwrap();
    assert_eq!(reward.reward, 1.0, "failures: {:?}", reward.failures);
    // The environment was never touched.
    assert!(result.delta.is_empty());
}

#[tokio::test]
async fn protocol_violation_zeroes_the_reward() {
    let user = actor(
        Sender::User,
        vec![ScriptedResponse::text("Cancel R1 please.")],
    );
    let mixed = ScriptedResponse {
        content: Some("Cancelling now".to_string()),
        tool_calls: vec![(
            "cancel_reservation".to_string(),
            json!({"reservation_id": "R1", "refund_to": "original_payment"}),
        )],
    };
    let agent = actor(Sender::Agent, vec![mixed]);

    let task = cancel_task();
    let results = TrialRunner::new(agent, user, registry())
        .run_trials(&task, 1, 1)
        .await;

    let result = &results[0];
    assert_eq!(result.termination, TerminationReason::ProtocolViolation);
    assert_eq!(result.reward.as_ref().unwrap().reward, 0.0);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn concurrent_trials_stay_isolated() {
    let make_runner = || {
        let user = actor(
            Sender::User,
            vec![
                ScriptedResponse::text("Cancel R1, refund to my card."),
                ScriptedResponse::text("Thanks. ###STOP###"),
            ],
        );
        let agent = actor(
            Sender::Agent,
            vec![
                ScriptedResponse::tool_call(
                    "cancel_reservation",
                    json!({"reservation_id": "R1", "refund_to": "original_payment"}),
                ),
                ScriptedResponse::text("Cancelled; refund in 5-7 business days."),
            ],
        );
        TrialRunner::new(agent, user, registry())
    };

    let task = cancel_task();
    let concurrent = make_runner().run_trials(&task, 8, 4).await;
    let sequential = make_runner().run_trials(&task, 8, 1).await;

    assert_eq!(concurrent.len(), 8);
    for (a, b) in concurrent.iter().zip(&sequential) {
        assert_eq!(a.conversation, b.conversation);
        assert_eq!(a.final_state, b.final_state);
        assert_eq!(a.reward, b.reward);
    }
    // Each trial cancelled exactly its own copy of R1.
    for result in &concurrent {
        assert_eq!(
            result.final_state.data()["reservations"]["R1"]["status"],
            json!("cancelled")
        );
    }
}

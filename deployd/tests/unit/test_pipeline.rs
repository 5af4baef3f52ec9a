//! Pipeline FSM tests

use deployd::agent::pipeline::{PipelineEvent, PipelineFsm, PipelineState};
use deployd::errors::DeployError;
use deployd::protocol::Stage;

#[test]
fn test_fsm_initial_state() {
    let fsm = PipelineFsm::new();
    assert_eq!(fsm.state(), PipelineState::Idle);
    assert!(fsm.error().is_none());
    assert!(fsm.failed_stage().is_none());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = PipelineFsm::new();

    assert_eq!(fsm.process(PipelineEvent::Start).unwrap(), PipelineState::Cloning);
    assert_eq!(fsm.process(PipelineEvent::Cloned).unwrap(), PipelineState::Building);
    assert_eq!(fsm.process(PipelineEvent::Built).unwrap(), PipelineState::Swapping);
    assert_eq!(fsm.process(PipelineEvent::Swapped).unwrap(), PipelineState::Restarting);
    assert_eq!(fsm.process(PipelineEvent::Restarted).unwrap(), PipelineState::Done);
    assert!(fsm.state().is_terminal());
}

#[test]
fn test_fsm_out_of_order_is_rejected() {
    let mut fsm = PipelineFsm::new();

    let err = fsm.process(PipelineEvent::Built).unwrap_err();
    assert!(matches!(err, DeployError::StateError(_)));
    assert_eq!(fsm.state(), PipelineState::Idle);

    fsm.process(PipelineEvent::Start).unwrap();
    assert!(fsm.process(PipelineEvent::Swapped).is_err());
    assert_eq!(fsm.state(), PipelineState::Cloning);
}

#[test]
fn test_fsm_failure_attributes_stage() {
    let cases = [
        (0, Stage::Clone),
        (1, Stage::Clone),
        (2, Stage::Build),
        (3, Stage::Swap),
        (4, Stage::Restart),
    ];
    let steps = [
        PipelineEvent::Start,
        PipelineEvent::Cloned,
        PipelineEvent::Built,
        PipelineEvent::Swapped,
    ];

    for (advance, stage) in cases {
        let mut fsm = PipelineFsm::new();
        for step in steps.iter().take(advance) {
            fsm.process(step.clone()).unwrap();
        }
        fsm.process(PipelineEvent::Fail("boom".to_string())).unwrap();
        assert_eq!(fsm.state(), PipelineState::Failed);
        assert_eq!(fsm.failed_stage(), Some(stage), "after {} steps", advance);
        assert_eq!(fsm.error(), Some("boom"));
    }
}

#[test]
fn test_fsm_cancel_from_any_working_state() {
    let mut fsm = PipelineFsm::new();
    fsm.process(PipelineEvent::Start).unwrap();
    fsm.process(PipelineEvent::Cloned).unwrap();
    assert_eq!(fsm.process(PipelineEvent::Cancel).unwrap(), PipelineState::Cancelled);
}

#[test]
fn test_fsm_terminal_states_are_final() {
    let mut fsm = PipelineFsm::new();
    fsm.process(PipelineEvent::Cancel).unwrap();

    assert!(fsm.process(PipelineEvent::Start).is_err());
    assert!(fsm.process(PipelineEvent::Cancel).is_err());
    assert!(fsm.process(PipelineEvent::Fail("late".to_string())).is_err());
    assert_eq!(fsm.state(), PipelineState::Cancelled);
}

#[test]
fn test_state_display_matches_wire_name() {
    for state in [PipelineState::Building, PipelineState::Restarting, PipelineState::Done] {
        let wire = serde_json::to_string(&state).unwrap();
        assert_eq!(wire, format!("\"{}\"", state));
    }
}

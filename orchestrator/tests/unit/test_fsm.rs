//! Instance lifecycle state machine

use logfleet::deploy::fsm::{InstanceAction, InstanceEvent, InstanceState};
use logfleet::errors::OrchestratorError;

const STATES: [InstanceState; 7] = [
    InstanceState::NotStarted,
    InstanceState::Starting,
    InstanceState::Running,
    InstanceState::StartFailed,
    InstanceState::Stopping,
    InstanceState::StopFailed,
    InstanceState::Removed,
];

const EVENTS: [InstanceEvent; 8] = [
    InstanceEvent::StartRequested,
    InstanceEvent::StartSucceeded,
    InstanceEvent::StartFailed,
    InstanceEvent::StopRequested,
    InstanceEvent::StopSucceeded,
    InstanceEvent::StopFailed,
    InstanceEvent::ProcessDied,
    InstanceEvent::Removed,
];

#[test]
fn test_fsm_start_success_flow() {
    let state = InstanceState::NotStarted;
    let state = state.next(InstanceEvent::StartRequested).unwrap();
    assert_eq!(state, InstanceState::Starting);
    let state = state.next(InstanceEvent::StartSucceeded).unwrap();
    assert_eq!(state, InstanceState::Running);
}

#[test]
fn test_fsm_stop_failure_flow() {
    let state = InstanceState::Running
        .next(InstanceEvent::StopRequested)
        .unwrap()
        .next(InstanceEvent::StopFailed)
        .unwrap();
    assert_eq!(state, InstanceState::StopFailed);

    // The process may still be alive: start is allowed, restart is not
    assert!(state.can_start());
    assert!(!state.can_restart());
    assert!(!state.can_stop());
}

#[test]
fn test_fsm_every_transition_is_a_declared_edge() {
    let edges = [
        (InstanceState::NotStarted, InstanceEvent::StartRequested, InstanceState::Starting),
        (InstanceState::StartFailed, InstanceEvent::StartRequested, InstanceState::Starting),
        (InstanceState::StopFailed, InstanceEvent::StartRequested, InstanceState::Starting),
        (InstanceState::Starting, InstanceEvent::StartSucceeded, InstanceState::Running),
        (InstanceState::Starting, InstanceEvent::StartFailed, InstanceState::StartFailed),
        (InstanceState::Running, InstanceEvent::StopRequested, InstanceState::Stopping),
        (InstanceState::StartFailed, InstanceEvent::StopRequested, InstanceState::Stopping),
        (InstanceState::Stopping, InstanceEvent::StopSucceeded, InstanceState::NotStarted),
        (InstanceState::Stopping, InstanceEvent::StopFailed, InstanceState::StopFailed),
        (InstanceState::Running, InstanceEvent::ProcessDied, InstanceState::NotStarted),
        (InstanceState::NotStarted, InstanceEvent::Removed, InstanceState::Removed),
        (InstanceState::StartFailed, InstanceEvent::Removed, InstanceState::Removed),
        (InstanceState::StopFailed, InstanceEvent::Removed, InstanceState::Removed),
    ];

    for state in STATES {
        for event in EVENTS {
            let expected = edges
                .iter()
                .find(|(from, on, _)| *from == state && *on == event)
                .map(|(_, _, to)| *to);
            match (state.next(event), expected) {
                (Ok(next), Some(to)) => assert_eq!(next, to, "{:?} on {:?}", state, event),
                (Err(OrchestratorError::IllegalTransition { .. }), None) => {}
                (other, expected) => panic!(
                    "{:?} on {:?}: got {:?}, expected {:?}",
                    state, event, other, expected
                ),
            }
        }
    }
}

#[test]
fn test_fsm_delete_never_allowed_while_active() {
    for state in [
        InstanceState::Starting,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Removed,
    ] {
        assert!(!state.can_delete(), "{:?}", state);
        assert!(state.ensure(InstanceAction::Delete).is_err());
    }
}

#[test]
fn test_fsm_transitional_states_reject_every_action() {
    let actions = [
        InstanceAction::Start,
        InstanceAction::Stop,
        InstanceAction::Restart,
        InstanceAction::Delete,
        InstanceAction::UpdateConfig,
        InstanceAction::RefreshConfig,
    ];
    for state in [InstanceState::Starting, InstanceState::Stopping] {
        assert!(state.is_transitional());
        for action in actions {
            assert!(!state.allows(action), "{:?} allowed {:?}", state, action);
        }
    }
}

#[test]
fn test_fsm_illegal_transition_error_names_state() {
    let err = InstanceState::Running.ensure(InstanceAction::Delete).unwrap_err();
    assert_eq!(err.to_string(), "Illegal transition: cannot delete while RUNNING");
    assert!(err.is_validation());
}

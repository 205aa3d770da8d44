mod common;

use std::time::Duration;

use common::{mock, Call};
use deck_core::{CoordinatorError, FlightEvent, FlightState, FlightStateMachine};
use deck_proto::control::VelocityCommand;

fn fsm() -> FlightStateMachine {
    FlightStateMachine::new(Duration::from_secs(3))
}

#[tokio::test]
async fn entry_queues_zero_setpoint_before_switching() {
    let (mut link, vehicle) = mock();
    let mut fsm = fsm();

    fsm.handle(&mut link, FlightEvent::BecameInAir).await;
    assert_eq!(vehicle.calls(), vec![Call::Velocity(VelocityCommand::ZERO), Call::EnterOffboard]);
    assert_eq!(fsm.state(), FlightState::AirborneOffboard);

    fsm.enter_offboard(&mut link).await.unwrap();
    fsm.enter_offboard(&mut link).await.unwrap();
    assert_eq!(vehicle.count(&Call::EnterOffboard), 1);
}

#[tokio::test]
async fn refused_entry_leaves_manual_flight() {
    let (mut link, vehicle) = mock();
    let mut fsm = fsm();
    vehicle.fail("enter_offboard", 1);

    fsm.handle(&mut link, FlightEvent::BecameInAir).await;
    assert_eq!(fsm.state(), FlightState::AirborneManual);
    assert!(fsm.is_airborne());
    assert!(!fsm.offboard_active());

    // nothing to leave
    fsm.exit_offboard(&mut link).await.unwrap();
    assert_eq!(vehicle.count(&Call::ExitOffboard), 0);
}

#[tokio::test]
async fn entry_is_refused_on_the_ground() {
    let (mut link, vehicle) = mock();
    let mut fsm = fsm();

    let err = fsm.enter_offboard(&mut link).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::OffboardTransitionFailure(_)));
    assert!(vehicle.calls().is_empty());
}

#[tokio::test]
async fn grounding_exits_once_even_when_refused() {
    let (mut link, vehicle) = mock();
    let mut fsm = fsm();
    fsm.handle(&mut link, FlightEvent::BecameInAir).await;
    vehicle.fail("exit_offboard", 1);

    fsm.handle(&mut link, FlightEvent::BecameGrounded).await;
    assert_eq!(vehicle.count(&Call::ExitOffboard), 1);
    assert_eq!(fsm.state(), FlightState::Ground);

    fsm.handle(&mut link, FlightEvent::BecameGrounded).await;
    assert_eq!(vehicle.count(&Call::ExitOffboard), 1);
}

#[tokio::test]
async fn armed_edges_change_nothing() {
    let (mut link, vehicle) = mock();
    let mut fsm = fsm();
    fsm.handle(&mut link, FlightEvent::BecameArmed).await;
    fsm.handle(&mut link, FlightEvent::BecameDisarmed).await;
    assert_eq!(fsm.state(), FlightState::Ground);
    assert!(vehicle.calls().is_empty());
}

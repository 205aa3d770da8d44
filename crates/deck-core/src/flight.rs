//! Ground / airborne / offboard state machine.
//!
//! The offboard session is active exactly when the state is
//! [`FlightState::AirborneOffboard`]; nothing outside this module flips it.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use deck_link::VehicleLink;

use crate::error::CoordinatorError;
use crate::telemetry::FlightEvent;
use crate::within;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum FlightState {
    #[default]
    Ground,
    AirborneManual,
    AirborneOffboard,
}

impl FlightState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ground => "On Ground",
            Self::AirborneManual => "In Flight (manual)",
            Self::AirborneOffboard => "In Flight",
        }
    }
}

pub struct FlightStateMachine {
    state: FlightState,
    call_timeout: Duration,
}

impl FlightStateMachine {
    pub fn new(call_timeout: Duration) -> Self {
        Self { state: FlightState::Ground, call_timeout }
    }

    pub fn state(&self) -> FlightState {
        self.state
    }

    pub fn is_airborne(&self) -> bool {
        self.state != FlightState::Ground
    }

    pub fn offboard_active(&self) -> bool {
        self.state == FlightState::AirborneOffboard
    }

    /// Reacts to a telemetry edge. Armed edges are informational only.
    pub async fn handle(&mut self, link: &mut dyn VehicleLink, ev: FlightEvent) {
        match ev {
            FlightEvent::BecameInAir => self.on_airborne(link).await,
            FlightEvent::BecameGrounded => self.on_grounded(link).await,
            FlightEvent::BecameArmed | FlightEvent::BecameDisarmed => {}
        }
    }

    /// Ground → AirborneManual, then one offboard entry attempt.
    pub async fn on_airborne(&mut self, link: &mut dyn VehicleLink) {
        if self.state == FlightState::Ground {
            info!("flight: airborne");
            self.state = FlightState::AirborneManual;
        }
        if let Err(e) = self.enter_offboard(link).await {
            warn!("flight: {}; staying in manual until the next input", e);
        }
    }

    /// Back to Ground, closing the offboard session first. The session is
    /// dropped even if the vehicle refuses the exit.
    pub async fn on_grounded(&mut self, link: &mut dyn VehicleLink) {
        if let Err(e) = self.exit_offboard(link).await {
            warn!("flight: {} (ignored, vehicle is down)", e);
        }
        if self.state != FlightState::Ground {
            info!("flight: grounded");
        }
        self.state = FlightState::Ground;
    }

    /// Queues a zero setpoint, then requests offboard. No-op when active.
    pub async fn enter_offboard(&mut self, link: &mut dyn VehicleLink) -> Result<(), CoordinatorError> {
        if self.offboard_active() {
            return Ok(());
        }
        if !self.is_airborne() {
            return Err(CoordinatorError::OffboardTransitionFailure("vehicle is on the ground".into()));
        }
        within(self.call_timeout, link.send_zero_velocity())
            .await
            .map_err(|e| CoordinatorError::OffboardTransitionFailure(format!("initial setpoint: {:#}", e)))?;
        within(self.call_timeout, link.enter_offboard_mode())
            .await
            .map_err(|e| CoordinatorError::OffboardTransitionFailure(format!("enter: {:#}", e)))?;
        info!("flight: offboard active");
        self.state = FlightState::AirborneOffboard;
        Ok(())
    }

    /// Leaves offboard. No-op when not active; on failure the session stays active.
    pub async fn exit_offboard(&mut self, link: &mut dyn VehicleLink) -> Result<(), CoordinatorError> {
        if !self.offboard_active() {
            return Ok(());
        }
        within(self.call_timeout, link.exit_offboard_mode())
            .await
            .map_err(|e| CoordinatorError::OffboardTransitionFailure(format!("exit: {:#}", e)))?;
        info!("flight: offboard released");
        self.state = FlightState::AirborneManual;
        Ok(())
    }
}

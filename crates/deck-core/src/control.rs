use std::time::Duration;

use tracing::debug;

use deck_link::VehicleLink;
use deck_proto::control::{OperatorInput, VelocityCommand};

use crate::error::CoordinatorError;
use crate::flight::FlightStateMachine;
use crate::safety::SendRateLimit;
use crate::{within, ControlConfig};

/// What triggered a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Operator input changed; rate limited, may open offboard.
    Input,
    /// Periodic resend; opens offboard only for input still waiting to go out.
    Heartbeat,
}

/// Turns operator sticks into body-frame velocity setpoints.
pub struct ControlInputMapper {
    input: OperatorInput,
    k_linear: f32,
    k_vertical: f32,
    k_yaw: f32,
    limiter: SendRateLimit,
    call_timeout: Duration,
    // input changed since the last send or entry attempt
    pending: bool,
}

impl ControlInputMapper {
    pub fn new(cfg: &ControlConfig, call_timeout: Duration) -> Self {
        Self {
            input: OperatorInput::default(),
            k_linear: cfg.k_linear(),
            k_vertical: cfg.k_vertical(),
            k_yaw: cfg.k_yaw(),
            limiter: SendRateLimit::new(cfg.min_send_interval()),
            call_timeout,
            pending: false,
        }
    }

    pub fn input(&self) -> OperatorInput {
        self.input
    }

    /// Clamps and stores new sticks.
    pub fn update(&mut self, throttle: f32, yaw: f32, pitch: f32, roll: f32) -> OperatorInput {
        self.set(OperatorInput::clamped(throttle, yaw, pitch, roll))
    }

    /// Stores sticks that are already clamped.
    pub fn set(&mut self, input: OperatorInput) -> OperatorInput {
        self.input = input;
        self.pending = true;
        input
    }

    pub fn reset(&mut self) {
        self.set(OperatorInput::default());
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Treats the current input as handled, e.g. after an edge-driven entry attempt.
    pub fn clear_pending(&mut self) {
        self.pending = false;
    }

    pub fn command(&self) -> VelocityCommand {
        let i = self.input;
        VelocityCommand {
            forward_mps: i.pitch * self.k_linear,
            right_mps: i.roll * self.k_linear,
            down_mps: -i.throttle * self.k_vertical,
            yaw_rate_dps: i.yaw * self.k_yaw,
        }
    }

    /// Sends the current command if the vehicle is in the air and the state
    /// machine agrees. Opens offboard first when needed; a refused entry
    /// aborts this attempt. Ok(true) when a command went out.
    pub async fn push(
        &mut self,
        fsm: &mut FlightStateMachine,
        link: &mut dyn VehicleLink,
        in_air: bool,
        why: Push,
    ) -> Result<bool, CoordinatorError> {
        if !in_air || !fsm.is_airborne() {
            return Ok(false);
        }
        match why {
            Push::Input => {
                if !self.limiter.allow() {
                    return Ok(false);
                }
            }
            Push::Heartbeat => {
                if !fsm.offboard_active() && !self.pending {
                    return Ok(false);
                }
                self.limiter.stamp();
            }
        }
        if !fsm.offboard_active() {
            self.pending = false;
            fsm.enter_offboard(link).await?;
        }

        let cmd = self.command();
        self.pending = false;
        within(self.call_timeout, link.send_body_velocity(cmd))
            .await
            .map_err(|e| CoordinatorError::CommandSendFailure(format!("{:#}", e)))?;
        if cmd.is_significant() {
            debug!("control: sent {:?}", cmd);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> ControlInputMapper {
        ControlInputMapper::new(&ControlConfig::default(), Duration::from_secs(3))
    }

    #[test]
    fn conversion_law() {
        let mut m = mapper();
        m.update(0.5, 1.0, 0.2, -0.3);
        let c = m.command();
        assert!((c.forward_mps - 0.6).abs() < 1e-6);
        assert!((c.right_mps + 0.9).abs() < 1e-6);
        assert!((c.down_mps + 1.0).abs() < 1e-6);
        assert!((c.yaw_rate_dps - 60.0).abs() < 1e-6);
    }

    #[test]
    fn stored_input_is_saturated() {
        let mut m = mapper();
        let i = m.update(4.0, -1.5, 0.3, -0.99);
        assert_eq!(i, OperatorInput { throttle: 1.0, yaw: -1.0, pitch: 0.3, roll: -0.99 });
        assert_eq!(m.command().down_mps, -2.0);
        assert!(m.has_pending());
    }

    #[test]
    fn reset_centres_sticks() {
        let mut m = mapper();
        m.update(1.0, 1.0, 1.0, 1.0);
        m.reset();
        assert_eq!(m.command(), VelocityCommand::ZERO);
    }
}

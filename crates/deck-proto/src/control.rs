use serde::{Deserialize, Serialize};

/// Normalized operator sticks, each axis in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorInput {
    pub throttle: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl OperatorInput {
    /// Saturates every axis into [-1, 1]. NaN collapses to 0.
    pub fn clamped(throttle: f32, yaw: f32, pitch: f32, roll: f32) -> Self {
        Self {
            throttle: clamp_axis(throttle),
            yaw: clamp_axis(yaw),
            pitch: clamp_axis(pitch),
            roll: clamp_axis(roll),
        }
    }
}

fn clamp_axis(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) }
}

/// Body-frame velocity setpoint (forward / right / down + yaw rate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub forward_mps: f32,
    pub right_mps: f32,
    pub down_mps: f32,
    pub yaw_rate_dps: f32,
}

impl VelocityCommand {
    pub const ZERO: Self = Self { forward_mps: 0.0, right_mps: 0.0, down_mps: 0.0, yaw_rate_dps: 0.0 };

    pub fn is_significant(&self) -> bool {
        self.forward_mps.abs() > 0.1
            || self.right_mps.abs() > 0.1
            || self.down_mps.abs() > 0.1
            || self.yaw_rate_dps.abs() > 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axes_saturate() {
        let i = OperatorInput::clamped(1.7, -3.0, 0.25, f32::NAN);
        assert_eq!(i, OperatorInput { throttle: 1.0, yaw: -1.0, pitch: 0.25, roll: 0.0 });
    }
}

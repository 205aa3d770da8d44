//! Flight-control coordinator: telemetry aggregation, the flight/offboard
//! state machine and the operator-input control loop, driven from one task
//! that owns the vehicle link.

pub mod control;
pub mod coordinator;
pub mod error;
pub mod flight;
pub mod safety;
pub mod telemetry;

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

pub use control::ControlInputMapper;
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::CoordinatorError;
pub use flight::{FlightState, FlightStateMachine};
pub use telemetry::{FlightEvent, StateCell, TelemetryAggregator};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub flight: FlightConfig,
    pub control: ControlConfig,
}

impl CoordinatorConfig {
    /// Static sanity checks, used by `deck doctor`.
    pub fn check(&self) -> anyhow::Result<()> {
        let (f, c) = (&self.flight, &self.control);
        anyhow::ensure!(f.takeoff_altitude_m() > 0.0, "flight.takeoff_altitude_m must be > 0");
        anyhow::ensure!(
            f.airborne_altitude_m() > 0.0 && f.airborne_altitude_m() < f.takeoff_altitude_m(),
            "flight.airborne_altitude_m must be between 0 and takeoff_altitude_m"
        );
        anyhow::ensure!(!f.call_timeout().is_zero(), "flight.call_timeout_ms must be > 0");
        anyhow::ensure!(f.takeoff_grace() >= f.call_timeout(), "flight.takeoff_grace_ms shorter than call_timeout_ms");
        for (name, k) in [("k_linear", c.k_linear()), ("k_vertical", c.k_vertical()), ("k_yaw", c.k_yaw())] {
            anyhow::ensure!(k.is_finite() && k > 0.0, "control.{} must be > 0", name);
        }
        anyhow::ensure!(
            c.resend_period() >= c.min_send_interval(),
            "control.resend_hz above control.max_rate_hz"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlightConfig {
    /// Altitude requested before takeoff. Default 5 m.
    pub takeoff_altitude_m: Option<f32>,

    /// How long takeoff waits for the in-air edge. Default 8000 ms.
    pub takeoff_grace_ms: Option<u64>,

    /// Relative altitude above which a missing in-air edge is overridden. Default 2 m.
    pub airborne_altitude_m: Option<f32>,

    /// Bound on every single link call. Default 3000 ms.
    pub call_timeout_ms: Option<u64>,

    /// Bound on connect, covering both opening and the first link-up report. Default 30000 ms.
    pub connect_timeout_ms: Option<u64>,
}

impl FlightConfig {
    pub fn takeoff_altitude_m(&self) -> f32 { self.takeoff_altitude_m.unwrap_or(5.0) }
    pub fn takeoff_grace(&self) -> Duration { Duration::from_millis(self.takeoff_grace_ms.unwrap_or(8000)) }
    pub fn airborne_altitude_m(&self) -> f32 { self.airborne_altitude_m.unwrap_or(2.0) }
    pub fn call_timeout(&self) -> Duration { Duration::from_millis(self.call_timeout_ms.unwrap_or(3000)) }
    pub fn connect_timeout(&self) -> Duration { Duration::from_millis(self.connect_timeout_ms.unwrap_or(30_000)) }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlConfig {
    /// m/s at full pitch/roll deflection. Default 3.
    pub k_linear: Option<f32>,
    /// m/s at full throttle. Default 2.
    pub k_vertical: Option<f32>,
    /// deg/s at full yaw. Default 60.
    pub k_yaw: Option<f32>,

    /// Setpoint resend rate while in the air. Default 5 Hz.
    pub resend_hz: Option<f32>,

    /// Upper bound on input-driven sends. Default 20 Hz.
    pub max_rate_hz: Option<f32>,
}

impl ControlConfig {
    pub fn k_linear(&self) -> f32 { self.k_linear.unwrap_or(3.0) }
    pub fn k_vertical(&self) -> f32 { self.k_vertical.unwrap_or(2.0) }
    pub fn k_yaw(&self) -> f32 { self.k_yaw.unwrap_or(60.0) }
    pub fn resend_period(&self) -> Duration { period(self.resend_hz.unwrap_or(5.0)) }
    pub fn min_send_interval(&self) -> Duration { period(self.max_rate_hz.unwrap_or(20.0)) }
}

fn period(hz: f32) -> Duration {
    Duration::from_micros((1_000_000.0 / hz.clamp(0.1, 1000.0)) as u64)
}

/// Runs one link call under `limit`. An expired call reads as an ordinary failure.
pub(crate) async fn within<T>(limit: Duration, call: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(r) => r,
        Err(_) => Err(anyhow::anyhow!("timed out after {:?}", limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_take_defaults() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.flight.takeoff_grace(), Duration::from_secs(8));
        assert_eq!(cfg.flight.airborne_altitude_m(), 2.0);
        assert_eq!(cfg.control.resend_period(), Duration::from_millis(200));
        assert_eq!(cfg.control.min_send_interval(), Duration::from_millis(50));
    }

    #[test]
    fn check_catches_inverted_thresholds() {
        assert!(CoordinatorConfig::default().check().is_ok());
        let mut cfg = CoordinatorConfig::default();
        cfg.flight.airborne_altitude_m = Some(6.0);
        assert!(cfg.check().is_err());
        let mut cfg = CoordinatorConfig::default();
        cfg.control.resend_hz = Some(50.0);
        assert!(cfg.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_call_times_out() {
        let r: anyhow::Result<()> = within(Duration::from_secs(3), std::future::pending()).await;
        assert_eq!(r.unwrap_err().to_string(), "timed out after 3s");
    }
}

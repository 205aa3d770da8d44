//! In-process multirotor for bench runs and tests.
//!
//! Kinematics only: takeoff climbs at a fixed rate to the requested altitude,
//! offboard integrates the body-frame velocity setpoint, landing descends and
//! disarms on touchdown. Like a real autopilot it refuses offboard without a
//! fresh setpoint stream and drops back to hold when the stream stalls.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use deck_proto::control::VelocityCommand;
use deck_proto::telemetry::{AttitudeEuler, BatteryUpdate, ConnectionEvent, GpsInfo, PositionUpdate};

use crate::{LinkConfig, TelemetryFeeds, Topic, VehicleLink};

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const IN_AIR_ALT_M: f32 = 0.2;
// tilt per m/s of commanded body velocity
const TILT_RAD_PER_MPS: f32 = 0.08;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub home_lat: f64,
    pub home_lon: f64,
    pub step: Duration,
    pub climb_mps: f32,
    pub descent_mps: f32,
    /// Offboard is refused / abandoned without a setpoint this recent.
    pub setpoint_timeout: Duration,
    /// Battery fraction drained per armed second.
    pub drain_per_s: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            home_lat: 47.397742,
            home_lon: 8.545594,
            step: Duration::from_millis(50),
            climb_mps: 1.5,
            descent_mps: 1.0,
            setpoint_timeout: Duration::from_secs(1),
            drain_per_s: 0.0005,
        }
    }
}

impl SimConfig {
    pub fn from_link(cfg: &LinkConfig) -> Self {
        let d = Self::default();
        Self {
            home_lat: cfg.sim_home_lat.unwrap_or(d.home_lat),
            home_lon: cfg.sim_home_lon.unwrap_or(d.home_lon),
            ..d
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ground,
    TakingOff,
    Hold,
    Offboard,
    Landing,
}

#[derive(Debug, Clone)]
struct Body {
    connected: bool,
    armed: bool,
    phase: Phase,
    north_m: f64,
    east_m: f64,
    alt_m: f32,
    yaw_rad: f32,
    roll_rad: f32,
    pitch_rad: f32,
    battery: f32,
    takeoff_alt_m: f32,
    setpoint: VelocityCommand,
    setpoint_at: Option<Instant>,
}

impl Body {
    fn new() -> Self {
        Self {
            connected: false,
            armed: false,
            phase: Phase::Ground,
            north_m: 0.0,
            east_m: 0.0,
            alt_m: 0.0,
            yaw_rad: 0.0,
            roll_rad: 0.0,
            pitch_rad: 0.0,
            battery: 1.0,
            takeoff_alt_m: 2.5,
            setpoint: VelocityCommand::ZERO,
            setpoint_at: None,
        }
    }

    fn in_air(&self) -> bool {
        self.phase != Phase::Ground && self.alt_m > IN_AIR_ALT_M
    }

    fn setpoint_fresh(&self, timeout: Duration) -> bool {
        self.setpoint_at.map(|t| t.elapsed() <= timeout).unwrap_or(false)
    }

    fn step(&mut self, cfg: &SimConfig, dt: f32) {
        let (mut tilt_pitch, mut tilt_roll) = (0.0, 0.0);
        match self.phase {
            Phase::Ground => self.alt_m = 0.0,
            Phase::TakingOff => {
                self.alt_m += cfg.climb_mps * dt;
                if self.alt_m >= self.takeoff_alt_m {
                    self.alt_m = self.takeoff_alt_m;
                    self.phase = Phase::Hold;
                }
            }
            Phase::Hold => {}
            Phase::Offboard => {
                if !self.setpoint_fresh(cfg.setpoint_timeout) {
                    warn!("sim: setpoint stream lost, falling back to hold");
                    self.phase = Phase::Hold;
                } else {
                    let sp = self.setpoint;
                    self.yaw_rad = wrap_pi(self.yaw_rad + sp.yaw_rate_dps.to_radians() * dt);
                    let (s, c) = self.yaw_rad.sin_cos();
                    self.north_m += ((sp.forward_mps * c - sp.right_mps * s) * dt) as f64;
                    self.east_m += ((sp.forward_mps * s + sp.right_mps * c) * dt) as f64;
                    self.alt_m -= sp.down_mps * dt;
                    tilt_pitch = -sp.forward_mps * TILT_RAD_PER_MPS;
                    tilt_roll = sp.right_mps * TILT_RAD_PER_MPS;
                    if self.alt_m <= 0.0 {
                        info!("sim: touched down under offboard control");
                        self.alt_m = 0.0;
                        self.phase = Phase::Ground;
                    }
                }
            }
            Phase::Landing => {
                self.alt_m -= cfg.descent_mps * dt;
                if self.alt_m <= 0.0 {
                    info!("sim: landed, disarming");
                    self.alt_m = 0.0;
                    self.phase = Phase::Ground;
                    self.armed = false;
                }
            }
        }
        self.pitch_rad = tilt_pitch;
        self.roll_rad = tilt_roll;
        if self.armed {
            self.battery = (self.battery - cfg.drain_per_s * dt).max(0.0);
        }
    }

    fn publish(&self, cfg: &SimConfig, feeds: &TelemetryFeeds) {
        let lat = cfg.home_lat + self.north_m / METERS_PER_DEG_LAT;
        let lon = cfg.home_lon + self.east_m / (METERS_PER_DEG_LAT * cfg.home_lat.to_radians().cos());
        feeds.armed.publish(self.armed);
        feeds.in_air.publish(self.in_air());
        feeds.position.publish(PositionUpdate { lat_deg: lat, lon_deg: lon, rel_alt_m: self.alt_m });
        feeds.attitude.publish(AttitudeEuler { roll_rad: self.roll_rad, pitch_rad: self.pitch_rad, yaw_rad: self.yaw_rad });
        feeds.battery.publish(BatteryUpdate { remaining_fraction: self.battery });
        feeds.gps.publish(GpsInfo { fix_type: 3, num_satellites: 12 });
    }
}

fn wrap_pi(a: f32) -> f32 {
    let two_pi = std::f32::consts::TAU;
    let mut a = a % two_pi;
    if a > std::f32::consts::PI { a -= two_pi; }
    if a < -std::f32::consts::PI { a += two_pi; }
    a
}

/// Simulated [`VehicleLink`].
pub struct SimVehicle {
    cfg: SimConfig,
    feeds: Arc<TelemetryFeeds>,
    body: Arc<Mutex<Body>>,
    ticker: Option<JoinHandle<()>>,
}

impl SimVehicle {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            cfg,
            feeds: Arc::new(TelemetryFeeds::new()),
            body: Arc::new(Mutex::new(Body::new())),
            ticker: None,
        }
    }

    fn body(&self) -> Result<MutexGuard<'_, Body>> {
        let b = self.body.lock().map_err(|_| anyhow::anyhow!("sim: state lock poisoned"))?;
        anyhow::ensure!(b.connected, "vehicle not connected");
        Ok(b)
    }
}

impl Drop for SimVehicle {
    fn drop(&mut self) {
        if let Some(h) = self.ticker.take() {
            h.abort();
        }
    }
}

#[async_trait]
impl VehicleLink for SimVehicle {
    async fn connect(&mut self, address: &str) -> Result<Topic<ConnectionEvent>> {
        anyhow::ensure!(self.ticker.is_none(), "sim link already open");
        self.body.lock().map_err(|_| anyhow::anyhow!("sim: state lock poisoned"))?.connected = true;

        let (cfg, feeds, body) = (self.cfg.clone(), self.feeds.clone(), self.body.clone());
        self.ticker = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(cfg.step);
            let dt = cfg.step.as_secs_f32();
            loop {
                tick.tick().await;
                let snapshot = match body.lock() {
                    Ok(mut b) => {
                        b.step(&cfg, dt);
                        b.clone()
                    }
                    Err(_) => break,
                };
                snapshot.publish(&cfg, &feeds);
            }
        }));

        info!("sim: vehicle up ({})", address);
        self.feeds.connection.publish(ConnectionEvent { is_connected: true });
        Ok(self.feeds.connection.subscribe())
    }

    fn subscribe_armed(&self) -> Topic<bool> { self.feeds.armed.subscribe() }
    fn subscribe_in_air(&self) -> Topic<bool> { self.feeds.in_air.subscribe() }
    fn subscribe_position(&self) -> Topic<PositionUpdate> { self.feeds.position.subscribe() }
    fn subscribe_attitude(&self) -> Topic<AttitudeEuler> { self.feeds.attitude.subscribe() }
    fn subscribe_battery(&self) -> Topic<BatteryUpdate> { self.feeds.battery.subscribe() }
    fn subscribe_gps_info(&self) -> Topic<GpsInfo> { self.feeds.gps.subscribe() }

    async fn arm(&mut self) -> Result<()> {
        let mut b = self.body()?;
        anyhow::ensure!(b.phase == Phase::Ground, "arm refused: vehicle is flying");
        anyhow::ensure!(b.battery > 0.05, "arm refused: battery too low");
        b.armed = true;
        Ok(())
    }

    async fn disarm(&mut self) -> Result<()> {
        let mut b = self.body()?;
        anyhow::ensure!(b.phase == Phase::Ground, "disarm refused: vehicle is flying");
        b.armed = false;
        Ok(())
    }

    async fn set_takeoff_altitude(&mut self, meters: f32) -> Result<()> {
        anyhow::ensure!(meters.is_finite() && meters > 0.0, "invalid takeoff altitude {}", meters);
        self.body()?.takeoff_alt_m = meters;
        Ok(())
    }

    async fn takeoff(&mut self) -> Result<()> {
        let mut b = self.body()?;
        anyhow::ensure!(b.armed, "takeoff refused: not armed");
        anyhow::ensure!(b.phase == Phase::Ground, "takeoff refused: already flying");
        b.phase = Phase::TakingOff;
        Ok(())
    }

    async fn land(&mut self) -> Result<()> {
        let mut b = self.body()?;
        anyhow::ensure!(b.phase != Phase::Ground, "land refused: on the ground");
        b.phase = Phase::Landing;
        Ok(())
    }

    async fn enter_offboard_mode(&mut self) -> Result<()> {
        let timeout = self.cfg.setpoint_timeout;
        let mut b = self.body()?;
        anyhow::ensure!(b.armed, "offboard refused: not armed");
        anyhow::ensure!(b.setpoint_fresh(timeout), "offboard refused: no setpoint stream");
        anyhow::ensure!(
            matches!(b.phase, Phase::Hold | Phase::Offboard | Phase::TakingOff),
            "offboard refused in {:?}", b.phase
        );
        b.phase = Phase::Offboard;
        Ok(())
    }

    async fn exit_offboard_mode(&mut self) -> Result<()> {
        let mut b = self.body()?;
        if b.phase == Phase::Offboard {
            b.phase = Phase::Hold;
        }
        Ok(())
    }

    async fn send_body_velocity(&mut self, cmd: VelocityCommand) -> Result<()> {
        let mut b = self.body()?;
        b.setpoint = cmd;
        b.setpoint_at = Some(Instant::now());
        debug!("sim: setpoint {:?}", cmd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fly_for(d: Duration) {
        tokio::time::sleep(d).await;
    }

    #[tokio::test(start_paused = true)]
    async fn takeoff_climbs_and_reports_in_air() {
        let mut sim = SimVehicle::new(SimConfig::default());
        let mut conn = sim.connect("sim").await.unwrap();
        assert_eq!(conn.next().await, Some(ConnectionEvent { is_connected: true }));
        let mut in_air = sim.subscribe_in_air();

        assert!(sim.takeoff().await.is_err());
        sim.arm().await.unwrap();
        sim.set_takeoff_altitude(3.0).await.unwrap();
        sim.takeoff().await.unwrap();
        fly_for(Duration::from_secs(3)).await;

        assert_eq!(in_air.next().await, Some(true));
        let alt = sim.subscribe_position().next().await.unwrap().rel_alt_m;
        assert!((alt - 3.0).abs() < 1e-3, "alt {}", alt);
        assert!(sim.disarm().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn offboard_needs_setpoints_and_fails_safe() {
        let mut sim = SimVehicle::new(SimConfig::default());
        sim.connect("sim").await.unwrap();
        sim.arm().await.unwrap();
        sim.takeoff().await.unwrap();
        fly_for(Duration::from_secs(3)).await;

        assert!(sim.enter_offboard_mode().await.is_err());
        sim.send_zero_velocity().await.unwrap();
        sim.enter_offboard_mode().await.unwrap();

        // climb at 1 m/s for one second
        let up = VelocityCommand { down_mps: -1.0, ..VelocityCommand::ZERO };
        for _ in 0..10 {
            sim.send_body_velocity(up).await.unwrap();
            fly_for(Duration::from_millis(100)).await;
        }
        let alt = sim.subscribe_position().next().await.unwrap().rel_alt_m;
        assert!(alt > 3.2, "alt {}", alt);

        // stream stops: back to hold, altitude frozen
        fly_for(Duration::from_secs(2)).await;
        let held = sim.subscribe_position().next().await.unwrap().rel_alt_m;
        fly_for(Duration::from_secs(1)).await;
        assert_eq!(sim.subscribe_position().next().await.unwrap().rel_alt_m, held);
    }

    #[tokio::test(start_paused = true)]
    async fn landing_disarms_on_touchdown() {
        let mut sim = SimVehicle::new(SimConfig::default());
        sim.connect("sim").await.unwrap();
        sim.arm().await.unwrap();
        sim.takeoff().await.unwrap();
        fly_for(Duration::from_secs(3)).await;
        sim.land().await.unwrap();
        fly_for(Duration::from_secs(4)).await;

        assert_eq!(sim.subscribe_in_air().next().await, Some(false));
        assert_eq!(sim.subscribe_armed().next().await, Some(false));
    }

    #[test]
    fn yaw_wraps() {
        assert!((wrap_pi(3.5) - (3.5 - std::f32::consts::TAU)).abs() < 1e-5);
        assert!((wrap_pi(-3.5) - (-3.5 + std::f32::consts::TAU)).abs() < 1e-5);
        assert_eq!(wrap_pi(1.0), 1.0);
    }
}

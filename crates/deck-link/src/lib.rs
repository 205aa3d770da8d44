pub mod autodetect;
pub mod mav;
pub mod sim;
pub mod state;
pub mod topic;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use deck_proto::control::VelocityCommand;
use deck_proto::telemetry::{AttitudeEuler, BatteryUpdate, ConnectionEvent, GpsInfo, PositionUpdate};

pub use topic::{topic, TelemetryFeeds, Topic, TopicSender};

/// Everything the coordinator needs from a vehicle transport.
///
/// Effectful calls take `&mut self`: a link is owned by exactly one task and
/// is never driven concurrently.
#[async_trait]
pub trait VehicleLink: Send {
    /// Opens the transport. The returned topic reports link up/down changes.
    async fn connect(&mut self, address: &str) -> Result<Topic<ConnectionEvent>>;

    fn subscribe_armed(&self) -> Topic<bool>;
    fn subscribe_in_air(&self) -> Topic<bool>;
    fn subscribe_position(&self) -> Topic<PositionUpdate>;
    fn subscribe_attitude(&self) -> Topic<AttitudeEuler>;
    fn subscribe_battery(&self) -> Topic<BatteryUpdate>;
    fn subscribe_gps_info(&self) -> Topic<GpsInfo>;

    async fn arm(&mut self) -> Result<()>;
    async fn disarm(&mut self) -> Result<()>;
    async fn set_takeoff_altitude(&mut self, meters: f32) -> Result<()>;
    async fn takeoff(&mut self) -> Result<()>;
    async fn land(&mut self) -> Result<()>;

    async fn send_zero_velocity(&mut self) -> Result<()> {
        self.send_body_velocity(VelocityCommand::ZERO).await
    }
    async fn enter_offboard_mode(&mut self) -> Result<()>;
    async fn exit_offboard_mode(&mut self) -> Result<()>;
    async fn send_body_velocity(&mut self, cmd: VelocityCommand) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Mavlink,
    Sim,
}

/// Which flight stack is on the other end; decides the offboard mode numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autopilot {
    #[default]
    Px4,
    Ardupilot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub kind: LinkKind,

    /// MAVSDK-style (`udp://:14540`) or mavlink-style (`udpin:0.0.0.0:14540`,
    /// `serial:/dev/ttyACM0:57600`) address. `serial:auto` probes ports.
    pub address: String,

    /// MAVLink ids we use (companion side)
    pub sys_id: Option<u8>,
    pub comp_id: Option<u8>,

    /// target system/component (vehicle side). 1/1 for PX4 and ArduPilot.
    pub target_sys: Option<u8>,
    pub target_comp: Option<u8>,

    pub autopilot: Option<Autopilot>,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// How long to wait for COMMAND_ACK.
    pub ack_timeout_ms: Option<u64>,

    /// Vehicle heartbeat silence after which the link is reported down.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Autodetect candidates for `serial:auto`.
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    /// Simulated vehicle home position.
    pub sim_home_lat: Option<f64>,
    pub sim_home_lon: Option<f64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Sim,
            address: "sim".into(),
            sys_id: None,
            comp_id: None,
            target_sys: None,
            target_comp: None,
            autopilot: None,
            send_heartbeat_hz: None,
            ack_timeout_ms: None,
            heartbeat_timeout_ms: None,
            candidate_devs: None,
            candidate_bauds: None,
            sim_home_lat: None,
            sim_home_lon: None,
        }
    }
}

impl LinkConfig {
    /// Static sanity checks, used by `deck doctor`.
    pub fn check(&self) -> Result<()> {
        match self.kind {
            LinkKind::Sim => {}
            LinkKind::Mavlink => {
                if self.address.trim() != "serial:auto" {
                    mav::normalize_address(&self.address)?;
                }
                if let Some(hz) = self.send_heartbeat_hz {
                    anyhow::ensure!(hz > 0.0 && hz <= 50.0, "link.send_heartbeat_hz out of range: {}", hz);
                }
                if let Some(ms) = self.ack_timeout_ms {
                    anyhow::ensure!(ms > 0, "link.ack_timeout_ms must be > 0");
                }
            }
        }
        Ok(())
    }
}

/// Builds the configured transport. Nothing is opened until `connect`.
pub fn open_link(cfg: &LinkConfig) -> Box<dyn VehicleLink> {
    match cfg.kind {
        LinkKind::Mavlink => Box::new(mav::MavVehicle::new(cfg)),
        LinkKind::Sim => Box::new(sim::SimVehicle::new(sim::SimConfig::from_link(cfg))),
    }
}

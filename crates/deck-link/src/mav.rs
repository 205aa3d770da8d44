use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mavlink::{
    common::{
        GpsFixType, MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag, MavResult,
        MavState, MavType, PositionTargetTypemask, COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    MavConnection, MavHeader,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use deck_proto::control::VelocityCommand;
use deck_proto::telemetry::{AttitudeEuler, BatteryUpdate, ConnectionEvent, GpsInfo, PositionUpdate};

use crate::autodetect::{autodetect_serial, default_candidate_bauds, default_candidate_devs};
use crate::state::LinkStatus;
use crate::{Autopilot, LinkConfig, TelemetryFeeds, Topic, VehicleLink};

type Conn = Box<dyn MavConnection<MavMessage> + Send + Sync>;

// Velocity + yaw rate only: ignore x/y/z, accelerations and absolute yaw.
const VELOCITY_ONLY_MASK: u16 = 0b0000_0101_1100_0111;

const MODE_FLAG_CUSTOM: f32 = 1.0;

struct Outbox {
    conn: Conn,
    hdr: Mutex<MavHeader>,
}

impl Outbox {
    fn send(&self, msg: &MavMessage) -> Result<()> {
        let hdr = {
            let mut h = self.hdr.lock().map_err(|_| anyhow::anyhow!("mavlink header lock poisoned"))?;
            h.sequence = h.sequence.wrapping_add(1);
            h.clone()
        };
        self.conn.send(&hdr, msg).context("mavlink send")?;
        Ok(())
    }
}

/// [`VehicleLink`] over MAVLink (PX4 or ArduPilot).
pub struct MavVehicle {
    sys_id: u8,
    comp_id: u8,
    target_sys: u8,
    target_comp: u8,
    autopilot: Autopilot,
    hb_interval: Duration,
    hb_timeout: Duration,
    ack_timeout: Duration,
    candidate_devs: Vec<String>,
    candidate_bauds: Vec<u32>,

    feeds: Arc<TelemetryFeeds>,
    acks: broadcast::Sender<COMMAND_ACK_DATA>,
    status: Arc<Mutex<LinkStatus>>,
    outbox: Option<Arc<Outbox>>,
    stop: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
    takeoff_alt_m: f32,
    started: Instant,
}

impl MavVehicle {
    pub fn new(cfg: &LinkConfig) -> Self {
        let hb_hz = cfg.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        Self {
            sys_id: cfg.sys_id.unwrap_or(245),
            comp_id: cfg.comp_id.unwrap_or(190),
            target_sys: cfg.target_sys.unwrap_or(1),
            target_comp: cfg.target_comp.unwrap_or(1),
            autopilot: cfg.autopilot.unwrap_or_default(),
            hb_interval: Duration::from_secs_f32(1.0 / hb_hz),
            hb_timeout: Duration::from_millis(cfg.heartbeat_timeout_ms.unwrap_or(3000)),
            ack_timeout: Duration::from_millis(cfg.ack_timeout_ms.unwrap_or(1500)),
            candidate_devs: cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs),
            candidate_bauds: cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds),
            feeds: Arc::new(TelemetryFeeds::new()),
            acks: broadcast::channel(16).0,
            status: Arc::new(Mutex::new(LinkStatus::default())),
            outbox: None,
            stop: Arc::new(AtomicBool::new(false)),
            supervisor: None,
            takeoff_alt_m: 5.0,
            started: Instant::now(),
        }
    }

    fn outbox(&self) -> Result<Arc<Outbox>> {
        self.outbox.clone().context("mavlink link not connected")
    }

    async fn resolve_url(&self, address: &str) -> Result<String> {
        if address.trim() != "serial:auto" {
            return normalize_address(address);
        }
        let res = autodetect_serial(&self.candidate_devs, &self.candidate_bauds, self.hb_timeout).await;
        let (dev, baud) = res.chosen.context("serial autodetect: no heartbeat on any candidate port")?;
        Ok(format!("serial:{}:{}", dev, baud))
    }

    async fn command(&mut self, cmd: MavCmd, params: [f32; 7]) -> Result<()> {
        let outbox = self.outbox()?;
        let mut acks = self.acks.subscribe();

        let msg = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command: cmd,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        debug!("mavlink: sending {:?}", cmd);
        outbox.send(&MavMessage::COMMAND_LONG(msg))?;

        let result = tokio::time::timeout(self.ack_timeout, await_ack(&mut acks, cmd))
            .await
            .with_context(|| format!("no COMMAND_ACK for {:?}", cmd))??;
        match result {
            MavResult::MAV_RESULT_ACCEPTED | MavResult::MAV_RESULT_IN_PROGRESS => Ok(()),
            other => anyhow::bail!("{:?} rejected: {:?}", cmd, other),
        }
    }

    fn set_mode_params(&self, offboard: bool) -> [f32; 7] {
        // PX4: main mode 6 = OFFBOARD, 4/3 = AUTO.LOITER. ArduPilot copter: 4 = GUIDED, 5 = LOITER.
        let (main, sub) = match (self.autopilot, offboard) {
            (Autopilot::Px4, true) => (6.0, 0.0),
            (Autopilot::Px4, false) => (4.0, 3.0),
            (Autopilot::Ardupilot, true) => (4.0, 0.0),
            (Autopilot::Ardupilot, false) => (5.0, 0.0),
        };
        [MODE_FLAG_CUSTOM, main, sub, 0.0, 0.0, 0.0, 0.0]
    }
}

impl Drop for MavVehicle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.supervisor.take() {
            h.abort();
        }
    }
}

#[async_trait]
impl VehicleLink for MavVehicle {
    async fn connect(&mut self, address: &str) -> Result<Topic<ConnectionEvent>> {
        anyhow::ensure!(self.outbox.is_none(), "mavlink link already open");
        let url = self.resolve_url(address).await?;

        if let Some(rest) = url.strip_prefix("serial:") {
            // quick validate device
            let (dev, baud) = rest.rsplit_once(':').context("serial address needs dev:baud")?;
            let baud: u32 = baud.parse().with_context(|| format!("bad baud rate in {}", url))?;
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open serial device {}", dev))?;
        }

        let conn: Conn = {
            let addr = url.clone();
            tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&addr))
                .await
                .context("mavlink connect task")?
                .with_context(|| format!("mavlink connect {}", url))?
        };

        let outbox = Arc::new(Outbox {
            conn,
            hdr: Mutex::new(MavHeader { system_id: self.sys_id, component_id: self.comp_id, sequence: 0 }),
        });
        let events = self.feeds.connection.subscribe();

        // recv() blocks, so the reader gets its own thread
        {
            let (outbox, feeds, acks, status, stop) =
                (outbox.clone(), self.feeds.clone(), self.acks.clone(), self.status.clone(), self.stop.clone());
            let target = (self.target_sys, self.target_comp);
            std::thread::Builder::new()
                .name("mav-reader".into())
                .spawn(move || read_loop(&outbox, &feeds, &acks, &status, target, &stop))
                .context("spawn mavlink reader")?;
        }

        self.supervisor = Some(tokio::spawn(supervise(
            outbox.clone(),
            self.feeds.clone(),
            self.status.clone(),
            self.hb_interval,
            self.hb_timeout,
        )));
        self.outbox = Some(outbox);
        self.started = Instant::now();
        info!("mavlink: link open on {} ({:?})", url, self.autopilot);
        Ok(events)
    }

    fn subscribe_armed(&self) -> Topic<bool> { self.feeds.armed.subscribe() }
    fn subscribe_in_air(&self) -> Topic<bool> { self.feeds.in_air.subscribe() }
    fn subscribe_position(&self) -> Topic<PositionUpdate> { self.feeds.position.subscribe() }
    fn subscribe_attitude(&self) -> Topic<AttitudeEuler> { self.feeds.attitude.subscribe() }
    fn subscribe_battery(&self) -> Topic<BatteryUpdate> { self.feeds.battery.subscribe() }
    fn subscribe_gps_info(&self) -> Topic<GpsInfo> { self.feeds.gps.subscribe() }

    async fn arm(&mut self) -> Result<()> {
        self.command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn disarm(&mut self) -> Result<()> {
        self.command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7]).await
    }

    async fn set_takeoff_altitude(&mut self, meters: f32) -> Result<()> {
        anyhow::ensure!(meters.is_finite() && meters > 0.0, "invalid takeoff altitude {}", meters);
        self.takeoff_alt_m = meters;
        Ok(())
    }

    async fn takeoff(&mut self) -> Result<()> {
        let alt = self.takeoff_alt_m;
        // NaN keeps current lat/lon/yaw
        self.command(MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, alt]).await
    }

    async fn land(&mut self) -> Result<()> {
        self.command(MavCmd::MAV_CMD_NAV_LAND, [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, 0.0]).await
    }

    async fn enter_offboard_mode(&mut self) -> Result<()> {
        let params = self.set_mode_params(true);
        self.command(MavCmd::MAV_CMD_DO_SET_MODE, params).await
    }

    async fn exit_offboard_mode(&mut self) -> Result<()> {
        let params = self.set_mode_params(false);
        self.command(MavCmd::MAV_CMD_DO_SET_MODE, params).await
    }

    async fn send_body_velocity(&mut self, cmd: VelocityCommand) -> Result<()> {
        let outbox = self.outbox()?;
        let msg = SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: self.started.elapsed().as_millis() as u32,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx: cmd.forward_mps,
            vy: cmd.right_mps,
            vz: cmd.down_mps,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: 0.0,
            yaw_rate: cmd.yaw_rate_dps.to_radians(),
            type_mask: PositionTargetTypemask::from_bits_truncate(VELOCITY_ONLY_MASK),
            target_system: self.target_sys,
            target_component: self.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_BODY_NED,
        };
        outbox.send(&MavMessage::SET_POSITION_TARGET_LOCAL_NED(msg))
    }
}

async fn await_ack(acks: &mut broadcast::Receiver<COMMAND_ACK_DATA>, cmd: MavCmd) -> Result<MavResult> {
    loop {
        match acks.recv().await {
            Ok(ack) if ack.command == cmd => return Ok(ack.result),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("mavlink link closed"),
        }
    }
}

fn read_loop(
    outbox: &Outbox,
    feeds: &TelemetryFeeds,
    acks: &broadcast::Sender<COMMAND_ACK_DATA>,
    status: &Mutex<LinkStatus>,
    (target_sys, target_comp): (u8, u8),
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        match outbox.conn.recv() {
            Ok((hdr, msg)) => {
                if hdr.system_id != target_sys { continue; }
                if let MavMessage::HEARTBEAT(hb) = &msg {
                    if hdr.component_id != target_comp { continue; }
                    let came_up = status.lock().map(|mut s| s.on_heartbeat(hb.custom_mode)).unwrap_or(false);
                    if came_up {
                        info!("mavlink: vehicle heartbeat from sys={} comp={}", hdr.system_id, hdr.component_id);
                        feeds.connection.publish(ConnectionEvent { is_connected: true });
                    }
                }
                route(feeds, acks, msg);
            }
            // Light sleep to avoid a busy loop on a dead port
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    debug!("mavlink: reader stopped");
}

fn route(feeds: &TelemetryFeeds, acks: &broadcast::Sender<COMMAND_ACK_DATA>, msg: MavMessage) {
    match msg {
        MavMessage::HEARTBEAT(hb) => {
            feeds.armed.publish(hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED));
        }
        MavMessage::EXTENDED_SYS_STATE(s) => {
            let in_air = matches!(
                s.landed_state,
                MavLandedState::MAV_LANDED_STATE_IN_AIR
                    | MavLandedState::MAV_LANDED_STATE_TAKEOFF
                    | MavLandedState::MAV_LANDED_STATE_LANDING
            );
            feeds.in_air.publish(in_air);
        }
        MavMessage::GLOBAL_POSITION_INT(p) => feeds.position.publish(PositionUpdate {
            lat_deg: p.lat as f64 / 1e7,
            lon_deg: p.lon as f64 / 1e7,
            // millimeters
            rel_alt_m: p.relative_alt as f32 / 1000.0,
        }),
        MavMessage::ATTITUDE(a) => feeds.attitude.publish(AttitudeEuler {
            roll_rad: a.roll,
            pitch_rad: a.pitch,
            yaw_rad: a.yaw,
        }),
        MavMessage::SYS_STATUS(s) => {
            if let Some(remaining_fraction) = battery_fraction(s.battery_remaining) {
                feeds.battery.publish(BatteryUpdate { remaining_fraction });
            }
        }
        MavMessage::GPS_RAW_INT(g) => feeds.gps.publish(GpsInfo {
            fix_type: fix_level(g.fix_type),
            num_satellites: g.satellites_visible as i32,
        }),
        MavMessage::COMMAND_ACK(ack) => {
            let _ = acks.send(ack);
        }
        _ => {}
    }
}

fn battery_fraction(remaining_pct: i8) -> Option<f32> {
    // battery_remaining is percentage 0-100, -1 means invalid
    if (0..=100).contains(&remaining_pct) {
        Some(remaining_pct as f32 / 100.0)
    } else {
        None
    }
}

fn fix_level(t: GpsFixType) -> u8 {
    match t {
        // static / PPP are full 3D solutions
        GpsFixType::GPS_FIX_TYPE_STATIC | GpsFixType::GPS_FIX_TYPE_PPP => 3,
        other => other as u8,
    }
}

fn companion_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Companion heartbeat out, vehicle heartbeat watchdog in.
async fn supervise(
    outbox: Arc<Outbox>,
    feeds: Arc<TelemetryFeeds>,
    status: Arc<Mutex<LinkStatus>>,
    hb_interval: Duration,
    hb_timeout: Duration,
) {
    let mut tick = tokio::time::interval(hb_interval);
    loop {
        tick.tick().await;
        // udpin has no peer until the vehicle has spoken; that error is expected
        if let Err(e) = outbox.send(&companion_heartbeat()) {
            debug!("mavlink: companion heartbeat not sent: {:#}", e);
        }
        let change = status.lock().ok().and_then(|mut s| s.evaluate(hb_timeout));
        if let Some(up) = change {
            if up {
                info!("mavlink: link up");
            } else {
                warn!("mavlink: no vehicle heartbeat for {:?}, link down", hb_timeout);
            }
            feeds.connection.publish(ConnectionEvent { is_connected: up });
        }
    }
}

/// Maps MAVSDK-style URLs onto the connection strings `mavlink::connect` takes.
pub fn normalize_address(address: &str) -> Result<String> {
    let a = address.trim();
    if let Some(rest) = a.strip_prefix("udp://") {
        let (host, port) = split_host_port(rest)?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        return Ok(format!("udpin:{}:{}", host, port));
    }
    if let Some(rest) = a.strip_prefix("tcp://") {
        let (host, port) = split_host_port(rest)?;
        anyhow::ensure!(!host.is_empty(), "tcp address needs a host: {}", address);
        return Ok(format!("tcpout:{}:{}", host, port));
    }
    if let Some(rest) = a.strip_prefix("serial://") {
        split_host_port(rest)?;
        return Ok(format!("serial:{}", rest));
    }
    for prefix in ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"] {
        if a.starts_with(prefix) {
            return Ok(a.to_string());
        }
    }
    anyhow::bail!("unsupported link address: {}", address)
}

fn split_host_port(s: &str) -> Result<(&str, u16)> {
    let (host, port) = s.rsplit_once(':').with_context(|| format!("missing port in {}", s))?;
    let port = port.parse().with_context(|| format!("bad port in {}", s))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mavsdk_udp_listens_on_all_interfaces() {
        assert_eq!(normalize_address("udp://:14540").unwrap(), "udpin:0.0.0.0:14540");
        assert_eq!(normalize_address("udp://127.0.0.1:14550").unwrap(), "udpin:127.0.0.1:14550");
    }

    #[test]
    fn tcp_and_serial_forms() {
        assert_eq!(normalize_address("tcp://10.0.0.2:5760").unwrap(), "tcpout:10.0.0.2:5760");
        assert_eq!(normalize_address("serial:///dev/ttyACM0:57600").unwrap(), "serial:/dev/ttyACM0:57600");
        assert_eq!(normalize_address(" udpin:0.0.0.0:14550 ").unwrap(), "udpin:0.0.0.0:14550");
    }

    #[test]
    fn rejects_unknown_or_portless() {
        assert!(normalize_address("http://x:1").is_err());
        assert!(normalize_address("udp://14540").is_err());
        assert!(normalize_address("tcp://:5760").is_err());
    }

    #[test]
    fn offboard_mode_numbers_follow_autopilot() {
        let mut v = MavVehicle::new(&LinkConfig::default());
        assert_eq!(v.set_mode_params(true)[1], 6.0);
        assert_eq!(v.set_mode_params(false)[1..3], [4.0, 3.0]);
        v.autopilot = Autopilot::Ardupilot;
        assert_eq!(v.set_mode_params(true)[1], 4.0);
        assert_eq!(v.set_mode_params(false)[1], 5.0);
    }

    #[test]
    fn battery_remaining_invalid_is_skipped() {
        assert_eq!(battery_fraction(-1), None);
        assert_eq!(battery_fraction(42), Some(0.42));
        assert_eq!(battery_fraction(100), Some(1.0));
    }
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use deck_core::{Coordinator, CoordinatorConfig, CoordinatorHandle};
use deck_link::{TelemetryFeeds, Topic, VehicleLink};
use deck_proto::control::VelocityCommand;
use deck_proto::telemetry::{AttitudeEuler, BatteryUpdate, ConnectionEvent, GpsInfo, PositionUpdate};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect(String),
    Arm,
    Disarm,
    SetTakeoffAltitude(f32),
    Takeoff,
    Land,
    EnterOffboard,
    ExitOffboard,
    Velocity(VelocityCommand),
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    // remaining refusals per operation
    failures: HashMap<&'static str, usize>,
    delays: HashMap<&'static str, Duration>,
    in_air: bool,
    sent_on_ground: usize,
    silent_connect: bool,
}

/// Recording [`VehicleLink`] whose telemetry is driven by the test.
pub struct MockLink {
    feeds: Arc<TelemetryFeeds>,
    shared: Arc<Mutex<Shared>>,
}

/// Test-side controls for a [`MockLink`].
#[derive(Clone)]
pub struct Vehicle {
    feeds: Arc<TelemetryFeeds>,
    shared: Arc<Mutex<Shared>>,
}

pub fn mock() -> (MockLink, Vehicle) {
    let feeds = Arc::new(TelemetryFeeds::new());
    let shared = Arc::new(Mutex::new(Shared::default()));
    (
        MockLink { feeds: feeds.clone(), shared: shared.clone() },
        Vehicle { feeds, shared },
    )
}

/// A coordinator over a fresh mock, already connected.
pub async fn connected() -> (Coordinator, CoordinatorHandle, Vehicle) {
    let (link, vehicle) = mock();
    let coord = Coordinator::spawn(Box::new(link), CoordinatorConfig::default());
    let handle = coord.handle();
    handle.connect("mock://").await.unwrap();
    vehicle.clear();
    (coord, handle, vehicle)
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

impl Vehicle {
    pub fn calls(&self) -> Vec<Call> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn velocities(&self) -> Vec<VelocityCommand> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Velocity(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.shared.lock().unwrap().calls.clear();
    }

    /// Refuses the next `times` calls of `op` (e.g. "enter_offboard").
    pub fn fail(&self, op: &'static str, times: usize) {
        self.shared.lock().unwrap().failures.insert(op, times);
    }

    /// Makes every later call of `op` take `delay` before it is recorded.
    pub fn slow(&self, op: &'static str, delay: Duration) {
        self.shared.lock().unwrap().delays.insert(op, delay);
    }

    /// Accepts `connect` but never reports the link up.
    pub fn silent_connect(&self) {
        self.shared.lock().unwrap().silent_connect = true;
    }

    pub fn set_in_air(&self, v: bool) {
        self.shared.lock().unwrap().in_air = v;
        self.feeds.in_air.publish(v);
    }

    pub fn set_armed(&self, v: bool) {
        self.feeds.armed.publish(v);
    }

    pub fn set_altitude(&self, meters: f32) {
        self.feeds.position.publish(PositionUpdate { lat_deg: 47.0, lon_deg: 8.0, rel_alt_m: meters });
    }

    pub fn set_attitude(&self, a: AttitudeEuler) {
        self.feeds.attitude.publish(a);
    }

    pub fn set_battery(&self, fraction: f32) {
        self.feeds.battery.publish(BatteryUpdate { remaining_fraction: fraction });
    }

    pub fn set_gps(&self, fix_type: u8, num_satellites: i32) {
        self.feeds.gps.publish(GpsInfo { fix_type, num_satellites });
    }

    pub fn drop_link(&self) {
        self.feeds.connection.publish(ConnectionEvent { is_connected: false });
    }

    /// Velocity commands that reached the vehicle while it was on the ground.
    pub fn sent_on_ground(&self) -> usize {
        self.shared.lock().unwrap().sent_on_ground
    }
}

impl MockLink {
    async fn act(&self, call: Call, op: &'static str) -> Result<()> {
        let delay = self.shared.lock().unwrap().delays.get(op).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.record(call, op)
    }

    fn record(&self, call: Call, op: &'static str) -> Result<()> {
        let mut s = self.shared.lock().unwrap();
        if let Call::Velocity(_) = call {
            if !s.in_air {
                s.sent_on_ground += 1;
            }
        }
        s.calls.push(call);
        if let Some(n) = s.failures.get_mut(op) {
            if *n > 0 {
                *n -= 1;
                anyhow::bail!("{} refused", op);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VehicleLink for MockLink {
    async fn connect(&mut self, address: &str) -> Result<Topic<ConnectionEvent>> {
        self.act(Call::Connect(address.to_string()), "connect").await?;
        if !self.shared.lock().unwrap().silent_connect {
            self.feeds.connection.publish(ConnectionEvent { is_connected: true });
        }
        Ok(self.feeds.connection.subscribe())
    }

    fn subscribe_armed(&self) -> Topic<bool> { self.feeds.armed.subscribe() }
    fn subscribe_in_air(&self) -> Topic<bool> { self.feeds.in_air.subscribe() }
    fn subscribe_position(&self) -> Topic<PositionUpdate> { self.feeds.position.subscribe() }
    fn subscribe_attitude(&self) -> Topic<AttitudeEuler> { self.feeds.attitude.subscribe() }
    fn subscribe_battery(&self) -> Topic<BatteryUpdate> { self.feeds.battery.subscribe() }
    fn subscribe_gps_info(&self) -> Topic<GpsInfo> { self.feeds.gps.subscribe() }

    async fn arm(&mut self) -> Result<()> {
        self.act(Call::Arm, "arm").await?;
        self.feeds.armed.publish(true);
        Ok(())
    }

    async fn disarm(&mut self) -> Result<()> {
        self.act(Call::Disarm, "disarm").await?;
        self.feeds.armed.publish(false);
        Ok(())
    }

    async fn set_takeoff_altitude(&mut self, meters: f32) -> Result<()> {
        self.act(Call::SetTakeoffAltitude(meters), "set_takeoff_altitude").await
    }

    async fn takeoff(&mut self) -> Result<()> {
        self.act(Call::Takeoff, "takeoff").await
    }

    async fn land(&mut self) -> Result<()> {
        self.act(Call::Land, "land").await
    }

    async fn enter_offboard_mode(&mut self) -> Result<()> {
        self.act(Call::EnterOffboard, "enter_offboard").await
    }

    async fn exit_offboard_mode(&mut self) -> Result<()> {
        self.act(Call::ExitOffboard, "exit_offboard").await
    }

    async fn send_body_velocity(&mut self, cmd: VelocityCommand) -> Result<()> {
        self.act(Call::Velocity(cmd), "send_body_velocity").await
    }
}

//! Folds the vehicle's telemetry topics into one [`VehicleState`].
//!
//! One task per topic, each blocked only on its own stream. Every write is a
//! single `send_modify` on the state channel, so readers never observe a
//! half-written field. Armed writes that flip the stored value are also
//! reported as [`FlightEvent`]s. In-air is not consumed here: the coordinator
//! reads that topic itself and writes the flag through [`StateCell::set_in_air`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use deck_link::{Topic, VehicleLink};
use deck_proto::telemetry::{
    Attitude, AttitudeEuler, BatteryUpdate, ConnectionEvent, GpsFixLevel, GpsInfo, PositionUpdate, VehicleState,
};

const ATTITUDE_LOG_EVERY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightEvent {
    BecameArmed,
    BecameDisarmed,
    BecameInAir,
    BecameGrounded,
}

/// Shared, latest-value vehicle snapshot.
#[derive(Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<VehicleState>>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(VehicleState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> VehicleState {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<VehicleState> {
        self.tx.subscribe()
    }

    fn write(&self, f: impl FnOnce(&mut VehicleState)) {
        self.tx.send_modify(|s| {
            f(s);
            s.updated_at_ms = now_ms();
        });
    }

    /// Stores a flag; true when the stored value changed.
    fn write_flag(&self, pick: fn(&mut VehicleState) -> &mut bool, value: bool) -> bool {
        let mut changed = false;
        self.write(|s| {
            let f = pick(s);
            changed = *f != value;
            *f = value;
        });
        changed
    }

    pub fn set_connected(&self, v: bool) -> bool {
        self.write_flag(|s| &mut s.connected, v)
    }

    pub fn set_armed(&self, v: bool) -> bool {
        self.write_flag(|s| &mut s.armed, v)
    }

    pub fn set_in_air(&self, v: bool) -> bool {
        self.write_flag(|s| &mut s.in_air, v)
    }

    /// Marks the vehicle airborne without an in-air report; a later `true`
    /// report from the vehicle then raises no second edge.
    pub fn force_in_air(&self) -> bool {
        self.set_in_air(true)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// The running per-topic consumers.
pub struct TelemetryAggregator {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TelemetryAggregator {
    /// Subscribes to every topic of `link` and starts one consumer each.
    /// `connection` is the topic `connect` returned.
    pub fn start(
        link: &dyn VehicleLink,
        connection: Topic<ConnectionEvent>,
        state: StateCell,
        events: mpsc::UnboundedSender<FlightEvent>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(6);

        let s = state.clone();
        tasks.push(consume("connection", connection, stop_rx.clone(), move |ev: ConnectionEvent| {
            if s.set_connected(ev.is_connected) {
                if ev.is_connected {
                    info!("telemetry: vehicle link up");
                } else {
                    warn!("telemetry: vehicle link lost");
                }
            }
        }));

        let s = state.clone();
        tasks.push(consume("armed", link.subscribe_armed(), stop_rx.clone(), move |armed: bool| {
            if s.set_armed(armed) {
                let ev = if armed { FlightEvent::BecameArmed } else { FlightEvent::BecameDisarmed };
                info!("telemetry: {:?}", ev);
                let _ = events.send(ev);
            }
        }));

        let s = state.clone();
        tasks.push(consume("position", link.subscribe_position(), stop_rx.clone(), move |p: PositionUpdate| {
            s.write(|v| v.position = p.into());
        }));

        let s = state.clone();
        let mut last_log: Option<Instant> = None;
        tasks.push(consume("attitude", link.subscribe_attitude(), stop_rx.clone(), move |a: AttitudeEuler| {
            let att = Attitude::from(a);
            s.write(|v| v.attitude = att);
            if last_log.map(|t| t.elapsed() >= ATTITUDE_LOG_EVERY).unwrap_or(true) {
                debug!("telemetry: roll {:.1} pitch {:.1} yaw {:.1}", att.roll_deg, att.pitch_deg, att.yaw_deg);
                last_log = Some(Instant::now());
            }
        }));

        let s = state.clone();
        tasks.push(consume("battery", link.subscribe_battery(), stop_rx.clone(), move |b: BatteryUpdate| {
            if let Some(pct) = battery_percent(b.remaining_fraction) {
                s.write(|v| v.battery_percent = pct);
            }
        }));

        let s = state;
        let mut last_fix: Option<GpsFixLevel> = None;
        tasks.push(consume("gps", link.subscribe_gps_info(), stop_rx, move |g: GpsInfo| {
            let Some(level) = GpsFixLevel::from_raw(g.fix_type) else {
                debug!("telemetry: ignoring unknown fix type {}", g.fix_type);
                return;
            };
            if last_fix != Some(level) {
                info!("telemetry: GPS {} ({} satellites)", level.name(), g.num_satellites);
                last_fix = Some(level);
            }
            s.write(|v| {
                v.gps_fix = level;
                v.satellites = g.num_satellites;
            });
        }));

        Self { stop, tasks }
    }

    /// Signals every consumer and waits for them to finish.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!("telemetry: consumer task failed: {}", e);
            }
        }
    }
}

fn battery_percent(fraction: f32) -> Option<f32> {
    fraction.is_finite().then(|| (fraction * 100.0).clamp(0.0, 100.0))
}

fn consume<T, F>(name: &'static str, mut topic: Topic<T>, mut stop: watch::Receiver<bool>, mut on_value: F) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                v = topic.next() => match v {
                    Some(v) => on_value(v),
                    None => {
                        debug!("telemetry: {} stream ended", name);
                        break;
                    }
                },
            }
        }
    })
}

/// Resolves once the flag is raised or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_report_only_real_changes() {
        let s = StateCell::new();
        assert!(!s.set_armed(false));
        assert!(s.set_armed(true));
        assert!(!s.set_armed(true));
        assert!(s.force_in_air());
        assert!(!s.set_in_air(true));
        assert!(s.set_in_air(false));
        assert!(s.snapshot().updated_at_ms > 0);
    }

    #[test]
    fn battery_is_clamped_percent() {
        assert_eq!(battery_percent(0.5), Some(50.0));
        assert_eq!(battery_percent(1.3), Some(100.0));
        assert_eq!(battery_percent(-0.1), Some(0.0));
        assert_eq!(battery_percent(f32::NAN), None);
    }
}

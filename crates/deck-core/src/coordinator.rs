//! The coordinator task and the handle the UI talks to.
//!
//! A single task owns the [`VehicleLink`], the [`FlightStateMachine`] and the
//! [`ControlInputMapper`]; link calls therefore never overlap. Verbs reach it
//! as messages with a oneshot reply. Operator input goes through a watch
//! channel instead, so a burst of slider moves collapses to the latest value.
//!
//! The in-air topic is consumed by the task itself, ahead of input and
//! resend ticks, so every setpoint is gated on the newest in-air report the
//! vehicle has published.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use deck_link::{Topic, VehicleLink};
use deck_proto::control::OperatorInput;
use deck_proto::telemetry::{Attitude, VehicleState};

use crate::control::{ControlInputMapper, Push};
use crate::error::CoordinatorError;
use crate::flight::{FlightState, FlightStateMachine};
use crate::telemetry::{stopped, FlightEvent, StateCell, TelemetryAggregator};
use crate::{within, CoordinatorConfig};

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

enum Request {
    Connect { address: String, reply: Reply<()> },
    Arm { reply: Reply<()> },
    Disarm { reply: Reply<()> },
    Takeoff { reply: Reply<bool> },
    Land { reply: Reply<()> },
    OverrideAirborne { reply: Reply<()> },
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Arm,
    Disarm,
    Land,
}

impl Verb {
    fn name(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Disarm => "disarm",
            Self::Land => "land",
        }
    }
}

/// Cheap, cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    requests: mpsc::Sender<Request>,
    input: Arc<watch::Sender<OperatorInput>>,
    state: watch::Receiver<VehicleState>,
    flight: watch::Receiver<FlightState>,
}

impl CoordinatorHandle {
    pub fn state(&self) -> VehicleState {
        self.state.borrow().clone()
    }

    pub fn flight_state(&self) -> FlightState {
        *self.flight.borrow()
    }

    /// Opens the link and waits for it to report itself up. A no-op once connected.
    pub async fn connect(&self, address: &str) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::Connect { address: address.to_string(), reply }).await
    }

    pub async fn arm(&self) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::Arm { reply }).await
    }

    /// Leaves offboard first if it is active.
    pub async fn disarm(&self) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::Disarm { reply }).await
    }

    /// Arms if needed and takes off. Resolves once the vehicle is seen in
    /// the air or the grace period ran out; the result says which.
    pub async fn takeoff(&self) -> Result<bool, CoordinatorError> {
        self.call(|reply| Request::Takeoff { reply }).await
    }

    /// Leaves offboard first if it is active.
    pub async fn land(&self) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::Land { reply }).await
    }

    /// Treats the vehicle as airborne when altitude says so even though no
    /// in-air report arrived, and opens offboard.
    pub async fn override_airborne(&self) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::OverrideAirborne { reply }).await
    }

    /// Stores new sticks (clamped) and returns what was stored.
    pub fn update_controls(&self, throttle: f32, yaw: f32, pitch: f32, roll: f32) -> OperatorInput {
        let input = OperatorInput::clamped(throttle, yaw, pitch, roll);
        self.input.send_replace(input);
        input
    }

    pub fn reset_controls(&self) {
        self.input.send_replace(OperatorInput::default());
    }

    /// Current attitude, logged for a quick sensor sanity check.
    pub fn probe_attitude(&self) -> Attitude {
        let a = self.state.borrow().attitude;
        info!("probe: roll {:.1} pitch {:.1} yaw {:.1}", a.roll_deg, a.pitch_deg, a.yaw_deg);
        a
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(make(tx)).await.map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }
}

pub struct Coordinator {
    handle: CoordinatorHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Coordinator {
    /// Starts the coordinator task around `link`. Nothing is opened until `connect`.
    pub fn spawn(link: Box<dyn VehicleLink>, cfg: CoordinatorConfig) -> Self {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (input_tx, input_rx) = watch::channel(OperatorInput::default());
        let (flight_tx, flight_rx) = watch::channel(FlightState::Ground);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = StateCell::new();

        let handle = CoordinatorHandle {
            requests: req_tx,
            input: Arc::new(input_tx),
            state: state.watch(),
            flight: flight_rx,
        };

        let pilot = Pilot {
            fsm: FlightStateMachine::new(cfg.flight.call_timeout()),
            mapper: ControlInputMapper::new(&cfg.control, cfg.flight.call_timeout()),
            link,
            cfg,
            state,
            flight_tx,
            events_tx,
            aggregator: None,
            in_air: None,
            forced_airborne: false,
            takeoff: None,
        };
        let task = tokio::spawn(pilot.run(req_rx, events_rx, input_rx, shutdown_rx));

        Self { handle, shutdown, task }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Leaves offboard, stops every telemetry task and waits for all of it.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!("coordinator: task failed: {}", e);
        }
    }
}

struct PendingTakeoff {
    deadline: Instant,
    reply: Reply<bool>,
}

/// State owned by the coordinator task.
struct Pilot {
    link: Box<dyn VehicleLink>,
    cfg: CoordinatorConfig,
    state: StateCell,
    fsm: FlightStateMachine,
    mapper: ControlInputMapper,
    flight_tx: watch::Sender<FlightState>,
    events_tx: mpsc::UnboundedSender<FlightEvent>,
    aggregator: Option<TelemetryAggregator>,
    in_air: Option<Topic<bool>>,
    // airborne by altitude override; landed reports are ignored while high
    forced_airborne: bool,
    takeoff: Option<PendingTakeoff>,
}

impl Pilot {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<FlightEvent>,
        mut input: watch::Receiver<OperatorInput>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut resend = tokio::time::interval(self.cfg.control.resend_period());
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.takeoff.as_ref().map(|t| t.deadline);
            tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => break,
                report = next_report(&mut self.in_air) => match report {
                    Some(v) => self.on_in_air(v).await,
                    None => {
                        debug!("coordinator: in-air stream ended");
                        self.in_air = None;
                    }
                },
                req = requests.recv() => match req {
                    Some(req) => self.on_request(req).await,
                    None => break,
                },
                Some(ev) = events.recv() => self.on_event(ev).await,
                changed = input.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let i = *input.borrow_and_update();
                    self.mapper.set(i);
                    self.push(Push::Input).await;
                }
                _ = resend.tick() => self.push(Push::Heartbeat).await,
                _ = until(deadline) => self.finish_takeoff().await,
            }
            self.flight_tx.send_replace(self.fsm.state());
        }

        self.teardown().await;
    }

    async fn on_request(&mut self, req: Request) {
        match req {
            Request::Connect { address, reply } => {
                let r = self.connect(&address).await;
                let _ = reply.send(r);
            }
            Request::Arm { reply } => {
                let r = self.simple(Verb::Arm).await;
                let _ = reply.send(r);
            }
            Request::Disarm { reply } => {
                self.release_offboard().await;
                let r = self.simple(Verb::Disarm).await;
                let _ = reply.send(r);
            }
            Request::Land { reply } => {
                self.release_offboard().await;
                let r = self.simple(Verb::Land).await;
                let _ = reply.send(r);
            }
            Request::Takeoff { reply } => self.start_takeoff(reply).await,
            Request::OverrideAirborne { reply } => {
                let r = self.override_airborne().await;
                let _ = reply.send(r);
            }
        }
    }

    async fn on_event(&mut self, ev: FlightEvent) {
        debug!("coordinator: {:?} in {:?}", ev, self.fsm.state());
        self.fsm.handle(self.link.as_mut(), ev).await;
        if ev == FlightEvent::BecameInAir {
            self.mapper.clear_pending();
            if let Some(t) = self.takeoff.take() {
                info!("coordinator: takeoff confirmed");
                let _ = t.reply.send(Ok(true));
            }
        }
    }

    /// Applies an in-air report. Edges are derived here, from the same value
    /// the setpoint gate reads.
    async fn on_in_air(&mut self, reported: bool) {
        if self.forced_airborne {
            if reported {
                self.forced_airborne = false;
            } else if self.above_airborne_altitude() {
                debug!("coordinator: landed report ignored, altitude still above threshold");
                return;
            } else {
                info!("coordinator: altitude back below threshold; airborne override released");
                self.forced_airborne = false;
            }
        }
        if self.state.set_in_air(reported) {
            let ev = if reported { FlightEvent::BecameInAir } else { FlightEvent::BecameGrounded };
            info!("telemetry: {:?}", ev);
            self.on_event(ev).await;
        }
    }

    fn above_airborne_altitude(&self) -> bool {
        self.state.snapshot().position.relative_altitude_m > self.cfg.flight.airborne_altitude_m()
    }

    async fn push(&mut self, why: Push) {
        let in_air = self.state.snapshot().in_air;
        if let Err(e) = self.mapper.push(&mut self.fsm, self.link.as_mut(), in_air, why).await {
            warn!("control: {}", e);
        }
    }

    async fn connect(&mut self, address: &str) -> Result<(), CoordinatorError> {
        if self.aggregator.is_some() {
            debug!("coordinator: already connected");
            return Ok(());
        }
        let limit = self.cfg.flight.connect_timeout();
        let deadline = Instant::now() + limit;
        info!("coordinator: connecting to {}", address);

        let mut conn = within(limit, self.link.connect(address)).await.map_err(|e| {
            warn!("coordinator: connect failed: {:#}", e);
            CoordinatorError::ConnectionFailure(format!("{:#}", e))
        })?;

        let came_up = async {
            while let Some(ev) = conn.next().await {
                if ev.is_connected {
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout_at(deadline, came_up).await {
            Ok(true) => {}
            Ok(false) => return Err(CoordinatorError::ConnectionFailure("link closed before coming up".into())),
            Err(_) => {
                warn!("coordinator: no link-up report within {:?}", limit);
                return Err(CoordinatorError::ConnectionFailure(format!("no connection within {:?}", limit)));
            }
        }

        self.state.set_connected(true);
        self.aggregator = Some(TelemetryAggregator::start(
            self.link.as_ref(),
            conn,
            self.state.clone(),
            self.events_tx.clone(),
        ));
        self.in_air = Some(self.link.subscribe_in_air());
        info!("coordinator: connected");
        Ok(())
    }

    async fn simple(&mut self, verb: Verb) -> Result<(), CoordinatorError> {
        let limit = self.cfg.flight.call_timeout();
        let link = self.link.as_mut();
        let r = match verb {
            Verb::Arm => within(limit, link.arm()).await,
            Verb::Disarm => within(limit, link.disarm()).await,
            Verb::Land => within(limit, link.land()).await,
        };
        match r {
            Ok(()) => {
                info!("coordinator: {} accepted", verb.name());
                Ok(())
            }
            Err(e) => {
                warn!("coordinator: {} failed: {:#}", verb.name(), e);
                Err(CoordinatorError::rejected(verb.name(), &e))
            }
        }
    }

    async fn release_offboard(&mut self) {
        if let Err(e) = self.fsm.exit_offboard(self.link.as_mut()).await {
            warn!("coordinator: {}", e);
        }
    }

    async fn start_takeoff(&mut self, reply: Reply<bool>) {
        if self.takeoff.is_some() {
            let _ = reply.send(Err(CoordinatorError::ActionRejected {
                action: "takeoff",
                reason: "takeoff already in progress".into(),
            }));
            return;
        }
        match self.issue_takeoff().await {
            Err(e) => {
                warn!("coordinator: {}", e);
                let _ = reply.send(Err(e));
            }
            Ok(()) if self.fsm.is_airborne() => {
                let _ = reply.send(Ok(true));
            }
            Ok(()) => {
                let deadline = Instant::now() + self.cfg.flight.takeoff_grace();
                self.takeoff = Some(PendingTakeoff { deadline, reply });
            }
        }
    }

    async fn issue_takeoff(&mut self) -> Result<(), CoordinatorError> {
        let limit = self.cfg.flight.call_timeout();
        let altitude = self.cfg.flight.takeoff_altitude_m();
        let link = self.link.as_mut();

        if !self.state.snapshot().armed {
            within(limit, link.arm()).await.map_err(|e| CoordinatorError::ActionRejected {
                action: "takeoff",
                reason: format!("arm failed: {:#}", e),
            })?;
        }
        within(limit, link.set_takeoff_altitude(altitude))
            .await
            .map_err(|e| CoordinatorError::rejected("takeoff", &e))?;
        within(limit, link.takeoff())
            .await
            .map_err(|e| CoordinatorError::rejected("takeoff", &e))?;
        info!("coordinator: takeoff to {:.1} m issued", altitude);
        Ok(())
    }

    /// Grace period over without an in-air report.
    async fn finish_takeoff(&mut self) {
        let Some(t) = self.takeoff.take() else { return };
        let airborne = self.fsm.is_airborne() || self.force_airborne().await;
        if !airborne {
            warn!("coordinator: vehicle not airborne after takeoff grace period");
        }
        let _ = t.reply.send(Ok(airborne));
    }

    /// Forces the airborne transition when altitude is above the threshold.
    async fn force_airborne(&mut self) -> bool {
        if !self.above_airborne_altitude() {
            return false;
        }
        info!(
            "coordinator: no in-air report but altitude {:.1} m > {:.1} m; treating as airborne",
            self.state.snapshot().position.relative_altitude_m,
            self.cfg.flight.airborne_altitude_m()
        );
        self.forced_airborne = true;
        self.state.force_in_air();
        self.fsm.on_airborne(self.link.as_mut()).await;
        self.mapper.clear_pending();
        true
    }

    async fn override_airborne(&mut self) -> Result<(), CoordinatorError> {
        if !self.fsm.is_airborne() && !self.force_airborne().await {
            let alt = self.state.snapshot().position.relative_altitude_m;
            return Err(CoordinatorError::ActionRejected {
                action: "override",
                reason: format!(
                    "altitude {:.1} m is below {:.1} m",
                    alt,
                    self.cfg.flight.airborne_altitude_m()
                ),
            });
        }
        self.fsm.enter_offboard(self.link.as_mut()).await
    }

    async fn teardown(mut self) {
        if let Some(t) = self.takeoff.take() {
            let _ = t.reply.send(Err(CoordinatorError::Stopped));
        }
        self.release_offboard().await;
        if let Some(agg) = self.aggregator.take() {
            agg.stop().await;
        }
        self.flight_tx.send_replace(self.fsm.state());
        info!("coordinator: stopped");
    }
}

async fn next_report(topic: &mut Option<Topic<bool>>) -> Option<bool> {
    match topic {
        Some(t) => t.next().await,
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

use crate::control::commander::Commander;
use crate::control::messages::Message;
use crate::control::rail_system::components::{Address, SensorLevel, Speed, TurnoutState};
use crate::control::rail_system::path_finder::{
    find_path, LayoutConstraints, NextStationConstraints, ReservedBlockPolicy, SearchSettings,
};
use crate::control::rail_system::rail_graph::GraphPathElement;
use crate::control::rail_system::railroad::Railroad;
use crate::control::rail_system::shortest_path::shortest_path;
use crate::control::rail_system::RailError;
use crate::control::train::{Destination, Route, RouteMode, TrainEvent, Trigger};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The single consumer of the control loop.
///
/// Every message is worked off completely, including all follow-up
/// evaluation passes, before the next one is taken from the channel.
/// That gives one writer per tick: the per-record locks never contend
/// for mutation, only against snapshot readers.
pub struct Scheduler<C: Commander> {
    railroad: Arc<Railroad>,
    commander: Arc<C>,
    receiver: mpsc::Receiver<Message>,
    halted: bool,
}

impl<C: Commander> Scheduler<C> {
    pub fn new(
        railroad: Arc<Railroad>,
        commander: Arc<C>,
    ) -> (Self, mpsc::Sender<Message>) {
        let (sender, receiver) = mpsc::channel(64);
        (
            Scheduler {
                railroad,
                commander,
                receiver,
                halted: false,
            },
            sender,
        )
    }

    pub fn railroad(&self) -> &Arc<Railroad> {
        &self.railroad
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Works the channel until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle(message).await;
        }
        debug!("scheduler channel closed");
    }

    /// Works off one message and every evaluation pass it causes.
    pub async fn handle(&mut self, message: Message) {
        debug!("handling {message:?}");
        match message {
            Message::RailOn => {
                if self.halted {
                    info!("track power restored, resuming");
                }
                self.halted = false;
            }
            Message::RailOff => {
                warn!("track power lost");
                self.emergency_halt().await;
            }
            _ if self.halted => {
                debug!("halted, dropping {message:?}");
            }
            Message::UpdateSensor(address, level) => {
                self.handle_sensor(address, level).await;
            }
            Message::TrainSpeed(address, speed) => {
                self.handle_manual_speed(address, speed).await;
            }
            Message::Turnout(address, state) => {
                self.handle_manual_turnout(address, state).await;
            }
            Message::TurnoutAck(address, state) => {
                // The physical layout is the truth; the record follows.
                if let Some(index) = self.railroad.graph().turnout_index(address) {
                    if let Some(record) = self.railroad.get_turnout_mutex(index) {
                        record.lock().await.set_state(state);
                    }
                }
                self.run_cycle(Trigger::Schedule).await;
            }
            Message::Tick(elapsed) => {
                self.run_cycle(Trigger::Tick(elapsed)).await;
            }
        }
    }

    async fn handle_sensor(&mut self, address: Address, level: SensorLevel) {
        if !self.railroad.set_sensor_level(address, level).await {
            warn!("activation of unknown sensor {address}");
            return;
        }
        if level == SensorLevel::Low {
            return;
        }
        // Anything active outside the expected set is a ghost and the
        // layout state can no longer be trusted.
        let expected = self.railroad.expected_sensors().await;
        if !expected.contains(&address) {
            error!("unexpected activation of sensor {address}");
            error!("{}", self.railroad.dump().await);
            self.emergency_halt().await;
            return;
        }
        self.run_cycle(Trigger::Sensor(address)).await;
    }

    async fn handle_manual_speed(&mut self, address: Address, speed: Speed) {
        let Some(mutex) = self.railroad.get_train(&address) else {
            warn!("speed for unknown train {address}");
            return;
        };
        let applied = mutex.lock().await.set_manual_speed(speed);
        if applied {
            self.commander.set_speed(address, speed).await;
        } else {
            debug!("train {address} is under automatic control, speed ignored");
        }
    }

    async fn handle_manual_turnout(&mut self, address: Address, state: TurnoutState) {
        let Some(index) = self.railroad.graph().turnout_index(address) else {
            warn!("command for unknown turnout {address}");
            return;
        };
        let Some(record) = self.railroad.get_turnout_mutex(index) else {
            return;
        };
        {
            let record = record.lock().await;
            // A turnout under a claim is the automatic system's; hand
            // commands must not pull it out from under a route.
            if record.reservation().is_some() {
                warn!("turnout {address} is claimed, command ignored");
                return;
            }
        }
        record.lock().await.set_state(state);
        self.commander.set_turnout(address, state).await;
        self.run_cycle(Trigger::Schedule).await;
    }

    /// Evaluates every train, in address order, until a full pass
    /// changes nothing. The causing trigger is delivered on the first
    /// pass only.
    async fn run_cycle(&mut self, trigger: Trigger) {
        let mut trigger = trigger;
        loop {
            let mut changed = false;
            for address in self.railroad.train_addresses() {
                let Some(mutex) = self.railroad.get_train(&address) else {
                    continue;
                };
                let mut events = Vec::new();
                let result = {
                    let mut train = mutex.lock().await;
                    train.evaluate(&self.railroad, trigger, &mut events).await
                };
                match result {
                    Ok(train_changed) => changed |= train_changed,
                    Err(err) => {
                        error!("evaluation of train {address} failed: {err}");
                        error!("{}", self.railroad.dump().await);
                        self.emergency_halt().await;
                        return;
                    }
                }
                self.execute(events).await;
            }
            if !changed {
                break;
            }
            trigger = Trigger::Schedule;
        }
    }

    async fn execute(&self, events: Vec<TrainEvent>) {
        for event in events {
            match event {
                TrainEvent::SpeedChanged(train, speed) => {
                    self.commander.set_speed(train, speed).await;
                }
                TrainEvent::TurnoutRequested(turnout, state) => {
                    self.commander.set_turnout(turnout, state).await;
                }
                TrainEvent::PositionChanged(train, block, position) => {
                    debug!("train {train} at {block:?} position {position}");
                }
                TrainEvent::BlockEntered(train, block) => {
                    debug!("train {train} entered {block:?}");
                }
                TrainEvent::RouteRegenerated(train) => {
                    info!("train {train} got a fresh route");
                }
                TrainEvent::StopArmed(train) => {
                    info!("train {train} will stop at the end of its claims");
                }
            }
        }
    }

    async fn emergency_halt(&mut self) {
        self.halted = true;
        self.commander.emergency_stop_all().await;
        self.railroad.emergency_stop_all().await;
        warn!("layout halted, awaiting power-on");
    }

    /// Puts a train under automatic control towards `destination`.
    ///
    /// Returns whether a route was found; finding none leaves the train
    /// untouched.
    pub async fn start_train(
        &mut self,
        address: Address,
        destination: Destination,
    ) -> Result<bool, RailError> {
        let Some(mutex) = self.railroad.get_train(&address) else {
            return Err(RailError::TrainNotFound(address));
        };
        let graph = self.railroad.graph();
        let view = self.railroad.reservation_view().await;
        let path = {
            let train = mutex.lock().await;
            let constraints = LayoutConstraints {
                view: &view,
                train: address,
                policy: ReservedBlockPolicy::AvoidFirst,
                avoided: &[],
            };
            let start =
                GraphPathElement::starting(train.block(), train.direction().exit_socket());
            match destination {
                Destination::Once { block, direction } => shortest_path(
                    graph,
                    start,
                    GraphPathElement::ending(block, direction.entry_socket()),
                    &constraints,
                ),
                Destination::Endless => find_path(
                    graph,
                    start,
                    None,
                    &SearchSettings::default(),
                    &NextStationConstraints {
                        inner: constraints,
                        start: train.block(),
                    },
                ),
            }
        };
        let Some(path) = path else {
            info!("no route for train {address} towards {destination:?}");
            return Ok(false);
        };
        let route = Route::from_path(graph, &path, RouteMode::Automatic(destination))?;
        mutex.lock().await.set_route(route);
        info!("train {address} scheduled: {path}");
        self.run_cycle(Trigger::Schedule).await;
        Ok(true)
    }

    /// Assigns a fixed, user-built route.
    pub async fn drive_route(&mut self, address: Address, route: Route) -> Result<(), RailError> {
        let Some(mutex) = self.railroad.get_train(&address) else {
            return Err(RailError::TrainNotFound(address));
        };
        mutex.lock().await.set_route(route);
        self.run_cycle(Trigger::Schedule).await;
        Ok(())
    }

    /// Requests a stop at the next opportunity. `completely` releases
    /// the train from automatic control once it stands.
    pub async fn stop_train(&mut self, address: Address, completely: bool) -> Result<(), RailError> {
        let Some(mutex) = self.railroad.get_train(&address) else {
            return Err(RailError::TrainNotFound(address));
        };
        mutex.lock().await.request_stop(completely);
        self.run_cycle(Trigger::Schedule).await;
        Ok(())
    }

    /// Lets a train run to the next station and releases it there.
    pub async fn finish_train(&mut self, address: Address) -> Result<(), RailError> {
        let Some(mutex) = self.railroad.get_train(&address) else {
            return Err(RailError::TrainNotFound(address));
        };
        mutex.lock().await.request_finish();
        self.run_cycle(Trigger::Schedule).await;
        Ok(())
    }

    /// Sends every train on an endless station-to-station run.
    pub async fn start_all(&mut self) -> Result<(), RailError> {
        for address in self.railroad.train_addresses() {
            self.start_train(address, Destination::Endless).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&mut self, completely: bool) -> Result<(), RailError> {
        for address in self.railroad.train_addresses() {
            self.stop_train(address, completely).await?;
        }
        Ok(())
    }
}

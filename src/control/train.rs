use crate::control::rail_system::components::{
    Address, BlockCategory, Direction, Node, Socket, Speed, TurnoutState,
};
use crate::control::rail_system::path_finder::{
    find_path, LayoutConstraints, NextStationConstraints, ReservedBlockPolicy, SearchSettings,
};
use crate::control::rail_system::rail_graph::{GraphPath, GraphPathElement, RailGraph};
use crate::control::rail_system::railroad::Railroad;
use crate::control::rail_system::RailError;
use log::{debug, warn};
use petgraph::graph::NodeIndex;
use std::collections::VecDeque;
use std::time::Duration;

/// How long a train holds in a station on an endless route before the
/// restart countdown elapses, unless the route step carries its own
/// wait.
pub const DEFAULT_STATION_WAIT: Duration = Duration::from_secs(10);

/// Movement state of one train.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TrainState {
    Stopped,
    Running,
    Braking,
    Stopping,
}

/// Whether and how the movement handling acts on a train.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScheduleMode {
    /// Driven by hand; only position tracking applies.
    Unmanaged,
    /// Fully automatic.
    Managed,
    /// Stop at the next opportunity.
    StopRequested { completely: bool },
    /// Run until the next station, then stop for good.
    FinishRequested,
}

/// Target of an automatic route.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Destination {
    /// A specific block, entered in a specific direction.
    Once {
        block: NodeIndex,
        direction: Direction,
    },
    /// Whatever station is reachable next, forever.
    Endless,
}

/// Fixed user route or regenerated-on-demand automatic route.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RouteMode {
    Manual,
    Automatic(Destination),
}

/// One element of a route.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RouteStep {
    Block {
        node: NodeIndex,
        direction: Direction,
        wait: Option<Duration>,
    },
    Turnout {
        node: NodeIndex,
        entry: Socket,
        exit: Socket,
    },
}

impl RouteStep {
    pub fn node(&self) -> NodeIndex {
        match self {
            RouteStep::Block { node, .. } | RouteStep::Turnout { node, .. } => *node,
        }
    }
}

/// An ordered sequence of block and turnout steps a train intends to
/// follow.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Route {
    pub mode: RouteMode,
    pub steps: Vec<RouteStep>,
}

impl Route {
    pub fn new(mode: RouteMode, steps: Vec<RouteStep>) -> Self {
        Route { mode, steps }
    }

    /// Converts a search result into route steps. The first element of
    /// a search is the train's own block.
    pub fn from_path(
        graph: &RailGraph,
        path: &GraphPath,
        mode: RouteMode,
    ) -> Result<Route, RailError> {
        let mut steps = Vec::with_capacity(path.len());
        for element in &path.elements {
            let node = graph
                .node(element.node)
                .ok_or(RailError::NodeNotFound(element.node))?;
            match node {
                Node::Block(_) => {
                    let direction = match (element.entry, element.exit) {
                        (Some(entry), _) => Direction::from_entry(entry),
                        (None, Some(exit)) => Direction::from_entry(exit).opposite(),
                        (None, None) => return Err(RailError::IncompleteStep(element.node)),
                    };
                    steps.push(RouteStep::Block {
                        node: element.node,
                        direction,
                        wait: None,
                    });
                }
                Node::Turnout(_) => {
                    let (entry, exit) = element
                        .entry
                        .zip(element.exit)
                        .ok_or(RailError::IncompleteStep(element.node))?;
                    steps.push(RouteStep::Turnout {
                        node: element.node,
                        entry,
                        exit,
                    });
                }
            }
        }
        Ok(Route { mode, steps })
    }
}

/// What caused the current evaluation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Trigger {
    /// A sensor went high.
    Sensor(Address),
    /// Wall time passed.
    Tick(Duration),
    /// A scheduling call or a follow-up convergence pass.
    Schedule,
}

/// Effect of an evaluation, drained and executed by the scheduler.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TrainEvent {
    SpeedChanged(Address, Speed),
    PositionChanged(Address, NodeIndex, usize),
    BlockEntered(Address, NodeIndex),
    TurnoutRequested(Address, TurnoutState),
    RouteRegenerated(Address),
    StopArmed(Address),
}

/// New position index after `sensor_index` fired under a train at
/// `position`, or `None` when the activation does not move the train.
///
/// Strict mode only accepts the one sensor immediately ahead, guarding
/// against noise and out-of-order activations. Non-strict mode accepts
/// any sensor ahead and jumps past it, tolerating missed sensors.
/// Positions count sensor gaps: a train before sensor `i` holds
/// position `i` when travelling towards next, `i + 1` when travelling
/// towards previous.
pub fn position_after_feedback(
    strict: bool,
    direction: Direction,
    position: usize,
    sensor_index: usize,
) -> Option<usize> {
    match (strict, direction) {
        (true, Direction::Next) => (sensor_index == position).then(|| position + 1),
        (true, Direction::Previous) => {
            (position > 0 && sensor_index == position - 1).then(|| position - 1)
        }
        (false, Direction::Next) => (sensor_index >= position).then(|| sensor_index + 1),
        (false, Direction::Previous) => (sensor_index < position).then_some(sensor_index),
    }
}

/// A block a train currently occupies, head first, together with the
/// turnouts it crossed right after leaving it. Those turnouts clear
/// when the block clears.
#[derive(Debug, Clone)]
struct OccupiedBlock {
    node: NodeIndex,
    turnouts_ahead: Vec<NodeIndex>,
}

/// One train and its movement handling.
///
/// Every externally triggered change runs through [`Train::evaluate`],
/// which works the fixed sub-step order: start, move, stop trigger,
/// route regeneration, advance. The scheduler re-invokes evaluation
/// until no sub-step reports a change.
#[derive(Debug, Clone)]
pub struct Train {
    address: Address,
    block: NodeIndex,
    position: usize,
    direction: Direction,
    speed: Speed,
    state: TrainState,
    mode: ScheduleMode,
    route: Option<Route>,
    step_index: usize,
    occupied: VecDeque<OccupiedBlock>,
    length_blocks: usize,
    strict_position: bool,
    restart_countdown: Option<Duration>,
    regenerations: u32,
    stop_armed: bool,
    stop_completely: bool,
}

impl Train {
    pub fn new(address: Address, block: NodeIndex, direction: Direction) -> Self {
        let mut occupied = VecDeque::new();
        occupied.push_back(OccupiedBlock {
            node: block,
            turnouts_ahead: Vec::new(),
        });
        Train {
            address,
            block,
            position: 0,
            direction,
            speed: Speed::Stop,
            state: TrainState::Stopped,
            mode: ScheduleMode::Unmanaged,
            route: None,
            step_index: 0,
            occupied,
            length_blocks: 0,
            strict_position: true,
            restart_countdown: None,
            regenerations: 0,
            stop_armed: false,
            stop_completely: false,
        }
    }

    /// Number of trailing blocks kept claimed behind the head, for
    /// trains longer than one block.
    pub fn with_length(mut self, length_blocks: usize) -> Self {
        self.length_blocks = length_blocks;
        self
    }

    /// Accept skipped sensors instead of ignoring them.
    pub fn tolerant_positioning(mut self) -> Self {
        self.strict_position = false;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn block(&self) -> NodeIndex {
        self.block
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// How often an automatic route has been recomputed or attempted.
    pub fn regenerations(&self) -> u32 {
        self.regenerations
    }

    pub fn is_moving(&self) -> bool {
        !self.speed.is_stopped()
    }

    pub fn occupied_blocks(&self) -> impl Iterator<Item = &NodeIndex> {
        self.occupied.iter().map(|occupied| &occupied.node)
    }

    /// Block under the leading wagon when the locomotive pushes its
    /// consist ahead of itself. Pushed consists are not tracked yet.
    pub fn head_wagon_block(&self) -> Option<NodeIndex> {
        None
    }

    pub fn stands(&self) -> bool {
        self.speed.is_stopped()
    }

    /// Assigns a route and puts the train under automatic control.
    pub fn set_route(&mut self, route: Route) {
        self.route = Some(route);
        self.step_index = 0;
        self.stop_armed = false;
        self.stop_completely = false;
        self.mode = ScheduleMode::Managed;
    }

    /// Applies a hand-driving speed. Trains under automatic control
    /// ignore it.
    pub fn set_manual_speed(&mut self, speed: Speed) -> bool {
        if self.mode != ScheduleMode::Unmanaged {
            return false;
        }
        self.speed = speed;
        self.state = if speed.is_stopped() {
            TrainState::Stopped
        } else {
            TrainState::Running
        };
        true
    }

    pub fn request_stop(&mut self, completely: bool) {
        if self.mode != ScheduleMode::Unmanaged {
            self.mode = ScheduleMode::StopRequested { completely };
        }
    }

    pub fn request_finish(&mut self) {
        if matches!(self.mode, ScheduleMode::Managed) {
            self.mode = ScheduleMode::FinishRequested;
        }
    }

    pub fn emergency_stop(&mut self) {
        self.speed = Speed::EmergencyStop;
        self.state = TrainState::Stopped;
        self.mode = ScheduleMode::Unmanaged;
        self.stop_armed = false;
        self.restart_countdown = None;
    }

    pub fn describe(&self) -> String {
        format!(
            "train {}: block {:?} pos {} dir {:?} speed {} state {:?} mode {:?} step {}",
            self.address,
            self.block,
            self.position,
            self.direction,
            self.speed,
            self.state,
            self.mode,
            self.step_index,
        )
    }

    /// Absolute step index, node and direction of the next block in the
    /// route after the current one.
    fn next_block_step(&self) -> Option<(usize, NodeIndex, Direction)> {
        let route = self.route.as_ref()?;
        route
            .steps
            .iter()
            .enumerate()
            .skip(self.step_index + 1)
            .find_map(|(index, step)| match step {
                RouteStep::Block {
                    node, direction, ..
                } => Some((index, *node, *direction)),
                RouteStep::Turnout { .. } => None,
            })
    }

    /// The elements to claim for moving one block ahead: the turnouts
    /// in between, then the block itself.
    fn elements_to_next_block(&self) -> Option<Vec<GraphPathElement>> {
        let (block_step, node, direction) = self.next_block_step()?;
        let route = self.route.as_ref()?;
        let mut elements = Vec::new();
        for step in &route.steps[self.step_index + 1..block_step] {
            if let RouteStep::Turnout { node, entry, exit } = step {
                elements.push(GraphPathElement::between(*node, *entry, *exit));
            }
        }
        elements.push(GraphPathElement::between(
            node,
            direction.entry_socket(),
            direction.exit_socket(),
        ));
        Some(elements)
    }

    fn turnouts_to_next_block(&self) -> Vec<NodeIndex> {
        match (self.next_block_step(), self.route.as_ref()) {
            (Some((block_step, ..)), Some(route)) => route.steps
                [self.step_index + 1..block_step]
                .iter()
                .filter_map(|step| match step {
                    RouteStep::Turnout { node, .. } => Some(*node),
                    RouteStep::Block { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn wait_of_current_step(&self) -> Duration {
        self.route
            .as_ref()
            .and_then(|route| route.steps.get(self.step_index))
            .and_then(|step| match step {
                RouteStep::Block { wait, .. } => *wait,
                RouteStep::Turnout { .. } => None,
            })
            .unwrap_or(DEFAULT_STATION_WAIT)
    }

    fn block_category(&self, graph: &RailGraph, node: NodeIndex) -> Option<BlockCategory> {
        graph.node(node)?.as_block().map(|block| block.category())
    }

    /// Whether a stop is due in the current block, and whether it
    /// releases the train completely.
    fn stop_pending(&self, graph: &RailGraph) -> Option<bool> {
        if self.stop_armed {
            return Some(self.stop_completely);
        }
        if let ScheduleMode::StopRequested { completely } = self.mode {
            return Some(completely);
        }
        let route = self.route.as_ref()?;
        if self.next_block_step().is_none() {
            // End of the route. Endless routes pause and regenerate.
            return Some(!matches!(
                route.mode,
                RouteMode::Automatic(Destination::Endless)
            ));
        }
        if let RouteMode::Automatic(Destination::Once { block, .. }) = route.mode {
            if block == self.block {
                return Some(true);
            }
        }
        let in_station = self.step_index > 0
            && self.block_category(graph, self.block) == Some(BlockCategory::Station);
        if in_station {
            match (self.mode, route.mode) {
                (ScheduleMode::FinishRequested, _) => return Some(true),
                (_, RouteMode::Automatic(Destination::Endless)) => return Some(false),
                _ => {}
            }
        }
        None
    }

    /// One full pass over the movement sub-steps. Returns whether any
    /// of them changed something; the scheduler re-invokes until a pass
    /// reports no change.
    pub async fn evaluate(
        &mut self,
        railroad: &Railroad,
        trigger: Trigger,
        events: &mut Vec<TrainEvent>,
    ) -> Result<bool, RailError> {
        if self.mode == ScheduleMode::Unmanaged {
            // Hand-driven trains still get their position and block
            // tracked, else the safety picture drifts off the layout.
            let mut changed = self.handle_move(railroad.graph(), trigger, events);
            changed |= self.follow_handover(railroad, trigger, events).await?;
            return Ok(changed);
        }
        let mut changed = false;
        changed |= self.try_start(railroad, events).await;
        changed |= self.handle_move(railroad.graph(), trigger, events);
        changed |= self.handle_stop_trigger(railroad, events).await;
        changed |= self.regenerate_route(railroad, events).await?;
        changed |= self.try_advance(railroad, trigger, events).await?;
        if let Trigger::Tick(elapsed) = trigger {
            changed |= self.tick(elapsed);
        }
        Ok(changed)
    }

    /// Start sub-step: a stopped, managed train with a route claims the
    /// way into the next block and accelerates.
    async fn try_start(&mut self, railroad: &Railroad, events: &mut Vec<TrainEvent>) -> bool {
        if self.state != TrainState::Stopped
            || self.stop_armed
            || self.restart_countdown.is_some()
            || !matches!(
                self.mode,
                ScheduleMode::Managed | ScheduleMode::FinishRequested
            )
        {
            return false;
        }
        let Some(elements) = self.elements_to_next_block() else {
            return false;
        };
        match railroad.reserve(self.address, &elements).await {
            Some(commands) => {
                for (address, state) in commands {
                    events.push(TrainEvent::TurnoutRequested(address, state));
                }
                self.speed = Speed::cruising();
                self.state = TrainState::Running;
                self.stop_completely = false;
                events.push(TrainEvent::SpeedChanged(self.address, self.speed));
                debug!("train {} starts", self.address);
                true
            }
            None => false,
        }
    }

    /// Move sub-step: a sensor under the train updates its position
    /// within the block.
    fn handle_move(
        &mut self,
        graph: &RailGraph,
        trigger: Trigger,
        events: &mut Vec<TrainEvent>,
    ) -> bool {
        let Trigger::Sensor(sensor) = trigger else {
            return false;
        };
        if graph.sensor_owner(sensor) != Some(self.block) {
            return false;
        }
        let Some(shape) = graph.node(self.block).and_then(Node::as_block) else {
            return false;
        };
        let Some(index) = shape.sensor_index(sensor) else {
            return false;
        };
        match position_after_feedback(self.strict_position, self.direction, self.position, index) {
            Some(position) if position != self.position => {
                self.position = position;
                events.push(TrainEvent::PositionChanged(
                    self.address,
                    self.block,
                    position,
                ));
                true
            }
            _ => false,
        }
    }

    /// Follow sub-step for hand-driven trains: the entry sensor of the
    /// physically connected next block moves the occupancy along with
    /// the train. Without this a manual drive would trip the ghost
    /// detection on its own block change.
    async fn follow_handover(
        &mut self,
        railroad: &Railroad,
        trigger: Trigger,
        events: &mut Vec<TrainEvent>,
    ) -> Result<bool, RailError> {
        let Trigger::Sensor(sensor) = trigger else {
            return Ok(false);
        };
        if !self.is_moving() || railroad.graph().sensor_owner(sensor) == Some(self.block) {
            return Ok(false);
        }
        let exit = self.direction.exit_socket();
        let Some((next, entry)) = railroad.next_block_along(self.block, exit).await else {
            return Ok(false);
        };
        let next_direction = Direction::from_entry(entry);
        let Some(shape) = railroad.graph().node(next).and_then(Node::as_block) else {
            return Ok(false);
        };
        if shape.entry_sensor(next_direction) != Some(sensor) {
            return Ok(false);
        }

        railroad
            .occupy_block(next, self.address, next_direction)
            .await?;
        self.occupied.push_front(OccupiedBlock {
            node: next,
            turnouts_ahead: Vec::new(),
        });
        self.block = next;
        self.direction = next_direction;
        self.position = shape.entry_position(next_direction);
        events.push(TrainEvent::BlockEntered(self.address, next));
        events.push(TrainEvent::PositionChanged(
            self.address,
            next,
            self.position,
        ));
        while self.occupied.len() > self.length_blocks + 1 {
            let Some(released) = self.occupied.pop_back() else {
                break;
            };
            railroad.vacate_block(released.node, self.address).await;
            railroad.free_node(released.node, self.address).await;
            for turnout in released.turnouts_ahead {
                railroad.free_node(turnout, self.address).await;
            }
        }
        Ok(true)
    }

    /// Stop sub-step: once a stop is due, the brake marker reduces the
    /// speed and the stop marker cuts it, releasing claims as
    /// requested.
    async fn handle_stop_trigger(
        &mut self,
        railroad: &Railroad,
        events: &mut Vec<TrainEvent>,
    ) -> bool {
        if self.state == TrainState::Stopping {
            // Speed has been cut; settle and release.
            let completely = self.stop_completely;
            let requested = matches!(self.mode, ScheduleMode::StopRequested { .. });
            self.finalize_stop(railroad, completely, requested).await;
            return true;
        }
        if !matches!(self.state, TrainState::Running | TrainState::Braking) {
            return false;
        }
        let Some(completely) = self.stop_pending(railroad.graph()) else {
            return false;
        };
        let Some(shape) = railroad
            .graph()
            .node(self.block)
            .and_then(Node::as_block)
        else {
            return false;
        };
        self.stop_completely = completely;
        if self.state == TrainState::Running
            && shape.reached(
                self.direction,
                self.position,
                shape.brake_position(self.direction),
            )
            && !shape.reached(
                self.direction,
                self.position,
                shape.stop_position(self.direction),
            )
        {
            self.state = TrainState::Braking;
            self.speed = self.speed.braked();
            events.push(TrainEvent::SpeedChanged(self.address, self.speed));
            return true;
        }
        if shape.reached(
            self.direction,
            self.position,
            shape.stop_position(self.direction),
        ) {
            self.state = TrainState::Stopping;
            self.speed = Speed::Stop;
            events.push(TrainEvent::SpeedChanged(self.address, self.speed));
            return true;
        }
        false
    }

    async fn finalize_stop(&mut self, railroad: &Railroad, completely: bool, requested: bool) {
        self.state = TrainState::Stopped;
        self.stop_armed = false;
        if completely {
            // Give back everything claimed beyond the train itself.
            if let Some(route) = self.route.take() {
                for step in &route.steps[self.step_index.saturating_add(1)..] {
                    railroad.free_node(step.node(), self.address).await;
                }
            }
            self.mode = ScheduleMode::Unmanaged;
            self.stop_completely = false;
            debug!("train {} released", self.address);
        } else if requested {
            // An operator stop holds until the operator acts again; no
            // countdown, the mode keeps start attempts locked out.
            self.restart_countdown = None;
            debug!("train {} stopped on request", self.address);
        } else {
            self.mode = ScheduleMode::Managed;
            self.restart_countdown = Some(self.wait_of_current_step());
            debug!(
                "train {} holds for {:?}",
                self.address, self.restart_countdown
            );
        }
    }

    /// Regeneration sub-step: an automatic route whose next block became
    /// unusable, or which ran out of steps, is recomputed from the
    /// current block. Finding nothing is not an error; the train waits.
    async fn regenerate_route(
        &mut self,
        railroad: &Railroad,
        events: &mut Vec<TrainEvent>,
    ) -> Result<bool, RailError> {
        let Some(route) = self.route.as_ref() else {
            return Ok(false);
        };
        let RouteMode::Automatic(destination) = route.mode else {
            return Ok(false);
        };
        let needed = match self.next_block_step() {
            // Route exhausted. Endless routes seek further, but only
            // once the scheduled station stop has completed, so the
            // fresh route never pre-empts the hold.
            None => destination == Destination::Endless && self.state == TrainState::Stopped,
            Some((_, node, _)) => railroad.block_unusable(node, self.address).await,
        };
        if !needed {
            return Ok(false);
        }
        self.regenerations += 1;
        let graph = railroad.graph();
        let view = railroad.reservation_view().await;
        let constraints = LayoutConstraints {
            view: &view,
            train: self.address,
            policy: ReservedBlockPolicy::AvoidFirst,
            avoided: &[],
        };
        let settings = SearchSettings::default();
        let start = GraphPathElement::starting(self.block, self.direction.exit_socket());
        let path = match destination {
            Destination::Once { block, direction } => find_path(
                graph,
                start,
                Some(GraphPathElement::ending(block, direction.entry_socket())),
                &settings,
                &constraints,
            ),
            Destination::Endless => find_path(
                graph,
                start,
                None,
                &settings,
                &NextStationConstraints {
                    inner: constraints,
                    start: self.block,
                },
            ),
        };
        match path {
            Some(path) => {
                let mode = RouteMode::Automatic(destination);
                self.route = Some(Route::from_path(graph, &path, mode)?);
                self.step_index = 0;
                self.stop_armed = false;
                events.push(TrainEvent::RouteRegenerated(self.address));
                debug!("train {} rerouted: {}", self.address, path);
                Ok(true)
            }
            None => {
                debug!("train {} found no route, waiting", self.address);
                Ok(false)
            }
        }
    }

    /// Advance sub-step: the entry sensor of the reserved next block
    /// moves the train into it and claims one more block ahead.
    async fn try_advance(
        &mut self,
        railroad: &Railroad,
        trigger: Trigger,
        events: &mut Vec<TrainEvent>,
    ) -> Result<bool, RailError> {
        let Trigger::Sensor(sensor) = trigger else {
            return Ok(false);
        };
        let Some((block_step, next_node, next_direction)) = self.next_block_step() else {
            return Ok(false);
        };
        let Some(owner) = railroad.graph().sensor_owner(sensor) else {
            return Ok(false);
        };
        if owner == self.block {
            return Ok(false);
        }
        if owner != next_node {
            // Entry into some other block claimed by this train means
            // the train is not where the route believes it is.
            if railroad.is_reserved_for(owner, self.address).await
                && self.entry_sensor_of(railroad.graph(), owner, sensor)
            {
                warn!(
                    "train {} hit entry of {:?} instead of {:?}",
                    self.address, owner, next_node
                );
                return Err(RailError::DestinationMismatch(self.address));
            }
            return Ok(false);
        }
        if !railroad.is_reserved_for(next_node, self.address).await {
            return Ok(false);
        }
        let Some(shape) = railroad.graph().node(next_node).and_then(Node::as_block) else {
            return Ok(false);
        };
        if shape.entry_sensor(next_direction) != Some(sensor) {
            return Ok(false);
        }

        railroad
            .occupy_block(next_node, self.address, next_direction)
            .await?;
        let crossed = self.turnouts_to_next_block();
        if let Some(head) = self.occupied.front_mut() {
            head.turnouts_ahead = crossed;
        }
        self.occupied.push_front(OccupiedBlock {
            node: next_node,
            turnouts_ahead: Vec::new(),
        });
        self.block = next_node;
        self.direction = next_direction;
        self.position = shape.entry_position(next_direction);
        self.step_index = block_step;
        events.push(TrainEvent::BlockEntered(self.address, next_node));
        events.push(TrainEvent::PositionChanged(
            self.address,
            next_node,
            self.position,
        ));

        // Trailing release: blocks beyond the train's length clear,
        // together with the turnouts crossed after them.
        while self.occupied.len() > self.length_blocks + 1 {
            let Some(released) = self.occupied.pop_back() else {
                break;
            };
            railroad.vacate_block(released.node, self.address).await;
            railroad.free_node(released.node, self.address).await;
            for turnout in released.turnouts_ahead {
                railroad.free_node(turnout, self.address).await;
            }
        }

        // Claim one more block ahead; failing to is no error, the
        // train simply stops at the end of what it holds.
        if self.stop_pending(railroad.graph()).is_none() {
            if let Some(elements) = self.elements_to_next_block() {
                match railroad.reserve(self.address, &elements).await {
                    Some(commands) => {
                        for (address, state) in commands {
                            events.push(TrainEvent::TurnoutRequested(address, state));
                        }
                    }
                    None => {
                        self.stop_armed = true;
                        self.stop_completely = false;
                        events.push(TrainEvent::StopArmed(self.address));
                        debug!("train {} cannot claim ahead, stop armed", self.address);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Whether `sensor` is the entry sensor of `node` for whichever
    /// direction a reservation would have the train enter.
    fn entry_sensor_of(&self, graph: &RailGraph, node: NodeIndex, sensor: Address) -> bool {
        graph
            .node(node)
            .and_then(Node::as_block)
            .map_or(false, |shape| {
                shape.entry_sensor(Direction::Next) == Some(sensor)
                    || shape.entry_sensor(Direction::Previous) == Some(sensor)
            })
    }

    /// Countdown sub-step: wall time works off a station hold.
    fn tick(&mut self, elapsed: Duration) -> bool {
        match self.restart_countdown {
            Some(remaining) => {
                let remaining = remaining.saturating_sub(elapsed);
                self.restart_countdown = (!remaining.is_zero()).then_some(remaining);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_position_accepts_only_the_next_sensor() {
        assert_eq!(
            position_after_feedback(true, Direction::Next, 0, 0),
            Some(1)
        );
        assert_eq!(position_after_feedback(true, Direction::Next, 0, 1), None);
        assert_eq!(position_after_feedback(true, Direction::Next, 2, 1), None);
        assert_eq!(
            position_after_feedback(true, Direction::Previous, 2, 1),
            Some(1)
        );
        assert_eq!(
            position_after_feedback(true, Direction::Previous, 2, 0),
            None
        );
        assert_eq!(
            position_after_feedback(true, Direction::Previous, 0, 0),
            None
        );
    }

    #[test]
    fn tolerant_position_jumps_ahead_but_never_back() {
        assert_eq!(
            position_after_feedback(false, Direction::Next, 0, 2),
            Some(3)
        );
        assert_eq!(
            position_after_feedback(false, Direction::Next, 2, 2),
            Some(3)
        );
        assert_eq!(position_after_feedback(false, Direction::Next, 3, 1), None);
        assert_eq!(
            position_after_feedback(false, Direction::Previous, 3, 0),
            Some(0)
        );
        assert_eq!(
            position_after_feedback(false, Direction::Previous, 1, 2),
            None
        );
    }

    #[test]
    fn forward_positions_never_decrease() {
        // A plausible noisy activation sequence under forward travel.
        let fired = [0usize, 0, 1, 1, 2, 0, 3];
        for strict in [true, false] {
            let mut position = 0usize;
            for &sensor in &fired {
                if let Some(next) =
                    position_after_feedback(strict, Direction::Next, position, sensor)
                {
                    assert!(next >= position);
                    position = next;
                }
            }
        }
    }
}

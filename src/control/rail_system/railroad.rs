use crate::control::rail_system::components::{
    Address, BlockRecord, Direction, Node, Sensor, SensorLevel, Socket, TurnoutRecord,
    TurnoutState,
};
use crate::control::rail_system::path_finder::ReservationView;
use crate::control::rail_system::rail_graph::{GraphPathElement, Link, RailGraph};
use crate::control::rail_system::RailError;
use crate::control::train::Train;
use async_recursion::async_recursion;
use fixedbitset::FixedBitSet;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::Undirected;
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::sync::Mutex;

/// The railroad: the immutable layout graph plus every piece of mutable
/// runtime state, each behind its own lock.
///
/// All mutation happens from the scheduler's single consumer task, so
/// the locks only ever guard against readers; within one evaluation
/// tick there is exactly one writer.
pub struct Railroad {
    graph: RailGraph,
    trains: HashMap<Address, Mutex<Train>>,
    sensors: HashMap<Address, Mutex<Sensor>>,
    blocks: HashMap<NodeIndex, Mutex<BlockRecord>>,
    turnouts: HashMap<NodeIndex, Mutex<TurnoutRecord>>,
}

impl Railroad {
    pub fn graph(&self) -> &RailGraph {
        &self.graph
    }

    pub fn get_train(&self, address: &Address) -> Option<&Mutex<Train>> {
        self.trains.get(address)
    }

    /// Train addresses in ascending order. The scheduler evaluates
    /// trains in this order every tick, so reservation races between
    /// two trains resolve the same way on every run.
    pub fn train_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.trains.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn get_sensor_mutex(&self, address: &Address) -> Option<&Mutex<Sensor>> {
        self.sensors.get(address)
    }

    pub fn get_block_mutex(&self, index: NodeIndex) -> Option<&Mutex<BlockRecord>> {
        self.blocks.get(&index)
    }

    pub fn get_turnout_mutex(&self, index: NodeIndex) -> Option<&Mutex<TurnoutRecord>> {
        self.turnouts.get(&index)
    }

    pub async fn set_sensor_level(&self, address: Address, level: SensorLevel) -> bool {
        match self.sensors.get(&address) {
            Some(sensor) => {
                sensor.lock().await.set_level(level);
                true
            }
            None => false,
        }
    }

    /// Registers a new train, claiming and occupying the block it
    /// stands in.
    pub async fn add_train(&mut self, train: Train) -> Result<(), RailError> {
        let block = train.block();
        let record = self
            .blocks
            .get(&block)
            .ok_or(RailError::NodeNotFound(block))?;
        {
            let mut record = record.lock().await;
            if !record.occupy(train.address(), train.direction()) {
                return Err(RailError::BlockOccupied(block));
            }
            record.reserve(train.address(), train.direction());
        }
        self.trains.insert(train.address(), Mutex::new(train));
        Ok(())
    }

    /// Snapshot of reservations, occupancies and disabled nodes for the
    /// search engines.
    pub async fn reservation_view(&self) -> ReservationView {
        let mut view = ReservationView::default();
        for (&index, record) in &self.blocks {
            let record = record.lock().await;
            if !record.enabled() {
                view.record_disabled(index);
            }
            if let Some(reservation) = record.reservation() {
                view.record_reserved(index, reservation.train);
            }
            if let Some(occupancy) = record.occupancy() {
                view.record_occupied(index, occupancy.train);
            }
        }
        for (&index, record) in &self.turnouts {
            let record = record.lock().await;
            if !record.enabled() {
                view.record_disabled(index);
            }
            if let Some(reservation) = record.reservation() {
                view.record_reserved(index, reservation.train);
            }
        }
        view
    }

    /// Claims every element for `train`, all or nothing. On success the
    /// crossed turnouts are switched to the route's state and returned
    /// so the caller can command the physical layout.
    ///
    /// The check pass and the write pass are not interleaved with other
    /// writers because all mutation runs on the scheduler task.
    pub async fn reserve(
        &self,
        train: Address,
        elements: &[GraphPathElement],
    ) -> Option<Vec<(Address, TurnoutState)>> {
        // Check pass.
        for element in elements {
            match self.graph.node(element.node) {
                Some(Node::Block(_)) => {
                    let record = self.blocks.get(&element.node)?.lock().await;
                    if !record.enabled()
                        || record.reserved_by_other(train)
                        || record
                            .occupancy()
                            .map_or(false, |occupancy| occupancy.train != train)
                    {
                        return None;
                    }
                }
                Some(Node::Turnout(shape)) => {
                    let record = self.turnouts.get(&element.node)?.lock().await;
                    if !record.enabled() || record.reserved_by_other(train) {
                        return None;
                    }
                    // Unswitchable socket pairs fail the whole claim.
                    let (entry, exit) = (element.entry?, element.exit?);
                    shape.state_for(entry, exit)?;
                }
                None => return None,
            }
        }

        // Write pass.
        let mut commands = Vec::new();
        for element in elements {
            match self.graph.node(element.node) {
                Some(Node::Block(_)) => {
                    let direction = element
                        .entry
                        .map(Direction::from_entry)
                        .unwrap_or(Direction::Next);
                    let mut record = self.blocks.get(&element.node)?.lock().await;
                    record.reserve(train, direction);
                }
                Some(Node::Turnout(shape)) => {
                    let (entry, exit) = (element.entry?, element.exit?);
                    let state = shape.state_for(entry, exit)?;
                    let mut record = self.turnouts.get(&element.node)?.lock().await;
                    record.reserve(train, Direction::Next);
                    if record.state() != state {
                        record.set_state(state);
                        commands.push((shape.address(), state));
                    }
                }
                None => return None,
            }
        }
        Some(commands)
    }

    /// Releases `train`'s claim on a single node.
    pub async fn free_node(&self, index: NodeIndex, train: Address) {
        if let Some(record) = self.blocks.get(&index) {
            record.lock().await.free(train);
        }
        if let Some(record) = self.turnouts.get(&index) {
            record.lock().await.free(train);
        }
    }

    pub async fn occupy_block(
        &self,
        index: NodeIndex,
        train: Address,
        direction: Direction,
    ) -> Result<(), RailError> {
        let record = self
            .blocks
            .get(&index)
            .ok_or(RailError::NodeNotFound(index))?;
        if !record.lock().await.occupy(train, direction) {
            return Err(RailError::BlockOccupied(index));
        }
        Ok(())
    }

    pub async fn vacate_block(&self, index: NodeIndex, train: Address) {
        if let Some(record) = self.blocks.get(&index) {
            record.lock().await.vacate(train);
        }
    }

    pub async fn is_reserved_for(&self, index: NodeIndex, train: Address) -> bool {
        if let Some(record) = self.blocks.get(&index) {
            return record
                .lock()
                .await
                .reservation()
                .map_or(false, |reservation| reservation.train == train);
        }
        false
    }

    /// Whether routing may still send `train` into this block.
    pub async fn block_unusable(&self, index: NodeIndex, train: Address) -> bool {
        match self.blocks.get(&index) {
            Some(record) => {
                let record = record.lock().await;
                !record.enabled()
                    || record.reserved_by_other(train)
                    || record
                        .occupancy()
                        .map_or(false, |occupancy| occupancy.train != train)
            }
            None => true,
        }
    }

    /// The next block a train leaving `node` through `socket` would
    /// physically roll into, following the current state of every
    /// turnout on the way.
    ///
    /// Returns the block and its entry socket. `None` when a turnout is
    /// thrown against the movement or the track dead-ends.
    pub async fn next_block_along(
        &self,
        node: NodeIndex,
        socket: Socket,
    ) -> Option<(NodeIndex, Socket)> {
        let mut visited = FixedBitSet::with_capacity(self.graph.node_count());
        self.walk_to_block(node, socket, &mut visited).await
    }

    #[async_recursion]
    async fn walk_to_block(
        &self,
        node: NodeIndex,
        socket: Socket,
        visited: &mut FixedBitSet,
    ) -> Option<(NodeIndex, Socket)> {
        let (next, entry) = self.graph.link(node, socket)?;
        if visited.contains(next.index()) {
            return None;
        }
        visited.insert(next.index());
        match self.graph.node(next)? {
            Node::Block(_) => Some((next, entry)),
            Node::Turnout(shape) => {
                let state = self.turnouts.get(&next)?.lock().await.state();
                let exit = shape.active_exit(entry, state)?;
                self.walk_to_block(next, exit, visited).await
            }
        }
    }

    /// Every sensor that may legitimately be active right now: the
    /// sensors of every occupied block, plus, for each moving train,
    /// the entry sensor of the block it is about to roll into.
    ///
    /// Anything active outside this set is a ghost: wiring fault,
    /// manual interference or a derailment. The scheduler treats it as
    /// an emergency.
    pub async fn expected_sensors(&self) -> Vec<Address> {
        let mut expected = Vec::new();
        for mutex in self.trains.values() {
            let train = mutex.lock().await;
            for &occupied in train.occupied_blocks() {
                if let Some(Node::Block(shape)) = self.graph.node(occupied) {
                    expected.extend_from_slice(shape.sensors());
                }
            }
            if !train.is_moving() {
                continue;
            }
            // The physically connected next block, per current turnout
            // states; this covers manually driven trains as well.
            let exit = train.direction().exit_socket();
            if let Some((next, entry)) = self.next_block_along(train.block(), exit).await {
                if let Some(Node::Block(shape)) = self.graph.node(next) {
                    if let Some(sensor) = shape.entry_sensor(Direction::from_entry(entry)) {
                        expected.push(sensor);
                    }
                }
            }
        }
        expected
    }

    /// Stops every train and releases every reservation. Occupancies
    /// stay: the trains are still physically where they are.
    pub async fn emergency_stop_all(&self) {
        for mutex in self.trains.values() {
            mutex.lock().await.emergency_stop();
        }
        for record in self.blocks.values() {
            record.lock().await.force_free();
        }
        for record in self.turnouts.values() {
            record.lock().await.force_free();
        }
    }

    /// Plain-text state listing for support purposes. Not a stable
    /// machine format.
    pub async fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "railroad state");
        for address in self.train_addresses() {
            if let Some(mutex) = self.trains.get(&address) {
                let train = mutex.lock().await;
                let _ = writeln!(out, "  {}", train.describe());
            }
        }
        let mut indices: Vec<NodeIndex> = self.blocks.keys().copied().collect();
        indices.sort();
        for index in indices {
            let record = self.blocks[&index].lock().await;
            let address = self
                .graph
                .node(index)
                .map(|node| node.address().to_string())
                .unwrap_or_else(|| "?".to_string());
            let _ = writeln!(
                out,
                "  block {address}: enabled={} reserved={:?} occupied={:?}",
                record.enabled(),
                record.reservation().map(|r| r.train.address()),
                record.occupancy().map(|o| o.train.address()),
            );
        }
        out
    }
}

/// Assembles a [`Railroad`] from blocks, turnouts and socket links.
pub struct Builder {
    graph: Graph<Node, Link, Undirected>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            graph: Graph::default(),
        }
    }

    pub fn add_node(&mut self, node: Node) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Pairs `from_socket` of `from` with `to_socket` of `to`.
    ///
    /// Each socket carries at most one link; a second link on either
    /// socket is a layout error, as is a socket the node does not have.
    pub fn connect(
        &mut self,
        from: NodeIndex,
        from_socket: Socket,
        to: NodeIndex,
        to_socket: Socket,
    ) -> Result<(), RailError> {
        for (node, socket) in [(from, from_socket), (to, to_socket)] {
            let weight = self
                .graph
                .node_weight(node)
                .ok_or(RailError::NodeNotFound(node))?;
            if !weight.sockets().contains(&socket) {
                return Err(RailError::SocketNotFound(node, socket));
            }
            if self.socket_linked(node, socket) {
                return Err(RailError::AmbiguousLink(node, socket));
            }
        }
        self.graph.add_edge(
            from,
            to,
            Link {
                sockets: (from_socket, to_socket),
            },
        );
        Ok(())
    }

    fn socket_linked(&self, node: NodeIndex, socket: Socket) -> bool {
        use petgraph::visit::EdgeRef;
        self.graph.edges(node).any(|edge| {
            // For undirected graphs `edges` orients every incident
            // edge away from `node`; the endpoints keep the stored
            // orientation the socket tuple was written in.
            match self.graph.edge_endpoints(edge.id()) {
                Some((source, target)) => {
                    (source == node && edge.weight().sockets.0 == socket)
                        || (target == node && edge.weight().sockets.1 == socket)
                }
                None => false,
            }
        })
    }

    pub fn build(self) -> Result<Railroad, RailError> {
        let mut sensors = HashMap::new();
        let mut sensor_owner = HashMap::new();
        let mut blocks = HashMap::new();
        let mut turnouts = HashMap::new();
        for index in self.graph.node_indices() {
            match &self.graph[index] {
                Node::Block(shape) => {
                    for &sensor in shape.sensors() {
                        if sensor_owner.insert(sensor, index).is_some() {
                            return Err(RailError::DuplicateSensor(sensor));
                        }
                        sensors.insert(sensor, Mutex::new(Sensor::new(sensor)));
                    }
                    blocks.insert(index, Mutex::new(BlockRecord::default()));
                }
                Node::Turnout(_) => {
                    turnouts.insert(index, Mutex::new(TurnoutRecord::default()));
                }
            }
        }
        Ok(Railroad {
            graph: RailGraph::new(self.graph, sensor_owner),
            trains: HashMap::new(),
            sensors,
            blocks,
            turnouts,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

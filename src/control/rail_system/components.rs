use crate::general::{DefaultSpeedType, SpeedType};
use std::fmt;

/// Identifies a sensor, a turnout, a block or a train on the layout.
///
/// The spaces are independent: block 3 and train 3 are different things.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address(u16);

impl Address {
    pub fn new(address: u16) -> Self {
        Address(address)
    }

    pub fn address(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A numbered connection point on a block or turnout.
///
/// Blocks carry [`Socket::PREVIOUS`] and [`Socket::NEXT`]; turnouts use
/// 0 up to 3 depending on their kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Socket(u8);

impl Socket {
    pub const PREVIOUS: Socket = Socket(0);
    pub const NEXT: Socket = Socket(1);

    pub fn new(index: u8) -> Self {
        Socket(index)
    }

    pub fn index(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Travel direction through a block, relative to its socket numbering.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Direction {
    /// From the previous socket towards the next socket.
    Next,
    /// From the next socket towards the previous socket.
    Previous,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Next => Direction::Previous,
            Direction::Previous => Direction::Next,
        }
    }

    /// Socket a train travelling in this direction entered through.
    pub fn entry_socket(self) -> Socket {
        match self {
            Direction::Next => Socket::PREVIOUS,
            Direction::Previous => Socket::NEXT,
        }
    }

    /// Socket a train travelling in this direction leaves through.
    pub fn exit_socket(self) -> Socket {
        match self {
            Direction::Next => Socket::NEXT,
            Direction::Previous => Socket::PREVIOUS,
        }
    }

    /// Direction implied by entering a block through `socket`.
    pub fn from_entry(socket: Socket) -> Direction {
        if socket == Socket::PREVIOUS {
            Direction::Next
        } else {
            Direction::Previous
        }
    }
}

/// Occupancy level reported by a physical sensor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SensorLevel {
    Low,
    High,
}

/// State of one physical occupancy detector.
#[derive(Debug, Clone)]
pub struct Sensor {
    address: Address,
    level: SensorLevel,
}

impl Sensor {
    pub fn new(address: Address) -> Sensor {
        Sensor {
            address,
            level: SensorLevel::Low,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn level(&self) -> SensorLevel {
        self.level
    }

    pub fn set_level(&mut self, level: SensorLevel) {
        self.level = level;
    }
}

/// Requested or commanded train speed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Speed {
    Stop,
    Drive(DefaultSpeedType),
    EmergencyStop,
}

impl Speed {
    pub fn cruising() -> Speed {
        Speed::Drive(DefaultSpeedType::cruising())
    }

    /// Reduced speed reached after one braking step. Braking below the
    /// step resolution stops the train.
    pub fn braked(self) -> Speed {
        match self {
            Speed::Drive(value) => value
                .step_down(&DefaultSpeedType::braking_delta())
                .map_or(Speed::Stop, Speed::Drive),
            other => other,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Speed::Stop | Speed::EmergencyStop)
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speed::Stop => write!(f, "stop"),
            Speed::Drive(value) => write!(f, "drive({value})"),
            Speed::EmergencyStop => write!(f, "emergency"),
        }
    }
}

/// How a block may be used by routing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BlockCategory {
    /// Plain track section.
    Free,
    /// A train may schedule a stop here.
    Station,
    /// Dead end, connected on its previous side only.
    Siding,
}

/// Static shape of a block: a track section bounded by two sockets,
/// carrying zero or more sensors ordered from the previous towards the
/// next socket.
#[derive(Debug, Clone)]
pub struct BlockShape {
    address: Address,
    category: BlockCategory,
    length_next: usize,
    length_previous: usize,
    sensors: Vec<Address>,
}

impl BlockShape {
    pub fn new(
        address: Address,
        category: BlockCategory,
        length: usize,
        sensors: Vec<Address>,
    ) -> Self {
        BlockShape {
            address,
            category,
            length_next: length,
            length_previous: length,
            sensors,
        }
    }

    /// A block whose usable length differs by travel direction, e.g.
    /// one ending in a sharper curve on one side.
    pub fn with_lengths(
        address: Address,
        category: BlockCategory,
        length_next: usize,
        length_previous: usize,
        sensors: Vec<Address>,
    ) -> Self {
        BlockShape {
            address,
            category,
            length_next,
            length_previous,
            sensors,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn category(&self) -> BlockCategory {
        self.category
    }

    pub fn sensors(&self) -> &[Address] {
        &self.sensors
    }

    pub fn length(&self, direction: Direction) -> usize {
        match direction {
            Direction::Next => self.length_next,
            Direction::Previous => self.length_previous,
        }
    }

    pub fn sensor_index(&self, sensor: Address) -> Option<usize> {
        self.sensors.iter().position(|&s| s == sensor)
    }

    /// Sensor that fires first when a train enters travelling in
    /// `direction`.
    pub fn entry_sensor(&self, direction: Direction) -> Option<Address> {
        match direction {
            Direction::Next => self.sensors.first().copied(),
            Direction::Previous => self.sensors.last().copied(),
        }
    }

    /// Position index a train holds right after its entry sensor fired.
    pub fn entry_position(&self, direction: Direction) -> usize {
        match direction {
            Direction::Next => 1.min(self.sensors.len()),
            Direction::Previous => self.sensors.len().saturating_sub(1),
        }
    }

    /// Position index at which a scheduled stop starts braking.
    pub fn brake_position(&self, direction: Direction) -> usize {
        match direction {
            Direction::Next => self.sensors.len().saturating_sub(1),
            Direction::Previous => 1.min(self.sensors.len()),
        }
    }

    /// Position index at which a scheduled stop cuts the speed to zero.
    pub fn stop_position(&self, direction: Direction) -> usize {
        match direction {
            Direction::Next => self.sensors.len(),
            Direction::Previous => 0,
        }
    }

    /// Whether `position` lies at or past `marker` in `direction`.
    pub fn reached(&self, direction: Direction, position: usize, marker: usize) -> bool {
        match direction {
            Direction::Next => position >= marker,
            Direction::Previous => position <= marker,
        }
    }
}

/// Geometry of a turnout.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TurnoutKind {
    /// Sockets 0 (entry), 1 (straight), 2 (left branch).
    SingleLeft,
    /// Sockets 0 (entry), 1 (straight), 2 (right branch).
    SingleRight,
    /// Sockets 0 (entry), 1 (straight), 2 (right branch), 3 (left branch).
    ThreeWay,
    /// Sockets 0, 1 on one side, 2, 3 on the other. Straight joins 0-2
    /// and 1-3; crossed joins 0-3 and 1-2.
    DoubleSlip,
}

impl TurnoutKind {
    pub fn socket_count(&self) -> u8 {
        match self {
            TurnoutKind::SingleLeft | TurnoutKind::SingleRight => 3,
            TurnoutKind::ThreeWay | TurnoutKind::DoubleSlip => 4,
        }
    }
}

/// Discrete state of a turnout, selecting which socket pairs connect.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TurnoutState {
    Straight,
    BranchLeft,
    BranchRight,
    Crossed,
}

/// Static shape of a turnout.
#[derive(Debug, Clone)]
pub struct TurnoutShape {
    address: Address,
    kind: TurnoutKind,
    length: usize,
}

impl TurnoutShape {
    pub fn new(address: Address, kind: TurnoutKind, length: usize) -> Self {
        TurnoutShape {
            address,
            kind,
            length,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn kind(&self) -> TurnoutKind {
        self.kind
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Socket pairs connected in `state`, independent of entry side.
    fn connections(&self, state: TurnoutState) -> &'static [(u8, u8)] {
        match self.kind {
            TurnoutKind::SingleLeft => match state {
                TurnoutState::Straight => &[(0, 1)],
                TurnoutState::BranchLeft => &[(0, 2)],
                TurnoutState::BranchRight | TurnoutState::Crossed => &[],
            },
            TurnoutKind::SingleRight => match state {
                TurnoutState::Straight => &[(0, 1)],
                TurnoutState::BranchRight => &[(0, 2)],
                TurnoutState::BranchLeft | TurnoutState::Crossed => &[],
            },
            TurnoutKind::ThreeWay => match state {
                TurnoutState::Straight => &[(0, 1)],
                TurnoutState::BranchRight => &[(0, 2)],
                TurnoutState::BranchLeft => &[(0, 3)],
                TurnoutState::Crossed => &[],
            },
            TurnoutKind::DoubleSlip => match state {
                TurnoutState::Straight => &[(0, 2), (1, 3)],
                TurnoutState::Crossed => &[(0, 3), (1, 2)],
                TurnoutState::BranchLeft | TurnoutState::BranchRight => &[],
            },
        }
    }

    /// The state whose branch connects `entry` with `exit`, if any state
    /// does.
    pub fn state_for(&self, entry: Socket, exit: Socket) -> Option<TurnoutState> {
        let states = [
            TurnoutState::Straight,
            TurnoutState::BranchLeft,
            TurnoutState::BranchRight,
            TurnoutState::Crossed,
        ];
        states.into_iter().find(|&state| {
            self.connections(state).iter().any(|&(a, b)| {
                (a == entry.index() && b == exit.index())
                    || (b == entry.index() && a == exit.index())
            })
        })
    }

    /// Every exit physically reachable from `entry` in some state.
    pub fn all_exits(&self, entry: Socket) -> Vec<Socket> {
        match self.kind {
            TurnoutKind::SingleLeft | TurnoutKind::SingleRight => match entry.index() {
                0 => vec![Socket::new(1), Socket::new(2)],
                1 | 2 => vec![Socket::new(0)],
                _ => vec![],
            },
            TurnoutKind::ThreeWay => match entry.index() {
                0 => vec![Socket::new(1), Socket::new(2), Socket::new(3)],
                1 | 2 | 3 => vec![Socket::new(0)],
                _ => vec![],
            },
            TurnoutKind::DoubleSlip => match entry.index() {
                0 => vec![Socket::new(2), Socket::new(3)],
                1 => vec![Socket::new(3), Socket::new(2)],
                2 => vec![Socket::new(0), Socket::new(1)],
                3 => vec![Socket::new(1), Socket::new(0)],
                _ => vec![],
            },
        }
    }

    /// The single exit selected by the current `state`, or `None` when
    /// `entry` is disconnected in that state.
    pub fn active_exit(&self, entry: Socket, state: TurnoutState) -> Option<Socket> {
        self.connections(state).iter().find_map(|&(a, b)| {
            if a == entry.index() {
                Some(Socket::new(b))
            } else if b == entry.index() {
                Some(Socket::new(a))
            } else {
                None
            }
        })
    }
}

/// A track element of the layout graph: either a block or a turnout.
///
/// Only the static shape lives in the graph; everything that changes at
/// runtime (turnout state, reservations, occupancy) is kept in the
/// per-node records of the railroad.
#[derive(Debug, Clone)]
pub enum Node {
    Block(BlockShape),
    Turnout(TurnoutShape),
}

impl Node {
    pub fn address(&self) -> Address {
        match self {
            Node::Block(block) => block.address(),
            Node::Turnout(turnout) => turnout.address(),
        }
    }

    /// Physical length used as the path cost of crossing this element
    /// after entering through `entry`.
    pub fn weight_from(&self, entry: Socket) -> usize {
        match self {
            Node::Block(block) => block.length(Direction::from_entry(entry)),
            Node::Turnout(turnout) => turnout.length(),
        }
    }

    pub fn sockets(&self) -> Vec<Socket> {
        match self {
            Node::Block(block) => {
                if block.category() == BlockCategory::Siding {
                    vec![Socket::PREVIOUS]
                } else {
                    vec![Socket::PREVIOUS, Socket::NEXT]
                }
            }
            Node::Turnout(turnout) => (0..turnout.kind().socket_count()).map(Socket::new).collect(),
        }
    }

    /// Every exit reachable from `entry` over some turnout state.
    /// Blocks connect their two sides; sidings dead-end.
    pub fn all_exits(&self, entry: Socket) -> Vec<Socket> {
        match self {
            Node::Block(block) => {
                if block.category() == BlockCategory::Siding {
                    vec![]
                } else if entry == Socket::PREVIOUS {
                    vec![Socket::NEXT]
                } else {
                    vec![Socket::PREVIOUS]
                }
            }
            Node::Turnout(turnout) => turnout.all_exits(entry),
        }
    }

    pub fn as_block(&self) -> Option<&BlockShape> {
        match self {
            Node::Block(block) => Some(block),
            Node::Turnout(_) => None,
        }
    }

    pub fn as_turnout(&self) -> Option<&TurnoutShape> {
        match self {
            Node::Turnout(turnout) => Some(turnout),
            Node::Block(_) => None,
        }
    }
}

/// Exclusive claim on a block or turnout.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Reservation {
    pub train: Address,
    pub direction: Direction,
}

/// A train physically inside a block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Occupancy {
    pub train: Address,
    pub direction: Direction,
}

/// Runtime record of a block.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    enabled: bool,
    reservation: Option<Reservation>,
    occupancy: Option<Occupancy>,
}

impl Default for BlockRecord {
    fn default() -> Self {
        BlockRecord {
            enabled: true,
            reservation: None,
            occupancy: None,
        }
    }
}

impl BlockRecord {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn reservation(&self) -> Option<Reservation> {
        self.reservation
    }

    pub fn occupancy(&self) -> Option<Occupancy> {
        self.occupancy
    }

    /// Claims this block. A claim held by the same train is kept; a
    /// claim held by another train is never overwritten.
    pub fn reserve(&mut self, train: Address, direction: Direction) -> bool {
        match self.reservation {
            Some(reservation) => reservation.train == train,
            None => {
                self.reservation = Some(Reservation { train, direction });
                true
            }
        }
    }

    /// Releases the claim, but only for the holding train.
    pub fn free(&mut self, train: Address) {
        if let Some(reservation) = self.reservation {
            if reservation.train == train {
                self.reservation = None;
            }
        }
    }

    pub fn force_free(&mut self) {
        self.reservation = None;
    }

    pub fn reserved_by_other(&self, train: Address) -> bool {
        self.reservation
            .map_or(false, |reservation| reservation.train != train)
    }

    /// Marks `train` as physically inside. Fails while another train
    /// occupies the block.
    pub fn occupy(&mut self, train: Address, direction: Direction) -> bool {
        match self.occupancy {
            Some(occupancy) => occupancy.train == train,
            None => {
                self.occupancy = Some(Occupancy { train, direction });
                true
            }
        }
    }

    pub fn vacate(&mut self, train: Address) {
        if let Some(occupancy) = self.occupancy {
            if occupancy.train == train {
                self.occupancy = None;
            }
        }
    }
}

/// Runtime record of a turnout.
#[derive(Debug, Clone)]
pub struct TurnoutRecord {
    enabled: bool,
    state: TurnoutState,
    reservation: Option<Reservation>,
}

impl Default for TurnoutRecord {
    fn default() -> Self {
        TurnoutRecord {
            enabled: true,
            state: TurnoutState::Straight,
            reservation: None,
        }
    }
}

impl TurnoutRecord {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn state(&self) -> TurnoutState {
        self.state
    }

    pub fn set_state(&mut self, state: TurnoutState) {
        self.state = state;
    }

    pub fn reservation(&self) -> Option<Reservation> {
        self.reservation
    }

    pub fn reserve(&mut self, train: Address, direction: Direction) -> bool {
        match self.reservation {
            Some(reservation) => reservation.train == train,
            None => {
                self.reservation = Some(Reservation { train, direction });
                true
            }
        }
    }

    pub fn free(&mut self, train: Address) {
        if let Some(reservation) = self.reservation {
            if reservation.train == train {
                self.reservation = None;
            }
        }
    }

    pub fn force_free(&mut self) {
        self.reservation = None;
    }

    pub fn reserved_by_other(&self, train: Address) -> bool {
        self.reservation
            .map_or(false, |reservation| reservation.train != train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(category: BlockCategory, sensors: &[u16]) -> BlockShape {
        BlockShape::new(
            Address::new(1),
            category,
            10,
            sensors.iter().map(|&s| Address::new(s)).collect(),
        )
    }

    #[test]
    fn block_entry_sensor_depends_on_direction() {
        let b = block(BlockCategory::Free, &[10, 11, 12]);
        assert_eq!(b.entry_sensor(Direction::Next), Some(Address::new(10)));
        assert_eq!(b.entry_sensor(Direction::Previous), Some(Address::new(12)));
    }

    #[test]
    fn block_markers_mirror_by_direction() {
        let b = block(BlockCategory::Station, &[10, 11, 12]);
        assert_eq!(b.brake_position(Direction::Next), 2);
        assert_eq!(b.stop_position(Direction::Next), 3);
        assert_eq!(b.brake_position(Direction::Previous), 1);
        assert_eq!(b.stop_position(Direction::Previous), 0);
        assert!(b.reached(Direction::Next, 3, b.stop_position(Direction::Next)));
        assert!(!b.reached(Direction::Previous, 3, b.stop_position(Direction::Previous)));
    }

    #[test]
    fn siding_has_no_exit() {
        let node = Node::Block(block(BlockCategory::Siding, &[10]));
        assert!(node.all_exits(Socket::PREVIOUS).is_empty());
        let free = Node::Block(block(BlockCategory::Free, &[10]));
        assert_eq!(free.all_exits(Socket::PREVIOUS), vec![Socket::NEXT]);
    }

    #[test]
    fn single_turnout_states() {
        let t = TurnoutShape::new(Address::new(5), TurnoutKind::SingleLeft, 2);
        assert_eq!(
            t.active_exit(Socket::new(0), TurnoutState::Straight),
            Some(Socket::new(1))
        );
        assert_eq!(t.active_exit(Socket::new(2), TurnoutState::Straight), None);
        assert_eq!(
            t.state_for(Socket::new(0), Socket::new(2)),
            Some(TurnoutState::BranchLeft)
        );
        assert_eq!(t.state_for(Socket::new(1), Socket::new(2)), None);
        assert_eq!(
            t.all_exits(Socket::new(0)),
            vec![Socket::new(1), Socket::new(2)]
        );
    }

    #[test]
    fn double_slip_crossing() {
        let t = TurnoutShape::new(Address::new(6), TurnoutKind::DoubleSlip, 2);
        assert_eq!(
            t.state_for(Socket::new(1), Socket::new(2)),
            Some(TurnoutState::Crossed)
        );
        assert_eq!(
            t.active_exit(Socket::new(3), TurnoutState::Straight),
            Some(Socket::new(1))
        );
    }

    #[test]
    fn reservation_is_exclusive() {
        let mut record = BlockRecord::default();
        assert!(record.reserve(Address::new(1), Direction::Next));
        assert!(record.reserve(Address::new(1), Direction::Next));
        assert!(!record.reserve(Address::new(2), Direction::Next));
        record.free(Address::new(2));
        assert!(record.reserved_by_other(Address::new(2)));
        record.free(Address::new(1));
        assert!(record.reserve(Address::new(2), Direction::Previous));
    }

    #[test]
    fn braking_ramp_bottoms_out_at_stop() {
        assert_eq!(Speed::cruising().braked(), Speed::Drive(40));
        assert_eq!(Speed::Drive(40).braked(), Speed::Stop);
        assert_eq!(Speed::EmergencyStop.braked(), Speed::EmergencyStop);
    }
}

use crate::control::rail_system::components::{Address, BlockCategory, Node, Socket};
use crate::control::rail_system::rail_graph::{GraphPath, GraphPathElement, RailGraph};
use petgraph::graph::NodeIndex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};

/// Order in which candidate exit sockets are explored.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SearchOrder {
    /// Socket numbering order. Deterministic.
    Fixed,
    /// Shuffled per node visit, seeded, for route diversity.
    Shuffled { seed: u64 },
}

/// Forces a single exit socket on a turnout instead of exploring all of
/// them.
pub type TurnoutExitOverride = Box<dyn Fn(NodeIndex, Socket) -> Option<Socket> + Send + Sync>;

/// Tuning of one path search call.
pub struct SearchSettings {
    /// The search gives up once the candidate path reaches
    /// `overflow_factor * node_count` elements. Guarantees termination
    /// on graphs with cycles.
    pub overflow_factor: usize,
    pub order: SearchOrder,
    pub turnout_exit_override: Option<TurnoutExitOverride>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            overflow_factor: 2,
            order: SearchOrder::Fixed,
            turnout_exit_override: None,
        }
    }
}

/// How foreign reservations constrain a search.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReservedBlockPolicy {
    /// Reservations do not matter, e.g. for display paths.
    Ignore,
    /// Any node reserved by another train is excluded.
    Avoid,
    /// Only the first node encountered after the start may not be
    /// reserved by another train; nodes further ahead are acceptable
    /// because they will have cleared by the time the train gets there.
    /// The starting element never counts.
    AvoidFirst,
}

/// Snapshot of the mutable layout state the search engines consult.
///
/// Taken once before a search call; the engines themselves never touch
/// a lock.
#[derive(Debug, Clone, Default)]
pub struct ReservationView {
    reserved: HashMap<NodeIndex, Address>,
    occupied: HashMap<NodeIndex, Address>,
    disabled: HashSet<NodeIndex>,
}

impl ReservationView {
    pub fn record_reserved(&mut self, node: NodeIndex, train: Address) {
        self.reserved.insert(node, train);
    }

    pub fn record_occupied(&mut self, node: NodeIndex, train: Address) {
        self.occupied.insert(node, train);
    }

    pub fn record_disabled(&mut self, node: NodeIndex) {
        self.disabled.insert(node);
    }

    pub fn reserved_by_other(&self, node: NodeIndex, train: Address) -> bool {
        self.reserved.get(&node).map_or(false, |&t| t != train)
            || self.occupied.get(&node).map_or(false, |&t| t != train)
    }

    pub fn disabled(&self, node: NodeIndex) -> bool {
        self.disabled.contains(&node)
    }
}

/// Decides, per visited element, whether the search may use it and
/// whether it completes the search.
pub trait SearchConstraints {
    /// Whether `element` may appear in the path at all. `path` is the
    /// run built so far, starting element first.
    fn include(
        &self,
        graph: &RailGraph,
        element: &GraphPathElement,
        path: &[GraphPathElement],
    ) -> bool {
        let _ = (graph, element, path);
        true
    }

    /// Whether `element` satisfies an implicit destination, e.g. "any
    /// reachable station".
    fn is_destination(&self, graph: &RailGraph, element: &GraphPathElement) -> bool {
        let _ = (graph, element);
        false
    }
}

/// Constraints that accept everything. Destination must be explicit.
pub struct NoConstraints;

impl SearchConstraints for NoConstraints {}

/// The constraints a running layout searches under: disabled track is
/// out, explicitly avoided nodes are out, and foreign reservations are
/// handled per [`ReservedBlockPolicy`].
pub struct LayoutConstraints<'a> {
    pub view: &'a ReservationView,
    pub train: Address,
    pub policy: ReservedBlockPolicy,
    pub avoided: &'a [NodeIndex],
}

impl SearchConstraints for LayoutConstraints<'_> {
    fn include(
        &self,
        graph: &RailGraph,
        element: &GraphPathElement,
        path: &[GraphPathElement],
    ) -> bool {
        if self.view.disabled(element.node) || self.avoided.contains(&element.node) {
            return false;
        }
        if graph.node(element.node).is_none() {
            return false;
        }
        if !self.view.reserved_by_other(element.node, self.train) {
            return true;
        }
        match self.policy {
            ReservedBlockPolicy::Ignore => true,
            ReservedBlockPolicy::Avoid => false,
            ReservedBlockPolicy::AvoidFirst => {
                // Element 0 is the train's own block; a reserved node is
                // tolerated once at least one block lies between it and
                // the start.
                path.iter()
                    .skip(1)
                    .any(|e| matches!(graph.node(e.node), Some(Node::Block(_))))
            }
        }
    }
}

/// [`LayoutConstraints`] plus an implicit "next reachable station"
/// destination, used by endless automatic routes.
pub struct NextStationConstraints<'a> {
    pub inner: LayoutConstraints<'a>,
    /// Block the search started in; it never counts as the destination.
    pub start: NodeIndex,
}

impl SearchConstraints for NextStationConstraints<'_> {
    fn include(
        &self,
        graph: &RailGraph,
        element: &GraphPathElement,
        path: &[GraphPathElement],
    ) -> bool {
        self.inner.include(graph, element, path)
    }

    fn is_destination(&self, graph: &RailGraph, element: &GraphPathElement) -> bool {
        if element.node == self.start {
            return false;
        }
        match graph.node(element.node) {
            Some(Node::Block(block)) => {
                block.category() == BlockCategory::Station
                    && !self
                        .inner
                        .view
                        .reserved_by_other(element.node, self.inner.train)
            }
            _ => false,
        }
    }
}

enum Step {
    Found,
    DeadEnd,
    Overflow,
}

/// Finds some valid path from `start` to `to`, or to whatever the
/// constraints declare a destination when `to` is `None`.
///
/// Depth-first with backtracking. No `(node, entry, exit)` triple is
/// ever taken twice within the candidate path, so the search terminates
/// on cyclic graphs; the overflow bound caps it long before the triple
/// space is exhausted. Not necessarily the shortest path.
pub fn find_path(
    graph: &RailGraph,
    start: GraphPathElement,
    to: Option<GraphPathElement>,
    settings: &SearchSettings,
    constraints: &dyn SearchConstraints,
) -> Option<GraphPath> {
    let overflow = settings.overflow_factor.max(1) * graph.node_count();
    let mut rng = match settings.order {
        SearchOrder::Fixed => None,
        SearchOrder::Shuffled { seed } => Some(SmallRng::seed_from_u64(seed)),
    };
    let mut path = vec![start];
    let mut visited: HashSet<GraphPathElement> = HashSet::new();
    visited.insert(start);
    match extend(
        graph,
        start,
        to.as_ref(),
        settings,
        constraints,
        &mut path,
        &mut visited,
        overflow,
        &mut rng,
    ) {
        Step::Found => Some(GraphPath::new(path)),
        Step::DeadEnd | Step::Overflow => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn extend(
    graph: &RailGraph,
    current: GraphPathElement,
    to: Option<&GraphPathElement>,
    settings: &SearchSettings,
    constraints: &dyn SearchConstraints,
    path: &mut Vec<GraphPathElement>,
    visited: &mut HashSet<GraphPathElement>,
    overflow: usize,
    rng: &mut Option<SmallRng>,
) -> Step {
    if path.len() >= overflow {
        return Step::Overflow;
    }
    let Some(exit) = current.exit else {
        return Step::DeadEnd;
    };
    let Some((next, next_entry)) = graph.link(current.node, exit) else {
        return Step::DeadEnd;
    };

    // Explicit destination: accept with the destination's own exit so
    // the caller can keep extending the path from it.
    if let Some(to) = to {
        let arrival = GraphPathElement {
            node: next,
            entry: Some(next_entry),
            exit: to.exit,
        };
        if arrival.satisfies(to) {
            if visited.contains(&arrival) || !constraints.include(graph, &arrival, path) {
                return Step::DeadEnd;
            }
            path.push(arrival);
            return Step::Found;
        }
    }

    let Some(node) = graph.node(next) else {
        return Step::DeadEnd;
    };

    // Implicit destination, e.g. the next reachable station.
    if to.is_none() {
        let ending = GraphPathElement::ending(next, next_entry);
        if constraints.is_destination(graph, &ending)
            && !visited.contains(&ending)
            && constraints.include(graph, &ending, path)
        {
            path.push(ending);
            return Step::Found;
        }
    }

    let mut exits = node.all_exits(next_entry);
    if node.as_turnout().is_some() {
        if let Some(force) = &settings.turnout_exit_override {
            if let Some(forced) = force(next, next_entry) {
                exits = vec![forced];
            }
        }
    }
    if let Some(rng) = rng {
        exits.shuffle(rng);
    }

    for exit in exits {
        let candidate = GraphPathElement::between(next, next_entry, exit);
        if visited.contains(&candidate) {
            continue;
        }
        if !constraints.include(graph, &candidate, path) {
            continue;
        }
        path.push(candidate);
        visited.insert(candidate);
        match extend(
            graph, candidate, to, settings, constraints, path, visited, overflow, rng,
        ) {
            Step::Found => return Step::Found,
            Step::Overflow => return Step::Overflow,
            Step::DeadEnd => {
                path.pop();
                visited.remove(&candidate);
            }
        }
    }
    Step::DeadEnd
}

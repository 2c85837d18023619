use crate::control::rail_system::components::{Address, Socket};
use petgraph::graph::NodeIndex;
use thiserror::Error;

/// Components needed for railroad creation
pub mod components;
/// A depth-first path finder with backtracking and pluggable constraints
pub mod path_finder;
/// The layout graph and the path element types the searches run on
pub mod rail_graph;
/// Railroad containing rail graph, runtime records and trains
pub mod railroad;
/// Stitching sparse waypoint sequences into continuous paths
pub mod resolver;
/// Minimum-weight paths over directional elements
pub mod shortest_path;
/// A test railroad and some tests on it
#[cfg(test)]
pub mod railroad_test;

/// Structural failures of the layout data or of a train's view of it.
///
/// Everything here is a data or programming error that bubbles up to
/// the scheduler. A search that merely finds nothing and a reservation
/// that is merely refused are ordinary return values, not errors.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum RailError {
    #[error("node {0:?} does not exist")]
    NodeNotFound(NodeIndex),
    #[error("node {0:?} has no socket {1}")]
    SocketNotFound(NodeIndex, Socket),
    #[error("socket {1} of node {0:?} is already linked")]
    AmbiguousLink(NodeIndex, Socket),
    #[error("sensor {0} is claimed by more than one block")]
    DuplicateSensor(Address),
    #[error("block {0:?} is already occupied by another train")]
    BlockOccupied(NodeIndex),
    #[error("no train with address {0}")]
    TrainNotFound(Address),
    #[error("train {0} is not where its route believes it is")]
    DestinationMismatch(Address),
    #[error("path element at node {0:?} lacks the sockets a route step needs")]
    IncompleteStep(NodeIndex),
}

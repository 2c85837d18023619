use crate::control::rail_system::components::{BlockCategory, Direction, Node};
use crate::control::rail_system::path_finder::{find_path, SearchConstraints, SearchSettings};
use crate::control::rail_system::rail_graph::{GraphPath, GraphPathElement, RailGraph};
use petgraph::graph::NodeIndex;

/// One stop of a sparse route description. Loose waypoints resolve to
/// several concrete elements; the resolver picks whichever combination
/// can actually be stitched together.
#[derive(Debug, Clone)]
pub enum Waypoint {
    /// A fully specified element.
    Element(GraphPathElement),
    /// A block in whatever direction works.
    Block(NodeIndex),
    /// Any station block.
    AnyStation,
}

/// Index range of the two waypoints between which resolution failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnresolvedRange {
    pub from: usize,
    pub to: usize,
}

/// Role a waypoint plays within the sequence, deciding which socket
/// sides its concrete elements must expose.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Role {
    First,
    Middle,
    Last,
}

fn block_elements(node: NodeIndex, role: Role) -> Vec<GraphPathElement> {
    let directions = [Direction::Next, Direction::Previous];
    directions
        .iter()
        .map(|&direction| match role {
            Role::First => GraphPathElement::starting(node, direction.exit_socket()),
            Role::Middle => GraphPathElement::between(
                node,
                direction.entry_socket(),
                direction.exit_socket(),
            ),
            Role::Last => GraphPathElement::ending(node, direction.entry_socket()),
        })
        .collect()
}

fn candidates(graph: &RailGraph, waypoint: &Waypoint, role: Role) -> Vec<GraphPathElement> {
    match waypoint {
        Waypoint::Element(element) => vec![*element],
        Waypoint::Block(node) => block_elements(*node, role),
        Waypoint::AnyStation => graph
            .node_indices()
            .filter(|&index| {
                matches!(
                    graph.node(index),
                    Some(Node::Block(block)) if block.category() == BlockCategory::Station
                )
            })
            .flat_map(|index| block_elements(index, role))
            .collect(),
    }
}

/// Stitches a sparse waypoint sequence into one continuous path.
///
/// Keeps a list of in-progress candidate paths, one per concrete
/// resolution of the first waypoint, and extends every one of them
/// towards every resolution of the following waypoint via the path
/// finder, dropping those that cannot be extended. An empty candidate
/// set at a waypoint boundary fails resolution with the boundary's
/// index range for diagnostics.
pub fn resolve(
    graph: &RailGraph,
    waypoints: &[Waypoint],
    settings: &SearchSettings,
    constraints: &dyn SearchConstraints,
) -> Result<GraphPath, UnresolvedRange> {
    if waypoints.is_empty() {
        return Err(UnresolvedRange { from: 0, to: 0 });
    }

    let mut in_progress: Vec<Vec<GraphPathElement>> =
        candidates(graph, &waypoints[0], Role::First)
            .into_iter()
            .map(|element| vec![element])
            .collect();
    if in_progress.is_empty() {
        return Err(UnresolvedRange { from: 0, to: 0 });
    }

    for (index, waypoint) in waypoints.iter().enumerate().skip(1) {
        let role = if index + 1 == waypoints.len() {
            Role::Last
        } else {
            Role::Middle
        };
        let targets = candidates(graph, waypoint, role);
        let mut extended: Vec<Vec<GraphPathElement>> = Vec::new();
        for path in &in_progress {
            let tail = path[path.len() - 1];
            for target in &targets {
                if let Some(extension) =
                    find_path(graph, tail, Some(*target), settings, constraints)
                {
                    let mut grown = path.clone();
                    grown.extend(extension.elements.into_iter().skip(1));
                    extended.push(grown);
                }
            }
        }
        if extended.is_empty() {
            return Err(UnresolvedRange {
                from: index - 1,
                to: index,
            });
        }
        in_progress = extended;
    }

    Ok(GraphPath::new(in_progress.remove(0)))
}

use crate::control::rail_system::components::{Address, Node, Socket};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Undirected;
use std::collections::HashMap;
use std::fmt;

/// A link between two sockets of two (possibly identical) nodes.
///
/// `sockets.0` belongs to the petgraph edge's source node, `sockets.1`
/// to its target; [`RailGraph::link`] presents the inverse view so
/// traversal code never special-cases direction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Link {
    pub sockets: (Socket, Socket),
}

/// The layout graph: blocks and turnouts as nodes, socket pairings as
/// edges.
///
/// Immutable after building. Everything that changes at runtime lives
/// in the railroad's per-node records, so a search call always operates
/// on a stable snapshot of the track plan.
pub struct RailGraph {
    graph: Graph<Node, Link, Undirected>,
    sensor_owner: HashMap<Address, NodeIndex>,
}

impl RailGraph {
    pub(crate) fn new(
        graph: Graph<Node, Link, Undirected>,
        sensor_owner: HashMap<Address, NodeIndex>,
    ) -> Self {
        RailGraph {
            graph,
            sensor_owner,
        }
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.graph.node_weight(index)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Whatever hangs off `socket` of `from`: the peer node together
    /// with the socket the link attaches to over there.
    ///
    /// At most one link exists per socket; the builder rejects a second.
    pub fn link(&self, from: NodeIndex, socket: Socket) -> Option<(NodeIndex, Socket)> {
        self.graph.edges(from).find_map(|edge| {
            // `edges` reports every incident edge with `from` as its
            // source, so the stored orientation has to come from the
            // endpoints, not from `edge.source()`.
            let (source, target) = self.graph.edge_endpoints(edge.id())?;
            let link = edge.weight();
            if source == from && link.sockets.0 == socket {
                Some((target, link.sockets.1))
            } else if target == from && link.sockets.1 == socket {
                Some((source, link.sockets.0))
            } else {
                None
            }
        })
    }

    /// Block containing `sensor`.
    pub fn sensor_owner(&self, sensor: Address) -> Option<NodeIndex> {
        self.sensor_owner.get(&sensor).copied()
    }

    /// Turnout node carrying `address`.
    pub fn turnout_index(&self, address: Address) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&index| {
            matches!(
                self.graph.node_weight(index),
                Some(Node::Turnout(shape)) if shape.address() == address
            )
        })
    }
}

/// The atomic unit of path-search state: a node together with the
/// socket it was entered through and the socket it will be left
/// through.
///
/// A starting element carries only an exit, an ending element only an
/// entry. Searches deduplicate on the full triple, never on the bare
/// node: a turnout's two branches and a block's two travel directions
/// are distinct search states.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct GraphPathElement {
    pub node: NodeIndex,
    pub entry: Option<Socket>,
    pub exit: Option<Socket>,
}

impl GraphPathElement {
    pub fn starting(node: NodeIndex, exit: Socket) -> Self {
        GraphPathElement {
            node,
            entry: None,
            exit: Some(exit),
        }
    }

    pub fn ending(node: NodeIndex, entry: Socket) -> Self {
        GraphPathElement {
            node,
            entry: Some(entry),
            exit: None,
        }
    }

    pub fn between(node: NodeIndex, entry: Socket, exit: Socket) -> Self {
        GraphPathElement {
            node,
            entry: Some(entry),
            exit: Some(exit),
        }
    }

    /// Whether this element can stand in for `destination`: same node,
    /// and the destination's entry (if it names one) matches.
    pub fn satisfies(&self, destination: &GraphPathElement) -> bool {
        self.node == destination.node
            && destination
                .entry
                .map_or(true, |entry| self.entry == Some(entry))
    }
}

impl fmt::Display for GraphPathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_socket = |socket: Option<Socket>| match socket {
            Some(socket) => socket.to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "{}[{}>{}]",
            self.node.index(),
            fmt_socket(self.entry),
            fmt_socket(self.exit)
        )
    }
}

/// An ordered run of path elements produced by one of the search
/// engines.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GraphPath {
    pub elements: Vec<GraphPathElement>,
}

impl GraphPath {
    pub fn new(elements: Vec<GraphPathElement>) -> Self {
        GraphPath { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn first(&self) -> Option<&GraphPathElement> {
        self.elements.first()
    }

    pub fn last(&self) -> Option<&GraphPathElement> {
        self.elements.last()
    }

    /// Summed node weights. The starting element has no entry socket;
    /// its weight counts in the direction it is left through.
    pub fn total_weight(&self, graph: &RailGraph) -> usize {
        self.elements
            .iter()
            .filter_map(|element| {
                let node = graph.node(element.node)?;
                let entry = element.entry.or_else(|| {
                    element.exit.map(|exit| {
                        if exit == Socket::PREVIOUS {
                            Socket::NEXT
                        } else {
                            Socket::PREVIOUS
                        }
                    })
                })?;
                Some(node.weight_from(entry))
            })
            .sum()
    }
}

impl fmt::Display for GraphPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for element in &self.elements {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{element}")?;
            first = false;
        }
        Ok(())
    }
}

use crate::control::rail_system::path_finder::SearchConstraints;
use crate::control::rail_system::rail_graph::{GraphPath, GraphPathElement, RailGraph};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Minimum-total-node-weight path between two directional elements.
///
/// Dijkstra, keyed by the full `(node, entry, exit)` triple: a
/// turnout's branches and a block's two travel directions have
/// different downstream reachability, so the bare node is not a vertex
/// of this search. The discovered-but-unsettled set is an ordered
/// `BTreeSet`, which makes the choice among equal distances
/// reproducible across runs.
pub fn shortest_path(
    graph: &RailGraph,
    from: GraphPathElement,
    to: GraphPathElement,
    constraints: &dyn SearchConstraints,
) -> Option<GraphPath> {
    let mut distances: HashMap<GraphPathElement, usize> = HashMap::new();
    let mut best_paths: HashMap<GraphPathElement, Vec<GraphPathElement>> = HashMap::new();
    let mut settled: HashSet<GraphPathElement> = HashSet::new();
    let mut unsettled: BTreeSet<(usize, GraphPathElement)> = BTreeSet::new();

    distances.insert(from, 0);
    best_paths.insert(from, vec![from]);
    unsettled.insert((0, from));

    while let Some(&(distance, element)) = unsettled.iter().next() {
        unsettled.remove(&(distance, element));
        if !settled.insert(element) {
            continue;
        }
        if element.satisfies(&to) {
            return best_paths.remove(&element).map(GraphPath::new);
        }

        let Some(exit) = element.exit else {
            continue;
        };
        let Some((next, next_entry)) = graph.link(element.node, exit) else {
            continue;
        };
        let Some(node) = graph.node(next) else {
            continue;
        };

        // Every exit configuration of the successor is a distinct
        // candidate; the destination additionally as an ending element.
        let mut candidates: Vec<GraphPathElement> = node
            .all_exits(next_entry)
            .into_iter()
            .map(|exit| GraphPathElement::between(next, next_entry, exit))
            .collect();
        if next == to.node {
            candidates.push(GraphPathElement {
                node: next,
                entry: Some(next_entry),
                exit: to.exit,
            });
        }

        let base_path = best_paths.get(&element).cloned().unwrap_or_default();
        for candidate in candidates {
            if settled.contains(&candidate) {
                continue;
            }
            if !constraints.include(graph, &candidate, &base_path) {
                continue;
            }
            let alt = distance + node.weight_from(next_entry);
            let known = distances.get(&candidate).copied();
            if known.map_or(true, |d| alt < d) {
                if let Some(previous) = known {
                    unsettled.remove(&(previous, candidate));
                }
                distances.insert(candidate, alt);
                let mut path = base_path.clone();
                path.push(candidate);
                best_paths.insert(candidate, path);
                unsettled.insert((alt, candidate));
            }
        }
    }
    None
}

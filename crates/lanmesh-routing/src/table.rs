//! Link-state store and next-hop computation
//!
//! The [`RouteTable`] keeps the most recent [`LinkState`] per source and
//! eagerly recomputes the next-hop map on every accepted update: a
//! single-source shortest-path relaxation over the union of stored link
//! states, rooted at the local peer. Edges carrying the unreachable cost
//! are excluded, equal-cost paths resolve to the lower next-hop id, and
//! a destination with a live direct link always routes directly.
//!
//! Writers are serialized by the table lock; readers get a consistent
//! snapshot and never observe a partially-relaxed graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::RwLock;

use tracing::trace;

use lanmesh_core::{COST_UNREACHABLE, LinkState, PeerId};

#[derive(Default)]
struct TableState {
    states: HashMap<PeerId, LinkState>,
    next_hops: HashMap<PeerId, PeerId>,
    seeded: HashMap<PeerId, PeerId>,
}

/// Route table of one overlay host
pub struct RouteTable {
    local: PeerId,
    inner: RwLock<TableState>,
}

impl RouteTable {
    /// Create an empty table rooted at the local peer
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            inner: RwLock::new(TableState::default()),
        }
    }

    /// The local peer the table is rooted at
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Apply a link-state advertisement
    ///
    /// Replaces the stored entry when the advertisement is newer than
    /// what we hold for its source (or the source is new), then
    /// recomputes every next hop. Returns whether the advertisement was
    /// accepted; stale arrivals are discarded.
    pub fn update(&self, state: LinkState) -> bool {
        let mut inner = self.inner.write().expect("route table poisoned");
        if let Some(stored) = inner.states.get(&state.source) {
            if stored.timestamp >= state.timestamp {
                return false;
            }
        }
        trace!(source = %state.source.short_id(), timestamp = state.timestamp, "Link state accepted");
        inner.states.insert(state.source, state);
        Self::recompute(&mut inner, self.local);
        true
    }

    /// The local peer's own stored link state, if one was applied
    pub fn self_link_state(&self) -> Option<LinkState> {
        self.inner
            .read()
            .expect("route table poisoned")
            .states
            .get(&self.local)
            .cloned()
    }

    /// Next hop for a destination, or `None` when no path is known
    pub fn forward_interface(&self, dest: &PeerId) -> Option<PeerId> {
        let inner = self.inner.read().expect("route table poisoned");
        inner
            .next_hops
            .get(dest)
            .or_else(|| inner.seeded.get(dest))
            .copied()
    }

    /// Seed a next hop before any link state names the destination
    ///
    /// Used at direct-peer discovery so the new peer is routable ahead
    /// of the first sweep. A seed is dropped once the computed map
    /// covers the destination, or via [`RouteTable::remove_seed`].
    pub fn force_add(&self, dest: PeerId, via: PeerId) {
        let mut inner = self.inner.write().expect("route table poisoned");
        if inner.next_hops.contains_key(&dest) || inner.seeded.contains_key(&dest) {
            return;
        }
        inner.seeded.insert(dest, via);
    }

    /// Drop the seeded next hop of a destination
    pub fn remove_seed(&self, dest: &PeerId) {
        self.inner
            .write()
            .expect("route table poisoned")
            .seeded
            .remove(dest);
    }

    /// Number of stored link states
    pub fn len(&self) -> usize {
        self.inner.read().expect("route table poisoned").states.len()
    }

    /// Whether no link state is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn recompute(inner: &mut TableState, local: PeerId) {
        let mut adjacency: HashMap<PeerId, Vec<(PeerId, u32)>> = HashMap::new();
        for state in inner.states.values() {
            let edges = adjacency.entry(state.source).or_default();
            for (interface, cost) in state.interfaces.iter().zip(&state.costs) {
                if *cost != COST_UNREACHABLE {
                    edges.push((*interface, *cost));
                }
            }
        }

        let mut dist: HashMap<PeerId, u64> = HashMap::new();
        let mut first_hop: HashMap<PeerId, PeerId> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u64, PeerId)>> = BinaryHeap::new();
        dist.insert(local, 0);
        heap.push(Reverse((0, local)));

        while let Some(Reverse((d, node))) = heap.pop() {
            if d > dist.get(&node).copied().unwrap_or(u64::MAX) {
                continue;
            }
            let Some(edges) = adjacency.get(&node) else {
                continue;
            };
            for (neighbor, cost) in edges {
                let candidate = d + *cost as u64;
                let hop = if node == local {
                    *neighbor
                } else {
                    first_hop[&node]
                };
                let better = match dist.get(neighbor) {
                    None => true,
                    Some(&current) => {
                        candidate < current
                            || (candidate == current
                                && first_hop.get(neighbor).map(|h| hop < *h).unwrap_or(true))
                    }
                };
                if better {
                    dist.insert(*neighbor, candidate);
                    first_hop.insert(*neighbor, hop);
                    heap.push(Reverse((candidate, *neighbor)));
                }
            }
        }

        first_hop.remove(&local);

        // A live direct link always wins over a computed detour
        if let Some(self_state) = inner.states.get(&local) {
            for (interface, cost) in self_state.interfaces.iter().zip(&self_state.costs) {
                if *cost != COST_UNREACHABLE {
                    first_hop.insert(*interface, *interface);
                }
            }
        }

        inner.seeded.retain(|dest, _| !first_hop.contains_key(dest));
        inner.next_hops = first_hop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    fn state(source: u8, timestamp: i64, links: &[(u8, u32)]) -> LinkState {
        LinkState {
            source: peer(source),
            timestamp,
            interfaces: links.iter().map(|(p, _)| peer(*p)).collect(),
            costs: links.iter().map(|(_, c)| *c).collect(),
        }
    }

    #[test]
    fn test_direct_peer_routes_to_itself() {
        let table = RouteTable::new(peer(1));
        assert!(table.update(state(1, 100, &[(2, 12)])));
        assert_eq!(table.forward_interface(&peer(2)), Some(peer(2)));
    }

    #[test]
    fn test_stale_update_is_discarded() {
        let table = RouteTable::new(peer(1));
        assert!(table.update(state(1, 100, &[(2, 12)])));
        assert!(!table.update(state(1, 100, &[(2, 99)])));
        assert!(!table.update(state(1, 50, &[(2, 99)])));

        // The original advertisement still governs
        let stored = table.self_link_state().unwrap();
        assert_eq!(stored.cost_to(&peer(2)), Some(12));
    }

    #[test]
    fn test_two_hop_route() {
        // 1 -- 2 -- 3
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 5)]));
        table.update(state(2, 100, &[(1, 5), (3, 7)]));

        assert_eq!(table.forward_interface(&peer(3)), Some(peer(2)));
        assert_eq!(table.forward_interface(&peer(9)), None);
    }

    #[test]
    fn test_unreachable_cost_excludes_edge() {
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 5)]));
        table.update(state(2, 100, &[(1, 5), (3, COST_UNREACHABLE)]));

        assert_eq!(table.forward_interface(&peer(3)), None);
    }

    #[test]
    fn test_cheaper_path_wins() {
        // 1 -> 2 -> 4 costs 2; 1 -> 3 -> 4 costs 30
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 1), (3, 10)]));
        table.update(state(2, 100, &[(4, 1)]));
        table.update(state(3, 100, &[(4, 20)]));

        assert_eq!(table.forward_interface(&peer(4)), Some(peer(2)));
    }

    #[test]
    fn test_equal_cost_tie_breaks_to_lower_id() {
        // Diamond: both paths to 4 cost 2
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 1), (3, 1)]));
        table.update(state(2, 100, &[(4, 1)]));
        table.update(state(3, 100, &[(4, 1)]));

        assert_eq!(table.forward_interface(&peer(4)), Some(peer(2)));
    }

    #[test]
    fn test_direct_link_wins_over_detour() {
        // Direct 1-3 costs 50; detour through 2 costs 2. The direct link
        // still routes directly.
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 1), (3, 50)]));
        table.update(state(2, 100, &[(3, 1)]));

        assert_eq!(table.forward_interface(&peer(3)), Some(peer(3)));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 5)]));
        table.update(state(2, 100, &[(1, 5), (3, 7)]));

        let before: Vec<_> = [2, 3, 9]
            .iter()
            .map(|b| table.forward_interface(&peer(*b)))
            .collect();

        // Replaying the same advertisement changes nothing
        assert!(!table.update(state(2, 100, &[(1, 5), (3, 7)])));
        let after: Vec<_> = [2, 3, 9]
            .iter()
            .map(|b| table.forward_interface(&peer(*b)))
            .collect();

        assert_eq!(before, after);
    }

    #[test]
    fn test_seed_before_any_link_state() {
        let table = RouteTable::new(peer(1));

        table.force_add(peer(2), peer(2));
        assert_eq!(table.forward_interface(&peer(2)), Some(peer(2)));

        // The computed map takes over once the graph knows the peer
        table.update(state(1, 100, &[(2, 12)]));
        assert_eq!(table.forward_interface(&peer(2)), Some(peer(2)));

        // Marking the link down removes the route entirely; the old seed
        // must not resurrect it
        let mut down = state(1, 200, &[(2, 12)]);
        down.set_cost(&peer(2), COST_UNREACHABLE);
        table.remove_seed(&peer(2));
        table.update(down);
        assert_eq!(table.forward_interface(&peer(2)), None);
    }

    #[test]
    fn test_seed_does_not_override_existing_route() {
        let table = RouteTable::new(peer(1));
        table.update(state(1, 100, &[(2, 5)]));
        table.update(state(2, 100, &[(1, 5), (3, 7)]));

        table.force_add(peer(3), peer(9));
        assert_eq!(table.forward_interface(&peer(3)), Some(peer(2)));
    }

    #[test]
    fn test_timestamp_monotonicity() {
        let table = RouteTable::new(peer(1));
        let timestamps = [10, 5, 20, 20, 15, 30];
        let mut applied = Vec::new();
        for ts in timestamps {
            if table.update(state(2, ts, &[(1, 1)])) {
                applied.push(ts);
            }
        }
        // Accepted timestamps are strictly increasing
        assert_eq!(applied, vec![10, 20, 30]);
    }
}

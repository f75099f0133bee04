//! Dependency graph over plan arena slots.
//!
//! Edges point from a dependency to its dependent, so a topological order
//! lists every node after everything it waits for.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::BTreeSet;

/// Arena index of a node in a `Plan`.
pub(crate) type Slot = usize;

#[derive(Debug, Clone, Default)]
pub(crate) struct DependencyGraph {
    inner: DiGraphMap<Slot, ()>,
}

impl DependencyGraph {
    pub(crate) fn add_node(&mut self, slot: Slot) {
        self.inner.add_node(slot);
    }

    /// `dependent` waits for `dependency`.
    pub(crate) fn add_edge(&mut self, dependency: Slot, dependent: Slot) {
        self.inner.add_edge(dependency, dependent, ());
    }

    pub(crate) fn contains_edge(&self, dependency: Slot, dependent: Slot) -> bool {
        self.inner.contains_edge(dependency, dependent)
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Slots `slot` waits for.
    pub(crate) fn dependencies(&self, slot: Slot) -> impl Iterator<Item = Slot> + '_ {
        self.inner.neighbors_directed(slot, Direction::Incoming)
    }

    /// Slots waiting for `slot`.
    pub(crate) fn dependents(&self, slot: Slot) -> impl Iterator<Item = Slot> + '_ {
        self.inner.neighbors_directed(slot, Direction::Outgoing)
    }

    /// Topological order, or the members of one cycle.
    pub(crate) fn topological_order(&self) -> Result<Vec<Slot>, Vec<Slot>> {
        toposort(&self.inner, None).map_err(|_| self.first_cycle())
    }

    fn first_cycle(&self) -> Vec<Slot> {
        let mut cycles: Vec<Vec<Slot>> = tarjan_scc(&self.inner)
            .into_iter()
            .filter(|scc| scc.len() > 1 || scc.iter().any(|&s| self.inner.contains_edge(s, s)))
            .collect();
        for scc in &mut cycles {
            scc.sort_unstable();
        }
        cycles.sort();
        cycles.into_iter().next().unwrap_or_default()
    }

    /// Group a topological order into ranks: a slot's rank is one more than
    /// the highest rank among its dependencies.
    pub(crate) fn ranks(&self, order: &[Slot]) -> Vec<Vec<Slot>> {
        let mut level = vec![0usize; order.iter().max().map_or(0, |m| m + 1)];
        let mut ranks: Vec<Vec<Slot>> = Vec::new();
        for &slot in order {
            let rank = self
                .dependencies(slot)
                .map(|dep| level[dep] + 1)
                .max()
                .unwrap_or(0);
            level[slot] = rank;
            if ranks.len() <= rank {
                ranks.resize_with(rank + 1, Vec::new);
            }
            ranks[rank].push(slot);
        }
        ranks
    }

    /// Every slot reachable from `slot` through dependent edges.
    pub(crate) fn descendants(&self, slot: Slot) -> BTreeSet<Slot> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<Slot> = self.dependents(slot).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: usize, edges: &[(Slot, Slot)]) -> DependencyGraph {
        let mut g = DependencyGraph::default();
        for n in 0..nodes {
            g.add_node(n);
        }
        for &(a, b) in edges {
            g.add_edge(a, b);
        }
        g
    }

    #[test]
    fn ranks_follow_longest_path() {
        // 0 -> 1 -> 3, 0 -> 2, 2 -> 3
        let g = graph(4, &[(0, 1), (1, 3), (0, 2), (2, 3)]);
        let order = g.topological_order().unwrap();
        let mut ranks = g.ranks(&order);
        for r in &mut ranks {
            r.sort_unstable();
        }
        assert_eq!(ranks, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn cycle_reports_members_only() {
        let g = graph(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        assert_eq!(g.topological_order().unwrap_err(), vec![1, 2]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(2, &[(1, 1)]);
        assert_eq!(g.topological_order().unwrap_err(), vec![1]);
    }

    #[test]
    fn descendants_are_transitive() {
        let g = graph(4, &[(0, 1), (1, 2)]);
        assert_eq!(g.descendants(0), BTreeSet::from([1, 2]));
        assert!(g.descendants(3).is_empty());
    }
}

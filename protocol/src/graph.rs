//! # Graph Builder
//!
//! Builds the neighbor topology for a fleet of local nodes: connected,
//! every vertex degree ≤ d, and deterministic for a given seed so a test
//! failure replays exactly.
//!
//! Construction is a ring plus seeded random chords. The ring guarantees
//! connectivity with degree 2; the chords shrink the diameter toward what
//! a random regular graph would give without any rejection-sampling
//! machinery.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

use crate::node::NodeHandle;

/// Topology construction failures.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{nodes} nodes need max degree >= {required}, got {got}")]
    DegreeTooSmall {
        nodes: usize,
        required: usize,
        got: usize,
    },
}

/// Produces the edge list for `n` vertices (indices `0..n`) with maximum
/// degree `max_degree`, deterministically from `seed`.
pub fn build_topology(
    n: usize,
    max_degree: usize,
    seed: u64,
) -> Result<Vec<(usize, usize)>, GraphError> {
    if n <= 1 {
        return Ok(Vec::new());
    }
    let required = if n == 2 { 1 } else { 2 };
    if max_degree < required {
        return Err(GraphError::DegreeTooSmall {
            nodes: n,
            required,
            got: max_degree,
        });
    }
    if n == 2 {
        return Ok(vec![(0, 1)]);
    }

    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut degree = vec![0usize; n];

    // Ring backbone: connectivity for free at degree 2.
    for i in 0..n {
        let j = (i + 1) % n;
        edges.insert((i.min(j), i.max(j)));
        degree[i] += 1;
        degree[j] += 1;
    }

    // Seeded chords up to the degree cap. Bounded attempts, not a target
    // count: a saturated small graph just ends up chord-free.
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..n * 4 {
        let a = rng.gen_range(0..n);
        let b = rng.gen_range(0..n);
        if a == b {
            continue;
        }
        let key = (a.min(b), a.max(b));
        if edges.contains(&key) || degree[a] >= max_degree || degree[b] >= max_degree {
            continue;
        }
        edges.insert(key);
        degree[a] += 1;
        degree[b] += 1;
    }

    Ok(edges.into_iter().collect())
}

/// Wires a fleet of node handles into a built topology. Handles are taken
/// in slice order; pass them sorted by UID for reproducible graphs.
/// Returns the number of edges laid down.
pub fn wire_fleet(
    handles: &[Arc<NodeHandle>],
    max_degree: usize,
    seed: u64,
) -> Result<usize, GraphError> {
    let edges = build_topology(handles.len(), max_degree, seed)?;
    for &(a, b) in &edges {
        handles[a].add_neighbor(handles[b].uid());
        handles[b].add_neighbor(handles[a].uid());
    }
    debug!(
        nodes = handles.len(),
        edges = edges.len(),
        max_degree,
        seed,
        "fleet topology wired"
    );
    Ok(edges.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn degrees(n: usize, edges: &[(usize, usize)]) -> Vec<usize> {
        let mut d = vec![0usize; n];
        for &(a, b) in edges {
            d[a] += 1;
            d[b] += 1;
        }
        d
    }

    fn is_connected(n: usize, edges: &[(usize, usize)]) -> bool {
        if n == 0 {
            return true;
        }
        let mut adjacency = vec![Vec::new(); n];
        for &(a, b) in edges {
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
        let mut visited = vec![false; n];
        let mut queue = VecDeque::from([0usize]);
        visited[0] = true;
        let mut reached = 1;
        while let Some(v) = queue.pop_front() {
            for &w in &adjacency[v] {
                if !visited[w] {
                    visited[w] = true;
                    reached += 1;
                    queue.push_back(w);
                }
            }
        }
        reached == n
    }

    #[test]
    fn topology_is_connected_and_degree_bounded() {
        for &(n, d, seed) in &[(3, 2, 0u64), (10, 4, 7), (50, 8, 42), (17, 3, 99)] {
            let edges = build_topology(n, d, seed).unwrap();
            assert!(is_connected(n, &edges), "n={n} d={d} seed={seed}");
            assert!(
                degrees(n, &edges).iter().all(|&deg| deg <= d),
                "degree bound violated for n={n} d={d} seed={seed}"
            );
        }
    }

    #[test]
    fn same_seed_same_graph() {
        let a = build_topology(20, 5, 1234).unwrap();
        let b = build_topology(20, 5, 1234).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_vary_the_chords() {
        let a = build_topology(30, 6, 1).unwrap();
        let b = build_topology(30, 6, 2).unwrap();
        assert_ne!(a, b, "30 vertices of chord space should not collide");
    }

    #[test]
    fn trivial_sizes() {
        assert!(build_topology(0, 3, 0).unwrap().is_empty());
        assert!(build_topology(1, 3, 0).unwrap().is_empty());
        assert_eq!(build_topology(2, 1, 0).unwrap(), vec![(0, 1)]);
    }

    #[test]
    fn insufficient_degree_is_rejected() {
        assert!(matches!(
            build_topology(5, 1, 0),
            Err(GraphError::DegreeTooSmall {
                nodes: 5,
                required: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn ring_backbone_is_always_present() {
        let edges = build_topology(8, 2, 3).unwrap();
        // Degree cap 2 leaves room for nothing but the ring.
        assert_eq!(edges.len(), 8);
        for i in 0..8 {
            let j = (i + 1) % 8;
            assert!(edges.contains(&(i.min(j), i.max(j))));
        }
    }
}

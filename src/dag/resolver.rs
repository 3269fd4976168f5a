use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

/// Kahn's algorithm over nodes `0..count` with `(from, to)` edges.
///
/// Among ready nodes the one with the smallest `key` goes first, which makes
/// the order deterministic. Returns the order and any nodes left over; a
/// non-empty leftover means the edges contain a cycle.
pub fn kahn_order<K, F>(count: usize, edges: &[(usize, usize)], key: F) -> (Vec<usize>, Vec<usize>)
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let (mut in_degree, adjacency) = degrees(count, edges);

    let mut ready: BinaryHeap<Reverse<(K, usize)>> = BinaryHeap::new();
    for (idx, &degree) in in_degree.iter().enumerate() {
        if degree == 0 {
            ready.push(Reverse((key(idx), idx)));
        }
    }

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse((key(next), next)));
            }
        }
    }

    let placed: BTreeSet<usize> = order.iter().copied().collect();
    let leftover = (0..count).filter(|i| !placed.contains(i)).collect();
    (order, leftover)
}

/// Resolve the dependency graph into parallel execution batches.
///
/// Each batch contains nodes that can run concurrently (all their
/// dependencies are in previous batches). Uses Kahn's algorithm.
pub fn resolve_batches(count: usize, edges: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let (mut in_degree, adjacency) = degrees(count, edges);

    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut queue: Vec<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();

    while !queue.is_empty() {
        let mut next_queue = Vec::new();
        for &node in &queue {
            for &next in &adjacency[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    next_queue.push(next);
                }
            }
        }
        queue.sort_unstable(); // Deterministic ordering within a batch
        batches.push(std::mem::replace(&mut queue, next_queue));
    }

    batches
}

fn degrees(count: usize, edges: &[(usize, usize)]) -> (Vec<usize>, Vec<Vec<usize>>) {
    let mut in_degree = vec![0usize; count];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); count];
    let unique: BTreeSet<(usize, usize)> = edges.iter().copied().collect();
    for (from, to) in unique {
        adjacency[from].push(to);
        in_degree[to] += 1;
    }
    (in_degree, adjacency)
}

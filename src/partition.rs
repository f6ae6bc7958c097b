use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::graph::{mix64, Edge, VertexId};
use crate::PartStrategy;

/// Splits the corpus edges into `num_parts` edge partitions under the
/// chosen strategy. The label-propagation strategy takes `num_iter`
/// refinement rounds; the hash strategies ignore it.
pub fn partition_edges(
    edges: Vec<Edge>,
    strategy: PartStrategy,
    num_parts: usize,
    seed: u64,
    num_iter: usize,
) -> Vec<Vec<Edge>> {
    let num_parts = num_parts.max(1);
    let assign: Vec<usize> = match strategy {
        PartStrategy::ByTerm => edges
            .iter()
            .map(|e| (mix64(e.src) % num_parts as u64) as usize)
            .collect(),
        PartStrategy::ByDoc => edges
            .iter()
            .map(|e| (mix64(e.dst) % num_parts as u64) as usize)
            .collect(),
        PartStrategy::Edge2D => edge_2d(&edges, num_parts),
        PartStrategy::Dbh => degree_based(&edges, num_parts),
        PartStrategy::Bbr => balanced_by_term(&edges, num_parts),
        PartStrategy::Vsdlp => label_propagation(&edges, num_parts, seed, num_iter),
    };

    let mut parts: Vec<Vec<Edge>> = (0..num_parts).map(|_| Vec::new()).collect();
    for (edge, pid) in edges.into_iter().zip(assign) {
        parts[pid].push(edge);
    }
    parts
}

/// Grid hashing: sources pick a column, destinations a row, bounding
/// the replication of any vertex by the grid side.
fn edge_2d(edges: &[Edge], num_parts: usize) -> Vec<usize> {
    let side = (num_parts as f64).sqrt().ceil() as u64;
    edges
        .iter()
        .map(|e| {
            let col = mix64(e.src) % side;
            let row = mix64(e.dst) % side;
            ((col * side + row) % num_parts as u64) as usize
        })
        .collect()
}

/// Degree-based hashing: each edge follows its lower-degree endpoint,
/// replicating the hubs instead of the tail.
fn degree_based(edges: &[Edge], num_parts: usize) -> Vec<usize> {
    let mut degree: HashMap<VertexId, u32> = HashMap::new();
    for e in edges {
        *degree.entry(e.src).or_insert(0) += 1;
        *degree.entry(e.dst).or_insert(0) += 1;
    }
    edges
        .iter()
        .map(|e| {
            let pivot = if degree[&e.src] <= degree[&e.dst] {
                e.src
            } else {
                e.dst
            };
            (mix64(pivot) % num_parts as u64) as usize
        })
        .collect()
}

/// Keeps whole source groups together and fills the least-loaded
/// partition first, balancing by token count.
fn balanced_by_term(edges: &[Edge], num_parts: usize) -> Vec<usize> {
    let mut group_tokens: HashMap<VertexId, u64> = HashMap::new();
    for e in edges {
        *group_tokens.entry(e.src).or_insert(0) += e.topics.len() as u64;
    }
    let mut groups: Vec<(VertexId, u64)> = group_tokens.into_iter().collect();
    groups.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut load = vec![0u64; num_parts];
    let mut group_part: HashMap<VertexId, usize> = HashMap::new();
    for (src, tokens) in groups {
        let pid = load
            .iter()
            .enumerate()
            .min_by_key(|(_, &l)| l)
            .map(|(i, _)| i)
            .unwrap_or(0);
        load[pid] += tokens;
        group_part.insert(src, pid);
    }
    edges.iter().map(|e| group_part[&e.src]).collect()
}

/// Vertex-cut label propagation: every vertex repeatedly proposes to
/// move to the partition where most of its neighbors live, and moves
/// are throttled so the exchange between any two partitions is
/// bounded by the smaller of the opposing demands. Edges follow their
/// source's final partition.
fn label_propagation(edges: &[Edge], num_parts: usize, seed: u64, num_iter: usize) -> Vec<usize> {
    // compact vertex index and CSR adjacency over both directions
    let mut vertex_index: HashMap<VertexId, u32> = HashMap::new();
    let mut vertices: Vec<VertexId> = Vec::new();
    let mut index_of = |vid: VertexId, vertices: &mut Vec<VertexId>| -> u32 {
        *vertex_index.entry(vid).or_insert_with(|| {
            vertices.push(vid);
            (vertices.len() - 1) as u32
        })
    };
    let pairs: Vec<(u32, u32)> = edges
        .iter()
        .map(|e| {
            let s = index_of(e.src, &mut vertices);
            let d = index_of(e.dst, &mut vertices);
            (s, d)
        })
        .collect();

    let n = vertices.len();
    let mut neighbor_count = vec![0u32; n];
    for &(s, d) in &pairs {
        neighbor_count[s as usize] += 1;
        neighbor_count[d as usize] += 1;
    }
    let mut offsets = vec![0usize; n + 1];
    for v in 0..n {
        offsets[v + 1] = offsets[v] + neighbor_count[v] as usize;
    }
    let mut adjacency = vec![0u32; offsets[n]];
    let mut cursor = offsets.clone();
    for &(s, d) in &pairs {
        adjacency[cursor[s as usize]] = d;
        cursor[s as usize] += 1;
        adjacency[cursor[d as usize]] = s;
        cursor[d as usize] += 1;
    }

    let mut parts: Vec<u32> = vertices
        .iter()
        .map(|&vid| (mix64(vid ^ seed) % num_parts as u64) as u32)
        .collect();

    for round in 0..=num_iter {
        let proposals = propose_moves(&parts, &offsets, &adjacency, num_parts, seed, round);
        let demand = move_demand(&parts, &proposals, num_parts);
        apply_moves(&mut parts, &proposals, &demand, num_parts, seed, round);
    }

    pairs
        .iter()
        .map(|&(s, _)| parts[s as usize] as usize)
        .collect()
}

/// Draws each vertex's proposed partition from the histogram of its
/// neighbors' partitions.
fn propose_moves(
    parts: &[u32],
    offsets: &[usize],
    adjacency: &[u32],
    num_parts: usize,
    seed: u64,
    round: usize,
) -> Vec<u32> {
    (0..parts.len())
        .into_par_iter()
        .map(|v| {
            let neighbors = &adjacency[offsets[v]..offsets[v + 1]];
            if neighbors.is_empty() {
                return parts[v];
            }
            let mut histogram = vec![0u32; num_parts];
            for &w in neighbors {
                histogram[parts[w as usize] as usize] += 1;
            }
            let total: u32 = neighbors.len() as u32;
            let mut rng =
                StdRng::seed_from_u64(mix64(seed ^ (round as u64) << 32 ^ v as u64));
            let mut draw = rng.gen_range(0..total);
            for (pid, &count) in histogram.iter().enumerate() {
                if draw < count {
                    return pid as u32;
                }
                draw -= count;
            }
            parts[v]
        })
        .collect()
}

/// The P x P move-demand matrix: `demand[i][j]` is the number of
/// vertices wishing to move from partition i to partition j.
fn move_demand(parts: &[u32], proposals: &[u32], num_parts: usize) -> Vec<u64> {
    parts
        .par_iter()
        .zip(proposals.par_iter())
        .fold(
            || vec![0u64; num_parts * num_parts],
            |mut local, (&from, &to)| {
                if from != to {
                    local[from as usize * num_parts + to as usize] += 1;
                }
                local
            },
        )
        .reduce(
            || vec![0u64; num_parts * num_parts],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                a
            },
        )
}

/// Executes a proposed move with probability
/// `min(demand[i][j], demand[j][i]) / demand[i][j]`, and additionally
/// caps the realized moves on each (i, j) pair at the matched demand,
/// so the exchange between two partitions is flow-balanced even when
/// the coin flips run hot.
fn apply_moves(
    parts: &mut [u32],
    proposals: &[u32],
    demand: &[u64],
    num_parts: usize,
    seed: u64,
    round: usize,
) {
    let moved: Vec<std::sync::atomic::AtomicU64> = (0..num_parts * num_parts)
        .map(|_| std::sync::atomic::AtomicU64::new(0))
        .collect();
    parts
        .par_iter_mut()
        .zip(proposals.par_iter())
        .enumerate()
        .for_each(|(v, (part, &to))| {
            let from = *part;
            if from == to {
                return;
            }
            let cell = from as usize * num_parts + to as usize;
            let forward = demand[cell];
            let quota = forward.min(demand[to as usize * num_parts + from as usize]);
            let accept = quota as f64 / forward as f64;
            let mut rng =
                StdRng::seed_from_u64(mix64(seed ^ 0x5eed ^ (round as u64) << 32 ^ v as u64));
            if rng.gen::<f64>() < accept {
                let ticket = moved[cell].fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if ticket < quota {
                    *part = to;
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{doc_vertex, term_vertex};

    fn set_up_edges(num_terms: u64, num_docs: u64) -> Vec<Edge> {
        let mut edges = Vec::new();
        for t in 0..num_terms {
            for d in 0..num_docs {
                if (t + d) % 3 != 0 {
                    continue;
                }
                edges.push(Edge {
                    src: term_vertex(t),
                    dst: doc_vertex(d),
                    topics: vec![0; 1 + ((t + d) % 4) as usize],
                });
            }
        }
        edges
    }

    fn assert_no_edges_lost(parts: &[Vec<Edge>], expected: usize) {
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), expected);
    }

    #[test]
    fn test_by_term_keeps_groups_whole() {
        let edges = set_up_edges(30, 40);
        let total = edges.len();
        let parts = partition_edges(edges, PartStrategy::ByTerm, 4, 42, 0);
        assert_no_edges_lost(&parts, total);

        let mut seen: HashMap<VertexId, usize> = HashMap::new();
        for (pid, part) in parts.iter().enumerate() {
            for edge in part {
                if let Some(&previous) = seen.get(&edge.src) {
                    assert_eq!(previous, pid);
                }
                seen.insert(edge.src, pid);
            }
        }
    }

    #[test]
    fn test_strategies_preserve_edges() {
        for strategy in [
            PartStrategy::ByDoc,
            PartStrategy::Edge2D,
            PartStrategy::Dbh,
            PartStrategy::Bbr,
            PartStrategy::Vsdlp,
        ] {
            let edges = set_up_edges(30, 40);
            let total = edges.len();
            let parts = partition_edges(edges, strategy, 4, 42, 2);
            assert_no_edges_lost(&parts, total);
        }
    }

    #[test]
    fn test_bbr_balances_tokens() {
        let edges = set_up_edges(64, 64);
        let tokens: u64 = edges.iter().map(|e| e.topics.len() as u64).sum();
        let parts = partition_edges(edges, PartStrategy::Bbr, 4, 42, 0);
        let largest_group = 96;
        for part in &parts {
            let load: u64 = part.iter().map(|e| e.topics.len() as u64).sum();
            // greedy fill stays within one group of the even share
            assert!(
                load <= tokens / 4 + largest_group,
                "load {} of {}",
                load,
                tokens
            );
        }
    }

    #[test]
    fn test_label_propagation_is_seeded() {
        let one = partition_edges(set_up_edges(30, 40), PartStrategy::Vsdlp, 4, 7, 3);
        let two = partition_edges(set_up_edges(30, 40), PartStrategy::Vsdlp, 4, 7, 3);
        for (a, b) in one.iter().zip(two.iter()) {
            assert_eq!(a.len(), b.len());
        }
    }

    #[test]
    fn test_move_quota_bounds_partition_drift() {
        let edges = set_up_edges(40, 40);
        let num_parts = 4;

        // run the internals of one round by hand
        let mut vertex_index: HashMap<VertexId, u32> = HashMap::new();
        let mut vertices: Vec<VertexId> = Vec::new();
        for e in &edges {
            for &vid in &[e.src, e.dst] {
                vertex_index.entry(vid).or_insert_with(|| {
                    vertices.push(vid);
                    (vertices.len() - 1) as u32
                });
            }
        }
        let parts_before: Vec<u32> = vertices
            .iter()
            .map(|&vid| (mix64(vid ^ 7) % num_parts as u64) as u32)
            .collect();
        let proposals: Vec<u32> = vertices
            .iter()
            .map(|&vid| (mix64(vid.wrapping_mul(31)) % num_parts as u64) as u32)
            .collect();
        let demand = move_demand(&parts_before, &proposals, num_parts);
        let mut parts_after = parts_before.clone();
        apply_moves(&mut parts_after, &proposals, &demand, num_parts, 7, 0);

        let size = |parts: &[u32], pid: u32| parts.iter().filter(|&&p| p == pid).count() as i64;
        for pid in 0..num_parts as u32 {
            let matched: u64 = (0..num_parts as u32)
                .filter(|&q| q != pid)
                .map(|q| {
                    let fwd = demand[pid as usize * num_parts + q as usize];
                    let bwd = demand[q as usize * num_parts + pid as usize];
                    fwd.min(bwd)
                })
                .sum();
            let drift = (size(&parts_after, pid) - size(&parts_before, pid)).unsigned_abs();
            assert!(
                drift <= matched,
                "partition {} drifted {} with quota {}",
                pid,
                drift,
                matched
            );
        }
    }
}

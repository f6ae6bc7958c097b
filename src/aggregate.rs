use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, Ordering};

use rayon::prelude::*;

use crate::counts::{promote_threshold, TopicCount};
use crate::graph::{is_term_id, EdgePartition, TokenGraph, VertexId, VertexPartition};

/// Mark values of the per-slot write protocol.
const OPEN: i32 = i32::MAX;
const WRITING: i32 = -1;

/// Shared result slots written under the protection of the atomic
/// marks: a slot is only dereferenced by the writer that observed the
/// empty mark (exclusive by the atomicity of the decrement) or by a
/// writer that swapped a positive mark to the writing sentinel.
struct SlotVec {
    cells: Vec<UnsafeCell<Option<TopicCount>>>,
}

unsafe impl Sync for SlotVec {}

impl SlotVec {
    fn new(len: usize) -> SlotVec {
        SlotVec {
            cells: (0..len).map(|_| UnsafeCell::new(None)).collect(),
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn get(&self, i: usize) -> &mut Option<TopicCount> {
        &mut *self.cells[i].get()
    }
}

/// Phase one: folds an edge partition's occurrence arrays into partial
/// per-vertex counters, sparse by default, with term partials promoted
/// to dense once their active size reaches K/8.
///
/// With `inference_only` set, term partials are not emitted at all, so
/// the trained term counters survive the merge untouched.
pub fn ship_partition(
    part: &EdgePartition,
    num_topics: usize,
    inference_only: bool,
) -> Vec<(VertexId, TopicCount)> {
    let mut partials: Vec<Option<TopicCount>> = vec![None; part.local2global.len()];
    for e in 0..part.num_edges() {
        let src = part.local_src_ids[e] as usize;
        let dst = part.local_dst_ids[e] as usize;
        for &t in &part.data[e] {
            for &v in &[src, dst] {
                let slot = partials[v].get_or_insert_with(TopicCount::new_sparse);
                slot.inc(t);
                if is_term_id(part.local2global[v])
                    && !slot.is_dense()
                    && slot.active_size() >= promote_threshold(num_topics)
                {
                    slot.promote(num_topics);
                }
            }
        }
    }

    partials
        .into_iter()
        .enumerate()
        .filter_map(|(v, slot)| slot.map(|tc| (part.local2global[v], tc)))
        .filter(|(vid, _)| !(inference_only && is_term_id(*vid)))
        .collect()
}

/// Phase two: merges routed partials into one vertex partition.
///
/// Writers coordinate per target slot through a 32-bit mark:
/// 0 = empty, a positive value = open, -1 = an exclusive writer. The
/// first writer (the one whose decrement observed 0) installs its
/// partial directly; later writers spin until they swap out a positive
/// mark, merge, and republish the open mark. Sparse+sparse merges of
/// term vertices run the promotion check unconditionally; doc vertices
/// never promote.
pub fn merge_partials(
    vertex_part: &mut VertexPartition,
    partials: Vec<(VertexId, TopicCount)>,
    num_topics: usize,
) {
    let len = vertex_part.values.len();
    let marks: Vec<AtomicI32> = (0..len).map(|_| AtomicI32::new(0)).collect();
    let slots = SlotVec::new(len);
    let index = &vertex_part.index;

    partials.into_par_iter().for_each(|(vid, partial)| {
        let i = *index
            .get(&vid)
            .expect("shipped a vertex the store does not own") as usize;
        let allow_promote = is_term_id(vid);

        let prev = marks[i].fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            unsafe {
                *slots.get(i) = Some(partial);
            }
            marks[i].store(OPEN, Ordering::Release);
        } else {
            loop {
                let mark = marks[i].swap(WRITING, Ordering::AcqRel);
                if mark > 0 {
                    break;
                }
                std::hint::spin_loop();
            }
            unsafe {
                slots
                    .get(i)
                    .as_mut()
                    .expect("open mark over an empty slot")
                    .merge(&partial, num_topics, allow_promote);
            }
            marks[i].store(OPEN, Ordering::Release);
        }
    });

    for (i, cell) in slots.cells.into_iter().enumerate() {
        if let Some(aggregate) = cell.into_inner() {
            vertex_part.values[i] = aggregate;
        }
    }
}

/// One full counter update: ship partials out of every edge partition,
/// route them to their owning vertex partitions, merge, and invalidate
/// the edge-partition attribute caches.
pub fn update_counters(graph: &mut TokenGraph, inference_only: bool) {
    let num_topics = graph.num_topics;
    let router = graph.router;

    let shipped: Vec<Vec<(VertexId, TopicCount)>> = graph
        .edge_parts
        .par_iter()
        .map(|part| ship_partition(part, num_topics, inference_only))
        .collect();

    let mut routed: Vec<Vec<(VertexId, TopicCount)>> =
        (0..graph.vertex_parts.len()).map(|_| Vec::new()).collect();
    for pairs in shipped {
        for (vid, tc) in pairs {
            routed[router.route(vid)].push((vid, tc));
        }
    }

    graph
        .vertex_parts
        .par_iter_mut()
        .zip(routed)
        .for_each(|(part, partials)| merge_partials(part, partials, num_topics));

    graph.shed_vertex_attrs();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{doc_vertex, term_vertex, Edge, RoutingTable};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn set_up_store(vids: &[VertexId]) -> VertexPartition {
        let mut part = VertexPartition {
            ids: Vec::new(),
            values: Vec::new(),
            index: HashMap::new(),
        };
        for &vid in vids {
            part.index.insert(vid, part.ids.len() as u32);
            part.ids.push(vid);
            part.values.push(TopicCount::new_sparse());
        }
        part
    }

    fn sparse_partial(pairs: &[(u32, u32)]) -> TopicCount {
        let mut tc = TopicCount::new_sparse();
        for &(k, c) in pairs {
            for _ in 0..c {
                tc.inc(k);
            }
        }
        tc
    }

    #[test]
    fn test_merge_is_order_independent() {
        let vids = [term_vertex(0), term_vertex(1), doc_vertex(0)];
        let base: Vec<(VertexId, TopicCount)> = vec![
            (vids[0], sparse_partial(&[(0, 1), (2, 2)])),
            (vids[0], sparse_partial(&[(1, 1)])),
            (vids[1], sparse_partial(&[(3, 4)])),
            (vids[2], sparse_partial(&[(0, 1)])),
            (vids[2], sparse_partial(&[(0, 2), (3, 1)])),
        ];

        let mut reference = set_up_store(&vids);
        merge_partials(&mut reference, base.clone(), 32);

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            let mut shuffled = base.clone();
            shuffled.shuffle(&mut rng);
            let mut store = set_up_store(&vids);
            merge_partials(&mut store, shuffled, 32);
            for (vid, expected) in reference.ids.iter().zip(reference.values.iter()) {
                let got = store.value(*vid).unwrap();
                for k in 0..32u32 {
                    assert_eq!(got.get(k), expected.get(k));
                }
            }
        }
    }

    #[test]
    fn test_merge_matches_single_threaded_reference() {
        // zipf-flavored vid distribution so a few hot vertices see
        // heavy writer contention
        let num_topics = 64;
        let vids: Vec<VertexId> = (0..50).map(term_vertex).collect();
        let mut rng = StdRng::seed_from_u64(9);
        let mut partials = Vec::with_capacity(100_000);
        for _ in 0..100_000 {
            let rank = (50.0 * (1.0 - rng.gen::<f64>().powf(2.0))) as usize;
            let vid = vids[rank.min(49)];
            let k = rng.gen_range(0..num_topics as u32);
            partials.push((vid, sparse_partial(&[(k, 1)])));
        }

        let mut expected: HashMap<VertexId, Vec<u32>> = HashMap::new();
        for (vid, tc) in &partials {
            let row = expected.entry(*vid).or_insert_with(|| vec![0; num_topics]);
            tc.for_each(|k, c| row[k as usize] += c);
        }

        for _ in 0..10 {
            partials.shuffle(&mut rng);
            let mut store = set_up_store(&vids);
            merge_partials(&mut store, partials.clone(), num_topics);
            for (vid, row) in &expected {
                let got = store.value(*vid).unwrap();
                for k in 0..num_topics as u32 {
                    assert_eq!(got.get(k), row[k as usize], "vid {:?} topic {}", vid, k);
                }
            }
        }
    }

    #[test]
    fn test_term_promotion_is_unconditional() {
        let vids = [term_vertex(7), doc_vertex(7)];
        let mut store = set_up_store(&vids);
        // two sparse partials whose union crosses K/8 = 2
        let partials = vec![
            (vids[0], sparse_partial(&[(0, 1)])),
            (vids[0], sparse_partial(&[(9, 1)])),
            (vids[1], sparse_partial(&[(0, 1)])),
            (vids[1], sparse_partial(&[(9, 1)])),
        ];
        merge_partials(&mut store, partials, 16);
        assert!(store.value(vids[0]).unwrap().is_dense());
        assert!(!store.value(vids[1]).unwrap().is_dense());
    }

    #[test]
    fn test_update_on_empty_graph_is_noop() {
        let mut graph = TokenGraph {
            num_topics: 4,
            num_tokens: 0,
            edge_parts: vec![EdgePartition::from_edges(Vec::new())],
            vertex_parts: vec![set_up_store(&[term_vertex(0), doc_vertex(0)])],
            router: RoutingTable { num_parts: 1 },
        };
        graph.vertex_parts[0].values[0] = sparse_partial(&[(1, 3)]);
        update_counters(&mut graph, false);
        assert_eq!(graph.vertex_parts[0].values[0].get(1), 3);
    }

    #[test]
    fn test_ship_groups_by_vertex() {
        let edges = vec![
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(0),
                topics: vec![0, 1],
            },
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(1),
                topics: vec![1],
            },
        ];
        let part = EdgePartition::from_edges(edges);
        let pairs = ship_partition(&part, 16, false);
        let by_vid: HashMap<VertexId, &TopicCount> =
            pairs.iter().map(|(v, tc)| (*v, tc)).collect();
        assert_eq!(by_vid[&term_vertex(0)].total(), 3);
        assert_eq!(by_vid[&doc_vertex(0)].total(), 2);
        assert_eq!(by_vid[&doc_vertex(1)].total(), 1);

        let doc_only = ship_partition(&part, 16, true);
        assert!(doc_only.iter().all(|(vid, _)| !is_term_id(*vid)));
    }
}

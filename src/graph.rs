use std::collections::HashMap;

use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::counts::{Topic, TopicCount};

/// Global vertex identifier. Term and doc ids live in disjoint ranges
/// told apart by the high bit; bit 62 marks a term as virtual.
pub type VertexId = u64;

const TERM_BIT: u64 = 1 << 63;
const VIRTUAL_BIT: u64 = 1 << 62;

pub fn term_vertex(term: u64) -> VertexId {
    term | TERM_BIT
}

pub fn virtual_term_vertex(term: u64) -> VertexId {
    term | TERM_BIT | VIRTUAL_BIT
}

pub fn doc_vertex(doc: u64) -> VertexId {
    doc
}

pub fn is_term_id(vid: VertexId) -> bool {
    vid & TERM_BIT != 0
}

pub fn is_virtual_term_id(vid: VertexId) -> bool {
    vid & TERM_BIT != 0 && vid & VIRTUAL_BIT != 0
}

/// The plain term index with the tag bits stripped.
pub fn term_index(vid: VertexId) -> u64 {
    vid & !(TERM_BIT | VIRTUAL_BIT)
}

/// One (term, doc) pair of the token graph. The occurrence array holds
/// one topic assignment per token occurrence of the pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src: VertexId,
    pub dst: VertexId,
    pub topics: Vec<Topic>,
}

/// A contiguous run of edges sharing a source, the unit of sampling
/// work in the word-by-word kernels.
#[derive(Debug, Clone, Copy)]
pub struct SourceGroup {
    pub local_src: u32,
    pub first_offset: u32,
    pub end_offset: u32,
}

/// An edge partition: edges grouped by source id, with a local vertex
/// id space and a (detachable) cache of vertex attributes.
///
/// Fields:
/// local_src_ids / local_dst_ids: per-edge endpoints in local id space
/// local2global: local vertex id to global vertex id
/// vertex_attrs: cached topic counters per local vertex, re-attached
///   from the vertex store before each sampling pass
/// data: per-edge occurrence arrays, mutated in place by the samplers
/// groups: offset table over the source-grouped edge runs
#[derive(Debug)]
pub struct EdgePartition {
    pub local_src_ids: Vec<u32>,
    pub local_dst_ids: Vec<u32>,
    pub local2global: Vec<VertexId>,
    pub vertex_attrs: Vec<TopicCount>,
    pub data: Vec<Vec<Topic>>,
    pub groups: Vec<SourceGroup>,
}

impl EdgePartition {
    /// Builds a partition from raw edges, sorting them into source
    /// groups and assigning local vertex ids in order of appearance.
    pub fn from_edges(mut edges: Vec<Edge>) -> EdgePartition {
        edges.sort_by(|a, b| a.src.cmp(&b.src).then(a.dst.cmp(&b.dst)));

        let mut local_ids: HashMap<VertexId, u32> = HashMap::new();
        let mut local2global = Vec::new();
        let mut local_of = |vid: VertexId, local2global: &mut Vec<VertexId>| -> u32 {
            *local_ids.entry(vid).or_insert_with(|| {
                local2global.push(vid);
                (local2global.len() - 1) as u32
            })
        };

        let mut local_src_ids = Vec::with_capacity(edges.len());
        let mut local_dst_ids = Vec::with_capacity(edges.len());
        let mut data = Vec::with_capacity(edges.len());
        let mut groups: Vec<SourceGroup> = Vec::new();
        let mut prev_src = None;
        for edge in edges {
            let src_local = local_of(edge.src, &mut local2global);
            let dst_local = local_of(edge.dst, &mut local2global);
            if prev_src != Some(edge.src) {
                let offset = local_src_ids.len() as u32;
                if let Some(open) = groups.last_mut() {
                    open.end_offset = offset;
                }
                groups.push(SourceGroup {
                    local_src: src_local,
                    first_offset: offset,
                    end_offset: offset,
                });
                prev_src = Some(edge.src);
            }
            local_src_ids.push(src_local);
            local_dst_ids.push(dst_local);
            data.push(edge.topics);
        }
        if let Some(open) = groups.last_mut() {
            open.end_offset = local_src_ids.len() as u32;
        }

        EdgePartition {
            local_src_ids,
            local_dst_ids,
            local2global,
            vertex_attrs: Vec::new(),
            data,
            groups,
        }
    }

    pub fn num_edges(&self) -> usize {
        self.data.len()
    }

    pub fn num_tokens(&self) -> u64 {
        self.data.iter().map(|o| o.len() as u64).sum()
    }

    /// Tears the partition back into global-id edges (used by the
    /// repartitioner and the checkpoint writer).
    pub fn to_edges(&self) -> Vec<Edge> {
        (0..self.num_edges())
            .map(|e| Edge {
                src: self.local2global[self.local_src_ids[e] as usize],
                dst: self.local2global[self.local_dst_ids[e] as usize],
                topics: self.data[e].clone(),
            })
            .collect()
    }

    /// Drops the cached vertex attributes. The cache must be
    /// re-attached before the next sampling or perplexity pass.
    pub fn shed_vertex_attrs(&mut self) {
        self.vertex_attrs = Vec::new();
    }
}

/// The authoritative store for one shard of vertex counters.
#[derive(Debug)]
pub struct VertexPartition {
    pub ids: Vec<VertexId>,
    pub values: Vec<TopicCount>,
    pub index: HashMap<VertexId, u32>,
}

impl VertexPartition {
    fn new() -> VertexPartition {
        VertexPartition {
            ids: Vec::new(),
            values: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn insert(&mut self, vid: VertexId) {
        if !self.index.contains_key(&vid) {
            self.index.insert(vid, self.ids.len() as u32);
            self.ids.push(vid);
            self.values.push(TopicCount::new_sparse());
        }
    }

    pub fn value(&self, vid: VertexId) -> Option<&TopicCount> {
        self.index.get(&vid).map(|&i| &self.values[i as usize])
    }
}

/// Maps vertex ids to their owning vertex partition.
#[derive(Debug, Clone, Copy)]
pub struct RoutingTable {
    pub num_parts: usize,
}

impl RoutingTable {
    pub fn route(&self, vid: VertexId) -> usize {
        (mix64(vid) % self.num_parts as u64) as usize
    }
}

/// SplitMix64 finalizer, used wherever a cheap well-mixed hash of an
/// id is needed (routing, edge partition strategies).
pub fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// The bipartite token graph: term vertices on one side, doc vertices
/// on the other, edges carrying per-occurrence topic assignments.
#[derive(Debug)]
pub struct TokenGraph {
    pub num_topics: usize,
    pub num_tokens: u64,
    pub edge_parts: Vec<EdgePartition>,
    pub vertex_parts: Vec<VertexPartition>,
    pub router: RoutingTable,
}

impl TokenGraph {
    /// Assembles the graph from pre-partitioned edges. Vertex counters
    /// start empty; run a counter update to populate them from the
    /// initial assignments.
    pub fn from_partitioned_edges(parts: Vec<Vec<Edge>>, num_topics: usize) -> TokenGraph {
        let router = RoutingTable {
            num_parts: parts.len().max(1),
        };
        let edge_parts: Vec<EdgePartition> = parts
            .into_par_iter()
            .map(EdgePartition::from_edges)
            .collect();

        let mut vertex_parts: Vec<VertexPartition> =
            (0..router.num_parts).map(|_| VertexPartition::new()).collect();
        for part in &edge_parts {
            for &vid in &part.local2global {
                vertex_parts[router.route(vid)].insert(vid);
            }
        }

        let num_tokens = edge_parts.iter().map(|p| p.num_tokens()).sum();
        TokenGraph {
            num_topics,
            num_tokens,
            edge_parts,
            vertex_parts,
            router,
        }
    }

    /// Rebuilds the global topic counters `n_k` by summing the term
    /// vertex counters out of the vertex store.
    pub fn global_counters(&self) -> Array1<u64> {
        let mut totals = Array1::<u64>::zeros(self.num_topics);
        for part in &self.vertex_parts {
            for (i, vid) in part.ids.iter().enumerate() {
                if is_term_id(*vid) {
                    part.values[i].for_each(|k, c| totals[k as usize] += c as u64);
                }
            }
        }
        totals
    }

    /// Fills every edge partition's vertex attribute cache from the
    /// authoritative vertex store.
    pub fn attach_vertex_attrs(&mut self) {
        let vertex_parts = &self.vertex_parts;
        let router = self.router;
        self.edge_parts.par_iter_mut().for_each(|part| {
            part.vertex_attrs = part
                .local2global
                .iter()
                .map(|&vid| {
                    vertex_parts[router.route(vid)]
                        .value(vid)
                        .cloned()
                        .unwrap_or_else(TopicCount::new_sparse)
                })
                .collect();
        });
    }

    pub fn shed_vertex_attrs(&mut self) {
        for part in &mut self.edge_parts {
            part.shed_vertex_attrs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_up_edges() -> Vec<Edge> {
        vec![
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(0),
                topics: vec![0, 1],
            },
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(0),
                topics: vec![1],
            },
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(1),
                topics: vec![0],
            },
        ]
    }

    #[test]
    fn test_id_predicates() {
        assert!(is_term_id(term_vertex(42)));
        assert!(!is_term_id(doc_vertex(42)));
        assert!(is_virtual_term_id(virtual_term_vertex(42)));
        assert!(!is_virtual_term_id(term_vertex(42)));
        assert_eq!(term_index(virtual_term_vertex(42)), 42);
        assert_eq!(term_index(term_vertex(42)), 42);
    }

    #[test]
    fn test_partition_groups_by_source() {
        let part = EdgePartition::from_edges(set_up_edges());
        assert_eq!(part.num_edges(), 3);
        assert_eq!(part.groups.len(), 2);
        for group in &part.groups {
            let src = group.local_src;
            for e in group.first_offset..group.end_offset {
                assert_eq!(part.local_src_ids[e as usize], src);
            }
        }
        // edges come back out with their assignments intact
        let round = part.to_edges();
        assert_eq!(round.len(), 3);
        assert_eq!(part.num_tokens(), 4);
    }

    #[test]
    fn test_graph_counters_empty_until_update() {
        let graph = TokenGraph::from_partitioned_edges(vec![set_up_edges()], 2);
        assert_eq!(graph.num_tokens, 4);
        let totals = graph.global_counters();
        assert_eq!(totals.sum(), 0);
    }
}

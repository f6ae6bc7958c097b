use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use rayon::prelude::*;

use crate::dist::DiscreteSampler;
use crate::gibbs::Denominators;
use crate::graph::{EdgePartition, TokenGraph};
use crate::Config;

/// Per-partition log-likelihood sums: the joint token likelihood and
/// the word- and doc-conditional ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct Likelihood {
    pub llh: f64,
    pub wllh: f64,
    pub dllh: f64,
}

impl Likelihood {
    fn add(self, other: Likelihood) -> Likelihood {
        Likelihood {
            llh: self.llh + other.llh,
            wllh: self.wllh + other.wllh,
            dllh: self.dllh + other.dllh,
        }
    }
}

/// Perplexities derived from the reduced log-likelihood sums,
/// `exp(-sum / N_tokens)` each. Lower is better.
#[derive(Debug, Clone, Copy)]
pub struct Perplexity {
    pub joint: f64,
    pub word: f64,
    pub doc: f64,
}

/// Evaluates corpus perplexity along the same source-group walk the
/// word-by-word samplers take. Vertex attribute caches must be
/// attached.
pub fn evaluate(graph: &TokenGraph, den: &Denominators, config: &Config) -> Perplexity {
    let total: Likelihood = graph
        .edge_parts
        .par_iter()
        .map(|part| partition_likelihood(part, den, config))
        .reduce(Likelihood::default, Likelihood::add);

    let n = graph.num_tokens as f64;
    Perplexity {
        joint: (-total.llh / n).exp(),
        word: (-total.wllh / n).exp(),
        doc: (-total.dllh / n).exp(),
    }
}

fn partition_likelihood(part: &EdgePartition, den: &Denominators, config: &Config) -> Likelihood {
    // per-doc denominator 1/(n_d + K*alpha), computed once per local
    // doc id under a 0 -> 1 mark; a racing duplicate compute stores
    // identical bits
    let marks: Vec<AtomicI32> = (0..part.local2global.len())
        .map(|_| AtomicI32::new(0))
        .collect();
    let cache: Vec<AtomicU64> = (0..part.local2global.len())
        .map(|_| AtomicU64::new(0))
        .collect();
    let doc_denom = |local: usize| -> f64 {
        if marks[local].load(Ordering::Acquire) == 1 {
            return f64::from_bits(cache[local].load(Ordering::Relaxed));
        }
        let n_d = &part.vertex_attrs[local];
        let value = 1.0 / (n_d.total() as f64 + config.num_topics as f64 * config.alpha);
        cache[local].store(value.to_bits(), Ordering::Relaxed);
        marks[local].store(1, Ordering::Release);
        value
    };

    let ab_norm = den.ab.norm();
    part.groups
        .par_iter()
        .map(|group| {
            let mut sums = Likelihood::default();
            let n_w = &part.vertex_attrs[group.local_src as usize];
            let mut wa_norm = 0.0;
            n_w.for_each(|k, c| wa_norm += den.alphak_denoms[k as usize] * c as f64);

            for e in group.first_offset..group.end_offset {
                let local_dst = part.local_dst_ids[e as usize] as usize;
                let n_d = &part.vertex_attrs[local_dst];
                let dd = doc_denom(local_dst);

                let mut dwb_norm = 0.0;
                n_d.for_each(|k, c| {
                    dwb_norm += c as f64 * den.term_beta_denom(k, n_w.get(k));
                });
                let token_prob = (ab_norm + wa_norm + dwb_norm) * dd;

                let occ = &part.data[e as usize];
                sums.llh += occ.len() as f64 * token_prob.ln();
                for &c in occ {
                    sums.wllh += den.term_beta_denom(c, n_w.get(c)).ln();
                    sums.dllh +=
                        ((n_d.get(c) as f64 + den.alphaks[c as usize]) * dd).ln();
                }
            }
            sums
        })
        .reduce(Likelihood::default, Likelihood::add)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::TopicCount;
    use crate::graph::{doc_vertex, term_vertex, Edge, TokenGraph};
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn attach_consistent_attrs(part: &mut EdgePartition) {
        part.vertex_attrs = part
            .local2global
            .iter()
            .map(|_| TopicCount::new_sparse())
            .collect();
        for e in 0..part.num_edges() {
            for &t in &part.data[e] {
                part.vertex_attrs[part.local_src_ids[e] as usize].inc(t);
                part.vertex_attrs[part.local_dst_ids[e] as usize].inc(t);
            }
        }
    }

    fn set_up_edges() -> Vec<Edge> {
        vec![
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(0),
                topics: vec![0, 0],
            },
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(0),
                topics: vec![1],
            },
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(1),
                topics: vec![1, 0],
            },
        ]
    }

    fn graph_of(edges: Vec<Edge>, num_topics: usize) -> TokenGraph {
        let mut graph = TokenGraph::from_partitioned_edges(vec![edges], num_topics);
        for part in &mut graph.edge_parts {
            attach_consistent_attrs(part);
        }
        graph
    }

    #[test]
    fn test_perplexity_is_finite_and_positive() {
        let mut config = Config::test_default();
        config.num_topics = 2;
        let graph = graph_of(set_up_edges(), 2);
        let den = Denominators::compute(&Array1::from(vec![3u64, 2]), 5, &config);
        let perp = evaluate(&graph, &den, &config);
        assert!(perp.joint.is_finite() && perp.joint > 1.0);
        assert!(perp.word.is_finite() && perp.word > 0.0);
        assert!(perp.doc.is_finite() && perp.doc > 0.0);
    }

    #[test]
    fn test_perplexity_invariant_under_edge_order() {
        let mut config = Config::test_default();
        config.num_topics = 2;
        let den = Denominators::compute(&Array1::from(vec![3u64, 2]), 5, &config);

        let forward = graph_of(set_up_edges(), 2);
        let mut reversed_edges = set_up_edges();
        reversed_edges.reverse();
        let reversed = graph_of(reversed_edges, 2);

        let a = evaluate(&forward, &den, &config);
        let b = evaluate(&reversed, &den, &config);
        assert_relative_eq!(a.joint, b.joint, max_relative = 1e-12);
        assert_relative_eq!(a.word, b.word, max_relative = 1e-12);
        assert_relative_eq!(a.doc, b.doc, max_relative = 1e-12);
    }
}

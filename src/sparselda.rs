use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::counts::{Topic, TopicCount};
use crate::dist::{DiscreteSampler, FlatDist};
use crate::gibbs::{CtxPool, Denominators};
use crate::graph::EdgePartition;
use crate::Config;

/// Doc-by-doc SparseLDA pass over an edge partition.
///
/// Edges are regrouped by destination and each doc becomes one task.
/// The conditional splits into
///   ab[k]  = alphak[k] * beta * denoms[k]          (dense, global)
///   db[k]  = n_kd * beta * denoms[k]               (doc support, per doc)
///   wda[k] = (n_kd + alphak[k]) * n_kw * denoms[k] (term support, per edge)
/// All three are flat cumulative builds; nothing is mutated in place,
/// the counter-update phase reconstructs the counters afterwards.
pub fn sample_partition_doc(
    part: &mut EdgePartition,
    pid: usize,
    num_parts: usize,
    iter: usize,
    den: &Denominators,
    pool: &CtxPool,
    config: &Config,
    deadline: Instant,
) -> Result<(), String> {
    // global smoothing distribution, shared read-only by every task
    let k = config.num_topics;
    let ab_probs: Vec<f64> = (0..k)
        .map(|i| den.alphak_denoms[i] * config.beta)
        .collect();
    let mut ab = FlatDist::new();
    ab.reset(k);
    ab.reset_dist(&ab_probs, None, k);

    // doc-grouped view of the source-grouped edge arrays
    let mut doc_edges: Vec<(u32, Vec<u32>)> = Vec::new();
    {
        let mut by_doc: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
        for (e, &dst) in part.local_dst_ids.iter().enumerate() {
            by_doc.entry(dst).or_default().push(e as u32);
        }
        doc_edges.extend(by_doc);
        doc_edges.sort_by_key(|(dst, _)| *dst);
    }

    let local_src_ids = &part.local_src_ids;
    let vertex_attrs = &part.vertex_attrs;
    let data = &part.data;

    let resampled: Vec<Vec<(u32, Vec<Topic>)>> = doc_edges
        .par_iter()
        .enumerate()
        .map(|(di, (dst, edges))| {
            if Instant::now() > deadline {
                return Err(format!(
                    "partition {} exceeded the task deadline in iteration {}",
                    pid, iter
                ));
            }
            let mut ctx = pool.checkout();
            let ctx = &mut *ctx;
            ctx.rng = StdRng::seed_from_u64(doc_seed(config, iter, pid, num_parts, di));

            let n_d = &vertex_attrs[*dst as usize];
            build_db(&mut ctx.flat_doc, n_d, den);

            let mut out = Vec::with_capacity(edges.len());
            for &e in edges {
                if config.sample_rate < 1.0 && ctx.rng.gen::<f64>() >= config.sample_rate {
                    continue;
                }
                let n_w = &vertex_attrs[local_src_ids[e as usize] as usize];
                build_wda(&mut ctx.flat_edge, n_d, n_w, den);
                let occ = data[e as usize]
                    .iter()
                    .map(|&current| {
                        sample_token(
                            &mut ctx.rng,
                            &ab,
                            &ctx.flat_doc,
                            &ctx.flat_edge,
                            n_d,
                            n_w,
                            current,
                        )
                    })
                    .collect();
                out.push((e, occ));
            }
            Ok(out)
        })
        .collect::<Result<Vec<_>, String>>()?;

    for doc in resampled {
        for (e, occ) in doc {
            part.data[e as usize] = occ;
        }
    }
    Ok(())
}

fn doc_seed(config: &Config, iter: usize, pid: usize, num_parts: usize, doc: usize) -> u64 {
    (config
        .seed
        .wrapping_add(iter as u64)
        .wrapping_mul(num_parts as u64)
        .wrapping_add(pid as u64))
    .wrapping_mul(0x200_0000)
    .wrapping_add(doc as u64)
}

fn build_db(flat: &mut FlatDist, n_d: &TopicCount, den: &Denominators) {
    let mut probs = Vec::with_capacity(n_d.active_size());
    let mut space = Vec::with_capacity(n_d.active_size());
    n_d.for_each(|k, c| {
        probs.push(c as f64 * den.beta_denoms[k as usize]);
        space.push(k);
    });
    let size = probs.len();
    flat.reset_dist(&probs, Some(&space), size);
}

fn build_wda(flat: &mut FlatDist, n_d: &TopicCount, n_w: &TopicCount, den: &Denominators) {
    let mut probs = Vec::with_capacity(n_w.active_size());
    let mut space = Vec::with_capacity(n_w.active_size());
    n_w.for_each(|k, c| {
        let i = k as usize;
        probs.push((n_d.get(k) as f64 + den.alphaks[i]) * c as f64 * den.denoms[i]);
        space.push(k);
    });
    let size = probs.len();
    flat.reset_dist(&probs, Some(&space), size);
}

fn sample_token(
    rng: &mut StdRng,
    ab: &FlatDist,
    db: &FlatDist,
    wda: &FlatDist,
    n_d: &TopicCount,
    n_w: &TopicCount,
    current: Topic,
) -> Topic {
    let db_norm = db.norm();
    let wda_norm = wda.norm();
    let total = db_norm + wda_norm + ab.norm();
    let u = rng.gen_range(0.0..total);
    if u < db_norm {
        let n_cd = n_d.get(current);
        db.resample_from(u, rng, current, 1.0 / n_cd.max(1) as f64)
    } else if u < db_norm + wda_norm {
        let n_cw = n_w.get(current);
        wda.resample_from(u - db_norm, rng, current, 1.0 / n_cw.max(1) as f64)
    } else {
        ab.sample_from(u - db_norm - wda_norm, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{doc_vertex, term_vertex, Edge};
    use ndarray::Array1;

    fn set_up_partition() -> EdgePartition {
        let edges = vec![
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(0),
                topics: vec![0, 1],
            },
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(0),
                topics: vec![1],
            },
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(1),
                topics: vec![2],
            },
        ];
        let mut part = EdgePartition::from_edges(edges);
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
        part
    }

    #[test]
    fn test_doc_pass_keeps_structure() {
        let mut config = Config::test_default();
        config.num_topics = 3;
        let mut part = set_up_partition();
        let lengths: Vec<usize> = part.data.iter().map(|o| o.len()).collect();
        let n_k = Array1::from(vec![1u64, 2, 1]);
        let den = Denominators::compute(&n_k, 4, &config);
        let pool = CtxPool::new(2, 3);
        let deadline = Instant::now() + std::time::Duration::from_secs(60);

        sample_partition_doc(&mut part, 0, 1, 1, &den, &pool, &config, deadline).unwrap();

        let after: Vec<usize> = part.data.iter().map(|o| o.len()).collect();
        assert_eq!(lengths, after);
        for occ in &part.data {
            for &t in occ {
                assert!((t as usize) < config.num_topics);
            }
        }
    }

    #[test]
    fn test_doc_pass_is_deterministic() {
        let mut config = Config::test_default();
        config.num_topics = 3;
        let n_k = Array1::from(vec![1u64, 2, 1]);
        let den = Denominators::compute(&n_k, 4, &config);
        let deadline = Instant::now() + std::time::Duration::from_secs(60);

        let mut one = set_up_partition();
        sample_partition_doc(&mut one, 0, 1, 2, &den, &CtxPool::new(1, 3), &config, deadline)
            .unwrap();
        let mut two = set_up_partition();
        sample_partition_doc(&mut two, 0, 1, 2, &den, &CtxPool::new(4, 3), &config, deadline)
            .unwrap();
        assert_eq!(one.data, two.data);
    }
}

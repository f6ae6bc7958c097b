use std::sync::Mutex;
use std::time::Instant;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::counts::{Topic, TopicCount};
use crate::dist::{AliasTable, CumulativeDist, DiscreteSampler, FTree, FlatDist};
use crate::graph::{is_virtual_term_id, EdgePartition, SourceGroup};
use crate::{AccelMethod, Config};

/// Shared per-iteration vectors of the posterior decomposition.
///
/// The collapsed conditional for a token of term w in doc d splits into
/// three non-negative parts:
///   ab[k]  = alphak_denoms[k] * beta              (dense, global)
///   wa[k]  = alphak_denoms[k] * n_kw              (term support)
///   dwb[k] = n_kd * (beta + n_kw) * denoms[k]     (doc support)
/// so that ab[k] + wa[k] + dwb[k] = (n_kw + beta) * denoms[k] * (n_kd + alphak[k]).
///
/// Everything here depends only on the global counters and is rebuilt
/// once per iteration.
pub struct Denominators {
    pub denoms: Array1<f64>,
    pub alphaks: Array1<f64>,
    pub alphak_denoms: Array1<f64>,
    pub beta_denoms: Array1<f64>,
    pub ab: AliasTable,
    pub alphak_sum: f64,
    pub alpha_ratio: f64,
}

impl Denominators {
    pub fn compute(n_k: &Array1<u64>, num_tokens: u64, config: &Config) -> Denominators {
        let k = config.num_topics;
        let kf = k as f64;
        let alpha_ratio = kf * config.alpha / (num_tokens as f64 + kf * config.alpha_as);

        let mut denoms = Array1::zeros(k);
        let mut alphaks = Array1::zeros(k);
        let mut alphak_denoms = Array1::zeros(k);
        let mut beta_denoms = Array1::zeros(k);
        let mut ab_probs = vec![0.0; k];
        for i in 0..k {
            denoms[i] = 1.0 / (n_k[i] as f64 + kf * config.beta);
            alphaks[i] = alpha_ratio * (n_k[i] as f64 + config.alpha_as);
            alphak_denoms[i] = alphaks[i] * denoms[i];
            beta_denoms[i] = config.beta * denoms[i];
            ab_probs[i] = alphak_denoms[i] * config.beta;
        }
        let alphak_sum = alphaks.sum();

        let mut ab = AliasTable::new();
        ab.reset(k);
        ab.reset_dist(&ab_probs, None, k);

        Denominators {
            denoms,
            alphaks,
            alphak_denoms,
            beta_denoms,
            ab,
            alphak_sum,
            alpha_ratio,
        }
    }

    /// `(n_kw + beta) / (n_k + K*beta)` for one topic of one term.
    pub fn term_beta_denom(&self, k: Topic, n_kw: u32) -> f64 {
        self.beta_denoms[k as usize] + self.denoms[k as usize] * n_kw as f64
    }
}

/// Mutable sampling state owned by one pool worker: its RNG, the
/// per-term accelerated distribution, the per-doc cumulative one, the
/// flat distributions of the doc-by-doc kernel, the dense proposal
/// tables of the Metropolis-Hastings kernel, and scratch space for
/// distribution builds.
pub struct SamplerCtx {
    pub rng: StdRng,
    pub term_alias: AliasTable,
    pub term_tree: FTree,
    pub cdf: CumulativeDist,
    pub flat_doc: FlatDist,
    pub flat_edge: FlatDist,
    pub dense_alpha: AliasTable,
    pub dense_beta: AliasTable,
    pub probs: Vec<f64>,
    pub space: Vec<Topic>,
}

impl SamplerCtx {
    fn new(num_topics: usize) -> SamplerCtx {
        let mut term_alias = AliasTable::new();
        term_alias.reset(num_topics);
        let mut term_tree = FTree::new();
        term_tree.reset(num_topics);
        let mut cdf = CumulativeDist::new();
        cdf.reset(num_topics);
        SamplerCtx {
            rng: StdRng::seed_from_u64(0),
            term_alias,
            term_tree,
            cdf,
            flat_doc: FlatDist::new(),
            flat_edge: FlatDist::new(),
            dense_alpha: AliasTable::new(),
            dense_beta: AliasTable::new(),
            probs: Vec::with_capacity(num_topics),
            space: Vec::with_capacity(num_topics),
        }
    }
}

/// A checkout/checkin pool of sampler contexts, one slot per pool
/// thread. Contexts hold the only mutable sampler state, so a slot is
/// never contended while rayon keeps one task per thread.
pub struct CtxPool {
    slots: Vec<Mutex<SamplerCtx>>,
}

impl CtxPool {
    pub fn new(num_threads: usize, num_topics: usize) -> CtxPool {
        CtxPool {
            slots: (0..num_threads.max(1))
                .map(|_| Mutex::new(SamplerCtx::new(num_topics)))
                .collect(),
        }
    }

    pub fn checkout(&self) -> std::sync::MutexGuard<'_, SamplerCtx> {
        let slot = rayon::current_thread_index().unwrap_or(0) % self.slots.len();
        self.slots[slot].lock().expect("poisoned sampler context")
    }
}

/// Seed for one source group's RNG stream. Group-granular seeding
/// keeps a run reproducible regardless of how tasks land on threads.
fn group_seed(config: &Config, iter: usize, pid: usize, num_parts: usize, group: usize) -> u64 {
    (config
        .seed
        .wrapping_add(iter as u64)
        .wrapping_mul(num_parts as u64)
        .wrapping_add(pid as u64))
    .wrapping_mul(0x100_0000)
    .wrapping_add(group as u64)
}

/// One word-by-word sampling pass over an edge partition, mutating the
/// occurrence arrays in place. Partition-global counters are left
/// untouched; the counter-update phase reconstructs them afterwards.
///
/// With `skip_virtual` set (the ZenSemiLDA variant) source groups of
/// virtual terms keep their current assignments.
pub fn sample_partition_word(
    part: &mut EdgePartition,
    pid: usize,
    num_parts: usize,
    iter: usize,
    den: &Denominators,
    pool: &CtxPool,
    config: &Config,
    deadline: Instant,
    skip_virtual: bool,
) -> Result<(), String> {
    let num_groups = part.groups.len();
    let groups = &part.groups;
    let local_dst_ids = &part.local_dst_ids;
    let local2global = &part.local2global;
    let vertex_attrs = &part.vertex_attrs;

    // carve the occurrence data into per-group mutable slices so group
    // tasks can run concurrently without touching each other's edges
    let mut tasks: Vec<(usize, &SourceGroup, &mut [Vec<Topic>])> = Vec::with_capacity(num_groups);
    let mut rest = part.data.as_mut_slice();
    for (gi, group) in groups.iter().enumerate() {
        let len = (group.end_offset - group.first_offset) as usize;
        let (head, tail) = rest.split_at_mut(len);
        rest = tail;
        tasks.push((gi, group, head));
    }

    tasks.into_par_iter().try_for_each(|(gi, group, occ)| {
        if Instant::now() > deadline {
            return Err(format!(
                "partition {} exceeded the task deadline in iteration {}",
                pid, iter
            ));
        }
        if skip_virtual && is_virtual_term_id(local2global[group.local_src as usize]) {
            return Ok(());
        }

        let mut ctx = pool.checkout();
        let ctx = &mut *ctx;
        ctx.rng = StdRng::seed_from_u64(group_seed(config, iter, pid, num_parts, gi));

        let n_w = &vertex_attrs[group.local_src as usize];
        build_term_dist(ctx, n_w, den);
        let use_alias = match config.accel_method {
            AccelMethod::Alias => true,
            AccelMethod::FTree => false,
            // wide groups amortize the O(support) alias build
            AccelMethod::Hybrid => {
                occ.iter().map(|o| o.len()).sum::<usize>() >= n_w.active_size()
            }
        };

        for (e, occ_e) in occ.iter_mut().enumerate() {
            if config.sample_rate < 1.0 && ctx.rng.gen::<f64>() >= config.sample_rate {
                continue;
            }
            let offset = group.first_offset as usize + e;
            let n_d = &vertex_attrs[local_dst_ids[offset] as usize];
            if occ_e.len() == 1 {
                let current = occ_e[0];
                build_doc_dist(&mut ctx.cdf, n_d, n_w, den, Some(current));
                occ_e[0] = if use_alias {
                    sample_token(
                        &mut ctx.rng,
                        &ctx.cdf,
                        &ctx.term_alias,
                        n_w,
                        n_d,
                        den,
                        current,
                        true,
                    )
                } else {
                    sample_token(
                        &mut ctx.rng,
                        &ctx.cdf,
                        &ctx.term_tree,
                        n_w,
                        n_d,
                        den,
                        current,
                        true,
                    )
                };
            } else {
                build_doc_dist(&mut ctx.cdf, n_d, n_w, den, None);
                for i in 0..occ_e.len() {
                    let current = occ_e[i];
                    occ_e[i] = if use_alias {
                        sample_token(
                            &mut ctx.rng,
                            &ctx.cdf,
                            &ctx.term_alias,
                            n_w,
                            n_d,
                            den,
                            current,
                            false,
                        )
                    } else {
                        sample_token(
                            &mut ctx.rng,
                            &ctx.cdf,
                            &ctx.term_tree,
                            n_w,
                            n_d,
                            den,
                            current,
                            false,
                        )
                    };
                }
            }
        }
        Ok(())
    })
}

/// Builds the `wa` distribution over the term's topic support into the
/// worker's accelerated table.
fn build_term_dist(ctx: &mut SamplerCtx, n_w: &TopicCount, den: &Denominators) {
    ctx.probs.clear();
    ctx.space.clear();
    n_w.for_each(|k, c| {
        ctx.probs.push(den.alphak_denoms[k as usize] * c as f64);
        ctx.space.push(k);
    });
    let size = ctx.probs.len();
    ctx.term_alias.reset_dist(&ctx.probs, Some(&ctx.space), size);
    ctx.term_tree.reset_dist(&ctx.probs, Some(&ctx.space), size);
}

/// Builds the `dwb` distribution over the doc's topic support. With
/// `adjusted = Some(c)` the current token's own count is subtracted
/// from `n_cd` up front (the single-occurrence fast path).
fn build_doc_dist(
    cdf: &mut CumulativeDist,
    n_d: &TopicCount,
    n_w: &TopicCount,
    den: &Denominators,
    adjusted: Option<Topic>,
) {
    let mut pairs: Vec<(Topic, f64)> = Vec::with_capacity(n_d.active_size());
    n_d.for_each(|k, c| {
        let c = if adjusted == Some(k) { c - 1 } else { c };
        if c > 0 {
            pairs.push((k, c as f64 * den.term_beta_denom(k, n_w.get(k))));
        }
    });
    cdf.reset_pairs(pairs.into_iter());
}

/// Draws one topic for a token currently assigned `current`, routing a
/// single uniform across the dwb / wa / ab intervals. The alias
/// rejection applies the exact -1 correction for the token's own
/// contribution to the doc and term counts; `doc_adjusted` marks that
/// the dwb table was already built with the doc side subtracted.
#[allow(clippy::too_many_arguments)]
fn sample_token<D: DiscreteSampler>(
    rng: &mut StdRng,
    cdf: &CumulativeDist,
    term_dist: &D,
    n_w: &TopicCount,
    n_d: &TopicCount,
    den: &Denominators,
    current: Topic,
    doc_adjusted: bool,
) -> Topic {
    let dwb_norm = cdf.norm();
    let wa_norm = term_dist.norm();
    let ab_norm = den.ab.norm();
    let total = dwb_norm + wa_norm + ab_norm;
    let u = rng.gen_range(0.0..total);

    if u < dwb_norm {
        if doc_adjusted {
            cdf.sample_from(u, rng)
        } else {
            // f(current) = n_cd * termBeta(current); removing one
            // occurrence rejects with probability 1/n_cd
            let n_cd = n_d.get(current);
            cdf.resample_from(u, rng, current, 1.0 / n_cd.max(1) as f64)
        }
    } else if u < dwb_norm + wa_norm {
        let n_cw = n_w.get(current);
        term_dist.resample_from(u - dwb_norm, rng, current, 1.0 / n_cw.max(1) as f64)
    } else {
        den.ab.sample_from(u - dwb_norm - wa_norm, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::TopicCount;
    use crate::graph::{doc_vertex, term_vertex, Edge, EdgePartition};
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn set_up_config(num_topics: usize) -> Config {
        let mut config = Config::test_default();
        config.num_topics = num_topics;
        config
    }

    #[test]
    fn test_decomposition_matches_full_conditional() {
        let config = set_up_config(4);
        let n_k = Array1::from(vec![10u64, 0, 3, 7]);
        let num_tokens = 20;
        let den = Denominators::compute(&n_k, num_tokens, &config);

        let mut n_w = TopicCount::new_sparse();
        for _ in 0..4 {
            n_w.inc(0);
        }
        n_w.inc(2);
        let mut n_d = TopicCount::new_sparse();
        n_d.inc(0);
        for _ in 0..3 {
            n_d.inc(3);
        }

        for k in 0..4u32 {
            let n_kw = n_w.get(k) as f64;
            let n_kd = n_d.get(k) as f64;
            let full = (n_kw + config.beta)
                * den.denoms[k as usize]
                * (n_kd + den.alphaks[k as usize]);
            let ab = den.alphak_denoms[k as usize] * config.beta;
            let wa = den.alphak_denoms[k as usize] * n_kw;
            let dwb = n_kd * den.term_beta_denom(k, n_w.get(k));
            assert_relative_eq!(ab + wa + dwb, full, max_relative = 1e-12);
        }
    }

    fn set_up_partition() -> EdgePartition {
        let edges = vec![
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(0),
                topics: vec![0, 1, 0],
            },
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(0),
                topics: vec![1],
            },
            Edge {
                src: term_vertex(1),
                dst: doc_vertex(1),
                topics: vec![0, 0],
            },
        ];
        let mut part = EdgePartition::from_edges(edges);
        // counters consistent with the assignments above
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
    fn test_kernel_keeps_topics_in_range() {
        let config = set_up_config(2);
        let mut part = set_up_partition();
        let n_k = Array1::from(vec![4u64, 2]);
        let den = Denominators::compute(&n_k, 6, &config);
        let pool = CtxPool::new(2, 2);
        let deadline = Instant::now() + std::time::Duration::from_secs(60);

        sample_partition_word(&mut part, 0, 1, 1, &den, &pool, &config, deadline, false)
            .unwrap();
        for occ in &part.data {
            assert!(!occ.is_empty());
            for &t in occ {
                assert!((t as usize) < config.num_topics);
            }
        }
    }

    #[test]
    fn test_kernel_is_deterministic_for_fixed_seed() {
        let config = set_up_config(2);
        let n_k = Array1::from(vec![4u64, 2]);
        let den = Denominators::compute(&n_k, 6, &config);
        let deadline = Instant::now() + std::time::Duration::from_secs(60);

        let mut one = set_up_partition();
        let pool_one = CtxPool::new(1, 2);
        sample_partition_word(&mut one, 0, 1, 3, &den, &pool_one, &config, deadline, false)
            .unwrap();

        let mut two = set_up_partition();
        let pool_two = CtxPool::new(4, 2);
        sample_partition_word(&mut two, 0, 1, 3, &den, &pool_two, &config, deadline, false)
            .unwrap();

        assert_eq!(one.data, two.data);
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::counts::{Topic, TopicCount};
use crate::dist::{AliasTable, DiscreteSampler};
use crate::gibbs::{CtxPool, Denominators, SamplerCtx};
use crate::graph::{EdgePartition, SourceGroup};
use crate::Config;

/// MH moves per token, alternating doc and word proposals.
const MH_STEPS: usize = 8;
/// Rebuild probability for a cached doc alias table on access.
const DOC_REBUILD_P: f64 = 1e-2;
/// Per-token rebuild probability for the dense alpha and beta tables.
const DENSE_REBUILD_P: f64 = 1e-6;
/// Per-token rebuild probability for the per-term sparse alias.
const WORD_REBUILD_P: f64 = 1e-4;
/// Bounded cache of per-doc alias tables, sized to stay cache-resident.
const DOC_CACHE_CAP: usize = 1 << 12;

/// Bounded LRU of doc proposal tables keyed by local doc id. Entries
/// go stale as doc counters move; the rebuild coin on access bounds
/// the staleness.
struct DocAliasCache {
    tables: HashMap<u32, Arc<AliasTable>>,
    order: VecDeque<u32>,
}

impl DocAliasCache {
    fn new() -> DocAliasCache {
        DocAliasCache {
            tables: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn fetch(&mut self, doc: u32) -> Option<Arc<AliasTable>> {
        self.tables.get(&doc).cloned()
    }

    fn install(&mut self, doc: u32, table: Arc<AliasTable>) {
        if !self.tables.contains_key(&doc) {
            self.order.push_back(doc);
            while self.order.len() > DOC_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.tables.remove(&evicted);
                }
            }
        }
        self.tables.insert(doc, table);
    }
}

/// LightLDA pass over an edge partition: per token, `MH_STEPS`
/// Metropolis-Hastings moves alternating a document proposal
/// `q_d(k) ~ n_kd + alphak[k]` and a word proposal
/// `q_w(k) ~ (n_kw + beta) / (n_k + K*beta)`.
///
/// Unlike the word-by-word family this kernel mutates counters in
/// place on acceptance: the global `n_k` through atomic increments,
/// the term vector exclusively within its source group, and the doc
/// vector inside its per-vector mutex (several groups hit the same doc
/// concurrently).
#[allow(clippy::too_many_arguments)]
pub fn sample_partition_light(
    part: &mut EdgePartition,
    pid: usize,
    num_parts: usize,
    iter: usize,
    den: &Denominators,
    n_k: &[AtomicU64],
    pool: &CtxPool,
    config: &Config,
    deadline: Instant,
) -> Result<(), String> {
    let attrs: Vec<Mutex<TopicCount>> = std::mem::take(&mut part.vertex_attrs)
        .into_iter()
        .map(Mutex::new)
        .collect();
    let doc_cache = Mutex::new(DocAliasCache::new());

    let groups = &part.groups;
    let local_dst_ids = &part.local_dst_ids;
    let mut tasks: Vec<(usize, &SourceGroup, &mut [Vec<Topic>])> =
        Vec::with_capacity(groups.len());
    let mut rest = part.data.as_mut_slice();
    for (gi, group) in groups.iter().enumerate() {
        let len = (group.end_offset - group.first_offset) as usize;
        let (head, tail) = rest.split_at_mut(len);
        rest = tail;
        tasks.push((gi, group, head));
    }

    let result = tasks.into_par_iter().try_for_each(|(gi, group, occ)| {
        if Instant::now() > deadline {
            return Err(format!(
                "partition {} exceeded the task deadline in iteration {}",
                pid, iter
            ));
        }
        let mut ctx = pool.checkout();
        let ctx = &mut *ctx;
        ctx.rng = StdRng::seed_from_u64(light_seed(config, iter, pid, num_parts, gi));

        // the source group owns its term vector for the whole task
        let mut n_w = attrs[group.local_src as usize]
            .lock()
            .map_err(|_| "poisoned term counter".to_string())?;
        build_dense_tables(ctx, n_k, config, den);
        build_word_table(ctx, &n_w, den);

        for (e, occ_e) in occ.iter_mut().enumerate() {
            if config.sample_rate < 1.0 && ctx.rng.gen::<f64>() >= config.sample_rate {
                continue;
            }
            let dst = local_dst_ids[group.first_offset as usize + e];
            let mut n_d = attrs[dst as usize]
                .lock()
                .map_err(|_| "poisoned doc counter".to_string())?;

            for current in occ_e.iter_mut() {
                if ctx.rng.gen::<f64>() < DENSE_REBUILD_P {
                    build_dense_tables(ctx, n_k, config, den);
                }
                if ctx.rng.gen::<f64>() < WORD_REBUILD_P {
                    build_word_table(ctx, &n_w, den);
                }
                let doc_table = doc_table_for(ctx, &doc_cache, dst, &n_d);

                let mut c = *current;
                for step in 0..MH_STEPS {
                    let proposal = if step % 2 == 0 {
                        propose_doc(ctx, &doc_table, den)
                    } else {
                        propose_word(ctx)
                    };
                    if proposal == c {
                        continue;
                    }
                    let ratio = if step % 2 == 0 {
                        accept_ratio_doc(&n_w, &n_d, n_k, den, config, c, proposal)
                    } else {
                        accept_ratio_word(&n_w, &n_d, n_k, den, config, c, proposal)
                    };
                    if ratio >= 1.0 || ctx.rng.gen::<f64>() < ratio {
                        n_w.dec(c);
                        n_w.inc(proposal);
                        n_d.dec(c);
                        n_d.inc(proposal);
                        n_k[c as usize].fetch_sub(1, Ordering::Relaxed);
                        n_k[proposal as usize].fetch_add(1, Ordering::Relaxed);
                        c = proposal;
                    }
                }
                *current = c;
            }
        }
        Ok(())
    });

    part.vertex_attrs = attrs
        .into_iter()
        .map(|m| m.into_inner().unwrap_or_else(|p| p.into_inner()))
        .collect();
    result
}

fn light_seed(config: &Config, iter: usize, pid: usize, num_parts: usize, group: usize) -> u64 {
    (config
        .seed
        .wrapping_add(iter as u64)
        .wrapping_mul(num_parts as u64)
        .wrapping_add(pid as u64))
    .wrapping_mul(0x400_0000)
    .wrapping_add(group as u64)
}

/// Rebuilds the dense alpha and beta proposal tables from the live
/// global counters.
fn build_dense_tables(ctx: &mut SamplerCtx, n_k: &[AtomicU64], config: &Config, den: &Denominators) {
    let k = config.num_topics;
    let kf = k as f64;
    ctx.probs.clear();
    for i in 0..k {
        let nk = n_k[i].load(Ordering::Relaxed) as f64;
        ctx.probs.push(den.alpha_ratio * (nk + config.alpha_as));
    }
    ctx.dense_alpha.reset_dist(&ctx.probs, None, k);
    ctx.probs.clear();
    for i in 0..k {
        let nk = n_k[i].load(Ordering::Relaxed) as f64;
        ctx.probs.push(config.beta / (nk + kf * config.beta));
    }
    ctx.dense_beta.reset_dist(&ctx.probs, None, k);
}

/// Rebuilds the sparse term part of the word proposal.
fn build_word_table(ctx: &mut SamplerCtx, n_w: &TopicCount, den: &Denominators) {
    ctx.probs.clear();
    ctx.space.clear();
    n_w.for_each(|k, c| {
        ctx.probs.push(c as f64 * den.denoms[k as usize]);
        ctx.space.push(k);
    });
    let size = ctx.probs.len();
    ctx.term_alias.reset_dist(&ctx.probs, Some(&ctx.space), size);
}

/// Fetches the doc proposal table from the shared cache, rebuilding it
/// on a miss or with probability `DOC_REBUILD_P`.
fn doc_table_for(
    ctx: &mut SamplerCtx,
    cache: &Mutex<DocAliasCache>,
    dst: u32,
    n_d: &TopicCount,
) -> Arc<AliasTable> {
    let cached = cache
        .lock()
        .ok()
        .and_then(|mut c| c.fetch(dst))
        .filter(|_| ctx.rng.gen::<f64>() >= DOC_REBUILD_P);
    if let Some(table) = cached {
        return table;
    }
    ctx.probs.clear();
    ctx.space.clear();
    n_d.for_each(|k, c| {
        ctx.probs.push(c as f64);
        ctx.space.push(k);
    });
    let mut table = AliasTable::new();
    let size = ctx.probs.len();
    table.reset(size);
    table.reset_dist(&ctx.probs, Some(&ctx.space), size);
    let table = Arc::new(table);
    if let Ok(mut c) = cache.lock() {
        c.install(dst, table.clone());
    }
    table
}

/// Document proposal: doc mass routes to the cached sparse table,
/// smoothing mass to the dense alpha table.
fn propose_doc(ctx: &mut SamplerCtx, doc_table: &AliasTable, den: &Denominators) -> Topic {
    let doc_mass = doc_table.norm();
    let total = doc_mass + den.alphak_sum;
    let u = ctx.rng.gen_range(0.0..total);
    if u < doc_mass {
        doc_table.sample_from(u, &mut ctx.rng)
    } else {
        let u = ctx.rng.gen_range(0.0..ctx.dense_alpha.norm());
        ctx.dense_alpha.sample_from(u, &mut ctx.rng)
    }
}

/// Word proposal: term mass routes to the sparse per-term table,
/// smoothing mass to the dense beta table.
fn propose_word(ctx: &mut SamplerCtx) -> Topic {
    let term_mass = ctx.term_alias.norm();
    let total = term_mass + ctx.dense_beta.norm();
    let u = ctx.rng.gen_range(0.0..total);
    if u < term_mass {
        ctx.term_alias.sample_from(u, &mut ctx.rng)
    } else {
        let u = ctx.rng.gen_range(0.0..ctx.dense_beta.norm());
        ctx.dense_beta.sample_from(u, &mut ctx.rng)
    }
}

/// Collapsed conditional with the current token's own contribution
/// subtracted from the counts.
fn adjusted_conditional(
    n_w: &TopicCount,
    n_d: &TopicCount,
    n_k: &[AtomicU64],
    den: &Denominators,
    config: &Config,
    current: Topic,
    k: Topic,
) -> f64 {
    let own = if k == current { 1.0 } else { 0.0 };
    let nkw = n_w.get(k) as f64 - own;
    let nkd = n_d.get(k) as f64 - own;
    let nk = n_k[k as usize].load(Ordering::Relaxed) as f64 - own;
    (nkw + config.beta) * (nkd + den.alphaks[k as usize])
        / (nk + config.num_topics as f64 * config.beta)
}

fn accept_ratio_doc(
    n_w: &TopicCount,
    n_d: &TopicCount,
    n_k: &[AtomicU64],
    den: &Denominators,
    config: &Config,
    current: Topic,
    proposal: Topic,
) -> f64 {
    let p_new = adjusted_conditional(n_w, n_d, n_k, den, config, current, proposal);
    let p_old = adjusted_conditional(n_w, n_d, n_k, den, config, current, current);
    let q_new = n_d.get(proposal) as f64 + den.alphaks[proposal as usize];
    let q_old = n_d.get(current) as f64 + den.alphaks[current as usize];
    (p_new * q_old) / (p_old * q_new)
}

fn accept_ratio_word(
    n_w: &TopicCount,
    n_d: &TopicCount,
    n_k: &[AtomicU64],
    den: &Denominators,
    config: &Config,
    current: Topic,
    proposal: Topic,
) -> f64 {
    let p_new = adjusted_conditional(n_w, n_d, n_k, den, config, current, proposal);
    let p_old = adjusted_conditional(n_w, n_d, n_k, den, config, current, current);
    let q_new = (n_w.get(proposal) as f64 + config.beta) * den.denoms[proposal as usize];
    let q_old = (n_w.get(current) as f64 + config.beta) * den.denoms[current as usize];
    (p_new * q_old) / (p_old * q_new)
}

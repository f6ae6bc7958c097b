use rand::Rng;

use crate::counts::Topic;

/// A discrete distribution over up to K outcomes that can be rebuilt in
/// place and sampled with a caller-supplied uniform.
///
/// `reset_dist` rebuilds the table from raw probabilities, optionally
/// over a sparse index space (the i-th probability then belongs to
/// outcome `space[i]` instead of `i`). `sample_from` consumes a uniform
/// `u` already scaled to `[0, norm())`; the rng is only touched when an
/// implementation needs extra randomness (alias redraws, rejections).
pub trait DiscreteSampler {
    fn reset(&mut self, num_topics: usize);

    fn reset_dist(&mut self, probs: &[f64], space: Option<&[Topic]>, size: usize);

    fn norm(&self) -> f64;

    fn sample_from<R: Rng>(&self, u: f64, rng: &mut R) -> Topic;

    /// Samples from the distribution with a one-term correction: the
    /// result is distributed as `f(k) - delta * [k == excluded]` where
    /// `correction = delta / f(excluded)`. A draw that lands on
    /// `excluded` is rejected with probability `correction` and redrawn.
    fn resample_from<R: Rng>(
        &self,
        u: f64,
        rng: &mut R,
        excluded: Topic,
        correction: f64,
    ) -> Topic {
        let mut topic = self.sample_from(u, rng);
        while topic == excluded && rng.gen::<f64>() < correction {
            topic = self.sample_from(rng.gen_range(0.0..self.norm()), rng);
        }
        topic
    }
}

fn check_norm(norm: f64) -> f64 {
    // a non-positive or non-finite mass means a counter went bad upstream
    assert!(
        norm.is_finite() && norm > 0.0,
        "distribution norm must be positive and finite, got {}",
        norm
    );
    norm
}

/// Walker's alias method: O(size) build, O(1) sample.
///
/// Fields:
/// prob: per-slot probability of keeping the slot's own outcome
/// alias: per-slot fallback outcome
/// space: sparse index map, empty when the table is dense
/// used: number of live slots
/// mass: unnormalized total probability mass
#[derive(Debug, Clone)]
pub struct AliasTable {
    prob: Vec<f64>,
    alias: Vec<u32>,
    space: Vec<Topic>,
    used: usize,
    mass: f64,
}

impl AliasTable {
    pub fn new() -> AliasTable {
        AliasTable {
            prob: Vec::new(),
            alias: Vec::new(),
            space: Vec::new(),
            used: 0,
            mass: 0.0,
        }
    }

    fn outcome(&self, slot: usize) -> Topic {
        if self.space.is_empty() {
            slot as Topic
        } else {
            self.space[slot]
        }
    }
}

impl Default for AliasTable {
    fn default() -> AliasTable {
        AliasTable::new()
    }
}

impl DiscreteSampler for AliasTable {
    fn reset(&mut self, num_topics: usize) {
        self.prob.clear();
        self.prob.reserve(num_topics);
        self.alias.clear();
        self.alias.reserve(num_topics);
        self.space.clear();
        self.used = 0;
        self.mass = 0.0;
    }

    fn reset_dist(&mut self, probs: &[f64], space: Option<&[Topic]>, size: usize) {
        let sum: f64 = probs[..size].iter().sum();
        self.mass = check_norm(sum);
        self.used = size;
        self.space.clear();
        if let Some(space) = space {
            self.space.extend_from_slice(&space[..size]);
        }

        // scale so the average slot holds mass 1, then split the slots
        // into under- and over-full and pair them off
        let mut scaled: Vec<f64> = probs[..size]
            .iter()
            .map(|&p| p * size as f64 / sum)
            .collect();
        self.prob.clear();
        self.prob.resize(size, 0.0);
        self.alias.clear();
        self.alias.extend(0..size as u32);

        let mut small = Vec::with_capacity(size);
        let mut large = Vec::with_capacity(size);
        for (i, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }
        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            self.prob[s] = scaled[s];
            self.alias[s] = l as u32;
            scaled[l] = (scaled[l] + scaled[s]) - 1.0;
            if scaled[l] < 1.0 - 1e-15 {
                small.push(l);
            } else {
                large.push(l);
            }
        }
        for i in small.into_iter().chain(large.into_iter()) {
            self.prob[i] = 1.0;
            self.alias[i] = i as u32;
        }
    }

    fn norm(&self) -> f64 {
        self.mass
    }

    fn sample_from<R: Rng>(&self, u: f64, _rng: &mut R) -> Topic {
        let scaled = (u / self.mass) * self.used as f64;
        let slot = (scaled as usize).min(self.used - 1);
        let frac = scaled - slot as f64;
        let bucket = if frac < self.prob[slot] {
            slot
        } else {
            self.alias[slot] as usize
        };
        self.outcome(bucket)
    }
}

/// A complete binary tree of prefix sums (F+ tree): O(size) build,
/// O(log size) point update, O(log size) sample. Used where the
/// distribution is mutated between samples.
#[derive(Debug, Clone)]
pub struct FTree {
    tree: Vec<f64>,
    space: Vec<Topic>,
    leaf_base: usize,
    used: usize,
}

impl FTree {
    pub fn new() -> FTree {
        FTree {
            tree: Vec::new(),
            space: Vec::new(),
            leaf_base: 1,
            used: 0,
        }
    }

    /// Replaces the weight of the i-th slot, keeping internal sums
    /// consistent.
    pub fn update(&mut self, slot: usize, weight: f64) {
        let mut node = self.leaf_base + slot;
        let delta = weight - self.tree[node];
        while node >= 1 {
            self.tree[node] += delta;
            if node == 1 {
                break;
            }
            node /= 2;
        }
    }

    pub fn weight(&self, slot: usize) -> f64 {
        self.tree[self.leaf_base + slot]
    }

    fn outcome(&self, slot: usize) -> Topic {
        if self.space.is_empty() {
            slot as Topic
        } else {
            self.space[slot]
        }
    }
}

impl Default for FTree {
    fn default() -> FTree {
        FTree::new()
    }
}

impl DiscreteSampler for FTree {
    fn reset(&mut self, num_topics: usize) {
        self.tree.clear();
        self.tree.reserve(2 * num_topics.next_power_of_two());
        self.space.clear();
        self.used = 0;
    }

    fn reset_dist(&mut self, probs: &[f64], space: Option<&[Topic]>, size: usize) {
        check_norm(probs[..size].iter().sum());
        self.used = size;
        self.leaf_base = size.next_power_of_two().max(1);
        self.tree.clear();
        self.tree.resize(2 * self.leaf_base, 0.0);
        self.tree[self.leaf_base..self.leaf_base + size].copy_from_slice(&probs[..size]);
        for node in (1..self.leaf_base).rev() {
            self.tree[node] = self.tree[2 * node] + self.tree[2 * node + 1];
        }
        self.space.clear();
        if let Some(space) = space {
            self.space.extend_from_slice(&space[..size]);
        }
    }

    fn norm(&self) -> f64 {
        self.tree[1]
    }

    fn sample_from<R: Rng>(&self, u: f64, _rng: &mut R) -> Topic {
        let mut u = u;
        let mut node = 1;
        while node < self.leaf_base {
            let left = 2 * node;
            if u < self.tree[left] {
                node = left;
            } else {
                u -= self.tree[left];
                node = left + 1;
            }
        }
        let slot = (node - self.leaf_base).min(self.used - 1);
        self.outcome(slot)
    }
}

/// Prefix-sum array over a sparse support: O(support) build,
/// O(log support) sample by binary search. Rebuilt per destination in
/// the word-by-word kernels, so the build cost is what matters.
#[derive(Debug, Clone)]
pub struct CumulativeDist {
    cdf: Vec<f64>,
    space: Vec<Topic>,
    used: usize,
}

impl CumulativeDist {
    pub fn new() -> CumulativeDist {
        CumulativeDist {
            cdf: Vec::new(),
            space: Vec::new(),
            used: 0,
        }
    }

    /// Builds directly from an iterator of (topic, probability) pairs,
    /// skipping the intermediate probability buffer.
    pub fn reset_pairs(&mut self, pairs: impl Iterator<Item = (Topic, f64)>) {
        self.cdf.clear();
        self.space.clear();
        let mut running = 0.0;
        for (k, p) in pairs {
            running += p;
            self.cdf.push(running);
            self.space.push(k);
        }
        self.used = self.cdf.len();
        if self.used > 0 {
            check_norm(running);
        }
    }
}

impl Default for CumulativeDist {
    fn default() -> CumulativeDist {
        CumulativeDist::new()
    }
}

impl DiscreteSampler for CumulativeDist {
    fn reset(&mut self, num_topics: usize) {
        self.cdf.clear();
        self.cdf.reserve(num_topics);
        self.space.clear();
        self.space.reserve(num_topics);
        self.used = 0;
    }

    fn reset_dist(&mut self, probs: &[f64], space: Option<&[Topic]>, size: usize) {
        self.cdf.clear();
        let mut running = 0.0;
        for &p in &probs[..size] {
            running += p;
            self.cdf.push(running);
        }
        check_norm(running);
        self.space.clear();
        if let Some(space) = space {
            self.space.extend_from_slice(&space[..size]);
        }
        self.used = size;
    }

    fn norm(&self) -> f64 {
        if self.used == 0 {
            0.0
        } else {
            self.cdf[self.used - 1]
        }
    }

    fn sample_from<R: Rng>(&self, u: f64, _rng: &mut R) -> Topic {
        let pos = bisection::bisect_right_by(&self.cdf[..self.used], |p| {
            u.partial_cmp(p).unwrap()
        })
        .min(self.used - 1);
        if self.space.is_empty() {
            pos as Topic
        } else {
            self.space[pos]
        }
    }
}

/// Thin wrapper giving the doc-by-doc kernel an alias-style interface
/// backed by a cumulative array, dense over K or over a sparse support.
/// All three of its sub-distributions are rebuilt per token, so a
/// prefix sum beats an alias build.
#[derive(Debug, Clone, Default)]
pub struct FlatDist {
    inner: CumulativeDist,
}

impl FlatDist {
    pub fn new() -> FlatDist {
        FlatDist {
            inner: CumulativeDist::new(),
        }
    }
}

impl DiscreteSampler for FlatDist {
    fn reset(&mut self, num_topics: usize) {
        self.inner.reset(num_topics);
    }

    fn reset_dist(&mut self, probs: &[f64], space: Option<&[Topic]>, size: usize) {
        self.inner.reset_dist(probs, space, size);
    }

    fn norm(&self) -> f64 {
        self.inner.norm()
    }

    fn sample_from<R: Rng>(&self, u: f64, rng: &mut R) -> Topic {
        self.inner.sample_from(u, rng)
    }
}

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod corpus;
pub mod counts;
pub mod dist;
pub mod gibbs;
pub mod graph;
pub mod lightlda;
pub mod output;
pub mod partition;
pub mod perplexity;
pub mod sparselda;

use crate::gibbs::{CtxPool, Denominators};
use crate::graph::TokenGraph;
use crate::output::ModelMeta;
use crate::perplexity::Perplexity;


/// Which sampling kernel drives an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum, Serialize, Deserialize)]
pub enum LdaAlgorithm {
    #[clap(name = "zensemilda")]
    ZenSemiLda,
    #[clap(name = "zenlda")]
    ZenLda,
    #[clap(name = "lightlda")]
    LightLda,
    #[clap(name = "sparselda")]
    SparseLda,
}

/// Accelerator behind the per-term distribution of the word-by-word
/// kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum, Serialize, Deserialize)]
pub enum AccelMethod {
    #[clap(name = "alias")]
    Alias,
    #[clap(name = "ftree")]
    FTree,
    #[clap(name = "hybrid")]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum, Serialize, Deserialize)]
pub enum InputFormat {
    #[clap(name = "raw")]
    Raw,
    #[clap(name = "bow")]
    Bow,
    #[clap(name = "semi")]
    Semi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum, Serialize, Deserialize)]
pub enum PartStrategy {
    #[clap(name = "byterm")]
    ByTerm,
    #[clap(name = "bydoc")]
    ByDoc,
    #[clap(name = "edge2d")]
    Edge2D,
    #[clap(name = "dbh")]
    Dbh,
    #[clap(name = "vsdlp")]
    Vsdlp,
    #[clap(name = "bbr")]
    Bbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum, Serialize, Deserialize)]
pub enum InitStrategy {
    #[clap(name = "random")]
    Random,
    #[clap(name = "sparse")]
    Sparse,
    #[clap(name = "split")]
    Split,
}

/// Full run configuration. The CLI builds one of these; loading it
/// from JSON works too since every field deserializes.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub num_topics: usize,
    pub alpha: f64,
    pub beta: f64,
    pub alpha_as: f64,
    pub total_iter: usize,
    pub num_partitions: usize,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub sample_rate: f64,
    pub num_threads: usize,
    pub input_format: InputFormat,
    pub input_semi_rate: f64,
    pub algorithm: LdaAlgorithm,
    pub accel_method: AccelMethod,
    pub storage_level: String,
    pub part_strategy: PartStrategy,
    pub partition_iters: usize,
    pub init_strategy: InitStrategy,
    pub chkpt_interval: usize,
    pub chkpt_dir: Option<PathBuf>,
    pub calc_perplexity: bool,
    pub save_interval: usize,
    pub save_transposed: bool,
    pub save_as_solid: bool,
    pub ignore_doc_id: bool,
    pub num_classes: usize,
    pub use_kryo: bool,
    pub seed: u64,
    pub task_deadline_secs: u64,
}

impl Config {
    /// Rejects configurations that cannot start: non-positive
    /// hyperparameters or counts, rates outside their ranges, a split
    /// init without classes.
    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.num_topics == 0 {
            return Err("numTopics must be positive".into());
        }
        if self.alpha <= 0.0 || self.beta <= 0.0 || self.alpha_as <= 0.0 {
            return Err("alpha, beta and alphaAS must all be positive".into());
        }
        if self.total_iter == 0 {
            return Err("totalIter must be positive".into());
        }
        if self.num_partitions == 0 {
            return Err("numPartitions must be positive".into());
        }
        if self.num_threads == 0 {
            return Err("numThreads must be positive".into());
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err("sampleRate must lie in (0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.input_semi_rate) {
            return Err("inputSemiRate must lie in [0, 1]".into());
        }
        if self.init_strategy == InitStrategy::Split && self.num_classes == 0 {
            return Err("numClasses must be positive for the split init".into());
        }
        if self.task_deadline_secs == 0 {
            return Err("taskDeadlineSecs must be positive".into());
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn test_default() -> Config {
        Config {
            num_topics: 4,
            alpha: 0.1,
            beta: 0.01,
            alpha_as: 0.1,
            total_iter: 1,
            num_partitions: 1,
            input_path: PathBuf::from("corpus.txt"),
            output_path: PathBuf::from("model-out"),
            sample_rate: 1.0,
            num_threads: 1,
            input_format: InputFormat::Bow,
            input_semi_rate: 0.5,
            algorithm: LdaAlgorithm::ZenLda,
            accel_method: AccelMethod::Alias,
            storage_level: "MEMORY_AND_DISK".to_string(),
            part_strategy: PartStrategy::ByTerm,
            partition_iters: 2,
            init_strategy: InitStrategy::Random,
            chkpt_interval: 0,
            chkpt_dir: None,
            calc_perplexity: false,
            save_interval: 0,
            save_transposed: false,
            save_as_solid: false,
            ignore_doc_id: false,
            num_classes: 1,
            use_kryo: false,
            seed: 42,
            task_deadline_secs: 3600,
        }
    }
}

/// A trained model: the graph holding term/doc counters and
/// assignments, the header, and the last perplexity if it was
/// evaluated.
pub struct TrainedModel {
    pub graph: TokenGraph,
    pub meta: ModelMeta,
    pub vocab: Option<Vec<String>>,
    pub perplexity: Option<Perplexity>,
}

/// Trains the model: corpus (or checkpoint) -> partitioned token graph
/// -> `total_iter` rounds of sample, counter update, and the optional
/// perplexity / save / checkpoint steps.
pub fn train(config: &Config) -> Result<TrainedModel, Box<dyn Error + Send + Sync>> {
    config.validate()?;
    if config.use_kryo {
        warn!("useKryo has no effect in this engine");
    }
    if config.storage_level != "MEMORY_AND_DISK" {
        warn!(
            "storageLevel {} has no effect in this engine",
            config.storage_level
        );
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build()?;
    pool.install(|| train_inner(config))
}

fn train_inner(config: &Config) -> Result<TrainedModel, Box<dyn Error + Send + Sync>> {
    let restart = config
        .chkpt_dir
        .as_ref()
        .filter(|dir| dir.join("current").is_dir());
    let (parts, vocab) = match restart {
        Some(dir) => {
            info!("restarting from checkpoint at {}", dir.display());
            (output::restore_checkpoint(dir, config.num_topics)?, None)
        }
        None => {
            let corpus = corpus::load_corpus(config)?;
            info!(
                "loaded corpus: {} docs, {} terms, {} tokens",
                corpus.num_docs, corpus.num_terms, corpus.num_tokens
            );
            let parts = partition::partition_edges(
                corpus.edges,
                config.part_strategy,
                config.num_partitions,
                config.seed,
                config.partition_iters,
            );
            (parts, corpus.vocab)
        }
    };

    let mut graph = TokenGraph::from_partitioned_edges(parts, config.num_topics);
    aggregate::update_counters(&mut graph, false);
    let mut n_k = graph.global_counters();
    debug_assert_eq!(n_k.sum(), graph.num_tokens);

    let ctx_pool = CtxPool::new(config.num_threads, config.num_topics);
    let mut last_perplexity = None;

    for iter in 1..=config.total_iter {
        let started = Instant::now();
        graph.attach_vertex_attrs();
        let den = Denominators::compute(&n_k, graph.num_tokens, config);
        sample_once(&mut graph, &den, &n_k, &ctx_pool, config, iter)?;

        aggregate::update_counters(&mut graph, false);
        n_k = graph.global_counters();
        debug_assert_eq!(n_k.sum(), graph.num_tokens);

        if config.calc_perplexity {
            graph.attach_vertex_attrs();
            let den = Denominators::compute(&n_k, graph.num_tokens, config);
            let perp = perplexity::evaluate(&graph, &den, config);
            info!(
                "iter {}: perplexity {:.3} (word {:.3}, doc {:.3})",
                iter, perp.joint, perp.word, perp.doc
            );
            last_perplexity = Some(perp);
            graph.shed_vertex_attrs();
        }

        if config.save_interval > 0 && iter % config.save_interval == 0 && iter < config.total_iter
        {
            let dir = config.output_path.join(format!("iter-{:04}", iter));
            let meta = model_meta(&graph, config, iter);
            output::save_model(&graph, config, &meta, &dir)?;
            info!("iter {}: saved interim model to {}", iter, dir.display());
        }

        if config.chkpt_interval > 0 && iter % config.chkpt_interval == 0 {
            if let Some(dir) = &config.chkpt_dir {
                output::save_checkpoint(&graph, dir)?;
                info!("iter {}: checkpointed to {}", iter, dir.display());
            }
        }

        info!(
            "iter {} of {} finished in {:.2}s",
            iter,
            config.total_iter,
            started.elapsed().as_secs_f64()
        );
    }

    let meta = model_meta(&graph, config, config.total_iter);
    Ok(TrainedModel {
        graph,
        meta,
        vocab,
        perplexity: last_perplexity,
    })
}

/// One sampling pass over every edge partition, dispatched by
/// algorithm. The deadline is shared by all partition tasks.
fn sample_once(
    graph: &mut TokenGraph,
    den: &Denominators,
    n_k: &Array1<u64>,
    ctx_pool: &CtxPool,
    config: &Config,
    iter: usize,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let deadline = Instant::now() + Duration::from_secs(config.task_deadline_secs);
    let num_parts = graph.edge_parts.len();

    let result: Result<(), String> = match config.algorithm {
        LdaAlgorithm::ZenLda | LdaAlgorithm::ZenSemiLda => {
            let skip_virtual = config.algorithm == LdaAlgorithm::ZenSemiLda;
            graph
                .edge_parts
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(pid, part)| {
                    gibbs::sample_partition_word(
                        part,
                        pid,
                        num_parts,
                        iter,
                        den,
                        ctx_pool,
                        config,
                        deadline,
                        skip_virtual,
                    )
                })
        }
        LdaAlgorithm::SparseLda => graph
            .edge_parts
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(pid, part)| {
                sparselda::sample_partition_doc(
                    part, pid, num_parts, iter, den, ctx_pool, config, deadline,
                )
            }),
        LdaAlgorithm::LightLda => {
            let shared: Vec<AtomicU64> = n_k.iter().map(|&c| AtomicU64::new(c)).collect();
            let outcome = graph
                .edge_parts
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(pid, part)| {
                    lightlda::sample_partition_light(
                        part, pid, num_parts, iter, den, &shared, ctx_pool, config, deadline,
                    )
                });
            debug_assert_eq!(
                shared
                    .iter()
                    .map(|a| a.load(Ordering::Relaxed))
                    .sum::<u64>(),
                graph.num_tokens
            );
            outcome
        }
    };
    result.map_err(|e| e.into())
}

fn model_meta(graph: &TokenGraph, config: &Config, iterations: usize) -> ModelMeta {
    let mut num_terms = 0;
    let mut num_docs = 0;
    for part in &graph.vertex_parts {
        for &vid in &part.ids {
            if graph::is_term_id(vid) {
                if !graph::is_virtual_term_id(vid) {
                    num_terms += 1;
                }
            } else {
                num_docs += 1;
            }
        }
    }
    ModelMeta {
        num_topics: config.num_topics,
        alpha: config.alpha,
        beta: config.beta,
        alpha_as: config.alpha_as,
        num_terms,
        num_docs,
        num_tokens: graph.num_tokens,
        iterations,
    }
}

/// Trains and writes the final model artifacts to the output path.
pub fn run(config: &Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let model = train(config)?;
    output::save_model(&model.graph, config, &model.meta, &config.output_path)?;
    if let Some(vocab) = &model.vocab {
        output::save_vocab(vocab, &config.output_path)?;
    }
    info!("model written to {}", config.output_path.display());
    Ok(())
}

use std::path::PathBuf;
use std::process;

use clap::Parser;

use gibbs_lda::{AccelMethod, Config, InitStrategy, InputFormat, LdaAlgorithm, PartStrategy};

/// Distributed-style collapsed Gibbs sampler for LDA topic models.
#[derive(Parser, Debug)]
#[clap(name = "gibbs_lda", version)]
struct Cli {
    /// Number of topics K
    #[clap(long)]
    num_topics: usize,

    /// Document-topic prior concentration
    #[clap(long)]
    alpha: f64,

    /// Term-topic prior concentration
    #[clap(long)]
    beta: f64,

    /// Asymmetric-prior hyperparameter
    #[clap(long)]
    alpha_as: f64,

    /// Gibbs iterations to run
    #[clap(long)]
    total_iter: usize,

    /// Edge partitions (and the parallel grain of a run)
    #[clap(long)]
    num_partitions: usize,

    /// Corpus file or directory
    #[clap(long)]
    input_path: PathBuf,

    /// Output directory for the trained model (must not exist)
    #[clap(long)]
    output_path: PathBuf,

    /// Fraction of tokens resampled per iteration
    #[clap(long, default_value_t = 1.0)]
    sample_rate: f64,

    /// Sampler threads per process
    #[clap(long, default_value_t = 1)]
    num_threads: usize,

    #[clap(long, arg_enum, default_value = "bow")]
    input_format: InputFormat,

    /// Survival probability of repeated term occurrences in semi input
    #[clap(long, default_value_t = 0.5)]
    input_semi_rate: f64,

    #[clap(long = "lda-algorithm", arg_enum, default_value = "zenlda")]
    algorithm: LdaAlgorithm,

    #[clap(long, arg_enum, default_value = "alias")]
    accel_method: AccelMethod,

    /// Accepted for compatibility; this engine keeps everything in memory
    #[clap(long, default_value = "MEMORY_AND_DISK")]
    storage_level: String,

    #[clap(long, arg_enum, default_value = "byterm")]
    part_strategy: PartStrategy,

    /// Refinement rounds of the label-propagation partitioner
    #[clap(long, default_value_t = 2)]
    partition_iters: usize,

    #[clap(long, arg_enum, default_value = "random")]
    init_strategy: InitStrategy,

    /// Checkpoint every N iterations (0 disables)
    #[clap(long, default_value_t = 0)]
    chkpt_interval: usize,

    /// Directory for checkpoints (also consulted on restart)
    #[clap(long)]
    chkpt_dir: Option<PathBuf>,

    /// Evaluate and log perplexity each iteration
    #[clap(long)]
    calc_perplexity: bool,

    /// Save an interim model every N iterations (0 disables)
    #[clap(long, default_value_t = 0)]
    save_interval: usize,

    /// Write the term-topic matrix topic-major
    #[clap(long)]
    save_transposed: bool,

    /// Coalesce each artifact into a single file
    #[clap(long)]
    save_as_solid: bool,

    /// Number documents by position instead of a leading id token
    #[clap(long)]
    ignore_doc_id: bool,

    /// Label classes for the split init strategy
    #[clap(long, default_value_t = 1)]
    num_classes: usize,

    /// Accepted for compatibility; serialization is not configurable here
    #[clap(long)]
    use_kryo: bool,

    /// Seed for every random choice of the run
    #[clap(long, default_value_t = 42)]
    seed: u64,

    /// Watchdog deadline for one partition task, in seconds
    #[clap(long, default_value_t = 3600)]
    task_deadline_secs: u64,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            num_topics: self.num_topics,
            alpha: self.alpha,
            beta: self.beta,
            alpha_as: self.alpha_as,
            total_iter: self.total_iter,
            num_partitions: self.num_partitions,
            input_path: self.input_path,
            output_path: self.output_path,
            sample_rate: self.sample_rate,
            num_threads: self.num_threads,
            input_format: self.input_format,
            input_semi_rate: self.input_semi_rate,
            algorithm: self.algorithm,
            accel_method: self.accel_method,
            storage_level: self.storage_level,
            part_strategy: self.part_strategy,
            partition_iters: self.partition_iters,
            init_strategy: self.init_strategy,
            chkpt_interval: self.chkpt_interval,
            chkpt_dir: self.chkpt_dir,
            calc_perplexity: self.calc_perplexity,
            save_interval: self.save_interval,
            save_transposed: self.save_transposed,
            save_as_solid: self.save_as_solid,
            ignore_doc_id: self.ignore_doc_id,
            num_classes: self.num_classes,
            use_kryo: self.use_kryo,
            seed: self.seed,
            task_deadline_secs: self.task_deadline_secs,
        }
    }
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = match err.kind() {
                clap::ErrorKind::DisplayHelp | clap::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            process::exit(code);
        }
    };

    let config = cli.into_config();
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {}", err);
        process::exit(1);
    }
    if config.output_path.exists() {
        eprintln!(
            "output path {} already exists",
            config.output_path.display()
        );
        process::exit(2);
    }

    if let Err(err) = gibbs_lda::run(&config) {
        eprintln!("run failed: {}", err);
        process::exit(1);
    }
}

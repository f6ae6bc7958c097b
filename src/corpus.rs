use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::counts::Topic;
use crate::graph::{doc_vertex, term_vertex, virtual_term_vertex, Edge};
use crate::{Config, InitStrategy, InputFormat};

/// A parsed corpus: one edge per (term, doc) pair with per-occurrence
/// initial topic assignments already drawn.
///
/// Fields:
/// edges: the token graph edges, not yet partitioned
/// num_terms: distinct term indices seen (virtual copies not counted)
/// num_docs: documents parsed
/// num_tokens: total token occurrences, virtual ones included
/// vocab: term index -> word, present only for the raw format
pub struct Corpus {
    pub edges: Vec<Edge>,
    pub num_terms: u64,
    pub num_docs: u64,
    pub num_tokens: u64,
    pub vocab: Option<Vec<String>>,
}

/// Reads and tokenizes the corpus at `config.input_path`, drawing the
/// initial topic assignment for every token occurrence.
///
/// A directory input is read file by file in name order. Each line is
/// one document; unless `ignore_doc_id` is set, the first token must
/// be the numeric document id.
pub fn load_corpus(config: &Config) -> Result<Corpus, Box<dyn Error + Send + Sync>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut init = TopicInit::new(config);
    let mut vocab_ids: HashMap<String, u64> = HashMap::new();
    let mut vocab: Vec<String> = Vec::new();
    let mut edges = Vec::new();
    let mut num_tokens = 0u64;
    let mut max_term = 0u64;
    let mut num_docs = 0u64;

    for path in input_files(Path::new(&config.input_path))? {
        let reader = BufReader::new(fs::File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let mut tokens = line.split_whitespace().peekable();
            if tokens.peek().is_none() {
                continue;
            }

            let doc = if config.ignore_doc_id {
                num_docs
            } else {
                let raw = tokens.next().unwrap();
                raw.parse::<u64>().map_err(|_| {
                    format!(
                        "{}:{}: document id '{}' is not numeric (use --ignore-doc-id for id-less corpora)",
                        path.display(),
                        line_no + 1,
                        raw
                    )
                })?
            };
            num_docs += 1;

            // multiplicity per term within this document
            let mut term_occurrences: HashMap<u64, u32> = HashMap::new();
            for token in tokens {
                let term = match config.input_format {
                    InputFormat::Raw => *vocab_ids.entry(token.to_string()).or_insert_with(|| {
                        vocab.push(token.to_string());
                        (vocab.len() - 1) as u64
                    }),
                    InputFormat::Bow | InputFormat::Semi => {
                        token.parse::<u64>().map_err(|_| {
                            format!(
                                "{}:{}: term id '{}' is not numeric",
                                path.display(),
                                line_no + 1,
                                token
                            )
                        })?
                    }
                };
                max_term = max_term.max(term);
                *term_occurrences.entry(term).or_insert(0) += 1;
            }

            let mut terms: Vec<(u64, u32)> = term_occurrences.into_iter().collect();
            terms.sort_unstable();
            init.start_doc(doc, &mut rng);
            for (term, count) in terms {
                let (real, virt) = match config.input_format {
                    InputFormat::Semi => {
                        // the first occurrence stays on the real term;
                        // repeats survive at the semi sampling rate and
                        // attach to the term's virtual copy
                        let mut kept = 0;
                        for _ in 1..count {
                            if rng.gen::<f64>() < config.input_semi_rate {
                                kept += 1;
                            }
                        }
                        (1, kept)
                    }
                    _ => (count, 0),
                };
                if real > 0 {
                    let topics: Vec<Topic> = (0..real).map(|_| init.draw(&mut rng)).collect();
                    num_tokens += topics.len() as u64;
                    edges.push(Edge {
                        src: term_vertex(term),
                        dst: doc_vertex(doc),
                        topics,
                    });
                }
                if virt > 0 {
                    let topics: Vec<Topic> = (0..virt).map(|_| init.draw(&mut rng)).collect();
                    num_tokens += topics.len() as u64;
                    edges.push(Edge {
                        src: virtual_term_vertex(term),
                        dst: doc_vertex(doc),
                        topics,
                    });
                }
            }
        }
    }

    let num_terms = if vocab.is_empty() {
        if edges.is_empty() {
            0
        } else {
            max_term + 1
        }
    } else {
        vocab.len() as u64
    };
    Ok(Corpus {
        edges,
        num_terms,
        num_docs,
        num_tokens,
        vocab: if vocab.is_empty() { None } else { Some(vocab) },
    })
}

fn input_files(path: &Path) -> Result<Vec<PathBuf>, Box<dyn Error + Send + Sync>> {
    if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(format!("input directory {} is empty", path.display()).into());
        }
        Ok(files)
    } else if path.is_file() {
        Ok(vec![path.to_path_buf()])
    } else {
        Err(format!("input path {} does not exist", path.display()).into())
    }
}

/// Draws initial topic assignments according to the configured
/// strategy.
struct TopicInit {
    strategy: InitStrategy,
    num_topics: usize,
    num_classes: usize,
    // Random: unused. Sparse: the current doc's topic subset.
    // Split: the current doc's topic block.
    doc_support: Vec<Topic>,
    block: (Topic, Topic),
}

impl TopicInit {
    fn new(config: &Config) -> TopicInit {
        TopicInit {
            strategy: config.init_strategy,
            num_topics: config.num_topics,
            num_classes: config.num_classes.max(1),
            doc_support: Vec::new(),
            block: (0, 0),
        }
    }

    fn start_doc(&mut self, doc: u64, rng: &mut StdRng) {
        match self.strategy {
            InitStrategy::Random => {}
            InitStrategy::Sparse => {
                // every doc starts on a small random subset of topics
                let support = (self.num_topics as f64).sqrt().ceil() as usize;
                let mut all: Vec<Topic> = (0..self.num_topics as Topic).collect();
                all.shuffle(rng);
                all.truncate(support.max(1));
                self.doc_support = all;
            }
            InitStrategy::Split => {
                let classes = self.num_classes.min(self.num_topics);
                let class = (doc % classes as u64) as usize;
                let width = self.num_topics / classes;
                let lo = (class * width) as Topic;
                let hi = if class == classes - 1 {
                    self.num_topics as Topic
                } else {
                    lo + width as Topic
                };
                self.block = (lo, hi);
            }
        }
    }

    fn draw(&self, rng: &mut StdRng) -> Topic {
        match self.strategy {
            InitStrategy::Random => rng.gen_range(0..self.num_topics as Topic),
            InitStrategy::Sparse => *self.doc_support.choose(rng).unwrap(),
            InitStrategy::Split => rng.gen_range(self.block.0..self.block.1),
        }
    }
}

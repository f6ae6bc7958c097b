use std::error::Error;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::counts::TopicCount;
use crate::graph::{is_term_id, is_virtual_term_id, term_index, Edge, TokenGraph};
use crate::Config;

/// Model header written next to the saved counters.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelMeta {
    pub num_topics: usize,
    pub alpha: f64,
    pub beta: f64,
    pub alpha_as: f64,
    pub num_terms: u64,
    pub num_docs: u64,
    pub num_tokens: u64,
    pub iterations: usize,
}

/// Writes the two model artifacts under `dir`: the term-topic counts
/// (optionally transposed to topic-major rows) and the doc-topic
/// assignments, either one file per vertex partition or a single
/// "solid" file. Rows are tab-separated records, one vertex per line,
/// with a `topic:count` field per nonzero topic. Virtual term copies
/// are an input-expansion artifact and are not part of the model.
pub fn save_model(
    graph: &TokenGraph,
    config: &Config,
    meta: &ModelMeta,
    dir: &Path,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(dir)?;

    write_artifact(dir, "term_topic", config.save_as_solid, graph, |part_id, out| {
        if config.save_transposed {
            // topic-major rows built from this partition's share
            let mut by_topic: Vec<Vec<(u64, u32)>> = vec![Vec::new(); config.num_topics];
            for (term, tc) in term_rows(&graph.vertex_parts[part_id]) {
                tc.for_each(|k, c| by_topic[k as usize].push((term, c)));
            }
            for (k, row) in by_topic.iter().enumerate() {
                if row.is_empty() {
                    continue;
                }
                let mut record = csv::ByteRecord::new();
                record.push_field(k.to_string().as_bytes());
                for (term, c) in row {
                    record.push_field(format!("{}:{}", term, c).as_bytes());
                }
                out.write_byte_record(&record)?;
            }
        } else {
            for (term, tc) in term_rows(&graph.vertex_parts[part_id]) {
                out.write_byte_record(&counter_record(term, tc))?;
            }
        }
        Ok(())
    })?;

    write_artifact(dir, "doc_topic", config.save_as_solid, graph, |part_id, out| {
        for (doc, tc) in doc_rows(&graph.vertex_parts[part_id]) {
            out.write_byte_record(&counter_record(doc, tc))?;
        }
        Ok(())
    })?;

    let meta_file = fs::File::create(dir.join("model.json"))?;
    serde_json::to_writer_pretty(BufWriter::new(meta_file), meta)?;
    Ok(())
}

/// Tab-separated writer over variable-length rows.
fn row_writer(path: PathBuf) -> Result<csv::Writer<fs::File>, csv::Error> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
}

fn counter_record(id: u64, tc: &TopicCount) -> csv::ByteRecord {
    let mut record = csv::ByteRecord::new();
    record.push_field(id.to_string().as_bytes());
    tc.for_each(|k, c| {
        record.push_field(format!("{}:{}", k, c).as_bytes());
    });
    record
}

fn term_rows(part: &crate::graph::VertexPartition) -> Vec<(u64, &TopicCount)> {
    let mut rows: Vec<(u64, &TopicCount)> = part
        .ids
        .iter()
        .zip(part.values.iter())
        .filter(|(&vid, _)| is_term_id(vid) && !is_virtual_term_id(vid))
        .map(|(&vid, tc)| (term_index(vid), tc))
        .collect();
    rows.sort_by_key(|(term, _)| *term);
    rows
}

fn doc_rows(part: &crate::graph::VertexPartition) -> Vec<(u64, &TopicCount)> {
    let mut rows: Vec<(u64, &TopicCount)> = part
        .ids
        .iter()
        .zip(part.values.iter())
        .filter(|(&vid, _)| !is_term_id(vid))
        .map(|(&vid, tc)| (vid, tc))
        .collect();
    rows.sort_by_key(|(doc, _)| *doc);
    rows
}

/// Writes the term-index to word mapping produced by the raw input
/// format.
pub fn save_vocab(vocab: &[String], dir: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(dir)?;
    let mut out = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(dir.join("vocab.txt"))?;
    for (term, word) in vocab.iter().enumerate() {
        out.write_record([term.to_string().as_str(), word])?;
    }
    out.flush()?;
    Ok(())
}

fn write_artifact(
    dir: &Path,
    name: &str,
    solid: bool,
    graph: &TokenGraph,
    mut write_part: impl FnMut(usize, &mut csv::Writer<fs::File>) -> Result<(), Box<dyn Error + Send + Sync>>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if solid {
        let mut out = row_writer(dir.join(format!("{}.txt", name)))?;
        for part_id in 0..graph.vertex_parts.len() {
            write_part(part_id, &mut out)?;
        }
        out.flush()?;
    } else {
        let subdir = dir.join(name);
        fs::create_dir_all(&subdir)?;
        for part_id in 0..graph.vertex_parts.len() {
            let mut out = row_writer(subdir.join(format!("part-{:05}", part_id)))?;
            write_part(part_id, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct CheckpointPart {
    edges: Vec<Edge>,
}

/// Writes the full edge state (assignments included) into a fresh tmp
/// directory, then atomically swings `current` over to it. A crash
/// mid-write leaves the previous checkpoint in place.
pub fn save_checkpoint(graph: &TokenGraph, chkpt_dir: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    let tmp = chkpt_dir.join("tmp");
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;
    for (pid, part) in graph.edge_parts.iter().enumerate() {
        let file = fs::File::create(tmp.join(format!("part-{:05}.json", pid)))?;
        let snapshot = CheckpointPart {
            edges: part.to_edges(),
        };
        serde_json::to_writer(BufWriter::new(file), &snapshot)?;
    }

    let current = chkpt_dir.join("current");
    if current.exists() {
        fs::remove_dir_all(&current)?;
    }
    fs::rename(&tmp, &current)?;
    Ok(())
}

/// Reads back the last committed checkpoint, validating every stored
/// assignment against the topic range.
pub fn restore_checkpoint(
    chkpt_dir: &Path,
    num_topics: usize,
) -> Result<Vec<Vec<Edge>>, Box<dyn Error + Send + Sync>> {
    let current = chkpt_dir.join("current");
    let mut files: Vec<PathBuf> = fs::read_dir(&current)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    files.sort();

    let mut parts = Vec::with_capacity(files.len());
    for file in files {
        let snapshot: CheckpointPart = serde_json::from_reader(fs::File::open(&file)?)?;
        for edge in &snapshot.edges {
            if edge.topics.is_empty() {
                return Err(format!("{}: empty occurrence array", file.display()).into());
            }
            for &t in &edge.topics {
                if t as usize >= num_topics {
                    return Err(format!(
                        "{}: topic assignment {} outside [0, {})",
                        file.display(),
                        t,
                        num_topics
                    )
                    .into());
                }
            }
        }
        parts.push(snapshot.edges);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{doc_vertex, term_vertex};

    fn set_up_graph() -> TokenGraph {
        let edges = vec![
            Edge {
                src: term_vertex(0),
                dst: doc_vertex(0),
                topics: vec![0, 1],
            },
            Edge {
                src: term_vertex(3),
                dst: doc_vertex(1),
                topics: vec![1],
            },
        ];
        let mut graph = TokenGraph::from_partitioned_edges(vec![edges], 2);
        crate::aggregate::update_counters(&mut graph, false);
        graph
    }

    #[test]
    fn test_save_and_reload_checkpoint() {
        let graph = set_up_graph();
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&graph, dir.path()).unwrap();
        let parts = restore_checkpoint(dir.path(), 2).unwrap();
        assert_eq!(parts.len(), 1);
        let tokens: usize = parts[0].iter().map(|e| e.topics.len()).sum();
        assert_eq!(tokens, 3);

        // a second save replaces the first atomically
        save_checkpoint(&graph, dir.path()).unwrap();
        assert!(dir.path().join("current").exists());
        assert!(!dir.path().join("tmp").exists());
    }

    #[test]
    fn test_restore_rejects_out_of_range_topics() {
        let graph = set_up_graph();
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&graph, dir.path()).unwrap();
        assert!(restore_checkpoint(dir.path(), 1).is_err());
    }

    #[test]
    fn test_save_model_writes_artifacts() {
        let graph = set_up_graph();
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::test_default();
        config.num_topics = 2;
        let meta = ModelMeta {
            num_topics: 2,
            alpha: config.alpha,
            beta: config.beta,
            alpha_as: config.alpha_as,
            num_terms: 4,
            num_docs: 2,
            num_tokens: 3,
            iterations: 0,
        };
        save_model(&graph, &config, &meta, dir.path()).unwrap();
        assert!(dir.path().join("term_topic").join("part-00000").exists());
        assert!(dir.path().join("doc_topic").join("part-00000").exists());
        assert!(dir.path().join("model.json").exists());

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .has_headers(false)
            .from_path(dir.path().join("term_topic").join("part-00000"))
            .unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(row.len() >= 2);
            row[0].parse::<u64>().unwrap();
            assert!(row[1].contains(':'));
        }

        config.save_as_solid = true;
        config.save_transposed = true;
        save_model(&graph, &config, &meta, dir.path()).unwrap();
        assert!(dir.path().join("term_topic.txt").exists());
    }
}

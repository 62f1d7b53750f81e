//! Run log and output artefacts.
//!
//! Everything here is post-hoc telemetry: CSV dumps of the placement, the
//! hardware graph and its loading, integrity reports, and the INI-style run
//! metadata. None of it participates in the annealing contract; the write
//! points are fixed so downstream plotting scripts can rely on them.

use crate::problem::Problem;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Timestamp format used in the run log and metadata: `%FT%T%z`.
#[inline]
pub fn timestamp() -> String {
    Utc::now().format("%FT%T%z").to_string()
}

// ============================================================================
// Run log
// ============================================================================

/// Timestamped textual log, mirrored to stdout and a file.
///
/// Disabled instances swallow writes, so callers can log unconditionally.
pub struct RunLog {
    sink: Mutex<Option<File>>,
}

impl RunLog {
    /// A log that discards everything.
    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Opens (appends to) a log file at `path`.
    ///
    /// # Errors
    /// Fails if the file cannot be opened for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            sink: Mutex::new(Some(file)),
        })
    }

    /// Writes one timestamped line to stdout and the log file, flushing the
    /// file. Thread safe. Does nothing when the log is disabled.
    pub fn write(&self, message: &str) {
        let mut sink = self.sink.lock();
        let Some(file) = sink.as_mut() else {
            return;
        };
        let line = format!("[{}] {message}", timestamp());
        println!("{line}");
        let _ = writeln!(file, "{line}");
        let _ = file.flush();
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Writes the INI-style run metadata file: annealer kind, disorder kind,
/// crate revision, timestamp, and (for parallel runs) the worker count.
///
/// # Errors
/// Fails on I/O errors creating or writing the file.
pub fn write_metadata(
    out_dir: &Path,
    annealer_kind: &str,
    disorder_kind: &str,
    num_workers: Option<usize>,
) -> Result<()> {
    let path = out_dir.join("metadata.txt");
    let mut out = BufWriter::new(
        File::create(&path).with_context(|| format!("creating {}", path.display()))?,
    );
    writeln!(out, "[anneal]")?;
    writeln!(out, "annealerType = {annealer_kind}")?;
    writeln!(out, "disorderType = {disorder_kind}")?;
    writeln!(out, "revision = {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "now = {}", timestamp())?;
    if let Some(workers) = num_workers {
        writeln!(out, "threadCount = {workers}")?;
    }
    out.flush().context("flushing metadata")?;
    Ok(())
}

// ============================================================================
// Problem dumps
// ============================================================================

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).with_context(|| {
        format!("creating {}", path.display())
    })?))
}

impl Problem {
    /// Writes one `name,degree` row per application node. Any existing file
    /// is clobbered.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_a_degrees(&self, path: &Path) -> Result<()> {
        self.log(&format!("Writing a degree list to file at '{}'.", path.display()));
        let mut out = create(path)?;
        writeln!(out, "Application node name,Degree")?;
        for node_a in &self.node_as {
            writeln!(out, "{},{}", node_a.name, node_a.neighbours.len())?;
        }
        Ok(())
    }

    /// Writes the application graph as seen by the hardware graph: one
    /// `fromHw,toHw,count` row per ordered pair of distinct hardware nodes
    /// connected by at least one application edge. Double-counts undirected
    /// application edges, once per direction.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_a_h_graph(&self, path: &Path) -> Result<()> {
        self.log(&format!("Writing a_h graph to file at '{}'.", path.display()));

        let mut edges: BTreeMap<&str, BTreeMap<&str, u64>> = BTreeMap::new();
        for node_a in &self.node_as {
            let from = self.node_hs[node_a.location()].name.as_str();
            for &neighbour in &node_a.neighbours {
                let to = self.node_hs[self.node_as[neighbour].location()].name.as_str();
                if from == to {
                    continue;
                }
                *edges.entry(from).or_default().entry(to).or_insert(0) += 1;
            }
        }

        let mut out = create(path)?;
        writeln!(
            out,
            "Hardware node name (first),Hardware node name (second),Loading"
        )?;
        for (from, sub) in &edges {
            for (to, count) in sub {
                writeln!(out, "{from},{to},{count}")?;
            }
        }
        Ok(())
    }

    /// Writes one `appNodeName,hwNodeName` row per application node.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_a_to_h_map(&self, path: &Path) -> Result<()> {
        self.log(&format!("Writing a_to_h map to file at '{}'.", path.display()));
        let mut out = create(path)?;
        writeln!(out, "Application node name,Hardware node name")?;
        for node_a in &self.node_as {
            writeln!(
                out,
                "{},{}",
                node_a.name,
                self.node_hs[node_a.location()].name
            )?;
        }
        Ok(())
    }

    /// Writes the hardware edge list as `fromHw,toHw` rows (no weights).
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_h_graph(&self, path: &Path) -> Result<()> {
        self.log(&format!("Writing h graph to file at '{}'.", path.display()));
        let mut out = create(path)?;
        writeln!(out, "Hardware node name (first),Hardware node name (second)")?;
        for &(from, to, _) in &self.edge_hs {
            writeln!(
                out,
                "{},{}",
                self.node_hs[from].name, self.node_hs[to].name
            )?;
        }
        Ok(())
    }

    /// Writes one `name,posHoriz,posVerti` row per hardware node; the index
    /// is implied by row order, beginning at zero.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_h_nodes(&self, path: &Path) -> Result<()> {
        self.log(&format!(
            "Writing h node information to file at '{}'.",
            path.display()
        ));
        let mut out = create(path)?;
        writeln!(out, "Hardware node name,Horizontal position,Vertical position")?;
        for node_h in &self.node_hs {
            writeln!(out, "{},{},{}", node_h.name, node_h.pos_horiz, node_h.pos_verti)?;
        }
        Ok(())
    }

    /// Writes one `name,load` row per hardware node.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_h_node_loading(&self, path: &Path) -> Result<()> {
        self.log(&format!(
            "Writing h node loading to file at '{}'.",
            path.display()
        ));
        let mut out = create(path)?;
        writeln!(out, "Hardware node name,Number of contained application nodes")?;
        for node_h in &self.node_hs {
            writeln!(out, "{},{}", node_h.name, node_h.load())?;
        }
        Ok(())
    }

    /// Runs the node integrity check and writes the violations to `path`.
    /// The file is created empty when no violations are found.
    ///
    /// # Errors
    /// Fails on I/O errors; integrity violations are reported, not raised.
    pub fn write_node_integrity_errs(&self, path: &Path) -> Result<()> {
        self.log(&format!(
            "Performing node integrity check, writing to file at '{}'.",
            path.display()
        ));
        let mut errors = String::new();
        if self.check_node_integrity(&mut errors) {
            self.log("No integrity errors found.");
        } else {
            self.log("Integrity errors found.");
        }
        std::fs::write(path, errors).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Runs the lock integrity check and writes the violations to `path`.
    /// The file is created empty when every lock is free.
    ///
    /// # Errors
    /// Fails on I/O errors; integrity violations are reported, not raised.
    pub fn write_lock_integrity_errs(&self, path: &Path) -> Result<()> {
        self.log(&format!(
            "Performing lock integrity check, writing to file at '{}'.",
            path.display()
        ));
        let mut errors = String::new();
        if self.check_lock_integrity(&mut errors) {
            self.log("No lock errors found.");
        } else {
            self.log("Lock errors found.");
        }
        std::fs::write(path, errors).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("placer_output_test_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn two_node_problem() -> Problem {
        let mut problem = Problem::new("two");
        problem.p_max = 2;
        problem.add_app_node("a0");
        problem.add_app_node("a1");
        problem.add_app_edge(0, 1);
        problem.add_hw_node_at("h0", 0.0, 0.0);
        problem.add_hw_node_at("h1", 1.0, 0.0);
        problem.add_hw_edge(0, 1, 3.0);
        problem.initialise_edge_cache();
        problem.populate_edge_cache();
        problem.initial_condition_bucket().unwrap();
        problem
    }

    #[test]
    fn a_to_h_map_lists_every_app_node() {
        let dir = scratch_dir("map");
        let problem = two_node_problem();
        let path = dir.join("map.csv");
        problem.write_a_to_h_map(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Application node name,Hardware node name\na0,h0\na1,h0\n"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn a_h_graph_skips_co_located_edges() {
        let dir = scratch_dir("ahgraph");
        let problem = two_node_problem();
        // Both endpoints sit on h0, so no rows are produced.
        let path = dir.join("a_h.csv");
        problem.write_a_h_graph(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Hardware node name (first),Hardware node name (second),Loading\n"
        );

        // Move a1 to h1; the edge now spans hardware and is double-counted.
        problem.transform(1, 1, 0);
        problem.write_a_h_graph(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("h0,h1,1"));
        assert!(text.contains("h1,h0,1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loading_and_degree_dumps_have_expected_rows() {
        let dir = scratch_dir("loading");
        let problem = two_node_problem();
        let loading = dir.join("loading.csv");
        problem.write_h_node_loading(&loading).unwrap();
        let text = std::fs::read_to_string(&loading).unwrap();
        assert!(text.contains("h0,2"));
        assert!(text.contains("h1,0"));

        let degrees = dir.join("degrees.csv");
        problem.write_a_degrees(&degrees).unwrap();
        let text = std::fs::read_to_string(&degrees).unwrap();
        assert!(text.contains("a0,1"));
        assert!(text.contains("a1,1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn integrity_files_are_empty_when_clean() {
        let dir = scratch_dir("integrity");
        let problem = two_node_problem();
        let nodes = dir.join("integrity_nodes.err");
        let locks = dir.join("integrity_locks.err");
        problem.write_node_integrity_errs(&nodes).unwrap();
        problem.write_lock_integrity_errs(&locks).unwrap();
        assert!(std::fs::read_to_string(&nodes).unwrap().is_empty());
        assert!(std::fs::read_to_string(&locks).unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn metadata_is_ini_shaped() {
        let dir = scratch_dir("metadata");
        write_metadata(&dir, "ParallelAnnealer", "ExpDecayDisorder", Some(4)).unwrap();
        let text = std::fs::read_to_string(dir.join("metadata.txt")).unwrap();
        assert!(text.starts_with("[anneal]\n"));
        assert!(text.contains("annealerType = ParallelAnnealer"));
        assert!(text.contains("disorderType = ExpDecayDisorder"));
        assert!(text.contains("threadCount = 4"));
        assert!(text.contains("now = "));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn disabled_log_swallows_writes() {
        let log = RunLog::disabled();
        log.write("nothing to see");
    }

    #[test]
    fn open_log_appends_timestamped_lines() {
        let dir = scratch_dir("runlog");
        let path = dir.join("log.txt");
        let log = RunLog::open(&path).unwrap();
        log.write("first");
        log.write("second");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Single-worker annealing loop.

use crate::disorder::{Disorder, Iteration, Seed};
use crate::output::write_metadata;
use crate::problem::Problem;
use crate::selection::select_serial;
use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

/// SplitMix64 mixer for deriving independent seeds from a base seed.
#[inline]
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Single-worker annealer: select, transform, evaluate, accept or revert.
///
/// With a fixed seed a serial run is fully reproducible.
pub struct SerialAnnealer<D: Disorder> {
    max_iteration: Iteration,
    out_dir: Option<PathBuf>,
    disorder: D,
    rng: SmallRng,
    iteration: Iteration,
}

impl<D: Disorder> SerialAnnealer<D> {
    /// Annealer kind recorded in run metadata.
    pub const HANDLE: &'static str = "SerialAnnealer";

    /// Creates an annealer for `max_iteration` iterations. Output files are
    /// written under `out_dir` when given; `seed` drives both the selection
    /// stream and the acceptance oracle.
    pub fn new(max_iteration: Iteration, out_dir: Option<PathBuf>, seed: Seed) -> Self {
        let base = seed.unwrap_or_else(rand::random);
        Self {
            max_iteration,
            out_dir,
            disorder: D::new(max_iteration, Some(base)),
            rng: SmallRng::seed_from_u64(splitmix64(base)),
            iteration: 0,
        }
    }

    /// Iterations completed so far.
    pub fn iteration(&self) -> Iteration {
        self.iteration
    }

    /// Anneals the problem in place.
    ///
    /// Runs the full iteration budget: per iteration one node is selected,
    /// moved, the fitness delta is computed incrementally, and the move is
    /// kept or inverted according to the disorder schedule.
    ///
    /// # Errors
    /// Fails only on output I/O; the annealing itself cannot fail.
    pub fn anneal(&mut self, problem: &mut Problem) -> Result<()> {
        // When an output directory is configured, two files are produced
        // here: a CSV describing each annealing operation, and a text file
        // holding the wallclock runtime in seconds.
        let mut csv_out = match &self.out_dir {
            Some(dir) => {
                let path = dir.join("anneal_ops.csv");
                let mut out = BufWriter::new(
                    File::create(&path).with_context(|| format!("creating {}", path.display()))?,
                );
                writeln!(
                    out,
                    "Iteration,\
                     Selected application node index,\
                     Selected hardware node index,\
                     Number of selection collisions,\
                     Transformed Fitness,\
                     Transformed Clustering Fitness,\
                     Transformed Locality Fitness,\
                     Determination"
                )?;
                write_metadata(dir, Self::HANDLE, D::HANDLE, None)?;
                Some(out)
            }
            None => None,
        };

        // Base fitness "used" from the start of each iteration.
        let mut old_clustering = problem.compute_total_clustering_fitness();
        let mut old_locality = problem.compute_total_locality_fitness();
        let mut old_fitness = old_clustering + old_locality;

        // Baseline row deploying the initial fitness.
        if let Some(out) = csv_out.as_mut() {
            writeln!(
                out,
                "-1,-1,-1,0,{old_fitness},{old_clustering},{old_locality},1"
            )?;
        }

        let time_at_start = Instant::now();
        while self.iteration != self.max_iteration {
            self.iteration += 1;

            let s = select_serial(problem, &mut self.rng);

            // Fitness of components before transformation.
            let old_clustering_components = problem.compute_hw_node_clustering_fitness(s.sel_h)
                + problem.compute_hw_node_clustering_fitness(s.old_h);
            let old_locality_components =
                2.0 * problem.compute_app_node_locality_fitness(s.sel_a);

            problem.transform(s.sel_a, s.sel_h, s.old_h);

            // Fitness of components after transformation.
            let new_clustering_components = problem.compute_hw_node_clustering_fitness(s.sel_h)
                + problem.compute_hw_node_clustering_fitness(s.old_h);
            let new_locality_components =
                2.0 * problem.compute_app_node_locality_fitness(s.sel_a);

            let new_clustering =
                old_clustering - old_clustering_components + new_clustering_components;
            let new_locality = old_locality - old_locality_components + new_locality_components;
            let new_fitness = new_locality + new_clustering;

            let determined = self
                .disorder
                .determine(old_fitness, new_fitness, self.iteration);

            if determined {
                old_fitness = new_fitness;
                old_clustering = new_clustering;
                old_locality = new_locality;
            } else {
                problem.transform(s.sel_a, s.old_h, s.sel_h);
            }

            if let Some(out) = csv_out.as_mut() {
                writeln!(
                    out,
                    "{},{},{},0,{new_fitness},{new_clustering},{new_locality},{}",
                    self.iteration,
                    s.sel_a,
                    s.sel_h,
                    u8::from(determined)
                )?;
            }
        }

        if let Some(dir) = &self.out_dir {
            let elapsed = time_at_start.elapsed().as_secs();
            let path = dir.join("wallclock.txt");
            std::fs::write(&path, format!("{elapsed}\n"))
                .with_context(|| format!("writing {}", path.display()))?;
            if let Some(out) = csv_out.as_mut() {
                out.flush().context("flushing anneal ops")?;
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

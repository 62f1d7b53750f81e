//! Multi-worker annealing loop.
//!
//! Workers share one placement and one atomic iteration counter. Two
//! synchronisation disciplines are provided:
//!
//! - **Semi-asynchronous**: a worker claims only the application node it is
//!   moving; hardware capacity reads are unlocked and may be stale, so the
//!   locking transform re-checks capacity and the iteration retries selection
//!   when it loses the race. Fitness deltas are computed against snapshots
//!   other workers may be mutating, so each worker's running fitness drifts
//!   from the true global value; the acceptance decision only consumes the
//!   difference between one worker's own pre/post snapshots, which is why
//!   the drift is tolerable.
//! - **Fully-synchronous**: selection returns with every node the iteration
//!   reads or writes already locked, so fitness deltas are exact and no
//!   capacity recheck is needed.
//!
//! When a record interval is configured the anneal runs in rounds: workers
//! are joined, the global fitness is measured serially and appended to a
//! master CSV, and the next round begins.

use crate::disorder::{Disorder, Iteration, Seed};
use crate::nodes::TransformCount;
use crate::output::write_metadata;
use crate::problem::Problem;
use crate::selection::{select_parallel_sasynchronous, select_parallel_synchronous};
use crate::serial::splitmix64;
use anyhow::{Context, Result};
use crossbeam::utils::CachePadded;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-worker mutable state: an independent generator, an independent
/// acceptance oracle, and an operations CSV stream.
struct Worker<D> {
    rng: SmallRng,
    disorder: D,
    csv: Option<BufWriter<File>>,
}

/// Multi-worker annealer over a shared placement.
pub struct ParallelAnnealer<D: Disorder> {
    num_workers: usize,
    max_iteration: Iteration,
    out_dir: Option<PathBuf>,
    base_seed: u64,
    /// Shared iteration counter, padded onto its own cache line so the
    /// per-step `fetch_add` does not false-share with anything else.
    iteration: CachePadded<AtomicU64>,
    _disorder: PhantomData<D>,
}

impl<D: Disorder> ParallelAnnealer<D> {
    /// Annealer kind recorded in run metadata.
    pub const HANDLE: &'static str = "ParallelAnnealer";

    /// Creates an annealer with `num_workers` workers and a budget of
    /// `max_iteration` iterations. Output files are written under `out_dir`
    /// when given. Each worker derives its own generator and oracle seed
    /// from `seed` with a SplitMix64 mixer.
    pub fn new(
        num_workers: usize,
        max_iteration: Iteration,
        out_dir: Option<PathBuf>,
        seed: Seed,
    ) -> Self {
        Self {
            num_workers,
            max_iteration,
            out_dir,
            base_seed: seed.unwrap_or_else(rand::random),
            iteration: CachePadded::new(AtomicU64::new(0)),
            _disorder: PhantomData,
        }
    }

    /// Iterations claimed so far across all workers.
    pub fn iteration(&self) -> Iteration {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Anneals the problem in place.
    ///
    /// If `record_every` is non-zero (and an output directory is set) the
    /// run pauses every `record_every` iterations: workers join, the global
    /// fitness is computed serially and appended to
    /// `reliable_fitness_values.csv`, and a fresh round of workers resumes.
    /// `fully_synchronous` picks the lock discipline of the worker loop.
    ///
    /// # Errors
    /// Fails only on output I/O; annealing itself cannot fail.
    pub fn anneal(
        &mut self,
        problem: &Problem,
        record_every: Iteration,
        fully_synchronous: bool,
    ) -> Result<()> {
        let logging = self.out_dir.is_some();

        // Base fitness for every worker's running accumulator. Recomputed at
        // each recording checkpoint.
        let mut clustering = problem.compute_total_clustering_fitness();
        let mut locality = problem.compute_total_locality_fitness();

        let mut workers = Vec::with_capacity(self.num_workers);
        for id in 0..self.num_workers {
            let worker_seed = splitmix64(self.base_seed ^ id as u64);
            let csv = match &self.out_dir {
                Some(dir) => {
                    let path = dir.join(format!("anneal_ops-{id}.csv"));
                    let mut out = BufWriter::new(
                        File::create(&path)
                            .with_context(|| format!("creating {}", path.display()))?,
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
                         Fitness computation is reliable,\
                         Determination"
                    )?;
                    // Baseline row deploying the initial fitness.
                    writeln!(
                        out,
                        "-1,-1,-1,0,{},{clustering},{locality},1,1",
                        clustering + locality
                    )?;
                    Some(out)
                }
                None => None,
            };
            workers.push(Worker {
                rng: SmallRng::seed_from_u64(splitmix64(worker_seed)),
                disorder: D::new(self.max_iteration, Some(worker_seed)),
                csv,
            });
        }

        // Master CSV for the serial fitness checkpoints.
        let mut csv_master = match &self.out_dir {
            Some(dir) if record_every != 0 => {
                let path = dir.join("reliable_fitness_values.csv");
                let mut out = BufWriter::new(
                    File::create(&path).with_context(|| format!("creating {}", path.display()))?,
                );
                writeln!(out, "Iteration,Fitness,Clustering Fitness,Locality Fitness")?;
                writeln!(out, "0,{},{clustering},{locality}", clustering + locality)?;
                Some(out)
            }
            _ => None,
        };

        if let Some(dir) = &self.out_dir {
            write_metadata(dir, Self::HANDLE, D::HANDLE, Some(self.num_workers))?;
        }

        // Rounds: spawn workers up to the next stop, join, record, repeat.
        // The problem cannot be scanned for its global fitness while workers
        // mutate it, hence the stop-the-world checkpoint.
        let mut wall_clock = Duration::ZERO;
        loop {
            let next_stop = if record_every == 0 || !logging {
                self.max_iteration
            } else {
                self.max_iteration
                    .min(self.iteration.load(Ordering::Relaxed) + record_every)
            };

            let counter: &AtomicU64 = &self.iteration;
            let time_at_start = Instant::now();
            workers.par_iter_mut().for_each(|worker| {
                if fully_synchronous {
                    co_anneal_synchronous(problem, worker, counter, next_stop, clustering, locality);
                } else {
                    co_anneal_sasynchronous(
                        problem, worker, counter, next_stop, clustering, locality,
                    );
                }
            });
            wall_clock += time_at_start.elapsed();

            if let Some(out) = csv_master.as_mut() {
                problem.log(&format!(
                    "Stopping annealing to record fitness at iteration {}...",
                    self.iteration.load(Ordering::Relaxed)
                ));
                clustering = problem.compute_total_clustering_fitness();
                locality = problem.compute_total_locality_fitness();
                writeln!(
                    out,
                    "{},{},{clustering},{locality}",
                    self.iteration.load(Ordering::Relaxed),
                    clustering + locality
                )?;
                problem.log("Fitness logged.");
            }

            if self.iteration.load(Ordering::Relaxed) >= self.max_iteration {
                break;
            }
        }

        if let Some(dir) = &self.out_dir {
            let path = dir.join("wallclock.txt");
            std::fs::write(&path, format!("{}\n", wall_clock.as_secs()))
                .with_context(|| format!("writing {}", path.display()))?;
            for worker in &mut workers {
                if let Some(out) = worker.csv.as_mut() {
                    out.flush().context("flushing worker ops")?;
                }
            }
            if let Some(out) = csv_master.as_mut() {
                out.flush().context("flushing fitness records")?;
            }
        }

        Ok(())
    }
}

// ============================================================================
// Worker loops
// ============================================================================

/// Semi-asynchronous worker loop: claim the application node, transform
/// under the two hardware locks with a capacity recheck, release everything
/// at iteration end.
fn co_anneal_sasynchronous<D: Disorder>(
    problem: &Problem,
    worker: &mut Worker<D>,
    counter: &AtomicU64,
    stop: Iteration,
    base_clustering: f32,
    base_locality: f32,
) {
    let logging = worker.csv.is_some();
    let mut old_clustering = base_clustering;
    let mut old_locality = base_locality;
    let mut old_fitness = old_clustering + old_locality;

    loop {
        let local_iteration = counter.fetch_add(1, Ordering::Relaxed);
        if local_iteration >= stop {
            break;
        }

        let mut collisions = 0usize;

        // Selection and transformation are not atomic in this mode, so the
        // destination can fill up in between; on a lost race the iteration
        // re-selects from scratch.
        let (selection, old_clustering_components, old_locality_components, old_footprint) = loop {
            let s = select_parallel_sasynchronous(problem, &mut worker.rng);
            collisions += s.collisions;

            // Footprint sampled at selection time; it only feeds the
            // reliability flag, so skip it when not logging.
            let footprint = if logging {
                transform_footprint(problem, s.sel_a, s.sel_h, s.old_h)
            } else {
                0
            };

            let occ = problem.compute_hw_node_clustering_fitness(s.sel_h)
                + problem.compute_hw_node_clustering_fitness(s.old_h);
            let olc = 2.0 * problem.compute_app_node_locality_fitness(s.sel_a);

            if locking_transform(problem, s.sel_a, s.sel_h, s.old_h) {
                break (s, occ, olc, footprint);
            }
            collisions += 1;
            s.release();
        };

        let new_clustering_components = problem
            .compute_hw_node_clustering_fitness(selection.sel_h)
            + problem.compute_hw_node_clustering_fitness(selection.old_h);
        let new_locality_components =
            2.0 * problem.compute_app_node_locality_fitness(selection.sel_a);

        // The transform itself bumped three counters; subtract them so an
        // undisturbed iteration compares equal.
        let new_footprint = if logging {
            transform_footprint(problem, selection.sel_a, selection.sel_h, selection.old_h)
                .wrapping_sub(3)
        } else {
            0
        };
        let reliable = old_footprint == new_footprint;

        let new_clustering =
            old_clustering - old_clustering_components + new_clustering_components;
        let new_locality = old_locality - old_locality_components + new_locality_components;
        let new_fitness = new_locality + new_clustering;

        let determined = worker
            .disorder
            .determine(old_fitness, new_fitness, local_iteration);

        if determined {
            old_fitness = new_fitness;
            old_clustering = new_clustering;
            old_locality = new_locality;
        } else {
            // Invert the move. The inversion can itself lose a capacity race
            // if the vacated node has been refilled meanwhile; it is then
            // skipped, and the running fitness absorbs the drift.
            let _ = locking_transform(problem, selection.sel_a, selection.old_h, selection.sel_h);
        }

        if let Some(out) = worker.csv.as_mut() {
            let _ = writeln!(
                out,
                "{local_iteration},{},{},{collisions},{new_fitness},{new_clustering},{new_locality},{},{}",
                selection.sel_a,
                selection.sel_h,
                u8::from(reliable),
                u8::from(determined)
            );
        }

        selection.release();
    }
}

/// Fully-synchronous worker loop: the selector hands over every lock the
/// iteration needs, the body operates under them, and dropping the selection
/// releases them all whether the move was kept or inverted.
fn co_anneal_synchronous<D: Disorder>(
    problem: &Problem,
    worker: &mut Worker<D>,
    counter: &AtomicU64,
    stop: Iteration,
    base_clustering: f32,
    base_locality: f32,
) {
    let logging = worker.csv.is_some();
    let mut old_clustering = base_clustering;
    let mut old_locality = base_locality;
    let mut old_fitness = old_clustering + old_locality;

    loop {
        let local_iteration = counter.fetch_add(1, Ordering::Relaxed);
        if local_iteration >= stop {
            break;
        }

        let mut s = select_parallel_synchronous(problem, &mut worker.rng);

        // With the whole lock set held the footprint cannot move; it is
        // still recorded to demonstrate exactly that.
        let old_footprint = if logging {
            transform_footprint(problem, s.sel_a, s.sel_h, s.old_h)
        } else {
            0
        };

        let old_clustering_components = problem.compute_hw_node_clustering_fitness(s.sel_h)
            + problem.compute_hw_node_clustering_fitness(s.old_h);
        let old_locality_components = 2.0 * problem.compute_app_node_locality_fitness(s.sel_a);

        problem.apply_move(
            s.sel_a,
            s.sel_h,
            s.old_h,
            &mut s.old_contents,
            &mut s.sel_contents,
        );

        let new_clustering_components = problem.compute_hw_node_clustering_fitness(s.sel_h)
            + problem.compute_hw_node_clustering_fitness(s.old_h);
        let new_locality_components = 2.0 * problem.compute_app_node_locality_fitness(s.sel_a);

        let new_footprint = if logging {
            transform_footprint(problem, s.sel_a, s.sel_h, s.old_h).wrapping_sub(3)
        } else {
            0
        };
        let reliable = old_footprint == new_footprint;

        let new_clustering =
            old_clustering - old_clustering_components + new_clustering_components;
        let new_locality = old_locality - old_locality_components + new_locality_components;
        let new_fitness = new_locality + new_clustering;

        let determined = worker
            .disorder
            .determine(old_fitness, new_fitness, local_iteration);

        if determined {
            old_fitness = new_fitness;
            old_clustering = new_clustering;
            old_locality = new_locality;
        } else {
            problem.apply_move(
                s.sel_a,
                s.old_h,
                s.sel_h,
                &mut s.sel_contents,
                &mut s.old_contents,
            );
        }

        if let Some(out) = worker.csv.as_mut() {
            let _ = writeln!(
                out,
                "{local_iteration},{},{},{},{new_fitness},{new_clustering},{new_locality},{},{}",
                s.sel_a,
                s.sel_h,
                s.collisions,
                u8::from(reliable),
                u8::from(determined)
            );
        }

        drop(s);
    }
}

// ============================================================================
// Transform helpers
// ============================================================================

/// Transform wrapper that acquires both hardware locks together (try both,
/// back off on failure, lower index first so concurrent pairs cannot
/// deadlock), re-checks destination capacity under the lock, and bails out
/// when the capacity race was lost.
fn locking_transform(problem: &Problem, sel_a: usize, sel_h: usize, old_h: usize) -> bool {
    let (lo, hi) = if sel_h < old_h {
        (sel_h, old_h)
    } else {
        (old_h, sel_h)
    };

    let (mut lo_guard, mut hi_guard) = loop {
        if let Some(first) = problem.node_hs[lo].try_lock_contents() {
            if let Some(second) = problem.node_hs[hi].try_lock_contents() {
                break (first, second);
            }
            // First guard drops here; back off rather than hold it.
        }
        std::hint::spin_loop();
    };

    let (sel_guard, old_guard) = if sel_h < old_h {
        (&mut lo_guard, &mut hi_guard)
    } else {
        (&mut hi_guard, &mut lo_guard)
    };

    if sel_guard.len() >= problem.p_max {
        return false;
    }

    problem.apply_move(sel_a, sel_h, old_h, old_guard, sel_guard);
    true
}

/// Sums the transform counters over the nodes one transformation touches:
/// both hardware nodes, the application node, and its neighbours. Sampled
/// before and after a transformation (minus the transformation's own three
/// increments) to detect interference from other workers.
fn transform_footprint(
    problem: &Problem,
    sel_a: usize,
    sel_h: usize,
    old_h: usize,
) -> TransformCount {
    let mut footprint = problem.node_hs[sel_h]
        .transform_count()
        .wrapping_add(problem.node_hs[old_h].transform_count())
        .wrapping_add(problem.node_as[sel_a].transform_count());
    for &neighbour in &problem.node_as[sel_a].neighbours {
        footprint = footprint.wrapping_add(problem.node_as[neighbour].transform_count());
    }
    footprint
}

// ============================================================================
// Tests
// ============================================================================

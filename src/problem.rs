//! Placement state: the application graph, the hardware graph, the distance
//! cache, the mutable mapping between them, and the fitness primitives.
//!
//! All annealing mutations funnel through [`Problem::apply_move`], which
//! updates both sides of the mapping (an application node's `location` and
//! the hardware contents lists) between the lock acquisitions its callers
//! own. This is what keeps reciprocity intact under concurrency.

use crate::nodes::{AppNode, HwNode};
use crate::output::RunLog;
use anyhow::{bail, Context, Result};
use parking_lot::MutexGuard;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// Sentinel distance between hardware nodes with no connecting path.
///
/// Must sit far enough below `f32::MAX` that Floyd-Warshall can add two of
/// them and still get an ordinary finite float.
pub const UNREACHABLE: f32 = 1.0e30;

/// The placement problem and its mutable solution state.
///
/// Owns both node arrays, the hardware edge list, the dense all-pairs
/// distance cache, and the capacity bound `p_max`. A setup-time generator
/// drives the random initial condition; annealing workers carry their own
/// generators and never touch this one.
pub struct Problem {
    /// Problem name; also names the output subdirectory.
    pub name: String,
    /// Application nodes, indexed by stable id.
    pub node_as: Vec<AppNode>,
    /// Hardware nodes, indexed by stable id.
    pub node_hs: Vec<HwNode>,
    /// Undirected hardware edges `(from, to, weight)`, stored once each.
    pub edge_hs: Vec<(usize, usize, f32)>,
    /// Maximum number of application nodes a hardware node may hold.
    pub p_max: usize,
    /// Dense row-major `|H| x |H|` shortest-path cache.
    edge_cache: Vec<f32>,
    cache_dim: usize,
    rng: SmallRng,
    journal: RunLog,
    out_dir: Option<PathBuf>,
}

impl Problem {
    /// Creates an empty problem with an entropy-seeded setup generator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_as: Vec::new(),
            node_hs: Vec::new(),
            edge_hs: Vec::new(),
            p_max: usize::MAX,
            edge_cache: Vec::new(),
            cache_dim: 0,
            rng: SmallRng::seed_from_u64(rand::random()),
            journal: RunLog::disabled(),
            out_dir: None,
        }
    }

    /// Reseeds the setup generator, making the random initial condition
    /// reproducible.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Adds an application node, returning its index.
    pub fn add_app_node(&mut self, name: impl Into<String>) -> usize {
        self.node_as.push(AppNode::new(name));
        self.node_as.len() - 1
    }

    /// Adds a hardware node with no plotting position, returning its index.
    pub fn add_hw_node(&mut self, name: impl Into<String>) -> usize {
        let index = self.node_hs.len();
        self.node_hs.push(HwNode::new(name, index));
        index
    }

    /// Adds a hardware node with a plotting position, returning its index.
    pub fn add_hw_node_at(
        &mut self,
        name: impl Into<String>,
        pos_horiz: f32,
        pos_verti: f32,
    ) -> usize {
        let index = self.node_hs.len();
        self.node_hs
            .push(HwNode::with_position(name, index, pos_horiz, pos_verti));
        index
    }

    /// Connects two application nodes. Both neighbour lists are updated, so
    /// the symmetry invariant holds by construction.
    pub fn add_app_edge(&mut self, a: usize, b: usize) {
        self.node_as[a].neighbours.push(b);
        self.node_as[b].neighbours.push(a);
    }

    /// Records an undirected weighted hardware edge.
    pub fn add_hw_edge(&mut self, from: usize, to: usize, weight: f32) {
        self.edge_hs.push((from, to, weight));
    }

    // ========================================================================
    // Output path and logging
    // ========================================================================

    /// Defines a directory for dumping outputs. Any existing directory at
    /// that path is cleared first.
    pub fn define_output_path(&mut self, dir: &Path) -> Result<()> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)
                .with_context(|| format!("clearing output directory {}", dir.display()))?;
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        self.out_dir = Some(dir.to_path_buf());
        Ok(())
    }

    /// The configured output directory, if any.
    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    /// Opens the run log. Returns without setup if no output path has been
    /// defined.
    pub fn initialise_logging(&mut self) -> Result<()> {
        if let Some(dir) = &self.out_dir {
            self.journal = RunLog::open(&dir.join("log.txt"))?;
            self.log("Logging initialised.");
        }
        Ok(())
    }

    /// Writes a timestamped log line to stdout and the log file. Thread
    /// safe; does nothing if logging is not initialised.
    pub fn log(&self, message: &str) {
        self.journal.write(message);
    }

    // ========================================================================
    // Distance cache
    // ========================================================================

    /// Reserves the dense edge cache and installs default values: zeroes on
    /// the diagonal, [`UNREACHABLE`] everywhere else, then the recorded
    /// hardware edges in both directions.
    pub fn initialise_edge_cache(&mut self) {
        let diameter = self.node_hs.len();
        self.log(&format!(
            "Initialising hardware edge cache with diameter {diameter}."
        ));

        self.cache_dim = diameter;
        self.edge_cache = vec![UNREACHABLE; diameter * diameter];
        for i in 0..diameter {
            self.edge_cache[i * diameter + i] = 0.0;
        }
        for &(from, to, weight) in &self.edge_hs {
            self.edge_cache[from * diameter + to] = weight;
            self.edge_cache[to * diameter + from] = weight;
        }

        self.log("Hardware edge cache initialised.");
    }

    /// Populates the unreachable members of the edge cache with all-pairs
    /// shortest paths using the Floyd-Warshall algorithm. Requires the cache
    /// to be initialised first. Runs once; not re-entrant.
    pub fn populate_edge_cache(&mut self) {
        self.log("Populating edge cache using the Floyd-Warshall algorithm.");
        let n = self.cache_dim;
        for k in 0..n {
            for i in 0..n {
                let ik = self.edge_cache[i * n + k];
                for j in 0..n {
                    let trial = ik + self.edge_cache[k * n + j];
                    if trial < self.edge_cache[i * n + j] {
                        self.edge_cache[i * n + j] = trial;
                    }
                }
            }
        }
        self.log("Edge cache fully populated.");
    }

    /// Shortest-path distance between two hardware nodes.
    #[inline]
    pub fn distance(&self, from: usize, to: usize) -> f32 {
        self.edge_cache[from * self.cache_dim + to]
    }

    // ========================================================================
    // Initial conditions
    // ========================================================================

    /// Assigns application nodes to hardware nodes in array order, filling
    /// each hardware node to `p_max` before moving to the next.
    ///
    /// # Errors
    /// Fails when the application graph does not fit, i.e.
    /// `|A| > p_max * |H|`.
    pub fn initial_condition_bucket(&mut self) -> Result<()> {
        self.log("Applying bucket-filling initial condition.");

        if self.node_as.len() > self.p_max.saturating_mul(self.node_hs.len()) {
            bail!(
                "cannot bucket-fill: {} application nodes exceed {} hardware nodes * pMax {}",
                self.node_as.len(),
                self.node_hs.len(),
                self.p_max
            );
        }

        let mut hw = 0;
        for a in 0..self.node_as.len() {
            if self.node_hs[hw].load() >= self.p_max {
                hw += 1;
            }
            self.place(a, hw);
        }

        self.log("Initial condition applied.");
        Ok(())
    }

    /// Assigns each application node, in shuffled order, to a uniformly
    /// random hardware node that still has room. Respects `p_max`.
    pub fn initial_condition_random(&mut self) {
        self.log("Applying random initial condition.");

        // Hardware nodes with spare room; entries leave as they fill up.
        let mut open: Vec<usize> = (0..self.node_hs.len())
            .filter(|&h| self.node_hs[h].load() < self.p_max)
            .collect();

        let mut to_place: Vec<usize> = (0..self.node_as.len()).collect();
        to_place.shuffle(&mut self.rng);

        for a in to_place {
            let slot = self.rng.random_range(0..open.len());
            let hw = open[slot];
            self.place(a, hw);
            if self.node_hs[hw].load() >= self.p_max {
                open.swap_remove(slot);
            }
        }

        self.log("Initial condition applied.");
    }

    /// Installs one application node on one hardware node during setup.
    fn place(&self, app: usize, hw: usize) {
        self.node_as[app].set_location(hw);
        let mut contents = self.node_hs[hw].lock_contents();
        contents.push(app);
        let len = contents.len();
        self.node_hs[hw].store_load(len);
    }

    // ========================================================================
    // Fitness
    // ========================================================================

    /// Clustering fitness of one hardware node: `-|contents|^2`.
    #[inline]
    pub fn compute_hw_node_clustering_fitness(&self, hw: usize) -> f32 {
        let size = self.node_hs[hw].load() as f32;
        -size * size
    }

    /// Locality fitness of one application node.
    ///
    /// Locality is a per-edge quantity; since every edge is recorded in both
    /// endpoint neighbour lists, this method computes half of the edge's
    /// total contribution. Move deltas double it.
    pub fn compute_app_node_locality_fitness(&self, app: usize) -> f32 {
        let node = &self.node_as[app];
        let root = node.location();
        let mut fitness = 0.0;
        for &neighbour in &node.neighbours {
            fitness -= self.distance(root, self.node_as[neighbour].location());
        }
        fitness
    }

    /// Total clustering fitness over all hardware nodes.
    pub fn compute_total_clustering_fitness(&self) -> f32 {
        (0..self.node_hs.len())
            .map(|h| self.compute_hw_node_clustering_fitness(h))
            .sum()
    }

    /// Total locality fitness over all application nodes. Every application
    /// edge contributes twice, once per endpoint; the double count is part
    /// of the fitness definition.
    pub fn compute_total_locality_fitness(&self) -> f32 {
        (0..self.node_as.len())
            .map(|a| self.compute_app_node_locality_fitness(a))
            .sum()
    }

    /// Total fitness of the current mapping. Negative; higher is better.
    pub fn compute_total_fitness(&self) -> f32 {
        self.compute_total_clustering_fitness() + self.compute_total_locality_fitness()
    }

    // ========================================================================
    // Transformation
    // ========================================================================

    /// The move primitive: relocates `sel_a` from `old_h` to `sel_h` through
    /// content guards the caller already holds. Updates both sides of the
    /// mapping, the unlocked load mirrors, and the three transform counters
    /// (release order). Capacity is not checked; that is caller discipline.
    pub fn apply_move(
        &self,
        sel_a: usize,
        sel_h: usize,
        old_h: usize,
        old_contents: &mut Vec<usize>,
        sel_contents: &mut Vec<usize>,
    ) {
        old_contents.retain(|&a| a != sel_a);
        self.node_as[sel_a].set_location(sel_h);
        sel_contents.push(sel_a);
        self.node_hs[old_h].store_load(old_contents.len());
        self.node_hs[sel_h].store_load(sel_contents.len());
        self.node_as[sel_a].bump_transform_count();
        self.node_hs[sel_h].bump_transform_count();
        self.node_hs[old_h].bump_transform_count();
    }

    /// Convenience transform for callers that own no hardware locks yet (the
    /// serial annealer and tests). Locks the two contents lists in index
    /// order and applies the move. The inverse of
    /// `transform(a, sel_h, old_h)` is `transform(a, old_h, sel_h)`.
    pub fn transform(&self, sel_a: usize, sel_h: usize, old_h: usize) {
        assert_ne!(sel_h, old_h, "transform requires distinct hardware nodes");
        let (mut first, mut second) = self.lock_hw_pair(sel_h, old_h);
        let (sel_contents, old_contents) = if sel_h < old_h {
            (&mut first, &mut second)
        } else {
            (&mut second, &mut first)
        };
        self.apply_move(sel_a, sel_h, old_h, old_contents, sel_contents);
    }

    /// Locks two hardware contents lists in index order, returning the
    /// guards as `(lower, higher)`.
    fn lock_hw_pair(
        &self,
        h1: usize,
        h2: usize,
    ) -> (MutexGuard<'_, Vec<usize>>, MutexGuard<'_, Vec<usize>>) {
        let (lo, hi) = if h1 < h2 { (h1, h2) } else { (h2, h1) };
        let first = self.node_hs[lo].lock_contents();
        let second = self.node_hs[hi].lock_contents();
        (first, second)
    }

    // ========================================================================
    // Integrity checks
    // ========================================================================

    /// Checks the integrity of the node data structures, appending a line to
    /// `errors` for every violation found. Returns true iff integrity is
    /// not compromised. Checks:
    ///
    /// - each application node is contained by the hardware node it names as
    ///   its location, and that hardware node reciprocates;
    /// - each application node contained by a hardware node reciprocates;
    /// - no hardware node exceeds `p_max`;
    /// - the contents lists account for every application node exactly once.
    ///
    /// Not thread safe; run it while no worker is annealing.
    pub fn check_node_integrity(&self, errors: &mut String) -> bool {
        let mut intact = true;
        let mut contained_total = 0usize;

        for (a, node_a) in self.node_as.iter().enumerate() {
            let location = node_a.location();
            if location >= self.node_hs.len() {
                intact = false;
                errors.push_str(&format!(
                    "Application node '{}' has no location information.\n",
                    node_a.name
                ));
                continue;
            }
            if !self.node_hs[location].contents_snapshot().contains(&a) {
                intact = false;
                errors.push_str(&format!(
                    "Application node '{}' claims to be held in hardware node '{}', \
                     but that hardware node does not reciprocate.\n",
                    node_a.name, self.node_hs[location].name
                ));
            }
        }

        for node_h in &self.node_hs {
            let contents = node_h.contents_snapshot();
            contained_total += contents.len();
            if contents.len() > self.p_max {
                intact = false;
                errors.push_str(&format!(
                    "Hardware node '{}' holds {} application nodes, exceeding pMax {}.\n",
                    node_h.name,
                    contents.len(),
                    self.p_max
                ));
            }
            for &a in &contents {
                if self.node_as[a].location() != node_h.index {
                    intact = false;
                    errors.push_str(&format!(
                        "Hardware node '{}' claims to contain application node '{}', \
                         but that application node does not reciprocate.\n",
                        node_h.name, self.node_as[a].name
                    ));
                }
            }
        }

        if contained_total != self.node_as.len() {
            intact = false;
            errors.push_str(&format!(
                "Hardware contents hold {} application nodes in total, expected {}.\n",
                contained_total,
                self.node_as.len()
            ));
        }

        intact
    }

    /// Checks that every per-node lock is free, appending a line to `errors`
    /// for each lock still held. Returns true iff all locks are free.
    pub fn check_lock_integrity(&self, errors: &mut String) -> bool {
        let mut intact = true;
        for node_a in &self.node_as {
            if node_a.try_claim().is_none() {
                intact = false;
                errors.push_str(&format!(
                    "Application node '{}' is still claimed.\n",
                    node_a.name
                ));
            }
        }
        for node_h in &self.node_hs {
            if node_h.try_lock_contents().is_none() {
                intact = false;
                errors.push_str(&format!(
                    "Hardware node '{}' is still locked.\n",
                    node_h.name
                ));
            }
        }
        intact
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    /// A problem with `n_app` application nodes in a cycle mapped onto
    /// `n_hw` hardware nodes in a cycle of uniform edge weight.
    fn ring_problem(n_app: usize, n_hw: usize, weight: f32, p_max: usize) -> Problem {
        let mut problem = Problem::new("test_ring");
        problem.p_max = p_max;
        for i in 0..n_app {
            problem.add_app_node(format!("a{i}"));
        }
        for i in 0..n_app {
            problem.add_app_edge(i, (i + 1) % n_app);
        }
        for i in 0..n_hw {
            problem.add_hw_node(format!("h{i}"));
        }
        for i in 0..n_hw {
            problem.add_hw_edge(i, (i + 1) % n_hw, weight);
        }
        problem.initialise_edge_cache();
        problem.populate_edge_cache();
        problem
    }

    #[test]
    fn floyd_warshall_on_a_ring() {
        let problem = ring_problem(4, 4, 2.0, 3);
        // Shortest paths on a 4-cycle with weight 2: 0, 2, 4, 2.
        assert!((problem.distance(0, 0) - 0.0).abs() < f32::EPSILON);
        assert!((problem.distance(0, 1) - 2.0).abs() < f32::EPSILON);
        assert!((problem.distance(0, 2) - 4.0).abs() < f32::EPSILON);
        assert!((problem.distance(0, 3) - 2.0).abs() < f32::EPSILON);
        // Symmetry.
        for i in 0..4 {
            for j in 0..4 {
                assert!((problem.distance(i, j) - problem.distance(j, i)).abs() < f32::EPSILON);
            }
        }
    }

    #[test]
    fn floyd_warshall_prefers_indirect_routes() {
        let mut problem = Problem::new("shortcut");
        for i in 0..3 {
            problem.add_hw_node(format!("h{i}"));
        }
        problem.add_hw_edge(0, 2, 100.0);
        problem.add_hw_edge(0, 1, 1.0);
        problem.add_hw_edge(1, 2, 1.0);
        problem.initialise_edge_cache();
        problem.populate_edge_cache();
        assert!((problem.distance(0, 2) - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disconnected_nodes_stay_unreachable() {
        let mut problem = Problem::new("islands");
        problem.add_hw_node("h0");
        problem.add_hw_node("h1");
        problem.initialise_edge_cache();
        problem.populate_edge_cache();
        assert!((problem.distance(0, 1) - UNREACHABLE).abs() < f32::EPSILON);
        assert!((problem.distance(0, 0) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn bucket_fill_packs_in_order() {
        let mut problem = ring_problem(8, 4, 2.0, 3);
        problem.initial_condition_bucket().unwrap();
        assert_eq!(problem.node_hs[0].load(), 3);
        assert_eq!(problem.node_hs[1].load(), 3);
        assert_eq!(problem.node_hs[2].load(), 2);
        assert_eq!(problem.node_hs[3].load(), 0);
        let mut errors = String::new();
        assert!(problem.check_node_integrity(&mut errors), "{errors}");
    }

    #[test]
    fn bucket_fill_fails_loudly_when_oversubscribed() {
        let mut problem = ring_problem(8, 2, 2.0, 3);
        assert!(problem.initial_condition_bucket().is_err());
    }

    #[test]
    fn random_fill_respects_capacity_and_conservation() {
        for seed in 0..10 {
            let mut problem = ring_problem(12, 4, 2.0, 3);
            problem.seed_rng(seed);
            problem.initial_condition_random();
            for node_h in &problem.node_hs {
                assert!(node_h.load() <= problem.p_max);
            }
            let total: usize = problem.node_hs.iter().map(|h| h.load()).sum();
            assert_eq!(total, problem.node_as.len());
            let mut errors = String::new();
            assert!(problem.check_node_integrity(&mut errors), "{errors}");
        }
    }

    #[test]
    fn fitness_of_hand_placed_ring() {
        let mut problem = ring_problem(8, 4, 2.0, 3);
        // Optimal hand placement: consecutive pairs on consecutive nodes.
        for a in 0..8 {
            let mut contents = problem.node_hs[a / 2].lock_contents();
            contents.push(a);
            let len = contents.len();
            problem.node_hs[a / 2].store_load(len);
            problem.node_as[a].set_location(a / 2);
        }
        // Clustering: 4 nodes * -(2^2) = -16. Locality: 4 inter-node edges,
        // each counted from both endpoints at distance 2 = -16.
        assert!((problem.compute_total_clustering_fitness() - -16.0).abs() < 1e-4);
        assert!((problem.compute_total_locality_fitness() - -16.0).abs() < 1e-4);
        assert!((problem.compute_total_fitness() - -32.0).abs() < 1e-4);
    }

    #[test]
    fn transform_moves_both_sides_of_the_mapping() {
        let mut problem = ring_problem(8, 4, 2.0, 3);
        problem.initial_condition_bucket().unwrap();
        let old_h = problem.node_as[0].location();
        let sel_h = 3;
        problem.transform(0, sel_h, old_h);
        assert_eq!(problem.node_as[0].location(), sel_h);
        assert!(problem.node_hs[sel_h].contents_snapshot().contains(&0));
        assert!(!problem.node_hs[old_h].contents_snapshot().contains(&0));
        let mut errors = String::new();
        assert!(problem.check_node_integrity(&mut errors), "{errors}");
    }

    #[test]
    fn transform_roundtrip_restores_fitness() {
        // 1000 random move/invert pairs leave the total fitness untouched.
        let mut problem = ring_problem(16, 8, 2.0, 3);
        problem.seed_rng(99);
        problem.initial_condition_random();
        let baseline = problem.compute_total_fitness();
        let mut rng = XorShiftRng::seed_from_u64(42);

        for _ in 0..1000 {
            let sel_a = rng.random_range(0..problem.node_as.len());
            let old_h = problem.node_as[sel_a].location();
            let sel_h = loop {
                let h = rng.random_range(0..problem.node_hs.len());
                if h != old_h && problem.node_hs[h].load() < problem.p_max {
                    break h;
                }
            };
            problem.transform(sel_a, sel_h, old_h);
            problem.transform(sel_a, old_h, sel_h);
        }

        let after = problem.compute_total_fitness();
        assert!(
            (after - baseline).abs() < 1e-3,
            "fitness drifted across roundtrips: {baseline} -> {after}"
        );
        let mut errors = String::new();
        assert!(problem.check_node_integrity(&mut errors), "{errors}");
    }

    #[test]
    fn incremental_delta_matches_global_rescan() {
        let mut problem = ring_problem(16, 8, 2.0, 3);
        problem.seed_rng(7);
        problem.initial_condition_random();
        let mut rng = XorShiftRng::seed_from_u64(123);
        let mut running = problem.compute_total_fitness();

        for _ in 0..200 {
            let sel_a = rng.random_range(0..problem.node_as.len());
            let old_h = problem.node_as[sel_a].location();
            let sel_h = loop {
                let h = rng.random_range(0..problem.node_hs.len());
                if h != old_h && problem.node_hs[h].load() < problem.p_max {
                    break h;
                }
            };

            let old_components = problem.compute_hw_node_clustering_fitness(sel_h)
                + problem.compute_hw_node_clustering_fitness(old_h)
                + 2.0 * problem.compute_app_node_locality_fitness(sel_a);
            problem.transform(sel_a, sel_h, old_h);
            let new_components = problem.compute_hw_node_clustering_fitness(sel_h)
                + problem.compute_hw_node_clustering_fitness(old_h)
                + 2.0 * problem.compute_app_node_locality_fitness(sel_a);

            running = running - old_components + new_components;
            let global = problem.compute_total_fitness();
            assert!(
                (running - global).abs() < 1e-2,
                "incremental fitness {running} diverged from global {global}"
            );
        }
    }

    #[test]
    fn lock_integrity_reports_held_locks() {
        let problem = ring_problem(4, 2, 1.0, 4);
        let mut errors = String::new();
        assert!(problem.check_lock_integrity(&mut errors));
        assert!(errors.is_empty());

        let guard = problem.node_as[1].try_claim().unwrap();
        let mut errors = String::new();
        assert!(!problem.check_lock_integrity(&mut errors));
        assert!(errors.contains("a1"));
        drop(guard);
    }

    #[test]
    fn node_integrity_reports_capacity_violations() {
        let problem = ring_problem(4, 2, 1.0, 1);
        // Overfill h0 by hand.
        for a in 0..3 {
            let mut contents = problem.node_hs[0].lock_contents();
            contents.push(a);
            let len = contents.len();
            problem.node_hs[0].store_load(len);
            problem.node_as[a].set_location(0);
        }
        {
            let mut contents = problem.node_hs[1].lock_contents();
            contents.push(3);
            problem.node_hs[1].store_load(1);
            drop(contents);
            problem.node_as[3].set_location(1);
        }
        let mut errors = String::new();
        assert!(!problem.check_node_integrity(&mut errors));
        assert!(errors.contains("exceeding pMax"));
    }
}

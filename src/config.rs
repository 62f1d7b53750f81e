//! Run configuration.

use crate::disorder::Iteration;
use std::path::PathBuf;

/// Which compiled-in example problem to anneal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProblemChoice {
    /// Application cycle on a hardware cycle.
    Ring,
    /// 2-D application grid on a board/mailbox hardware graph.
    Grid,
}

/// Options recognised by the command-line front end.
#[derive(Clone, Debug)]
pub struct MainConfig {
    /// Quiet timing-only mode: no output directory, no logging; the elapsed
    /// whole seconds are printed to stdout and nothing else.
    pub mouse_mode: bool,
    /// Anneal in serial rather than parallel.
    pub serial: bool,
    /// Number of workers (parallel only).
    pub num_workers: usize,
    /// Synchronicity (parallel only): lock everything an iteration touches
    /// so no computation uses stale data (true), or synchronise only enough
    /// to keep the data structure intact (false).
    pub fully_synchronous: bool,
    /// Deterministic seed, used for both the problem's shuffler and the
    /// disorder oracles. `None` draws from OS entropy.
    pub seed: Option<u64>,
    /// Iteration budget.
    pub max_iteration: Iteration,
    /// Checkpoint interval for the parallel annealer; defaults to a
    /// twentieth of the budget.
    pub record_every: Option<Iteration>,
    /// Problem to anneal.
    pub problem: ProblemChoice,
    /// Root of the output tree; the run writes into `<root>/<problem name>`.
    pub out_root: PathBuf,
}

impl Default for MainConfig {
    fn default() -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1);
        Self {
            mouse_mode: false,
            serial: false,
            num_workers,
            fully_synchronous: false,
            seed: None,
            max_iteration: 1_000_000,
            record_every: None,
            problem: ProblemChoice::Ring,
            out_root: PathBuf::from("output"),
        }
    }
}

impl MainConfig {
    /// The effective checkpoint interval for a parallel run.
    pub fn record_interval(&self) -> Iteration {
        self.record_every.unwrap_or(self.max_iteration / 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = MainConfig::default();
        assert!(!config.mouse_mode);
        assert!(!config.serial);
        assert!(!config.fully_synchronous);
        assert_eq!(config.seed, None);
        assert_eq!(config.max_iteration, 1_000_000);
        assert_eq!(config.problem, ProblemChoice::Ring);
        assert!(config.num_workers >= 1);
    }

    #[test]
    fn record_interval_defaults_to_a_twentieth() {
        let config = MainConfig::default();
        assert_eq!(config.record_interval(), 50_000);
        let config = MainConfig {
            record_every: Some(123),
            ..MainConfig::default()
        };
        assert_eq!(config.record_interval(), 123);
    }
}

use placer::config::{MainConfig, ProblemChoice};
use placer::disorder::ExpDecay;
use placer::parallel::ParallelAnnealer;
use placer::problem::Problem;
use placer::problems;
use placer::serial::SerialAnnealer;
use std::path::PathBuf;
use std::time::Instant;

fn main() {
    let mut cfg = MainConfig::default();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--serial" => {
                cfg.serial = true;
                i += 1;
            }
            "--mouse" => {
                cfg.mouse_mode = true;
                i += 1;
            }
            "--fully-synchronous" => {
                cfg.fully_synchronous = true;
                i += 1;
            }
            "--workers" => {
                let v = args.get(i + 1).unwrap_or_else(|| usage_and_exit(2));
                cfg.num_workers = v.parse().unwrap_or_else(|_| usage_and_exit(2));
                if cfg.num_workers == 0 {
                    usage_and_exit(2);
                }
                i += 2;
            }
            "--seed" => {
                let v = args.get(i + 1).unwrap_or_else(|| usage_and_exit(2));
                cfg.seed = Some(v.parse().unwrap_or_else(|_| usage_and_exit(2)));
                i += 2;
            }
            "--iterations" => {
                let v = args.get(i + 1).unwrap_or_else(|| usage_and_exit(2));
                cfg.max_iteration = v.parse().unwrap_or_else(|_| usage_and_exit(2));
                i += 2;
            }
            "--record-every" => {
                let v = args.get(i + 1).unwrap_or_else(|| usage_and_exit(2));
                cfg.record_every = Some(v.parse().unwrap_or_else(|_| usage_and_exit(2)));
                i += 2;
            }
            "--problem" => {
                let v = args.get(i + 1).unwrap_or_else(|| usage_and_exit(2));
                cfg.problem = match v.as_str() {
                    "ring" => ProblemChoice::Ring,
                    "grid" => ProblemChoice::Grid,
                    _ => usage_and_exit(2),
                };
                i += 2;
            }
            "--out" => {
                let v = args.get(i + 1).unwrap_or_else(|| usage_and_exit(2));
                cfg.out_root = PathBuf::from(v);
                i += 2;
            }
            "--help" | "-h" => usage_and_exit(0),
            _ => usage_and_exit(2),
        }
    }

    if let Err(e) = run(&cfg) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cfg: &MainConfig) -> anyhow::Result<()> {
    let mut problem = match cfg.problem {
        ProblemChoice::Ring => problems::ring(128, 32, 2.0, 8),
        ProblemChoice::Grid => problems::grid(32, 3, 2, 4, 4, 16),
    };
    if let Some(seed) = cfg.seed {
        problem.seed_rng(seed);
    }

    // Mouse mode runs as quietly as possible, printing timing only.
    let out_dir = if cfg.mouse_mode {
        None
    } else {
        let dir = cfg.out_root.join(&problem.name);
        problem.define_output_path(&dir)?;
        problem.initialise_logging()?;
        Some(dir)
    };

    // Prepare problem for annealing.
    problem.initialise_edge_cache();
    problem.populate_edge_cache();
    problem.initial_condition_random();

    if let Some(dir) = &out_dir {
        problem.write_lock_integrity_errs(&dir.join("integrity_locks_before.err"))?;
        problem.write_node_integrity_errs(&dir.join("integrity_nodes_before.err"))?;

        problem.log(&format!(
            "Initial fitness: {}.",
            problem.compute_total_fitness()
        ));

        problem.write_a_degrees(&dir.join("a_degrees.csv"))?;
        problem.write_a_h_graph(&dir.join("initial_a_h_graph.csv"))?;
        problem.write_a_to_h_map(&dir.join("initial_a_to_h_map.csv"))?;

        problem.log(&format!(
            "Annealing problem for {} iterations.",
            cfg.max_iteration
        ));
    }

    let time_at_start = Instant::now();
    anneal(cfg, &mut problem, out_dir.clone())?;
    if cfg.mouse_mode {
        println!("{}", time_at_start.elapsed().as_secs());
    }

    if let Some(dir) = &out_dir {
        problem.log("Annealing complete.");
        problem.log(&format!(
            "Final fitness: {}.",
            problem.compute_total_fitness()
        ));

        problem.write_a_h_graph(&dir.join("final_a_h_graph.csv"))?;
        problem.write_a_to_h_map(&dir.join("final_a_to_h_map.csv"))?;
        problem.write_h_graph(&dir.join("h_graph.csv"))?;
        problem.write_h_nodes(&dir.join("h_nodes.csv"))?;
        problem.write_h_node_loading(&dir.join("h_node_loading.csv"))?;
        problem.write_lock_integrity_errs(&dir.join("integrity_locks_after.err"))?;
        problem.write_node_integrity_errs(&dir.join("integrity_nodes_after.err"))?;
    }

    Ok(())
}

fn anneal(cfg: &MainConfig, problem: &mut Problem, out_dir: Option<PathBuf>) -> anyhow::Result<()> {
    if cfg.serial {
        let mut annealer = SerialAnnealer::<ExpDecay>::new(cfg.max_iteration, out_dir, cfg.seed);
        annealer.anneal(problem)
    } else {
        let mut annealer = ParallelAnnealer::<ExpDecay>::new(
            cfg.num_workers,
            cfg.max_iteration,
            out_dir,
            cfg.seed,
        );
        annealer.anneal(problem, cfg.record_interval(), cfg.fully_synchronous)
    }
}

fn usage_and_exit(code: i32) -> ! {
    eprintln!(
        "Usage:\n  placer [OPTIONS]\n\nOptions:\n  --problem ring|grid      Compiled-in problem to anneal (default: ring)\n  --serial                 Anneal with the single-worker annealer\n  --workers N              Worker count for the parallel annealer (default: auto-detect)\n  --fully-synchronous      Lock every node an iteration touches (parallel only)\n  --iterations N           Iteration budget (default: 1000000)\n  --record-every N         Checkpoint interval (parallel; default: iterations/20)\n  --seed SEED              Deterministic seed for shuffler and disorder\n  --out DIR                Output root directory (default: output)\n  --mouse                  Quiet timing-only mode\n"
    );
    std::process::exit(code)
}

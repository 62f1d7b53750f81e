//! Selection protocols: choosing `(selA, selH, oldH)` for one iteration.
//!
//! Three flavours share the same outcome shape and differ only in locking
//! discipline:
//!
//! - **Serial**: no locks.
//! - **Semi-asynchronous**: the application node is claimed with a
//!   non-blocking lock; hardware capacity is read without locks and may be
//!   stale. Only the claim is held on return.
//! - **Fully-synchronous**: every node the iteration will read or write is
//!   locked before return, acquired try-and-back-off so no worker can
//!   deadlock.
//!
//! None of these block: failed acquisitions are retried with fresh draws,
//! counted as collisions for telemetry.

use crate::problem::Problem;
use parking_lot::MutexGuard;
use rand::rngs::SmallRng;
use rand::Rng;

/// Soft ceiling on selection retries. Exceeding it logs a warning and keeps
/// going; it is never an error.
pub const SELECTION_PATIENCE: usize = 1000;

/// Outcome of a serial selection.
#[derive(Clone, Copy, Debug)]
pub struct Selection {
    /// Index of the application node to move.
    pub sel_a: usize,
    /// Index of the destination hardware node.
    pub sel_h: usize,
    /// Index of the hardware node currently hosting `sel_a`.
    pub old_h: usize,
}

/// Draws a destination hardware node, rejecting full nodes and `avoid`.
fn select_sel_h(problem: &Problem, rng: &mut SmallRng, avoid: usize) -> usize {
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        if attempts == SELECTION_PATIENCE {
            problem.log(
                "WARNING: Hardware node selection is taking a while. Try \
                 setting a larger value for pMax.",
            );
        }
        let sel_h = rng.random_range(0..problem.node_hs.len());
        if sel_h != avoid && problem.node_hs[sel_h].load() < problem.p_max {
            return sel_h;
        }
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Selects an application node and a destination hardware node uniformly at
/// random, with no locking. Does not modify any state.
pub fn select_serial(problem: &Problem, rng: &mut SmallRng) -> Selection {
    let sel_a = rng.random_range(0..problem.node_as.len());
    let old_h = problem.node_as[sel_a].location();
    let sel_h = select_sel_h(problem, rng, old_h);
    Selection { sel_a, sel_h, old_h }
}

// ============================================================================
// Semi-asynchronous
// ============================================================================

/// Outcome of a semi-asynchronous selection. Holds the claim on the selected
/// application node; dropping this value releases it, which must not happen
/// before the iteration's accept/revert decision has been applied.
pub struct SasyncSelection<'p> {
    /// Index of the application node to move.
    pub sel_a: usize,
    /// Index of the destination hardware node.
    pub sel_h: usize,
    /// Index of the hardware node currently hosting `sel_a`.
    pub old_h: usize,
    /// Failed claim attempts while selecting the application node.
    pub collisions: usize,
    claim: MutexGuard<'p, ()>,
}

impl SasyncSelection<'_> {
    /// Releases the application node claim.
    pub fn release(self) {
        drop(self.claim);
    }
}

/// Selects with the semi-asynchronous discipline: the application node is
/// claimed so no two workers move the same node at once, but the capacity
/// read on the destination is unlocked and may be stale. Callers must
/// re-check capacity under lock when transforming.
pub fn select_parallel_sasynchronous<'p>(
    problem: &'p Problem,
    rng: &mut SmallRng,
) -> SasyncSelection<'p> {
    let mut attempts = 0usize;
    let (sel_a, claim) = loop {
        attempts += 1;
        if attempts == SELECTION_PATIENCE {
            problem.log(
                "WARNING: Atomic application node selection is taking a \
                 while. Try spawning fewer threads.",
            );
        }
        let roll = rng.random_range(0..problem.node_as.len());
        if let Some(guard) = problem.node_as[roll].try_claim() {
            break (roll, guard);
        }
    };

    let old_h = problem.node_as[sel_a].location();
    let sel_h = select_sel_h(problem, rng, old_h);

    SasyncSelection {
        sel_a,
        sel_h,
        old_h,
        collisions: attempts - 1,
        claim,
    }
}

// ============================================================================
// Fully-synchronous
// ============================================================================

/// Outcome of a fully-synchronous selection. Owns every lock the iteration
/// body needs: the claims on `selA` and all its neighbours, and the contents
/// guards of `oldH` and `selH`. Dropping this value releases everything, on
/// every exit path.
pub struct SyncSelection<'p> {
    /// Index of the application node to move.
    pub sel_a: usize,
    /// Index of the destination hardware node.
    pub sel_h: usize,
    /// Index of the hardware node currently hosting `sel_a`.
    pub old_h: usize,
    /// Wasted lock acquisitions over the whole selection.
    pub collisions: usize,
    /// Contents of `old_h`, held locked.
    pub old_contents: MutexGuard<'p, Vec<usize>>,
    /// Contents of `sel_h`, held locked.
    pub sel_contents: MutexGuard<'p, Vec<usize>>,
    claims: Vec<MutexGuard<'p, ()>>,
}

impl SyncSelection<'_> {
    /// Number of application node claims held (`selA` plus its neighbours).
    pub fn claimed_nodes(&self) -> usize {
        self.claims.len()
    }
}

/// Selects with the fully-synchronous discipline.
///
/// Deadlock-free by try-and-back-off: the application node is claimed first,
/// then its neighbours in list order and the current hardware node; any
/// failure releases everything held and restarts with a fresh draw. The
/// destination is drawn last and its capacity is confirmed under its own
/// lock, so the iteration body needs no recheck.
pub fn select_parallel_synchronous<'p>(
    problem: &'p Problem,
    rng: &mut SmallRng,
) -> SyncSelection<'p> {
    let mut collisions = 0usize;
    let mut attempts = 0usize;

    'restart: loop {
        attempts += 1;
        if attempts == SELECTION_PATIENCE {
            problem.log(
                "WARNING: Synchronous selection is taking a while. Try \
                 spawning fewer threads.",
            );
        }

        let roll = rng.random_range(0..problem.node_as.len());
        let Some(app_claim) = problem.node_as[roll].try_claim() else {
            collisions += 1;
            continue 'restart;
        };
        let mut claims = vec![app_claim];

        let old_h = problem.node_as[roll].location();
        for &neighbour in &problem.node_as[roll].neighbours {
            match problem.node_as[neighbour].try_claim() {
                Some(guard) => claims.push(guard),
                None => {
                    collisions += 1;
                    continue 'restart; // claims drop here, releasing all
                }
            }
        }

        let Some(old_contents) = problem.node_hs[old_h].try_lock_contents() else {
            collisions += 1;
            continue 'restart;
        };

        // Destination draw: redraw on contention without releasing the rest
        // of the lock set.
        let (sel_h, sel_contents) = loop {
            attempts += 1;
            if attempts == SELECTION_PATIENCE {
                problem.log(
                    "WARNING: Hardware node selection is taking a while. Try \
                     setting a larger value for pMax.",
                );
            }
            let sel_h = rng.random_range(0..problem.node_hs.len());
            if sel_h == old_h || problem.node_hs[sel_h].load() >= problem.p_max {
                continue;
            }
            match problem.node_hs[sel_h].try_lock_contents() {
                None => collisions += 1,
                Some(guard) => {
                    if guard.len() >= problem.p_max {
                        // Filled between the unlocked read and the lock.
                        collisions += 1;
                    } else {
                        break (sel_h, guard);
                    }
                }
            }
        };

        return SyncSelection {
            sel_a: roll,
            sel_h,
            old_h,
            collisions,
            old_contents,
            sel_contents,
            claims,
        };
    }
}

// ============================================================================
// Tests
// ============================================================================

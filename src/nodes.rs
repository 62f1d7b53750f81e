//! Node records for the application and hardware graphs.
//!
//! The two graphs are realised as flat arrays indexed by stable integer ids;
//! an application node's `location` is an index into the hardware array, and
//! a hardware node's `contents` is a list of indices into the application
//! array. This keeps each node's lock and transform counter co-located with
//! the data they protect and avoids smart-pointer cycles.
//!
//! Lock roles differ between the two graphs: application nodes carry a unit
//! *claim* mutex taken at selection time, whereas hardware nodes guard their
//! contents list with their mutex, taken at transformation time.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Counter recording how many transformations have touched a node.
///
/// Wrapping is fine: only counter *differences* over one iteration are ever
/// inspected, and wrapping all the way around within a single iteration is
/// not a realistic concern with few workers.
pub type TransformCount = u32;

/// Location value of an application node that has not been placed yet.
pub const UNPLACED: usize = usize::MAX;

// ============================================================================
// Application nodes
// ============================================================================

/// Node in the application graph.
pub struct AppNode {
    /// Human-readable node name, stable for the lifetime of the problem.
    pub name: String,
    /// Indices of neighbouring application nodes. Symmetric: `b` lists `a`
    /// whenever `a` lists `b`. Immutable once the problem is built.
    pub neighbours: Vec<usize>,
    /// Index of the hardware node currently hosting this application node.
    location: AtomicUsize,
    /// Claim token taken by selection in the parallel modes.
    claim: Mutex<()>,
    transform_count: AtomicU32,
}

impl AppNode {
    /// Creates an unplaced application node with no neighbours.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            neighbours: Vec::new(),
            location: AtomicUsize::new(UNPLACED),
            claim: Mutex::new(()),
            transform_count: AtomicU32::new(0),
        }
    }

    /// Index of the hardware node currently hosting this node.
    ///
    /// In the semi-asynchronous mode this read may be stale.
    #[inline]
    pub fn location(&self) -> usize {
        self.location.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_location(&self, hw_index: usize) {
        self.location.store(hw_index, Ordering::Release);
    }

    /// Attempts to claim this node for one iteration without blocking.
    ///
    /// The returned guard must be held until the iteration's accept/revert
    /// decision has been applied.
    #[inline]
    pub fn try_claim(&self) -> Option<MutexGuard<'_, ()>> {
        self.claim.try_lock()
    }

    /// Current transform counter (acquire load).
    #[inline]
    pub fn transform_count(&self) -> TransformCount {
        self.transform_count.load(Ordering::Acquire)
    }

    /// Records that a transformation touched this node (release increment).
    #[inline]
    pub fn bump_transform_count(&self) {
        self.transform_count.fetch_add(1, Ordering::Release);
    }
}

// ============================================================================
// Hardware nodes
// ============================================================================

/// Node in the hardware graph.
pub struct HwNode {
    /// Human-readable node name, stable for the lifetime of the problem.
    pub name: String,
    /// Position of this node in the problem's hardware array.
    pub index: usize,
    /// Optional horizontal plotting position; `-1.0` when undefined.
    pub pos_horiz: f32,
    /// Optional vertical plotting position; `-1.0` when undefined.
    pub pos_verti: f32,
    /// Application node indices currently mapped here, guarded by this
    /// node's lock.
    contents: Mutex<Vec<usize>>,
    /// Mirror of `contents.len()`, readable without the lock. The
    /// semi-asynchronous selector reads capacity without locking and
    /// tolerates staleness; the mirror is what makes that read possible
    /// without widening the lock scope.
    load: AtomicUsize,
    transform_count: AtomicU32,
}

impl HwNode {
    /// Creates a hardware node with no plotting position.
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self::with_position(name, index, -1.0, -1.0)
    }

    /// Creates a hardware node with a 2-D plotting position.
    pub fn with_position(
        name: impl Into<String>,
        index: usize,
        pos_horiz: f32,
        pos_verti: f32,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            pos_horiz,
            pos_verti,
            contents: Mutex::new(Vec::new()),
            load: AtomicUsize::new(0),
            transform_count: AtomicU32::new(0),
        }
    }

    /// Number of application nodes currently mapped here, without locking.
    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Locks and returns the contents list. Setup and reporting only; the
    /// annealing hot path uses [`HwNode::try_lock_contents`].
    #[inline]
    pub fn lock_contents(&self) -> MutexGuard<'_, Vec<usize>> {
        self.contents.lock()
    }

    /// Attempts to lock the contents list without blocking.
    #[inline]
    pub fn try_lock_contents(&self) -> Option<MutexGuard<'_, Vec<usize>>> {
        self.contents.try_lock()
    }

    /// Copies the current contents out under the lock.
    pub fn contents_snapshot(&self) -> Vec<usize> {
        self.contents.lock().clone()
    }

    /// Refreshes the unlocked load mirror. Callers must hold the contents
    /// lock for `len` to be meaningful.
    #[inline]
    pub(crate) fn store_load(&self, len: usize) {
        self.load.store(len, Ordering::Release);
    }

    /// Current transform counter (acquire load).
    #[inline]
    pub fn transform_count(&self) -> TransformCount {
        self.transform_count.load(Ordering::Acquire)
    }

    /// Records that a transformation touched this node (release increment).
    #[inline]
    pub fn bump_transform_count(&self) {
        self.transform_count.fetch_add(1, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_node_starts_unplaced() {
        let node = AppNode::new("a0");
        assert_eq!(node.location(), UNPLACED);
        assert_eq!(node.transform_count(), 0);
        assert!(node.neighbours.is_empty());
    }

    #[test]
    fn claim_is_exclusive() {
        let node = AppNode::new("a0");
        let guard = node.try_claim().expect("first claim should succeed");
        assert!(node.try_claim().is_none(), "second claim must fail");
        drop(guard);
        assert!(node.try_claim().is_some(), "claim must be reusable");
    }

    #[test]
    fn hw_node_defaults_have_no_position() {
        let node = HwNode::new("h0", 3);
        assert_eq!(node.index, 3);
        assert!((node.pos_horiz - -1.0).abs() < f32::EPSILON);
        assert!((node.pos_verti - -1.0).abs() < f32::EPSILON);
        assert_eq!(node.load(), 0);
    }

    #[test]
    fn load_mirror_tracks_contents() {
        let node = HwNode::new("h0", 0);
        {
            let mut contents = node.lock_contents();
            contents.push(7);
            contents.push(9);
            let len = contents.len();
            node.store_load(len);
        }
        assert_eq!(node.load(), 2);
        assert_eq!(node.contents_snapshot(), vec![7, 9]);
    }

    #[test]
    fn transform_count_wraps_without_panicking() {
        let node = HwNode::new("h0", 0);
        node.transform_count.store(TransformCount::MAX, Ordering::Relaxed);
        node.bump_transform_count();
        assert_eq!(node.transform_count(), 0);
    }
}

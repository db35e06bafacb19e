// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Flattened table of affinity instances, with the lookups, locking and state propagation built on
//! top of it.

use super::{TopologyDescription, affinity_state::AffinityState};
use arm_psci::{ErrorCode, HwState};
use arm_sysregs::MpidrEl1;
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    sync::atomic::{AtomicU8, Ordering},
};
use log::info;
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// The highest affinity level which can be encoded in an MPIDR value.
pub const MPIDR_MAX_AFFINITY_LEVEL: usize = 3;

/// The bits of an MPIDR value which identify a core.
pub const MPIDR_AFFINITY_MASK: u64 = (MpidrEl1::AFF0_MASK << MpidrEl1::AFF0_SHIFT)
    | (MpidrEl1::AFF1_MASK << MpidrEl1::AFF1_SHIFT)
    | (MpidrEl1::AFF2_MASK << MpidrEl1::AFF2_SHIFT)
    | (MpidrEl1::AFF3_MASK << MpidrEl1::AFF3_SHIFT);

const AFFINITY_FIELD_MASK: u64 = MpidrEl1::AFF0_MASK;
const AFFINITY_FIELD_SHIFTS: [u32; MPIDR_MAX_AFFINITY_LEVEL + 1] = [
    MpidrEl1::AFF0_SHIFT,
    MpidrEl1::AFF1_SHIFT,
    MpidrEl1::AFF2_SHIFT,
    MpidrEl1::AFF3_SHIFT,
];

/// Returns a copy of `mpidr` with the affinity field of `level` replaced by `value`.
///
/// `value` is truncated to the width of an affinity field.
pub fn with_field(mpidr: MpidrEl1, level: usize, value: usize) -> MpidrEl1 {
    assert!(
        level <= MPIDR_MAX_AFFINITY_LEVEL,
        "Invalid affinity level {level}"
    );
    let shift = AFFINITY_FIELD_SHIFTS[level];
    let field = (value as u64 & AFFINITY_FIELD_MASK) << shift;
    MpidrEl1::from_bits_retain((mpidr.bits() & !(AFFINITY_FIELD_MASK << shift)) | field)
}

/// Returns the affinity bits of `mpidr` which name its instance at `level`, i.e. with the fields of
/// all lower levels and all non-affinity bits cleared.
fn instance_id(mpidr: MpidrEl1, level: usize) -> u64 {
    let fields = [mpidr.aff0(), mpidr.aff1(), mpidr.aff2(), mpidr.aff3()];
    (level..=MPIDR_MAX_AFFINITY_LEVEL)
        .fold(MpidrEl1::empty(), |id, upper| with_field(id, upper, fields[upper].into()))
        .bits()
}

/// Busy-waiting lock of a single affinity node.
///
/// Any operation holding more than one of these must have acquired them in ascending order of
/// affinity level and must release them in the reverse order. [`LockedPath`] is the only place
/// that holds several of them, and it checks the order as it goes.
pub struct AffinityLock {
    inner: SpinMutex<()>,
}

impl AffinityLock {
    const fn new() -> Self {
        Self {
            inner: SpinMutex::new(()),
        }
    }

    /// Spins until the lock is free, then takes it. It is released when the guard is dropped.
    pub fn acquire(&self) -> AffinityLockGuard<'_> {
        AffinityLockGuard {
            _guard: self.inner.lock(),
        }
    }

    /// Returns whether some core currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Proof of holding an [`AffinityLock`].
pub struct AffinityLockGuard<'a> {
    _guard: SpinMutexGuard<'a, ()>,
}

/// One affinity instance, i.e. a core, cluster or higher level grouping of cores.
pub struct AffinityNode {
    /// MPIDR affinity bits naming this instance, with the fields of lower levels cleared.
    mpidr: MpidrEl1,
    level: usize,
    present: bool,
    /// Number of possible instances one level below, present or not.
    child_count: usize,
    /// Raw `AffinityState`. It's only written with `lock` held, but may be read without it.
    state: AtomicU8,
    lock: AffinityLock,
}

impl AffinityNode {
    fn new(mpidr: MpidrEl1, level: usize, present: bool, child_count: usize) -> Self {
        Self {
            mpidr,
            level,
            present,
            child_count,
            state: AtomicU8::new(AffinityState::Off.into()),
            lock: AffinityLock::new(),
        }
    }

    /// Returns the MPIDR affinity bits which name this instance.
    pub fn mpidr(&self) -> MpidrEl1 {
        self.mpidr
    }

    /// Returns the affinity level of the instance, 0 being a core.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Returns whether the instance is present on this platform.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Returns the current logical state.
    pub fn state(&self) -> AffinityState {
        AffinityState::try_from(self.state.load(Ordering::Acquire))
            .expect("Affinity node state corrupted")
    }

    /// Returns the conservative physical view of the logical state.
    pub fn physical_state(&self) -> HwState {
        self.state().physical_state()
    }

    /// Returns the lock which serialises state changes of this node.
    pub fn lock(&self) -> &AffinityLock {
        &self.lock
    }

    pub(super) fn set_state(&self, state: AffinityState) {
        self.state.store(state.into(), Ordering::Release);
    }
}

impl Debug for AffinityNode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("AffinityNode")
            .field("mpidr", &format_args!("{:#x}", self.mpidr.bits()))
            .field("level", &self.level)
            .field("present", &self.present)
            .field("state", &self.state())
            .finish()
    }
}

/// The locks held along the ancestor chain of a core, lowest level first.
///
/// Locks are added bottom-up and released top-down when the path is dropped.
pub struct LockedPath<'a> {
    levels: ArrayVec<(&'a AffinityNode, AffinityLockGuard<'a>), { MPIDR_MAX_AFFINITY_LEVEL + 1 }>,
}

impl<'a> LockedPath<'a> {
    pub(super) fn new() -> Self {
        Self {
            levels: ArrayVec::new(),
        }
    }

    /// Spins until the lock of `node` is acquired and adds it to the path.
    ///
    /// # Panics
    ///
    /// Panics if `node` isn't above every node already on the path, as that could deadlock against
    /// another core walking the same branch.
    pub(super) fn push(&mut self, node: &'a AffinityNode) {
        if let Some((top, _)) = self.levels.last() {
            assert!(
                node.level > top.level,
                "Affinity lock for level {} taken after level {}",
                node.level,
                top.level
            );
        }
        let guard = node.lock.acquire();
        self.levels.push((node, guard));
    }

    /// Returns the locked nodes, lowest level first.
    pub fn nodes(&self) -> impl Iterator<Item = &'a AffinityNode> + '_ {
        self.levels.iter().map(|(node, _)| *node)
    }

    /// Returns the number of locks held.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Returns whether no locks are held.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl Drop for LockedPath<'_> {
    fn drop(&mut self) {
        // Release in the reverse order of acquisition.
        while self.levels.pop().is_some() {}
    }
}

/// Position of the nodes of one affinity level in the flattened table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AffinityLevelRange {
    start: usize,
    end: usize,
}

impl AffinityLevelRange {
    /// Index of the first node of the level.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Index one past the last node of the level.
    pub fn end(&self) -> usize {
        self.end
    }

    fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Every affinity instance of the platform, stored level by level from the highest level down.
///
/// Within a level the nodes are sorted by MPIDR, so a node is found by a binary search within its
/// level's range. `N` is the capacity of the table. The table is built once at boot and never
/// reallocated.
pub struct AffinityTree<const N: usize> {
    nodes: ArrayVec<AffinityNode, N>,
    level_ranges: [AffinityLevelRange; MPIDR_MAX_AFFINITY_LEVEL + 1],
    max_level: usize,
}

impl<const N: usize> AffinityTree<N> {
    /// Builds the table from the platform topology description, with every node `Off`.
    ///
    /// Instances are numbered from 0 upwards at every level, in the MPIDR field of that level.
    pub fn new(topology: &impl TopologyDescription) -> Self {
        let max_level = topology.max_affinity_level();
        assert!(
            max_level <= MPIDR_MAX_AFFINITY_LEVEL,
            "Platform max affinity level {max_level} is above {MPIDR_MAX_AFFINITY_LEVEL}"
        );

        let mut nodes = ArrayVec::new();
        let mut level_ranges = [AffinityLevelRange::default(); MPIDR_MAX_AFFINITY_LEVEL + 1];
        // Breadth first, so each level's nodes are contiguous and in ascending MPIDR order.
        for level in (0..=max_level).rev() {
            let start = nodes.len();
            Self::add_level(topology, &mut nodes, MpidrEl1::empty(), max_level, level);
            level_ranges[level] = AffinityLevelRange {
                start,
                end: nodes.len(),
            };
        }

        info!(
            "Affinity topology has {} nodes in {} levels",
            nodes.len(),
            max_level + 1
        );

        Self {
            nodes,
            level_ranges,
            max_level,
        }
    }

    /// Adds the nodes at `target_level` below the instance named by the fields of `mpidr` above
    /// `current_level`.
    fn add_level(
        topology: &impl TopologyDescription,
        nodes: &mut ArrayVec<AffinityNode, N>,
        mpidr: MpidrEl1,
        current_level: usize,
        target_level: usize,
    ) {
        let count = topology.affinity_count(current_level, mpidr);
        assert_ne!(
            count,
            0,
            "No level {current_level} instances in {:#x}",
            mpidr.bits()
        );

        for instance in 0..count {
            let mpidr = with_field(mpidr, current_level, instance);
            if current_level > target_level {
                Self::add_level(topology, nodes, mpidr, current_level - 1, target_level);
            } else {
                let child_count = match current_level {
                    0 => 0,
                    level => topology.affinity_count(level - 1, mpidr),
                };
                assert!(!nodes.is_full(), "Affinity table capacity {N} exceeded");
                nodes.push(AffinityNode::new(
                    mpidr,
                    current_level,
                    topology.is_present(current_level, mpidr),
                    child_count,
                ));
            }
        }
    }

    /// Returns the deepest affinity level implemented by the platform.
    pub fn max_affinity_level(&self) -> usize {
        self.max_level
    }

    /// Returns where the nodes of `level` are stored in the table.
    pub fn level_range(&self, level: usize) -> Option<AffinityLevelRange> {
        (level <= self.max_level).then(|| self.level_ranges[level])
    }

    /// Returns all the nodes of `level`, in ascending MPIDR order.
    pub fn nodes_at_level(&self, level: usize) -> &[AffinityNode] {
        match self.level_range(level) {
            Some(range) => &self.nodes[range.as_range()],
            None => &[],
        }
    }

    /// Checks that `start..=end` is a non-empty range of levels implemented by the platform.
    pub fn check_level_range(&self, start: usize, end: usize) -> Result<(), ErrorCode> {
        if end > self.max_level || end < start {
            return Err(ErrorCode::InvalidParameters);
        }
        Ok(())
    }

    /// Finds the node of the instance at `level` which contains the core `mpidr`.
    ///
    /// Returns `None` if the table has no such instance, and fails if `level` is above the
    /// platform's max level.
    pub fn locate(
        &self,
        mpidr: MpidrEl1,
        level: usize,
    ) -> Result<Option<&AffinityNode>, ErrorCode> {
        if level > self.max_level {
            return Err(ErrorCode::InvalidParameters);
        }

        let key = instance_id(mpidr, level);
        let nodes = self.nodes_at_level(level);
        Ok(nodes
            .binary_search_by_key(&key, |node| node.mpidr.bits())
            .ok()
            .map(|index| &nodes[index]))
    }

    /// Succeeds if the instance at `level` containing `mpidr` exists and is present.
    pub fn validate(&self, mpidr: MpidrEl1, level: usize) -> Result<(), ErrorCode> {
        match self.locate(mpidr, level)? {
            Some(node) if node.present => Ok(()),
            _ => Err(ErrorCode::InvalidParameters),
        }
    }

    /// Returns the logical state of the instance at `level` containing `mpidr`.
    ///
    /// Fails with `NotPresent` if the instance is known but absent on this platform.
    pub fn node_state(&self, mpidr: MpidrEl1, level: usize) -> Result<AffinityState, ErrorCode> {
        match self.locate(mpidr, level)? {
            Some(node) if node.present => Ok(node.state()),
            Some(_) => Err(ErrorCode::NotPresent),
            None => Err(ErrorCode::InvalidParameters),
        }
    }

    /// Walks the levels from `start` to `end` and returns the first one at which the instance
    /// containing `mpidr` is present.
    ///
    /// The walk ascends if `start <= end` and descends otherwise. Returns `None` if no level in the
    /// range has a present instance, which is valid on platforms with absent intermediate levels.
    pub fn first_present_level(
        &self,
        mpidr: MpidrEl1,
        start: usize,
        end: usize,
    ) -> Result<Option<usize>, ErrorCode> {
        if start > self.max_level || end > self.max_level {
            return Err(ErrorCode::InvalidParameters);
        }

        let is_present = |level: &usize| {
            matches!(self.locate(mpidr, *level), Ok(Some(node)) if node.present)
        };
        Ok(if start <= end {
            (start..=end).find(is_present)
        } else {
            (end..=start).rev().find(is_present)
        })
    }

    /// Returns the present nodes on the path from level `start` up to level `end` of the core
    /// `mpidr`, lowest level first.
    ///
    /// Absent levels above the core are skipped, but the core itself must be present if it is part
    /// of the range.
    pub fn path_nodes(
        &self,
        mpidr: MpidrEl1,
        start: usize,
        end: usize,
    ) -> Result<ArrayVec<&AffinityNode, { MPIDR_MAX_AFFINITY_LEVEL + 1 }>, ErrorCode> {
        self.check_level_range(start, end)?;

        let mut path = ArrayVec::new();
        for level in start..=end {
            let node = self
                .locate(mpidr, level)?
                .ok_or(ErrorCode::InvalidParameters)?;
            if node.present {
                path.push(node);
            } else if level == 0 {
                return Err(ErrorCode::InvalidParameters);
            }
        }
        Ok(path)
    }

    /// Locks the present nodes on the path from level `start` up to level `end` of the core
    /// `mpidr`, runs the closure and unlocks the nodes.
    ///
    /// The locks are always acquired from the lowest level to the highest and released in the
    /// reverse order, so cores coordinating over overlapping branches can't deadlock.
    pub fn with_path_locked<F, T>(
        &self,
        mpidr: MpidrEl1,
        start: usize,
        end: usize,
        f: F,
    ) -> Result<T, ErrorCode>
    where
        F: FnOnce(&LockedPath<'_>) -> T,
    {
        let nodes = self.path_nodes(mpidr, start, end)?;
        let mut path = LockedPath::new();
        for node in nodes {
            path.push(node);
        }
        Ok(f(&path))
    }

    /// Returns the node at `level` containing `mpidr`, which the caller knows to exist.
    ///
    /// # Panics
    ///
    /// Panics if there is no such node, as the topology table is then inconsistent with the
    /// caller's view of it.
    pub(super) fn expect_node(&self, mpidr: MpidrEl1, level: usize) -> &AffinityNode {
        match self.locate(mpidr, level) {
            Ok(Some(node)) => node,
            _ => panic!(
                "No level {level} affinity node for MPIDR {:#x}",
                mpidr.bits()
            ),
        }
    }

    /// Computes the state of a non-core node from the current states of its present children.
    ///
    /// # Panics
    ///
    /// Panics if `node` is a core, or if one of its children is missing from the table.
    pub fn aggregate(&self, node: &AffinityNode) -> AffinityState {
        assert!(node.level > 0, "Can't aggregate the state of a core");

        let child_level = node.level - 1;
        AffinityState::aggregate((0..node.child_count).filter_map(|instance| {
            let child_mpidr = with_field(node.mpidr, child_level, instance);
            let child = self.expect_node(child_mpidr, child_level);
            child.present.then(|| child.state())
        }))
    }

    /// Sets the state of the core `mpidr` to `state` if `current_level` is 0, then recomputes the
    /// state of every ancestor level up to `target_level` from its children.
    ///
    /// Above level 0 `state` is ignored, as the state of those levels is always derived from the
    /// cores. Absent levels are skipped. The caller must hold the locks of the affected nodes.
    ///
    /// # Panics
    ///
    /// Panics if a level in the range has no node for `mpidr`.
    pub fn change_state(
        &self,
        mpidr: MpidrEl1,
        current_level: usize,
        target_level: usize,
        state: AffinityState,
    ) -> Result<(), ErrorCode> {
        self.check_level_range(current_level, target_level)?;

        for level in current_level..=target_level {
            let node = self.expect_node(mpidr, level);
            if !node.present {
                continue;
            }

            let new_state = if level == 0 {
                state
            } else {
                self.aggregate(node)
            };
            node.set_state(new_state);
        }

        Ok(())
    }
}

impl<const N: usize> Debug for AffinityTree<N> {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, node) in self.nodes.iter().enumerate() {
            let lock = if node.lock.is_locked() { " locked" } else { "" };
            writeln!(f, "N{index} [label=\"{node:?}{lock}\"]")?;

            if node.level < self.max_level {
                let parent_range = self.level_ranges[node.level + 1];
                let parent_key = instance_id(node.mpidr, node.level + 1);
                if let Some(parent) = self.nodes[parent_range.as_range()]
                    .iter()
                    .position(|parent| parent.mpidr.bits() == parent_key)
                {
                    writeln!(f, "N{} -> N{index}", parent_range.start + parent)?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

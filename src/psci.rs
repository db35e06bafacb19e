// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Power state coordination across the affinity topology.
//!
//! [`Psci`] owns the affinity table and the per-core resume contexts, and provides the bookkeeping
//! behind `CPU_ON`, `CPU_SUSPEND`, `CPU_OFF`, `AFFINITY_INFO` and `NODE_HW_STATE`, as well as the
//! warm boot path of a core which has just been powered on.

mod affinity_state;
mod affinity_tree;
mod power_on;
mod resume_context;

pub use self::{
    affinity_state::AffinityState,
    affinity_tree::{
        AffinityLevelRange, AffinityLock, AffinityLockGuard, AffinityNode, AffinityTree,
        LockedPath, MPIDR_AFFINITY_MASK, MPIDR_MAX_AFFINITY_LEVEL, with_field,
    },
    resume_context::{ActiveConfiguration, RegisterWidth, ResumeContext, ResumeContextStore},
};
use crate::{
    context::{CpuContext, with_cpu_context},
    platform::{Platform, PlatformImpl, PowerPlatformImpl},
};
use arm_psci::{AffinityInfo, EntryPoint, ErrorCode, HwState, Mpidr};
use arm_sysregs::{MpidrEl1, read_mpidr_el1};
use core::fmt::{self, Debug, Formatter};
use log::info;
use spin::mutex::SpinMutex;

/// Capacity of the platform's affinity table.
pub const AFFINITY_NODE_COUNT: usize =
    <PowerPlatformImpl as PowerPlatformInterface>::AFFINITY_NODE_COUNT;

/// The affinity table of the selected platform.
pub type PlatformAffinityTree = AffinityTree<AFFINITY_NODE_COUNT>;

/// Platform work done at one affinity level when a core has been powered on.
///
/// Called with the level's node locked, along with the nodes of every present level below it on
/// the core's path, and with the node's state from before the power on.
pub type PowerOnFinisher = fn(
    mpidr: MpidrEl1,
    node: &AffinityNode,
    previous_state: AffinityState,
) -> Result<(), ErrorCode>;

/// Shape of a platform's affinity topology.
///
/// Instances are numbered from 0 at every level, in the MPIDR affinity field of that level.
pub trait TopologyDescription {
    /// Returns the highest affinity level of the platform.
    fn max_affinity_level(&self) -> usize;

    /// Returns the number of instances at `level` within the parent instance named by the fields
    /// of `mpidr` above `level`. For the max level this is the number of top level instances.
    fn affinity_count(&self, level: usize, mpidr: MpidrEl1) -> usize;

    /// Returns whether the instance at `level` named by `mpidr` is present on this platform.
    fn is_present(&self, level: usize, mpidr: MpidrEl1) -> bool;
}

/// Power controller interface of a platform.
pub trait PowerPlatformInterface: TopologyDescription {
    /// Number of nodes in the affinity table, i.e. the number of instances at all levels.
    const AFFINITY_NODE_COUNT: usize;

    /// Returns the finisher of every affinity level, indexed by level.
    fn power_on_finishers(&self) -> &[PowerOnFinisher];

    /// Asks the power controller to power on the given core.
    fn power_on(&self, mpidr: MpidrEl1) -> Result<(), ErrorCode>;
}

/// Main structure of the power state coordination, shared by all cores.
pub struct Psci {
    platform: PowerPlatformImpl,
    tree: PlatformAffinityTree,
    resume_contexts: ResumeContextStore<{ PlatformImpl::CORE_COUNT }>,
    /// Highest level affected by each core's pending suspend, if any.
    suspend_levels: [SpinMutex<Option<usize>>; PlatformImpl::CORE_COUNT],
    config: ActiveConfiguration,
}

impl Psci {
    /// Builds the affinity table and marks the path of the primary core `primary` as on.
    ///
    /// This should be called exactly once, on the primary core, before any secondary core is
    /// started.
    pub fn new(
        platform: PowerPlatformImpl,
        primary: MpidrEl1,
        config: ActiveConfiguration,
    ) -> Self {
        let tree = PlatformAffinityTree::new(&platform);
        let max_level = tree.max_affinity_level();

        tree.with_path_locked(primary, 0, max_level, |_path| {
            tree.change_state(primary, 0, max_level, AffinityState::On)
        })
        .and_then(|result| result)
        .unwrap_or_else(|error| {
            panic!(
                "Primary core {:#x} not in affinity topology: {error:?}",
                primary.bits()
            )
        });
        info!("Primary core {:#x} marked on", primary.bits());

        Self {
            platform,
            tree,
            resume_contexts: ResumeContextStore::new(),
            suspend_levels: [const { SpinMutex::new(None) }; PlatformImpl::CORE_COUNT],
            config,
        }
    }

    /// Returns the affinity table.
    pub fn tree(&self) -> &PlatformAffinityTree {
        &self.tree
    }

    /// Handles `CPU_ON` for the core `target_cpu`, which will start at `entry` once powered on.
    ///
    /// Fails with `AlreadyOn` if the core is on or suspended and with `OnPending` if it is already
    /// being powered on.
    pub fn cpu_on(&self, target_cpu: Mpidr, entry: EntryPoint) -> Result<(), ErrorCode> {
        let mpidr = MpidrEl1::from_psci_mpidr(target_cpu.into());
        let cpu_index = core_index(mpidr).ok_or(ErrorCode::InvalidParameters)?;
        self.tree.validate(mpidr, 0)?;
        let max_level = self.tree.max_affinity_level();

        self.tree.with_path_locked(mpidr, 0, max_level, |_path| {
            match self.tree.node_state(mpidr, 0)? {
                AffinityState::On | AffinityState::Suspend => return Err(ErrorCode::AlreadyOn),
                AffinityState::OnPending => return Err(ErrorCode::OnPending),
                // The core is off, so carry on.
                AffinityState::Off => {}
            }

            self.resume_contexts.stash(
                cpu_index,
                entry.entry_point_address(),
                entry.context_id(),
                &self.config,
            )?;

            if let Err(error) = self.platform.power_on(mpidr) {
                self.resume_contexts.discard(cpu_index);
                return Err(error);
            }

            self.tree
                .change_state(mpidr, 0, max_level, AffinityState::OnPending)
        })?
    }

    /// Handles the bookkeeping of `CPU_SUSPEND` to a power down state, for the calling core
    /// `mpidr`.
    ///
    /// Levels from the core up to `power_level` are marked as suspended, and the core will resume
    /// at `entry`.
    pub fn cpu_suspend(
        &self,
        mpidr: MpidrEl1,
        power_level: usize,
        entry: EntryPoint,
    ) -> Result<(), ErrorCode> {
        let cpu_index = core_index(mpidr).ok_or(ErrorCode::InvalidParameters)?;
        self.tree.validate(mpidr, 0)?;
        self.tree.check_level_range(0, power_level)?;

        self.tree.with_path_locked(mpidr, 0, power_level, |_path| {
            if self.tree.node_state(mpidr, 0)? != AffinityState::On {
                return Err(ErrorCode::Denied);
            }

            self.resume_contexts.stash(
                cpu_index,
                entry.entry_point_address(),
                entry.context_id(),
                &self.config,
            )?;
            *self.suspend_levels[cpu_index].lock() = Some(power_level);

            self.tree
                .change_state(mpidr, 0, power_level, AffinityState::Suspend)
        })?
    }

    /// Handles the bookkeeping of `CPU_OFF` for the calling core `mpidr`.
    pub fn cpu_off(&self, mpidr: MpidrEl1) -> Result<(), ErrorCode> {
        self.tree.validate(mpidr, 0)?;
        let max_level = self.tree.max_affinity_level();

        self.tree.with_path_locked(mpidr, 0, max_level, |_path| {
            if self.tree.node_state(mpidr, 0)? != AffinityState::On {
                return Err(ErrorCode::Denied);
            }

            self.tree.change_state(mpidr, 0, max_level, AffinityState::Off)
        })?
    }

    /// Returns the highest level which the core `mpidr` has to finish powering on.
    ///
    /// This is the max level for a core being turned on, and the suspend level for a core resuming
    /// from suspend.
    ///
    /// # Panics
    ///
    /// Panics if the core is neither being turned on nor suspended, since it shouldn't be running.
    pub fn power_on_target_level(&self, mpidr: MpidrEl1) -> usize {
        let state = self.tree.node_state(mpidr, 0).unwrap_or_else(|error| {
            panic!("Booting core {:#x} is not valid: {error:?}", mpidr.bits())
        });

        match state {
            AffinityState::OnPending => self.tree.max_affinity_level(),
            AffinityState::Suspend => {
                let cpu_index = core_index(mpidr)
                    .unwrap_or_else(|| panic!("Invalid booting core {:#x}", mpidr.bits()));
                let suspend_level = *self.suspend_levels[cpu_index].lock();
                suspend_level.unwrap_or_else(|| {
                    panic!("Suspended core {:#x} has no suspend level", mpidr.bits())
                })
            }
            AffinityState::On | AffinityState::Off => panic!(
                "Unexpected state {state:?} of booting core {:#x}",
                mpidr.bits()
            ),
        }
    }

    /// Must be called when a core is powered on, either for `CPU_ON` or to resume from suspend,
    /// before returning to the non-secure lower EL.
    ///
    /// Finishes the power on of every affected level and sets up the core's non-secure context to
    /// continue at the entry point it was given.
    pub fn handle_cpu_boot(&self) {
        let mpidr = read_mpidr_el1();
        with_cpu_context(|context| self.finish_cpu_boot(mpidr, context));
    }

    /// Finishes the power on of the core `mpidr`, and applies its resume context to `context`.
    ///
    /// # Panics
    ///
    /// Panics if a power on finisher fails, as the core can't be left half powered on.
    pub fn finish_cpu_boot(&self, mpidr: MpidrEl1, context: &mut CpuContext) {
        let cpu_index = core_index(mpidr)
            .unwrap_or_else(|| panic!("Invalid booting core {:#x}", mpidr.bits()));
        let target_level = self.power_on_target_level(mpidr);

        if let Err(error) =
            self.tree
                .power_on_finish(mpidr, 0, target_level, self.platform.power_on_finishers())
        {
            panic!(
                "Failed to finish power on of core {:#x}: {error:?}",
                mpidr.bits()
            );
        }
        self.suspend_levels[cpu_index].lock().take();

        self.resume_contexts.apply(cpu_index, context);
    }

    /// Handles `AFFINITY_INFO`.
    ///
    /// Only core level queries are supported. A suspended core is reported as on.
    pub fn affinity_info(
        &self,
        target_affinity: Mpidr,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        let mpidr = MpidrEl1::from_psci_mpidr(target_affinity.into());
        if core_index(mpidr).is_none() || lowest_affinity_level != 0 {
            return Err(ErrorCode::InvalidParameters);
        }

        Ok(self.tree.node_state(mpidr, 0)?.into())
    }

    /// Handles `NODE_HW_STATE`, returning the physical view of the instance at `power_level`
    /// containing `target_cpu`.
    pub fn node_hw_state(&self, target_cpu: Mpidr, power_level: u32) -> Result<HwState, ErrorCode> {
        let mpidr = MpidrEl1::from_psci_mpidr(target_cpu.into());
        if core_index(mpidr).is_none() {
            return Err(ErrorCode::InvalidParameters);
        }
        let level = usize::try_from(power_level).map_err(|_| ErrorCode::InvalidParameters)?;

        Ok(self.tree.node_state(mpidr, level)?.physical_state())
    }
}

impl Debug for Psci {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.tree.fmt(f)
    }
}

/// Returns the linear index of the core `mpidr`, or `None` if it isn't a valid core.
fn core_index(mpidr: MpidrEl1) -> Option<usize> {
    PlatformImpl::mpidr_is_valid(mpidr).then(|| PlatformImpl::core_position(mpidr))
}

/// Returns the corresponding linear core index for the given PSCI MPIDR value.
///
/// For any valid MPIDR this will return a unique value less than `Platform::CORE_COUNT`.
/// For any invalid MPIDR it will return `None`.
pub fn try_get_cpu_index_by_mpidr(psci_mpidr: Mpidr) -> Option<usize> {
    // The PSCI MPIDR value doesn't include the MT or U bits, but they might be important for how
    // the platform validates MPIDR values and calculates core position, so add them in.
    core_index(MpidrEl1::from_psci_mpidr(psci_mpidr.into()))
}

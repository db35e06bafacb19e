// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::{
    PowerOnFinisher,
    affinity_state::AffinityState,
    affinity_tree::{AffinityTree, LockedPath},
};
use arm_psci::ErrorCode;
use arm_sysregs::MpidrEl1;
use log::{debug, warn};

impl<const N: usize> AffinityTree<N> {
    /// Completes the power on of the core `mpidr`, which is now running, for the levels from
    /// `current_level` to `target_level`.
    ///
    /// For each present level in ascending order, locks the level's node and calls the level's
    /// finisher with the node's state from before the power on. All the locks are held until the
    /// last finisher has returned, then every level from the core up to `target_level` is marked
    /// `On` and the locks are released from the top down.
    ///
    /// If a finisher fails, the state of its level is put back the way it was, no higher level is
    /// visited and the error is returned. Levels below the failing one aren't rolled back.
    ///
    /// # Panics
    ///
    /// Panics if `finishers` has no entry for some level in the range, or if the core was finished
    /// but isn't `On` once every level has been finished.
    pub fn power_on_finish(
        &self,
        mpidr: MpidrEl1,
        current_level: usize,
        target_level: usize,
        finishers: &[PowerOnFinisher],
    ) -> Result<(), ErrorCode> {
        self.check_level_range(current_level, target_level)?;
        assert!(
            target_level < finishers.len(),
            "No power on finisher for level {target_level}"
        );

        let mut path = LockedPath::new();
        let mut level = current_level;
        while level <= target_level {
            let Some(present_level) = self.first_present_level(mpidr, level, target_level)? else {
                break;
            };

            let node = self.expect_node(mpidr, present_level);
            path.push(node);

            let previous_state = node.state();
            if let Err(error) = finishers[present_level](mpidr, node, previous_state) {
                node.set_state(previous_state);
                warn!(
                    "Level {present_level} power on finisher failed for {:#x}: {error:?}",
                    mpidr.bits()
                );
                return Err(error);
            }
            debug!("Finished level {present_level} power on for {:#x}", mpidr.bits());

            level = present_level + 1;
        }

        if path.is_empty() {
            // Nothing present between the two levels.
            return Ok(());
        }

        self.change_state(mpidr, 0, target_level, AffinityState::On)?;

        if let Some(core) = path.nodes().next().filter(|node| node.level() == 0) {
            let state = core.state();
            assert_eq!(
                AffinityState::On,
                state,
                "Core {:#x} not on after power on",
                mpidr.bits()
            );
        }

        Ok(())
    }
}

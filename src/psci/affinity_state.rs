// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Logical power states of affinity instances and the rules for combining them.

use arm_psci::{AffinityInfo, HwState};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Firmware bookkeeping view of the power state of an affinity instance.
///
/// The variants are declared in ascending order of how awake the instance is, which is the order
/// used when a parent's state is derived from its children.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive)]
#[repr(u8)]
pub enum AffinityState {
    /// Powered off.
    Off = 0,
    /// A power on request has been issued but the instance hasn't finished powering on yet.
    OnPending = 1,
    /// Suspended in a low power state, expected to resume.
    Suspend = 2,
    /// Running.
    On = 3,
}

impl AffinityState {
    /// Combines the states of the present children of an affinity instance into the state of the
    /// instance itself.
    ///
    /// A parent is as awake as its most awake present child: any `On` child makes it `On`,
    /// otherwise any `Suspend` child makes it `Suspend`, otherwise any `OnPending` child makes it
    /// `OnPending`. If every child is `Off`, or there are no present children at all, the result is
    /// `Off`.
    pub fn aggregate(children: impl IntoIterator<Item = Self>) -> Self {
        let mut aggregated = Self::Off;
        for state in children {
            if state == Self::On {
                return Self::On;
            }
            aggregated = aggregated.max(state);
        }
        aggregated
    }

    /// Returns the conservative physical view of the state.
    ///
    /// Only `On` is reported as on. `OnPending` and `Suspend` describe transitions whose physical
    /// completion can't be confirmed from bookkeeping alone, so they are reported as off.
    pub fn physical_state(self) -> HwState {
        match self {
            Self::On => HwState::On,
            Self::Off | Self::OnPending | Self::Suspend => HwState::Off,
        }
    }
}

impl From<AffinityState> for AffinityInfo {
    fn from(state: AffinityState) -> Self {
        match state {
            // A suspended core is still on as far as AFFINITY_INFO is concerned.
            AffinityState::On | AffinityState::Suspend => AffinityInfo::On,
            AffinityState::OnPending => AffinityInfo::OnPending,
            AffinityState::Off => AffinityInfo::Off,
        }
    }
}

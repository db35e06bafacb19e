// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-core state of the non-secure lower EL, as seen by EL3 on the way back out.

use crate::platform::{Platform, PlatformImpl, exception_free};
use arm_sysregs::{ScrEl3, SctlrEl1, SctlrEl2, SpsrEl3 as Spsr, read_mpidr_el1};
use core::cell::{RefCell, RefMut};
use percore::{Cores, ExceptionFree, ExceptionLock, PerCore};

/// Per-core mutable state.
pub type PerCoreState<T> =
    PerCore<[ExceptionLock<RefCell<T>>; PlatformImpl::CORE_COUNT], CoresImpl>;

/// Implementation of the `Cores` trait to get the index of the current CPU core.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position(read_mpidr_el1())
    }
}

/// The state a core will have in the non-secure lower EL after the next exception return.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CpuContext {
    /// General purpose registers `x0` to `x30`, plus one slot of padding.
    pub gpregs: GpRegs,
    /// EL3 registers which control the exception return.
    pub el3_state: El3State,
    /// Lower EL system registers which must be in a known state on entry.
    pub lower_el_sysregs: LowerElSysregs,
}

impl CpuContext {
    /// A context with every register zeroed.
    pub const EMPTY: Self = Self {
        gpregs: GpRegs::EMPTY,
        el3_state: El3State::EMPTY,
        lower_el_sysregs: LowerElSysregs::EMPTY,
    };
}

/// AArch64 general purpose register context.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct GpRegs {
    /// Register values, indexed by register number.
    pub registers: [u64; Self::COUNT],
}

impl GpRegs {
    /// The number of (64-bit) registers included in `GpRegs`.
    pub const COUNT: usize = 32;

    const EMPTY: Self = Self {
        registers: [0; Self::COUNT],
    };
}

/// EL3 registers used for the exception return to the lower EL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct El3State {
    /// Security state, execution state and routing of the lower ELs.
    pub scr_el3: ScrEl3,
    /// PSTATE to restore.
    pub spsr_el3: Spsr,
    /// Address to return to.
    pub elr_el3: usize,
}

impl El3State {
    const EMPTY: Self = Self {
        scr_el3: ScrEl3::empty(),
        spsr_el3: Spsr::empty(),
        elr_el3: 0,
    };
}

/// The lower EL system control registers.
///
/// Only one of them is used on entry: `sctlr_el2` if EL2 is implemented, otherwise `sctlr_el1`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LowerElSysregs {
    /// System control register for EL1.
    pub sctlr_el1: SctlrEl1,
    /// System control register for EL2.
    pub sctlr_el2: SctlrEl2,
}

impl LowerElSysregs {
    const EMPTY: Self = Self {
        sctlr_el1: SctlrEl1::empty(),
        sctlr_el2: SctlrEl2::empty(),
    };
}

static CPU_CONTEXT: PerCoreState<CpuContext> = PerCore::new(
    [const { ExceptionLock::new(RefCell::new(CpuContext::EMPTY)) }; PlatformImpl::CORE_COUNT],
);

/// Returns a reference to the non-secure `CpuContext` of the current core.
///
/// Panics if the `CpuContext` is already borrowed.
pub fn cpu_context(token: ExceptionFree) -> RefMut<CpuContext> {
    CPU_CONTEXT.get().borrow_mut(token)
}

/// Runs the given function on the current core's non-secure context with exceptions masked.
pub fn with_cpu_context<T>(f: impl FnOnce(&mut CpuContext) -> T) -> T {
    exception_free(|token| f(&mut cpu_context(token)))
}

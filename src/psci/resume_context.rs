// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Where and how each core continues in the non-secure lower EL once it is running again.

use crate::context::CpuContext;
use arm_psci::ErrorCode;
use arm_sysregs::{
    ScrEl3, SctlrEl1, SctlrEl2, SpsrEl3 as Spsr, read_id_aa64pfr0_el1, read_scr_el3, read_sctlr_el1,
    read_sctlr_el2,
};
use log::debug;
use spin::mutex::SpinMutex;

const SCTLR_M_BIT: u64 = 1 << 0;
const SCTLR_C_BIT: u64 = 1 << 2;
const SCTLR_EE_BIT: u64 = 1 << 25;

// AArch32 PSTATE fields.
const SPSR_MODE32_SVC: u64 = 0b1_0011;
const SPSR_MODE32_HYP: u64 = 0b1_1010;
const SPSR_T_BIT: u64 = 1 << 5;
const SPSR_E_BIT: u64 = 1 << 9;

/// Execution state of the non-secure lower EL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterWidth {
    /// AArch32 execution state.
    AArch32,
    /// AArch64 execution state.
    AArch64,
}

/// How the non-secure lower EL is currently configured to run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActiveConfiguration {
    /// Execution state of the next lower EL, from `SCR_EL3.RW`.
    pub width: RegisterWidth,
    /// Whether EL2 is implemented.
    pub el2_implemented: bool,
    /// Whether the hypervisor call instruction is enabled, from `SCR_EL3.HCE`.
    pub hyp_enabled: bool,
    /// Endianness of EL1, from `SCTLR_EL1.EE`.
    pub el1_big_endian: bool,
    /// Endianness of EL2, from `SCTLR_EL2.EE`.
    pub el2_big_endian: bool,
}

impl ActiveConfiguration {
    /// Reads the configuration from the system registers of the current core.
    pub fn current() -> Self {
        let scr_el3 = read_scr_el3();
        let el2_implemented = read_id_aa64pfr0_el1().el2() != 0;
        Self {
            width: if scr_el3.contains(ScrEl3::RW) {
                RegisterWidth::AArch64
            } else {
                RegisterWidth::AArch32
            },
            el2_implemented,
            hyp_enabled: scr_el3.contains(ScrEl3::HCE),
            el1_big_endian: read_sctlr_el1().bits() & SCTLR_EE_BIT != 0,
            el2_big_endian: el2_implemented && read_sctlr_el2().bits() & SCTLR_EE_BIT != 0,
        }
    }

    /// Returns whether the core enters the lower EL in EL2 (or Hyp mode) rather than EL1.
    fn enters_el2(&self) -> bool {
        self.el2_implemented && self.hyp_enabled
    }
}

/// Everything needed to start executing in the non-secure lower EL after a power on or resume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResumeContext {
    entry_point: u64,
    context_id: u64,
    width: RegisterWidth,
    spsr: Spsr,
    /// Whether the core resumes in EL2 (or Hyp mode) rather than EL1.
    enters_el2: bool,
    big_endian: bool,
}

impl ResumeContext {
    /// Works out the resume state for entering at `entry_point` with the given configuration.
    ///
    /// Fails with `InvalidParameters` if `entry_point` is a Thumb address but the lower EL is
    /// AArch64.
    pub fn new(
        entry_point: u64,
        context_id: u64,
        config: &ActiveConfiguration,
    ) -> Result<Self, ErrorCode> {
        let enters_el2 = config.enters_el2();
        let big_endian = if enters_el2 {
            config.el2_big_endian
        } else {
            config.el1_big_endian
        };

        let spsr = match config.width {
            RegisterWidth::AArch64 => {
                if entry_point & 1 != 0 {
                    return Err(ErrorCode::InvalidParameters);
                }
                let mode = if enters_el2 {
                    Spsr::M_AARCH64_EL2H
                } else {
                    Spsr::M_AARCH64_EL1H
                };
                Spsr::D | Spsr::A | Spsr::I | Spsr::F | mode
            }
            RegisterWidth::AArch32 => {
                let mut bits = if enters_el2 {
                    SPSR_MODE32_HYP
                } else {
                    SPSR_MODE32_SVC
                };
                if entry_point & 1 != 0 {
                    bits |= SPSR_T_BIT;
                }
                if big_endian {
                    bits |= SPSR_E_BIT;
                }
                Spsr::A | Spsr::I | Spsr::F | Spsr::from_bits_retain(bits)
            }
        };

        Ok(Self {
            entry_point,
            context_id,
            width: config.width,
            spsr,
            enters_el2,
            big_endian,
        })
    }

    /// Returns the address execution resumes at.
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// Returns the value passed to the lower EL in `x0`.
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Returns the PSTATE the lower EL starts with.
    pub fn spsr(&self) -> Spsr {
        self.spsr
    }

    /// Returns the execution state the lower EL starts in.
    pub fn width(&self) -> RegisterWidth {
        self.width
    }

    /// Writes the resume state into `context`, ready for the exception return.
    ///
    /// The lower EL starts with its MMU and data cache off, and with every general purpose register
    /// except `x0` holding an all-ones pattern so nothing from EL3 leaks through them. Only the
    /// system control register of the EL being entered is changed.
    pub fn apply(&self, context: &mut CpuContext) {
        let el3_state = &mut context.el3_state;
        el3_state.scr_el3 |= ScrEl3::NS;
        el3_state
            .scr_el3
            .set(ScrEl3::RW, self.width == RegisterWidth::AArch64);
        el3_state.elr_el3 = self.entry_point as usize;
        el3_state.spsr_el3 = self.spsr;

        let sysregs = &mut context.lower_el_sysregs;
        if self.enters_el2 {
            sysregs.sctlr_el2 =
                SctlrEl2::from_bits_retain(self.sctlr_bits(sysregs.sctlr_el2.bits()));
        } else {
            sysregs.sctlr_el1 =
                SctlrEl1::from_bits_retain(self.sctlr_bits(sysregs.sctlr_el1.bits()));
        }

        context.gpregs.registers.fill(u64::MAX);
        context.gpregs.registers[0] = self.context_id;
    }

    fn sctlr_bits(&self, current: u64) -> u64 {
        let mut bits = current & !(SCTLR_M_BIT | SCTLR_C_BIT | SCTLR_EE_BIT);
        if self.big_endian {
            bits |= SCTLR_EE_BIT;
        }
        bits
    }
}

/// One pending resume context per core.
///
/// A context is stashed by whichever core starts another core's power on, or by a core about to
/// suspend itself, and is taken by the target core when it runs again.
pub struct ResumeContextStore<const CORE_COUNT: usize> {
    slots: [SpinMutex<Option<ResumeContext>>; CORE_COUNT],
}

impl<const CORE_COUNT: usize> ResumeContextStore<CORE_COUNT> {
    /// Creates a store with no pending contexts.
    pub const fn new() -> Self {
        Self {
            slots: [const { SpinMutex::new(None) }; CORE_COUNT],
        }
    }

    /// Stashes the resume context of the given core, replacing any previous one.
    pub fn stash(
        &self,
        core_index: usize,
        entry_point: u64,
        context_id: u64,
        config: &ActiveConfiguration,
    ) -> Result<(), ErrorCode> {
        let slot = self
            .slots
            .get(core_index)
            .ok_or(ErrorCode::InvalidParameters)?;
        let context = ResumeContext::new(entry_point, context_id, config)?;
        debug!(
            "Stashed resume context for core {core_index}: entry {entry_point:#x}, {:?}",
            context.width
        );
        *slot.lock() = Some(context);
        Ok(())
    }

    /// Drops the pending context of the given core, if any.
    pub fn discard(&self, core_index: usize) {
        self.slots[core_index].lock().take();
    }

    /// Returns whether the given core has a pending context.
    pub fn is_pending(&self, core_index: usize) -> bool {
        self.slots[core_index].lock().is_some()
    }

    /// Takes the pending context of the given core and applies it to `context`.
    ///
    /// # Panics
    ///
    /// Panics if the core has no pending context, as it then has nowhere to resume.
    pub fn apply(&self, core_index: usize, context: &mut CpuContext) {
        let resume_context = self.slots[core_index]
            .lock()
            .take()
            .unwrap_or_else(|| panic!("No resume context for core {core_index}"));
        resume_context.apply(context);
        debug!(
            "Applied resume context for core {core_index}: entry {:#x}",
            resume_context.entry_point
        );
    }
}

impl<const CORE_COUNT: usize> Default for ResumeContextStore<CORE_COUNT> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_sysregs::{IdAa64pfr0El1, fake::SYSREGS};

    const AARCH64_EL1: ActiveConfiguration = ActiveConfiguration {
        width: RegisterWidth::AArch64,
        el2_implemented: false,
        hyp_enabled: false,
        el1_big_endian: false,
        el2_big_endian: false,
    };

    const AARCH64_EL2: ActiveConfiguration = ActiveConfiguration {
        width: RegisterWidth::AArch64,
        el2_implemented: true,
        hyp_enabled: true,
        el1_big_endian: false,
        el2_big_endian: true,
    };

    const AARCH32_SVC: ActiveConfiguration = ActiveConfiguration {
        width: RegisterWidth::AArch32,
        el2_implemented: true,
        hyp_enabled: false,
        el1_big_endian: true,
        el2_big_endian: false,
    };

    #[test]
    fn aarch64_el1_spsr() {
        let context = ResumeContext::new(0x8000_0000, 42, &AARCH64_EL1).unwrap();
        assert_eq!(
            Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL1H,
            context.spsr()
        );
        assert_eq!(RegisterWidth::AArch64, context.width());
        assert_eq!(0x8000_0000, context.entry_point());
        assert_eq!(42, context.context_id());
    }

    #[test]
    fn aarch64_el2_spsr() {
        let context = ResumeContext::new(0x8000_0000, 0, &AARCH64_EL2).unwrap();
        assert_eq!(
            Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL2H,
            context.spsr()
        );
    }

    #[test]
    fn el2_without_hyp_enabled_enters_el1() {
        let config = ActiveConfiguration {
            hyp_enabled: false,
            ..AARCH64_EL2
        };
        let context = ResumeContext::new(0x8000_0000, 0, &config).unwrap();
        assert_eq!(
            Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL1H,
            context.spsr()
        );
    }

    #[test]
    fn aarch64_rejects_thumb_entry_point() {
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            ResumeContext::new(0x8000_0001, 0, &AARCH64_EL1)
        );
    }

    #[test]
    fn aarch32_svc_spsr() {
        let context = ResumeContext::new(0x8000_0000, 0, &AARCH32_SVC).unwrap();
        assert_eq!(RegisterWidth::AArch32, context.width());
        assert_eq!(
            Spsr::A | Spsr::I | Spsr::F | Spsr::from_bits_retain(SPSR_MODE32_SVC | SPSR_E_BIT),
            context.spsr()
        );
    }

    #[test]
    fn aarch32_thumb_hyp_spsr() {
        let config = ActiveConfiguration {
            hyp_enabled: true,
            ..AARCH32_SVC
        };
        let context = ResumeContext::new(0x8000_0001, 0, &config).unwrap();
        assert_eq!(
            Spsr::A | Spsr::I | Spsr::F | Spsr::from_bits_retain(SPSR_MODE32_HYP | SPSR_T_BIT),
            context.spsr()
        );
    }

    #[test]
    fn apply_aarch64_el2() {
        let store = ResumeContextStore::<4>::new();
        let mut context = CpuContext::EMPTY;
        context.lower_el_sysregs.sctlr_el2 =
            SctlrEl2::from_bits_retain(SCTLR_M_BIT | SCTLR_C_BIT | 1 << 12);
        context.lower_el_sysregs.sctlr_el1 = SctlrEl1::from_bits_retain(SCTLR_M_BIT);

        store
            .stash(2, 0x8800_0000, 0x1234, &AARCH64_EL2)
            .unwrap();
        assert!(store.is_pending(2));
        store.apply(2, &mut context);
        assert!(!store.is_pending(2));

        assert!(context.el3_state.scr_el3.contains(ScrEl3::NS | ScrEl3::RW));
        assert_eq!(0x8800_0000, context.el3_state.elr_el3);
        assert_eq!(
            Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL2H,
            context.el3_state.spsr_el3
        );
        assert_eq!(
            SCTLR_EE_BIT | 1 << 12,
            context.lower_el_sysregs.sctlr_el2.bits()
        );
        // EL1 is left alone when entering EL2.
        assert_eq!(SCTLR_M_BIT, context.lower_el_sysregs.sctlr_el1.bits());
        assert_eq!(0x1234, context.gpregs.registers[0]);
        assert!(context.gpregs.registers[1..31].iter().all(|&x| x == u64::MAX));
    }

    #[test]
    fn apply_aarch32_clears_rw() {
        let store = ResumeContextStore::<4>::new();
        let mut context = CpuContext::EMPTY;
        context.el3_state.scr_el3 = ScrEl3::RW | ScrEl3::HCE;

        store.stash(0, 0x8000_0001, 7, &AARCH32_SVC).unwrap();
        store.apply(0, &mut context);

        assert_eq!(ScrEl3::NS | ScrEl3::HCE, context.el3_state.scr_el3);
        assert_eq!(0x8000_0001, context.el3_state.elr_el3);
        assert_eq!(7, context.gpregs.registers[0]);
    }

    #[test]
    fn apply_el1_only() {
        let store = ResumeContextStore::<1>::new();
        let mut context = CpuContext::EMPTY;
        context.lower_el_sysregs.sctlr_el1 =
            SctlrEl1::from_bits_retain(SCTLR_M_BIT | SCTLR_C_BIT | SCTLR_EE_BIT);

        store.stash(0, 0x8000_0000, 0, &AARCH64_EL1).unwrap();
        store.apply(0, &mut context);

        assert_eq!(0, context.lower_el_sysregs.sctlr_el1.bits());
        assert_eq!(0, context.lower_el_sysregs.sctlr_el2.bits());
    }

    #[test]
    fn apply_el1_target_with_el2_implemented() {
        let config = ActiveConfiguration {
            width: RegisterWidth::AArch64,
            el2_implemented: true,
            hyp_enabled: false,
            el1_big_endian: true,
            el2_big_endian: false,
        };
        let store = ResumeContextStore::<1>::new();
        let mut context = CpuContext::EMPTY;
        context.lower_el_sysregs.sctlr_el1 = SctlrEl1::from_bits_retain(SCTLR_M_BIT | SCTLR_C_BIT);
        context.lower_el_sysregs.sctlr_el2 = SctlrEl2::from_bits_retain(SCTLR_M_BIT);

        store.stash(0, 0x8000_0000, 0, &config).unwrap();
        store.apply(0, &mut context);

        assert_eq!(
            Spsr::D | Spsr::A | Spsr::I | Spsr::F | Spsr::M_AARCH64_EL1H,
            context.el3_state.spsr_el3
        );
        // The EL1 MMU and cache are turned off and EL1's endianness is used.
        assert_eq!(SCTLR_EE_BIT, context.lower_el_sysregs.sctlr_el1.bits());
        // EL2 isn't entered, so it is left alone.
        assert_eq!(SCTLR_M_BIT, context.lower_el_sysregs.sctlr_el2.bits());
    }

    #[test]
    fn current_configuration_from_registers() {
        let saved = {
            let mut sysregs = SYSREGS.lock().unwrap();
            let saved = (
                sysregs.scr_el3,
                sysregs.id_aa64pfr0_el1,
                sysregs.sctlr_el1,
                sysregs.sctlr_el2,
            );
            sysregs.scr_el3 = ScrEl3::RW | ScrEl3::HCE;
            sysregs.id_aa64pfr0_el1 = IdAa64pfr0El1::from_bits_retain(1 << 8);
            sysregs.sctlr_el1 = SctlrEl1::from_bits_retain(SCTLR_EE_BIT);
            sysregs.sctlr_el2 = SctlrEl2::from_bits_retain(SCTLR_M_BIT);
            saved
        };
        assert_eq!(
            ActiveConfiguration {
                width: RegisterWidth::AArch64,
                el2_implemented: true,
                hyp_enabled: true,
                el1_big_endian: true,
                el2_big_endian: false,
            },
            ActiveConfiguration::current()
        );

        // SCTLR_EL2.EE is ignored when EL2 isn't implemented.
        {
            let mut sysregs = SYSREGS.lock().unwrap();
            sysregs.scr_el3 = ScrEl3::empty();
            sysregs.id_aa64pfr0_el1 = IdAa64pfr0El1::empty();
            sysregs.sctlr_el1 = SctlrEl1::empty();
            sysregs.sctlr_el2 = SctlrEl2::from_bits_retain(SCTLR_EE_BIT);
        }
        let config = ActiveConfiguration::current();

        {
            let mut sysregs = SYSREGS.lock().unwrap();
            (
                sysregs.scr_el3,
                sysregs.id_aa64pfr0_el1,
                sysregs.sctlr_el1,
                sysregs.sctlr_el2,
            ) = saved;
        }
        assert_eq!(
            ActiveConfiguration {
                width: RegisterWidth::AArch32,
                el2_implemented: false,
                hyp_enabled: false,
                el1_big_endian: false,
                el2_big_endian: false,
            },
            config
        );
        assert!(!config.enters_el2());
    }

    #[test]
    fn stash_replaces_previous_context() {
        let store = ResumeContextStore::<2>::new();
        let mut context = CpuContext::EMPTY;

        store.stash(1, 0x1000, 1, &AARCH64_EL1).unwrap();
        store.stash(1, 0x2000, 2, &AARCH64_EL1).unwrap();
        store.apply(1, &mut context);

        assert_eq!(0x2000, context.el3_state.elr_el3);
        assert_eq!(2, context.gpregs.registers[0]);
    }

    #[test]
    fn stash_failure_keeps_slot_empty() {
        let store = ResumeContextStore::<2>::new();

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            store.stash(0, 0x1001, 0, &AARCH64_EL1)
        );
        assert!(!store.is_pending(0));
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            store.stash(2, 0x1000, 0, &AARCH64_EL1)
        );
    }

    #[test]
    fn discard_pending_context() {
        let store = ResumeContextStore::<2>::new();
        store.stash(0, 0x1000, 0, &AARCH64_EL1).unwrap();
        store.discard(0);
        assert!(!store.is_pending(0));
    }

    #[test]
    #[should_panic]
    fn apply_consumes_context_once() {
        let store = ResumeContextStore::<1>::new();
        let mut context = CpuContext::EMPTY;

        store.stash(0, 0x1000, 0, &AARCH64_EL1).unwrap();
        store.apply(0, &mut context);
        store.apply(0, &mut context);
    }
}

// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::Platform;
use crate::{
    logger::{self, LockedWriter},
    psci::{
        AffinityNode, AffinityState, PowerOnFinisher, PowerPlatformInterface,
        TopologyDescription,
    },
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_psci::ErrorCode;
use arm_sysregs::MpidrEl1;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};
use log::debug;

const SEC_SRAM_BASE: usize = 0x0e00_0000;
const SHARED_RAM_BASE: usize = SEC_SRAM_BASE;

/// Base address of the trusted mailbox.
/// The mailbox has a storage buffer at its base, and a doorbell for each CPU.
const TRUSTED_MAILBOX_BASE: usize = SHARED_RAM_BASE;
/// Location to which to write the address that secondary cores should jump to after being released
/// from their holding pens.
const HOLD_ENTRYPOINT: *mut unsafe extern "C" fn() = TRUSTED_MAILBOX_BASE as _;
/// Base address of hold entries for secondary cores. Writing `HOLD_STATE_GO` to the entry for a
/// secondary core will cause it to be released from its holding pen and jump to `*HOLD_ENTRYPOINT`.
const HOLD_BASE: usize = TRUSTED_MAILBOX_BASE + 8;
const HOLD_STATE_GO: u64 = 1;

/// Base address of the secure world PL011 UART, aka. UART1.
const UART1_BASE: usize = 0x0904_0000;
const PL011_BASE_ADDRESS: *mut PL011Registers = UART1_BASE as _;

/// The number of CPU clusters.
const CLUSTER_COUNT: usize = 1;
const PLATFORM_CPU_PER_CLUSTER_SHIFT: usize = 2;
/// The maximum number of CPUs in each cluster.
const MAX_CPUS_PER_CLUSTER: usize = 1 << PLATFORM_CPU_PER_CLUSTER_SHIFT;

// System, cluster, core.
const MAX_AFFINITY_LEVEL: usize = 2;

static POWER_PLATFORM_TAKEN: AtomicBool = AtomicBool::new(false);

unsafe extern "C" {
    /// Entry point of a core released from its holding pen, provided by the monitor.
    unsafe fn bl31_warm_entrypoint();
}

/// QEMU virt machine.
pub struct Qemu;

impl Platform for Qemu {
    const CORE_COUNT: usize = CLUSTER_COUNT * MAX_CPUS_PER_CLUSTER;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PowerPlatformImpl = QemuPowerPlatformImpl;

    fn init_logger() {
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range.
        let uart_pointer = unsafe {
            UniqueMmioPointer::new(NonNull::new(PL011_BASE_ADDRESS).expect("Null UART address"))
        };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("Failed to initialise logger");
    }

    fn power_platform() -> Option<Self::PowerPlatformImpl> {
        (!POWER_PLATFORM_TAKEN.swap(true, Ordering::AcqRel)).then_some(QemuPowerPlatformImpl)
    }

    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool {
        mpidr.aff3() == 0
            && mpidr.aff2() == 0
            && usize::from(mpidr.aff1()) < CLUSTER_COUNT
            && usize::from(mpidr.aff0()) < MAX_CPUS_PER_CLUSTER
    }

    fn core_position(mpidr: MpidrEl1) -> usize {
        (usize::from(mpidr.aff1()) << PLATFORM_CPU_PER_CLUSTER_SHIFT) + usize::from(mpidr.aff0())
    }
}

/// QEMU power control, through the holding pens in the trusted mailbox.
pub struct QemuPowerPlatformImpl;

impl TopologyDescription for QemuPowerPlatformImpl {
    fn max_affinity_level(&self) -> usize {
        MAX_AFFINITY_LEVEL
    }

    fn affinity_count(&self, level: usize, _mpidr: MpidrEl1) -> usize {
        match level {
            0 => MAX_CPUS_PER_CLUSTER,
            1 => CLUSTER_COUNT,
            _ => 1,
        }
    }

    fn is_present(&self, _level: usize, _mpidr: MpidrEl1) -> bool {
        true
    }
}

impl PowerPlatformInterface for QemuPowerPlatformImpl {
    const AFFINITY_NODE_COUNT: usize = 1 + CLUSTER_COUNT + Qemu::CORE_COUNT;

    fn power_on_finishers(&self) -> &[PowerOnFinisher] {
        &[finish_level, finish_level, finish_level]
    }

    fn power_on(&self, mpidr: MpidrEl1) -> Result<(), ErrorCode> {
        if !Qemu::mpidr_is_valid(mpidr) {
            return Err(ErrorCode::InvalidParameters);
        }
        let cpu_index = Qemu::core_position(mpidr);
        // SAFETY: HOLD_BASE is a valid address and adding cpu_index does not make it go out of
        // bounds of the holding pens, since cpu_index is smaller than CORE_COUNT. This memory
        // region is only used for the trusted mailbox.
        unsafe {
            *HOLD_ENTRYPOINT = bl31_warm_entrypoint;
            let cpu_hold_addr = (HOLD_BASE as *mut u64).add(cpu_index);
            cpu_hold_addr.write_volatile(HOLD_STATE_GO);
        }
        send_event();
        Ok(())
    }
}

/// Nothing to set up on QEMU at any level.
fn finish_level(
    mpidr: MpidrEl1,
    node: &AffinityNode,
    previous_state: AffinityState,
) -> Result<(), ErrorCode> {
    debug!(
        "QEMU level {} on for {:#x}, was {previous_state:?}",
        node.level(),
        mpidr.bits()
    );
    Ok(())
}

fn send_event() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `sev` only signals an event to the other cores.
    unsafe {
        core::arch::asm!("sev", options(nomem, nostack, preserves_flags));
    }
}

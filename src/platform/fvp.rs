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
use log::{debug, info};

const FVP_CLUSTER_COUNT: usize = 2;
const FVP_MAX_CPUS_PER_CLUSTER: usize = 4;
const PLATFORM_CORE_COUNT: usize = FVP_CLUSTER_COUNT * FVP_MAX_CPUS_PER_CLUSTER;

// System, cluster, core.
const MAX_AFFINITY_LEVEL: usize = 2;

const ARM_TRUSTED_SRAM_BASE: usize = 0x0400_0000;
const ARM_SHARED_RAM_BASE: usize = ARM_TRUSTED_SRAM_BASE;
/// Location from which a core released by the power controller reads its warm boot entry point.
const TRUSTED_MAILBOX_ENTRYPOINT: *mut unsafe extern "C" fn() = ARM_SHARED_RAM_BASE as _;

/// Base address of the FVP power controller.
const PWRC_BASE: usize = 0x1c10_0000;
/// Power on request register. Writing a core's MPIDR powers it on.
const PWRC_PPONR: *mut u32 = (PWRC_BASE + 0x4) as _;

// Base address of the primary PL011 UART.
const PL011_BASE_ADDRESS: *mut PL011Registers = 0x1C09_0000 as _;

static POWER_PLATFORM_TAKEN: AtomicBool = AtomicBool::new(false);

unsafe extern "C" {
    /// Entry point of a core released by the power controller, provided by the monitor.
    unsafe fn bl31_warm_entrypoint();
}

/// Fixed Virtual Platform
pub struct Fvp;

impl Platform for Fvp {
    const CORE_COUNT: usize = PLATFORM_CORE_COUNT;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PowerPlatformImpl = FvpPowerPlatformImpl;

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
        (!POWER_PLATFORM_TAKEN.swap(true, Ordering::AcqRel)).then_some(FvpPowerPlatformImpl)
    }

    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool {
        !mpidr.contains(MpidrEl1::MT)
            && mpidr.aff3() == 0
            && mpidr.aff2() == 0
            && usize::from(mpidr.aff1()) < FVP_CLUSTER_COUNT
            && usize::from(mpidr.aff0()) < FVP_MAX_CPUS_PER_CLUSTER
    }

    fn core_position(mpidr: MpidrEl1) -> usize {
        usize::from(mpidr.aff1()) * FVP_MAX_CPUS_PER_CLUSTER + usize::from(mpidr.aff0())
    }
}

/// FVP power control, through the base platform power controller.
pub struct FvpPowerPlatformImpl;

impl TopologyDescription for FvpPowerPlatformImpl {
    fn max_affinity_level(&self) -> usize {
        MAX_AFFINITY_LEVEL
    }

    fn affinity_count(&self, level: usize, _mpidr: MpidrEl1) -> usize {
        match level {
            0 => FVP_MAX_CPUS_PER_CLUSTER,
            1 => FVP_CLUSTER_COUNT,
            _ => 1,
        }
    }

    fn is_present(&self, _level: usize, _mpidr: MpidrEl1) -> bool {
        true
    }
}

impl PowerPlatformInterface for FvpPowerPlatformImpl {
    const AFFINITY_NODE_COUNT: usize = 1 + FVP_CLUSTER_COUNT + PLATFORM_CORE_COUNT;

    fn power_on_finishers(&self) -> &[PowerOnFinisher] {
        &[finish_core, finish_cluster, finish_level]
    }

    fn power_on(&self, mpidr: MpidrEl1) -> Result<(), ErrorCode> {
        if !Fvp::mpidr_is_valid(mpidr) {
            return Err(ErrorCode::InvalidParameters);
        }
        info!("Requesting power on of {:#x}", mpidr.bits());
        // SAFETY: The trusted mailbox and the power controller registers are only written here,
        // and `PWRC_PPONR` is a valid MMIO register of the power controller.
        unsafe {
            *TRUSTED_MAILBOX_ENTRYPOINT = bl31_warm_entrypoint;
            // The register only holds the affinity fields 0 to 2.
            PWRC_PPONR.write_volatile(mpidr.bits() as u32 & 0x00ff_ffff);
        }
        Ok(())
    }
}

fn finish_core(
    mpidr: MpidrEl1,
    _node: &AffinityNode,
    previous_state: AffinityState,
) -> Result<(), ErrorCode> {
    debug!("FVP core {:#x} on, was {previous_state:?}", mpidr.bits());
    Ok(())
}

fn finish_cluster(
    mpidr: MpidrEl1,
    node: &AffinityNode,
    previous_state: AffinityState,
) -> Result<(), ErrorCode> {
    if previous_state == AffinityState::Off {
        // First core of the cluster to come up.
        debug!("FVP cluster {:#x} on for {:#x}", node.mpidr().bits(), mpidr.bits());
    }
    Ok(())
}

fn finish_level(
    _mpidr: MpidrEl1,
    node: &AffinityNode,
    _previous_state: AffinityState,
) -> Result<(), ErrorCode> {
    debug!("FVP level {} on", node.level());
    Ok(())
}

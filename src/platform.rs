// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Compile-time selection of the platform, and the hooks every platform implements.

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(platform = $condition, not(test)))]
        mod $mod;

        #[cfg(all(platform = $condition, not(test)))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        pub(crate) mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "fvp", fvp::Fvp);
select_platform!(platform = "qemu", qemu::Qemu);
select_platform!(test, test::TestPlatform);

use crate::{logger::LogSink, psci::PowerPlatformInterface};
use arm_sysregs::MpidrEl1;
#[cfg(not(test))]
pub use percore::exception_free;
#[cfg(test)]
pub use test::exception_free;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

/// The power controller interface of the selected platform.
pub type PowerPlatformImpl = <PlatformImpl as Platform>::PowerPlatformImpl;

/// The hooks implemented by all platforms.
pub trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent power controller and topology description.
    type PowerPlatformImpl: PowerPlatformInterface;

    /// Initialises the logger. Any logs sent before this is called will be ignored.
    fn init_logger();

    /// Returns the power platform handle. This returns `Some` the first time it is called and
    /// `None` after that.
    fn power_platform() -> Option<Self::PowerPlatformImpl>;

    /// Returns whether the given MPIDR is valid for this platform.
    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool;

    /// Given a valid MPIDR value, returns the corresponding linear core index.
    ///
    /// The implementation must never return the same index for two different valid MPIDR values,
    /// and must never return a value greater than or equal to `CORE_COUNT`. For an invalid MPIDR
    /// value no guarantees are made about the return value.
    fn core_position(mpidr: MpidrEl1) -> usize;
}

// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Affinity topology power state coordination for the RF-A EL3 monitor.
//!
//! Tracks the logical power state of every core, cluster and higher affinity instance, keeps
//! ancestors consistent with their cores, and drives the bookkeeping of cores being turned on,
//! suspended, turned off and warm booting, on many cores at once.

#![cfg_attr(not(test), no_std)]

pub mod context;
mod debug;
pub mod logger;
pub mod platform;
pub mod psci;

// SPDX-FileCopyrightText: 2025 tegra-mm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! System capabilities consumed by the memory manager.
//!
//! The manager never owns host memory. It resolves guest CPU addresses to
//! host pointers through [`MemoryBus`] and tells the guest kernel which CPU
//! ranges are device-mapped through the same trait, so it can be unit-tested
//! without an emulator kernel behind it.

use bitflags::bitflags;
use thiserror::Error;

use crate::types::{CpuAddr, HostPtr};

bitflags! {
    /// Guest-kernel memory attribute bits for a CPU memory range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAttribute: u32 {
        /// The range is mapped into a device address space (here: the GPU).
        const DEVICE_MAPPED = 1 << 2;
    }
}

/// The guest kernel refused an attribute update.
#[derive(Debug, Error)]
#[error("failed to update memory attributes for {size:#x} bytes at {addr:#018X}")]
pub struct AttributeError {
    pub addr: CpuAddr,
    pub size: u64,
}

/// Emulator memory bus plus the kernel-side attribute capability.
pub trait MemoryBus {
    /// Host pointer backing a guest CPU address, or null if nothing does.
    fn host_pointer(&self, addr: CpuAddr) -> HostPtr;

    /// Update the attribute bits selected by `mask` over
    /// `[addr, addr + size)` to `value`.
    fn set_memory_attribute(
        &self,
        addr: CpuAddr,
        size: u64,
        mask: MemoryAttribute,
        value: MemoryAttribute,
    ) -> Result<(), AttributeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_error_display() {
        let err = AttributeError {
            addr: 0x10_0000,
            size: 0x2000,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x2000"));
        assert!(msg.contains("0x0000000000100000"));
    }
}

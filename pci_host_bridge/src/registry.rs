//! Address-space registry contract.
//!
//! The engine does not own an address map; it drives an external range
//! database (the GCD in firmware, anything range-shaped elsewhere) through
//! this trait. Allocation is always attempted at an explicit base address —
//! the engine performs its own forward scan over aligned candidates — and
//! the map accessors exist so aperture coverage can be verified before the
//! first allocation.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::error::{EfiError, Result};
use crate::error;

/// Ownership state of a memory-space sub-range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemorySpaceType {
    /// Not yet added to the registry; eligible for coverage filling.
    #[default]
    NonExistent,
    /// Memory-mapped I/O, the type this engine allocates from.
    MemoryMappedIo,
    /// System memory owned by someone else.
    SystemMemory,
    /// Reserved space owned by someone else.
    Reserved,
}

/// Ownership state of an I/O-space sub-range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IoSpaceType {
    /// Not yet added to the registry; eligible for coverage filling.
    #[default]
    NonExistent,
    /// I/O port space, the type this engine allocates from.
    Io,
    /// Reserved space owned by someone else.
    Reserved,
}

/// One entry of the registry's memory-space map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySpaceDescriptor {
    pub base_address: u64,
    pub length: u64,
    pub memory_type: MemorySpaceType,
    pub capabilities: u64,
}

/// One entry of the registry's I/O-space map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSpaceDescriptor {
    pub base_address: u64,
    pub length: u64,
    pub io_type: IoSpaceType,
}

/// The range database the allocation engine runs against.
///
/// Callers guarantee single-writer discipline: the registry must not be
/// mutated by anyone else while a phase call is in flight.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait AddressSpaceRegistry {
    /// Adds an I/O port range to the registry.
    fn add_io_space(&mut self, base_address: u64, length: u64) -> Result<()>;

    /// Adds a memory-mapped I/O range with the given capabilities.
    fn add_memory_space(&mut self, base_address: u64, length: u64, capabilities: u64) -> Result<()>;

    /// Attempts to reserve `length` bytes of I/O space at exactly
    /// `base_address`. The address satisfies `bits_of_alignment`.
    fn allocate_io_space(&mut self, base_address: u64, bits_of_alignment: u32, length: u64) -> Result<u64>;

    /// Attempts to reserve `length` bytes of memory space at exactly
    /// `base_address`. The address satisfies `bits_of_alignment`.
    fn allocate_memory_space(&mut self, base_address: u64, bits_of_alignment: u32, length: u64) -> Result<u64>;

    /// Releases a previously allocated I/O range.
    fn free_io_space(&mut self, base_address: u64, length: u64) -> Result<()>;

    /// Releases a previously allocated memory range.
    fn free_memory_space(&mut self, base_address: u64, length: u64) -> Result<()>;

    /// Full-coverage snapshot of the I/O space map, gaps included as
    /// [`IoSpaceType::NonExistent`] entries.
    fn io_space_map(&self) -> Vec<IoSpaceDescriptor>;

    /// Full-coverage snapshot of the memory space map, gaps included as
    /// [`MemorySpaceType::NonExistent`] entries.
    fn memory_space_map(&self) -> Vec<MemorySpaceDescriptor>;
}

/// Makes sure `[base_address, base_address + length)` is tracked as I/O
/// space, registering any sub-range the registry does not know yet.
///
/// Idempotent: ranges already tagged as I/O are left alone. A sub-range
/// tagged as anything else is a platform configuration conflict.
pub(crate) fn ensure_io_coverage<R: AddressSpaceRegistry + ?Sized>(
    registry: &mut R,
    base_address: u64,
    length: u64,
) -> Result<()> {
    for descriptor in registry.io_space_map() {
        intersect_io_descriptor(registry, base_address, length, &descriptor)?;
    }
    Ok(())
}

fn intersect_io_descriptor<R: AddressSpaceRegistry + ?Sized>(
    registry: &mut R,
    base_address: u64,
    length: u64,
    descriptor: &IoSpaceDescriptor,
) -> Result<()> {
    if descriptor.io_type == IoSpaceType::Io {
        return Ok(());
    }

    let intersection_base = base_address.max(descriptor.base_address);
    let intersection_end = (base_address + length).min(descriptor.base_address + descriptor.length);
    if intersection_base >= intersection_end {
        // no intersection
        return Ok(());
    }

    if descriptor.io_type == IoSpaceType::NonExistent {
        return registry.add_io_space(intersection_base, intersection_end - intersection_base);
    }

    log::error!(
        "aperture [{:#x}, {:#x}) overlaps {:?} io range [{:#x}, {:#x})",
        base_address,
        base_address + length,
        descriptor.io_type,
        descriptor.base_address,
        descriptor.base_address + descriptor.length
    );
    error!(EfiError::InvalidParameter);
}

/// Makes sure `[base_address, base_address + length)` is tracked as MMIO
/// space with at least `capabilities`, registering unknown sub-ranges.
pub(crate) fn ensure_memory_coverage<R: AddressSpaceRegistry + ?Sized>(
    registry: &mut R,
    base_address: u64,
    length: u64,
    capabilities: u64,
) -> Result<()> {
    for descriptor in registry.memory_space_map() {
        intersect_memory_descriptor(registry, base_address, length, capabilities, &descriptor)?;
    }
    Ok(())
}

fn intersect_memory_descriptor<R: AddressSpaceRegistry + ?Sized>(
    registry: &mut R,
    base_address: u64,
    length: u64,
    capabilities: u64,
    descriptor: &MemorySpaceDescriptor,
) -> Result<()> {
    if descriptor.memory_type == MemorySpaceType::MemoryMappedIo
        && (descriptor.capabilities & capabilities) == capabilities
    {
        return Ok(());
    }

    let intersection_base = base_address.max(descriptor.base_address);
    let intersection_end = (base_address + length).min(descriptor.base_address + descriptor.length);
    if intersection_base >= intersection_end {
        // no intersection
        return Ok(());
    }

    if descriptor.memory_type == MemorySpaceType::NonExistent {
        return registry.add_memory_space(intersection_base, intersection_end - intersection_base, capabilities);
    }

    log::error!(
        "aperture [{:#x}, {:#x}) overlaps {:?} memory range [{:#x}, {:#x})",
        base_address,
        base_address + length,
        descriptor.memory_type,
        descriptor.base_address,
        descriptor.base_address + descriptor.length
    );
    error!(EfiError::InvalidParameter);
}

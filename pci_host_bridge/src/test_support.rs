//! Test fixtures shared by the unit tests: a deterministic in-memory
//! address-space registry that records every call it sees.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;

use crate::error::{EfiError, Result};
use crate::registry::{
    AddressSpaceRegistry, IoSpaceDescriptor, IoSpaceType, MemorySpaceDescriptor, MemorySpaceType,
};

/// One registry interaction, as observed by [`TestRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryCall {
    AddIo { base_address: u64, length: u64 },
    AddMemory { base_address: u64, length: u64 },
    AllocateIo { base_address: u64, length: u64 },
    AllocateMemory { base_address: u64, length: u64 },
    FreeIo { base_address: u64, length: u64 },
    FreeMemory { base_address: u64, length: u64 },
}

impl RegistryCall {
    pub fn is_free(&self) -> bool {
        matches!(self, RegistryCall::FreeIo { .. } | RegistryCall::FreeMemory { .. })
    }
}

/// A first-fit range database over two typed maps, plus a call journal.
///
/// Reservations only succeed inside a typed segment of the matching kind
/// and never overlap an existing reservation, which is all the engine's
/// forward scan needs to behave like it does against the real registry.
#[derive(Debug, Default)]
pub struct TestRegistry {
    io: SpaceMap<IoSpaceType>,
    memory: SpaceMap<MemorySpaceType>,
    pub calls: Vec<RegistryCall>,
}

impl TestRegistry {
    /// Marks an I/O range as owned by someone else, for coverage-conflict
    /// tests.
    pub fn seed_reserved_io(&mut self, base_address: u64, length: u64) {
        self.io.add(base_address, length, IoSpaceType::Reserved).unwrap();
    }
}

impl AddressSpaceRegistry for TestRegistry {
    fn add_io_space(&mut self, base_address: u64, length: u64) -> Result<()> {
        self.calls.push(RegistryCall::AddIo { base_address, length });
        self.io.add(base_address, length, IoSpaceType::Io)
    }

    fn add_memory_space(&mut self, base_address: u64, length: u64, _capabilities: u64) -> Result<()> {
        self.calls.push(RegistryCall::AddMemory { base_address, length });
        self.memory.add(base_address, length, MemorySpaceType::MemoryMappedIo)
    }

    fn allocate_io_space(&mut self, base_address: u64, bits_of_alignment: u32, length: u64) -> Result<u64> {
        self.calls.push(RegistryCall::AllocateIo { base_address, length });
        self.io.allocate(IoSpaceType::Io, base_address, bits_of_alignment, length)
    }

    fn allocate_memory_space(&mut self, base_address: u64, bits_of_alignment: u32, length: u64) -> Result<u64> {
        self.calls.push(RegistryCall::AllocateMemory { base_address, length });
        self.memory.allocate(MemorySpaceType::MemoryMappedIo, base_address, bits_of_alignment, length)
    }

    fn free_io_space(&mut self, base_address: u64, length: u64) -> Result<()> {
        self.calls.push(RegistryCall::FreeIo { base_address, length });
        self.io.free(base_address, length)
    }

    fn free_memory_space(&mut self, base_address: u64, length: u64) -> Result<()> {
        self.calls.push(RegistryCall::FreeMemory { base_address, length });
        self.memory.free(base_address, length)
    }

    fn io_space_map(&self) -> Vec<IoSpaceDescriptor> {
        self.io.descriptors(|base_address, length, io_type| IoSpaceDescriptor {
            base_address,
            length,
            io_type: io_type.unwrap_or_default(),
        })
    }

    fn memory_space_map(&self) -> Vec<MemorySpaceDescriptor> {
        self.memory.descriptors(|base_address, length, memory_type| MemorySpaceDescriptor {
            base_address,
            length,
            memory_type: memory_type.unwrap_or_default(),
            capabilities: u64::MAX,
        })
    }
}

#[derive(Debug, Default)]
struct SpaceMap<T> {
    segments: Vec<Segment<T>>,
    allocations: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Copy)]
struct Segment<T> {
    base: u64,
    length: u64,
    space_type: T,
}

impl<T: Copy + PartialEq> SpaceMap<T> {
    fn add(&mut self, base: u64, length: u64, space_type: T) -> Result<()> {
        let end = base as u128 + length as u128;
        for segment in &self.segments {
            let segment_end = segment.base as u128 + segment.length as u128;
            if (base as u128) < segment_end && (segment.base as u128) < end {
                return Err(EfiError::AccessDenied);
            }
        }
        self.segments.push(Segment { base, length, space_type });
        self.segments.sort_by_key(|segment| segment.base);
        Ok(())
    }

    fn allocate(&mut self, target: T, base: u64, bits_of_alignment: u32, length: u64) -> Result<u64> {
        if length == 0 || bits_of_alignment >= 64 || base & ((1u64 << bits_of_alignment) - 1) != 0 {
            return Err(EfiError::InvalidParameter);
        }
        let end = base as u128 + length as u128;
        let contained = self.segments.iter().any(|segment| {
            segment.space_type == target
                && segment.base as u128 <= base as u128
                && end <= segment.base as u128 + segment.length as u128
        });
        if !contained {
            return Err(EfiError::NotFound);
        }
        for &(allocation_base, allocation_length) in &self.allocations {
            let allocation_end = allocation_base as u128 + allocation_length as u128;
            if (base as u128) < allocation_end && (allocation_base as u128) < end {
                return Err(EfiError::NotFound);
            }
        }
        self.allocations.push((base, length));
        Ok(base)
    }

    fn free(&mut self, base: u64, length: u64) -> Result<()> {
        match self.allocations.iter().position(|&(b, l)| b == base && l == length) {
            Some(index) => {
                self.allocations.remove(index);
                Ok(())
            }
            None => Err(EfiError::NotFound),
        }
    }

    fn descriptors<D>(&self, make: impl Fn(u64, u64, Option<T>) -> D) -> Vec<D> {
        let mut result = Vec::new();
        let mut cursor: u64 = 0;
        for segment in &self.segments {
            if segment.base > cursor {
                result.push(make(cursor, segment.base - cursor, None));
            }
            result.push(make(segment.base, segment.length, Some(segment.space_type)));
            cursor = segment.base.saturating_add(segment.length);
        }
        if cursor < u64::MAX {
            // The top byte of the space is left uncovered so lengths fit in
            // a u64.
            result.push(make(cursor, u64::MAX - cursor, None));
        }
        result
    }
}

//! PCI Host Bridge Resource Allocation
//!
//! This library implements the resource arbitration half of a PCI host
//! bridge driver: a host bridge collects the I/O, memory, and bus-number
//! demands of its root bridges, walks an externally driven enumeration
//! cycle, and carves aligned ranges for each demand out of an
//! address-space registry it is handed at construction. The registry (the
//! GCD in firmware, any range database elsewhere) and the conflict policy
//! callback are ordinary trait objects — nothing in here touches global
//! state or a protocol database.
//!
//! ## Examples and Usage
//!
//! ```
//! use pci_host_bridge::{
//!     AddressSpaceRegistry, AllocationAttributes, Aperture, Apertures, EnumerationPhase,
//!     HostBridge, NullConflictHandler, ResourceRequest, ResourceType, RootBridge,
//! };
//! # use pci_host_bridge::error::Result;
//! # use pci_host_bridge::registry::{IoSpaceDescriptor, MemorySpaceDescriptor};
//! #
//! # /// A registry that accepts every reservation at the requested address.
//! # #[derive(Default)]
//! # struct OpenRegistry;
//! # impl AddressSpaceRegistry for OpenRegistry {
//! #     fn add_io_space(&mut self, _base_address: u64, _length: u64) -> Result<()> {
//! #         Ok(())
//! #     }
//! #     fn add_memory_space(&mut self, _base_address: u64, _length: u64, _capabilities: u64) -> Result<()> {
//! #         Ok(())
//! #     }
//! #     fn allocate_io_space(&mut self, base_address: u64, _bits_of_alignment: u32, _length: u64) -> Result<u64> {
//! #         Ok(base_address)
//! #     }
//! #     fn allocate_memory_space(&mut self, base_address: u64, _bits_of_alignment: u32, _length: u64) -> Result<u64> {
//! #         Ok(base_address)
//! #     }
//! #     fn free_io_space(&mut self, _base_address: u64, _length: u64) -> Result<()> {
//! #         Ok(())
//! #     }
//! #     fn free_memory_space(&mut self, _base_address: u64, _length: u64) -> Result<()> {
//! #         Ok(())
//! #     }
//! #     fn io_space_map(&self) -> Vec<IoSpaceDescriptor> {
//! #         Vec::new()
//! #     }
//! #     fn memory_space_map(&self) -> Vec<MemorySpaceDescriptor> {
//! #         Vec::new()
//! #     }
//! # }
//!
//! let root_bridge = RootBridge::new(
//!     0,
//!     AllocationAttributes::empty(),
//!     Apertures { bus: Aperture::new(0, 0xFF), io: Aperture::new(0x1000, 0x1FFF), ..Default::default() },
//! )?;
//! let mut host = HostBridge::new(vec![root_bridge], OpenRegistry, NullConflictHandler)?;
//!
//! host.notify_phase(EnumerationPhase::BeginEnumeration)?;
//! host.notify_phase(EnumerationPhase::BeginBusAllocation)?;
//! host.notify_phase(EnumerationPhase::EndBusAllocation)?;
//! host.notify_phase(EnumerationPhase::BeginResourceAllocation)?;
//! host.submit_resources(0, &[ResourceRequest::io(0x100, 0xFF)])?;
//! host.notify_phase(EnumerationPhase::AllocateResources)?;
//!
//! let node = host.root_bridge(0)?.node(ResourceType::Io);
//! assert_eq!(0x1000, node.base);
//! # Ok::<(), pci_host_bridge::EfiError>(())
//! ```
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod base;
pub mod error;
pub mod host_bridge;
pub mod registry;
pub mod resource;
pub mod root_bridge;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{EfiError, Result};
pub use host_bridge::{ConflictHandler, EnumerationPhase, HostBridge, NullConflictHandler};
pub use registry::AddressSpaceRegistry;
pub use resource::{
    BusRange, ConflictDescriptor, ProposedResource, ResourceNode, ResourceRequest, ResourceStatus, ResourceType,
    RootBridgeConflict, Satisfaction, SpaceKind,
};
pub use root_bridge::{AllocationAttributes, Aperture, Apertures, RootBridge};

#[macro_export]
macro_rules! ensure {
    ($condition:expr, $err:expr) => {{
        if !($condition) {
            error!($err);
        }
    }};
}

#[macro_export]
macro_rules! error {
    ($err:expr) => {{
        return Err($err.into()).into();
    }};
}

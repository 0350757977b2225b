//! Resource type vocabulary and per-root-bridge resource records.
//!
//! A root bridge tracks one [`ResourceNode`] per [`ResourceType`]. Bus
//! drivers describe their needs as [`ResourceRequest`] records, the engine
//! answers with [`ProposedResource`] snapshots, and allocation failures are
//! reported as [`RootBridgeConflict`] groups.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;

/// The six resource windows a root bridge arbitrates.
///
/// The declaration order is the enumeration order used to break alignment
/// ties during allocation, so the discriminants are load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum ResourceType {
    /// I/O port space.
    Io = 0,
    /// Non-prefetchable memory below 4GB.
    Mem32 = 1,
    /// Prefetchable memory below 4GB.
    PMem32 = 2,
    /// Non-prefetchable memory above 4GB.
    Mem64 = 3,
    /// Prefetchable memory above 4GB.
    PMem64 = 4,
    /// Bus numbers.
    Bus = 5,
}

impl ResourceType {
    /// Number of resource types tracked per root bridge.
    pub const COUNT: usize = 6;

    /// Every resource type, in enumeration order.
    pub const ALL: [ResourceType; ResourceType::COUNT] = [
        ResourceType::Io,
        ResourceType::Mem32,
        ResourceType::PMem32,
        ResourceType::Mem64,
        ResourceType::PMem64,
        ResourceType::Bus,
    ];

    /// The types that compete for address space during the allocation phase.
    /// Bus numbers are assigned by the bus enumeration phase instead.
    pub const ALLOCATABLE: [ResourceType; 5] =
        [ResourceType::Io, ResourceType::Mem32, ResourceType::PMem32, ResourceType::Mem64, ResourceType::PMem64];

    /// Classifies a submitted request into the node it lands in.
    ///
    /// Returns `None` for combinations the submission validator rejects
    /// (bus requests, memory granularities other than 32 or 64).
    pub fn classify(request: &ResourceRequest) -> Option<ResourceType> {
        match request.kind {
            SpaceKind::Io => Some(ResourceType::Io),
            SpaceKind::Mem => match (request.granularity, request.prefetchable) {
                (32, false) => Some(ResourceType::Mem32),
                (32, true) => Some(ResourceType::PMem32),
                (64, false) => Some(ResourceType::Mem64),
                (64, true) => Some(ResourceType::PMem64),
                _ => None,
            },
            SpaceKind::Bus => None,
        }
    }

    /// The address-space kind descriptors of this type carry.
    pub fn space_kind(&self) -> SpaceKind {
        match self {
            ResourceType::Io => SpaceKind::Io,
            ResourceType::Bus => SpaceKind::Bus,
            _ => SpaceKind::Mem,
        }
    }

    /// Decode granularity and prefetchability for descriptor construction.
    ///
    /// Io and Bus report a zero granularity; only memory types carry a
    /// meaningful 32/64 split.
    pub fn mem_traits(&self) -> (u32, bool) {
        match self {
            ResourceType::Io | ResourceType::Bus => (0, false),
            ResourceType::Mem32 => (32, false),
            ResourceType::PMem32 => (32, true),
            ResourceType::Mem64 => (64, false),
            ResourceType::PMem64 => (64, true),
        }
    }
}

/// The address-space kind of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// I/O port space.
    Io,
    /// Memory-mapped space.
    Mem,
    /// Bus number space.
    Bus,
}

/// Allocation lifecycle of a [`ResourceNode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceStatus {
    /// Nothing requested for this window.
    #[default]
    None,
    /// A request has been recorded by the submission validator.
    Submitted,
    /// The allocation engine reserved a range for this window.
    Allocated,
}

/// Per-(root bridge, resource type) allocation record.
///
/// `alignment` is always stored in mask form (`2^n - 1`); `base` is a host
/// address once the node reaches [`ResourceStatus::Allocated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceNode {
    pub res_type: ResourceType,
    pub base: u64,
    pub length: u64,
    pub alignment: u64,
    pub status: ResourceStatus,
}

impl ResourceNode {
    pub(crate) const fn new(res_type: ResourceType) -> Self {
        Self { res_type, base: 0, length: 0, alignment: 0, status: ResourceStatus::None }
    }

    /// Returns the node to its post-construction state.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.res_type);
    }
}

/// A resource demand submitted by a bus driver.
///
/// `granularity` and `prefetchable` only apply to [`SpaceKind::Mem`]
/// requests; `alignment` must be in mask form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub kind: SpaceKind,
    pub granularity: u32,
    pub prefetchable: bool,
    pub length: u64,
    pub alignment: u64,
}

impl ResourceRequest {
    /// An I/O port space request.
    pub fn io(length: u64, alignment: u64) -> Self {
        Self { kind: SpaceKind::Io, granularity: 0, prefetchable: false, length, alignment }
    }

    /// A memory space request of the given granularity.
    pub fn mem(granularity: u32, prefetchable: bool, length: u64, alignment: u64) -> Self {
        Self { kind: SpaceKind::Mem, granularity, prefetchable, length, alignment }
    }
}

/// How completely an allocation phase satisfied a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfaction {
    /// The node was allocated exactly as requested.
    Satisfied,
    /// The node was submitted but the engine could not (or has not yet)
    /// allocated it; the proposal carries less than was asked for.
    Less,
    /// Nothing was requested for this window.
    Nonexistent,
}

/// One entry of a proposed-resources snapshot, in device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedResource {
    pub res_type: ResourceType,
    /// Device address of the proposed range (host base plus the window's
    /// translation).
    pub device_base: u64,
    pub length: u64,
    pub satisfaction: Satisfaction,
}

/// A bus-number range, as handed to bus enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusRange {
    pub base: u64,
    pub length: u64,
}

/// One resource window of a conflict report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictDescriptor {
    pub kind: SpaceKind,
    pub granularity: u32,
    pub prefetchable: bool,
    pub base: u64,
    pub alignment: u64,
    pub length: u64,
}

/// The full node set of one root bridge, snapshotted for conflict reporting.
///
/// Reports are grouped per root bridge in host-bridge order; the grouping
/// replaces the end-tag markers a raw descriptor buffer would carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBridgeConflict {
    /// PCI segment of the root bridge the descriptors belong to.
    pub segment: u16,
    /// One descriptor per [`ResourceType`], in enumeration order.
    pub resources: Vec<ConflictDescriptor>,
}

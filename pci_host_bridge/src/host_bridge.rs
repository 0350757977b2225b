//! Host bridge phase machine and allocation engine.
//!
//! The host bridge owns its root bridges, the address-space registry, and
//! the conflict handler, and advances through an externally driven
//! enumeration cycle: reset, bus allocation, resource submission, resource
//! allocation, teardown. One [`HostBridge::notify_phase`] call performs one
//! transition; nothing here suspends or retries.
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

use r_efi::efi;

use crate::base::{align_value, bits_of_alignment};
use crate::error::{EfiError, Result};
use crate::registry::{ensure_io_coverage, ensure_memory_coverage, AddressSpaceRegistry};
use crate::resource::{
    BusRange, ConflictDescriptor, ProposedResource, ResourceRequest, ResourceStatus, ResourceType, RootBridgeConflict,
};
use crate::root_bridge::{AllocationAttributes, Aperture, RootBridge};
use crate::{ensure, error};

/// The notification points of one enumeration cycle, in protocol order.
///
/// `FreeResources` is reachable from any state to tear the cycle down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationPhase {
    BeginEnumeration,
    BeginBusAllocation,
    EndBusAllocation,
    BeginResourceAllocation,
    AllocateResources,
    SetResources,
    FreeResources,
    EndResourceAllocation,
    EndEnumeration,
}

/// Platform policy callback invoked when an allocation phase cannot satisfy
/// every submitted request.
///
/// The report carries the complete node table of every root bridge so the
/// platform can decide what to evict; the engine does not interpret the
/// outcome.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait ConflictHandler {
    fn on_resource_conflict(&mut self, report: &[RootBridgeConflict]);
}

/// A conflict handler for platforms without a conflict policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConflictHandler;

impl ConflictHandler for NullConflictHandler {
    fn on_resource_conflict(&mut self, _report: &[RootBridgeConflict]) {}
}

/// The PCI host bridge: an ordered, fixed set of root bridges plus the
/// collaborators the allocation engine runs against.
#[derive(Debug)]
pub struct HostBridge<R: AddressSpaceRegistry, C: ConflictHandler> {
    root_bridges: Vec<RootBridge>,
    can_restarted: bool,
    registry: R,
    conflict_handler: C,
}

impl<R: AddressSpaceRegistry, C: ConflictHandler> HostBridge<R, C> {
    /// Builds the host bridge and registers every present aperture with the
    /// address-space registry.
    ///
    /// The coverage step is idempotent over ranges the registry already
    /// tracks with the right type; a range owned by a conflicting type
    /// fails construction with `InvalidParameter`.
    pub fn new(root_bridges: Vec<RootBridge>, mut registry: R, conflict_handler: C) -> Result<Self> {
        for bridge in &root_bridges {
            let io = bridge.aperture(ResourceType::Io);
            if io.is_present() {
                ensure_io_coverage(&mut registry, io.to_host(io.base), io.length())?;
            }
            for res_type in [ResourceType::Mem32, ResourceType::PMem32, ResourceType::Mem64, ResourceType::PMem64] {
                let aperture = bridge.aperture(res_type);
                if aperture.is_present() {
                    ensure_memory_coverage(
                        &mut registry,
                        aperture.to_host(aperture.base),
                        aperture.length(),
                        efi::MEMORY_UC,
                    )?;
                }
            }
            log::info!("segment {:#x}: root bridge apertures registered", bridge.segment());
        }

        Ok(Self { root_bridges, can_restarted: true, registry, conflict_handler })
    }

    /// The root bridges, in submission/reporting order.
    pub fn root_bridges(&self) -> &[RootBridge] {
        &self.root_bridges
    }

    /// Looks a root bridge up by position.
    pub fn root_bridge(&self, index: usize) -> Result<&RootBridge> {
        self.root_bridges.get(index).ok_or(EfiError::NotFound)
    }

    /// The registry this host bridge allocates from.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Advances the enumeration cycle by one phase.
    pub fn notify_phase(&mut self, phase: EnumerationPhase) -> Result<()> {
        log::debug!("NotifyPhase ({phase:?})");
        match phase {
            EnumerationPhase::BeginEnumeration => {
                ensure!(self.can_restarted, EfiError::NotReady);
                for bridge in &mut self.root_bridges {
                    bridge.reset_nodes();
                }
                self.can_restarted = true;
                Ok(())
            }
            EnumerationPhase::BeginBusAllocation => {
                // No restart until this cycle completes or its resources are
                // freed.
                self.can_restarted = false;
                Ok(())
            }
            EnumerationPhase::AllocateResources => self.allocate_resources(),
            EnumerationPhase::FreeResources => self.free_resources(),
            EnumerationPhase::EndBusAllocation
            | EnumerationPhase::BeginResourceAllocation
            | EnumerationPhase::SetResources
            | EnumerationPhase::EndResourceAllocation
            | EnumerationPhase::EndEnumeration => Ok(()),
        }
    }

    /// Validates and records a bus driver's resource demands for one root
    /// bridge. See [`RootBridge`] for the validation rules.
    pub fn submit_resources(&mut self, index: usize, requests: &[ResourceRequest]) -> Result<()> {
        self.root_bridge_mut(index)?.submit_resources(requests)
    }

    /// Device-address snapshot of one root bridge's allocatable nodes.
    pub fn proposed_resources(&self, index: usize) -> Result<Vec<ProposedResource>> {
        Ok(self.root_bridge(index)?.proposed_resources())
    }

    /// The bus window bus enumeration should start from.
    pub fn start_bus_enumeration(&self, index: usize) -> Result<BusRange> {
        self.root_bridge(index)?.start_bus_enumeration()
    }

    /// Records the bus range enumeration settled on for one root bridge.
    pub fn set_bus_numbers(&mut self, index: usize, base: u64, length: u64) -> Result<()> {
        self.root_bridge_mut(index)?.set_bus_numbers(base, length)
    }

    /// The allocation policy switches of one root bridge.
    pub fn allocation_attributes(&self, index: usize) -> Result<AllocationAttributes> {
        Ok(self.root_bridge(index)?.allocation_attributes())
    }

    fn root_bridge_mut(&mut self, index: usize) -> Result<&mut RootBridge> {
        self.root_bridges.get_mut(index).ok_or(EfiError::NotFound)
    }

    /// The resource allocation phase.
    ///
    /// Every root bridge is processed independently, highest-alignment node
    /// first. A node failure is recorded and the walk continues; one
    /// aggregate `OutOfResources` surfaces at the end, after the conflict
    /// handler has seen the full picture.
    fn allocate_resources(&mut self) -> Result<()> {
        // Every root bridge must have submitted before anyone allocates.
        for bridge in &self.root_bridges {
            ensure!(bridge.resource_submitted(), EfiError::NotReady);
        }

        let mut return_status = Ok(());
        let registry = &mut self.registry;
        for bridge in &mut self.root_bridges {
            log::info!("segment {:#x}: allocating submitted resources", bridge.segment());

            let mut handled = [false; ResourceType::ALLOCATABLE.len()];
            for (slot, res_type) in ResourceType::ALLOCATABLE.iter().enumerate() {
                if bridge.node(*res_type).status == ResourceStatus::None {
                    handled[slot] = true;
                }
            }

            loop {
                // Highest alignment first. The `<=` comparison is part of
                // the contract: on ties the later-enumerated type wins.
                let mut max_alignment = 0;
                let mut selected = None;
                for (slot, res_type) in ResourceType::ALLOCATABLE.iter().enumerate() {
                    if handled[slot] {
                        continue;
                    }
                    if max_alignment <= bridge.node(*res_type).alignment {
                        max_alignment = bridge.node(*res_type).alignment;
                        selected = Some((slot, *res_type));
                    }
                }
                let Some((slot, res_type)) = selected else {
                    break;
                };
                handled[slot] = true;

                if let Err(e) = Self::allocate_node(registry, bridge, res_type) {
                    return_status = Err(e);
                }
            }
        }

        if return_status.is_err() {
            let report = Self::build_conflict_report(&self.root_bridges);
            self.conflict_handler.on_resource_conflict(&report);
        }

        // Nodes that did not make it to Allocated report an empty request
        // from here on, not a stale length.
        for bridge in &mut self.root_bridges {
            for res_type in ResourceType::ALLOCATABLE {
                let node = bridge.node_mut(res_type);
                if node.status != ResourceStatus::Allocated {
                    node.length = 0;
                }
            }
        }

        return_status
    }

    fn allocate_node(registry: &mut R, bridge: &mut RootBridge, res_type: ResourceType) -> Result<()> {
        let node = *bridge.node(res_type);
        let alignment = node.alignment;
        let bits = bits_of_alignment(alignment);

        log::info!(
            "segment {:#x}: Type = {:?}; Length = {:#x}; Alignment = {:#x}",
            bridge.segment(),
            res_type,
            node.length,
            alignment
        );

        // The window translation must be at least as aligned as the request,
        // so that device-side and host-side alignment agree.
        let translation = bridge.aperture(res_type).translation;
        if (translation as u64) & alignment != 0 {
            log::error!(
                "segment {:#x}: translation {:#x} of {:?} is not aligned to {:#x}",
                bridge.segment(),
                translation,
                res_type,
                alignment
            );
            error!(EfiError::OutOfResources);
        }

        let base_address = match res_type {
            ResourceType::Io => Self::scan_aperture(
                registry,
                false,
                node.length,
                bits.min(15),
                bridge.aperture(ResourceType::Io),
                alignment,
            ),
            ResourceType::Mem32 => Self::scan_aperture(
                registry,
                true,
                node.length,
                bits.min(31),
                bridge.aperture(ResourceType::Mem32),
                alignment,
            ),
            ResourceType::PMem32 => Self::scan_aperture(
                registry,
                true,
                node.length,
                bits.min(31),
                bridge.aperture(ResourceType::PMem32),
                alignment,
            ),
            ResourceType::Mem64 => Self::scan_aperture(
                registry,
                true,
                node.length,
                bits.min(63),
                bridge.aperture(ResourceType::Mem64),
                alignment,
            )
            .or_else(|| {
                // 64-bit window exhausted or absent: retry below 4GB.
                Self::scan_aperture(
                    registry,
                    true,
                    node.length,
                    bits.min(31),
                    bridge.aperture(ResourceType::Mem32),
                    alignment,
                )
            }),
            ResourceType::PMem64 => Self::scan_aperture(
                registry,
                true,
                node.length,
                bits.min(63),
                bridge.aperture(ResourceType::PMem64),
                alignment,
            )
            .or_else(|| {
                Self::scan_aperture(
                    registry,
                    true,
                    node.length,
                    bits.min(31),
                    bridge.aperture(ResourceType::PMem32),
                    alignment,
                )
            }),
            ResourceType::Bus => unreachable!("bus numbers are not address-space allocated"),
        };

        match base_address {
            Some(base) => {
                let node = bridge.node_mut(res_type);
                node.base = base;
                node.status = ResourceStatus::Allocated;
                log::info!("segment {:#x}: {:?} allocated at {:#x}", bridge.segment(), res_type, base);
                Ok(())
            }
            None => {
                log::error!("segment {:#x}: {:?} out of resources", bridge.segment(), res_type);
                error!(EfiError::OutOfResources);
            }
        }
    }

    /// Walks aligned candidate bases across a window, asking the registry
    /// to reserve each one until a reservation sticks.
    fn scan_aperture(
        registry: &mut R,
        mmio: bool,
        length: u64,
        bits_of_alignment: u32,
        aperture: &Aperture,
        alignment: u64,
    ) -> Option<u64> {
        // Alignment applies to the device address; translation alignment was
        // already verified, so it holds for the host address too.
        let base_address = aperture.to_host(align_value(aperture.base, alignment.wrapping_add(1)));
        let limit = aperture.to_host(aperture.limit);
        if base_address >= limit || length == 0 {
            return None;
        }

        let step = 1u64 << bits_of_alignment;
        let mut address = align_value(base_address, step);
        while let Some(end) = address.checked_add(length - 1) {
            if end > limit {
                break;
            }
            let result = if mmio {
                registry.allocate_memory_space(address, bits_of_alignment, length)
            } else {
                registry.allocate_io_space(address, bits_of_alignment, length)
            };
            if let Ok(base) = result {
                return Some(base);
            }
            address = match address.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        None
    }

    fn build_conflict_report(root_bridges: &[RootBridge]) -> Vec<RootBridgeConflict> {
        root_bridges
            .iter()
            .map(|bridge| RootBridgeConflict {
                segment: bridge.segment(),
                resources: ResourceType::ALL
                    .iter()
                    .map(|&res_type| {
                        let node = bridge.node(res_type);
                        let (granularity, prefetchable) = res_type.mem_traits();
                        ConflictDescriptor {
                            kind: res_type.space_kind(),
                            granularity,
                            prefetchable,
                            base: node.base,
                            alignment: node.alignment,
                            length: node.length,
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// The teardown phase: releases every allocated range and rearms the
    /// cycle. Continues through errors; the last failure wins.
    fn free_resources(&mut self) -> Result<()> {
        let mut return_status = Ok(());
        let registry = &mut self.registry;
        for bridge in &mut self.root_bridges {
            for res_type in ResourceType::ALLOCATABLE {
                if bridge.node(res_type).status != ResourceStatus::Allocated {
                    continue;
                }
                let (base, length) = {
                    let node = bridge.node(res_type);
                    (node.base, node.length)
                };
                let result = match res_type {
                    ResourceType::Io => registry.free_io_space(base, length),
                    _ => registry.free_memory_space(base, length),
                };
                if let Err(e) = result {
                    log::error!(
                        "segment {:#x}: failed to free {:?} at {:#x}: {:?}",
                        bridge.segment(),
                        res_type,
                        base,
                        e
                    );
                    return_status = Err(e);
                }
                bridge.node_mut(res_type).reset();
            }
            bridge.clear_resource_submitted();
        }
        self.can_restarted = true;
        return_status
    }
}

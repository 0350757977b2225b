//! Root bridge state: apertures, allocation attributes, and the per-type
//! resource node table.
//!
//! A root bridge is constructed once from platform configuration and then
//! driven by the host bridge's phase machine. The submission validator in
//! this module is the only writer of `Submitted` nodes; the allocation
//! engine in [`crate::host_bridge`] is the only writer of `Allocated` ones.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::base::{is_alignment_mask, SIZE_4GB};
use crate::error::{EfiError, Result};
use crate::resource::{
    BusRange, ProposedResource, ResourceNode, ResourceRequest, ResourceStatus, ResourceType, Satisfaction, SpaceKind,
};
use crate::{ensure, error};

bitflags! {
    /// Allocation policy switches supplied by platform configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationAttributes: u64 {
        /// The bridge decodes prefetchable requests through the ordinary
        /// memory window; no separate prefetchable window exists.
        const COMBINE_MEM_PMEM = 0x1;
        /// The bridge decodes 64-bit memory above 4GB.
        const MEM64_DECODE = 0x2;
    }
}

/// A contiguous device-address window assigned by platform configuration.
///
/// `base > limit` marks the window as absent. `translation` relates the two
/// address views: `device = host + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aperture {
    pub base: u64,
    pub limit: u64,
    pub translation: i64,
}

impl Aperture {
    /// The absent-window sentinel.
    pub const NONE: Aperture = Aperture { base: u64::MAX, limit: 0, translation: 0 };

    /// Creates a window covering `[base, limit]` in device address space
    /// with no translation.
    pub const fn new(base: u64, limit: u64) -> Self {
        Self { base, limit, translation: 0 }
    }

    /// Creates a translated window; host addresses are obtained by
    /// subtracting `translation` from device addresses.
    pub const fn with_translation(base: u64, limit: u64, translation: i64) -> Self {
        Self { base, limit, translation }
    }

    /// Whether platform configuration supplied this window at all.
    pub const fn is_present(&self) -> bool {
        self.base <= self.limit
    }

    /// Inclusive window length. Only meaningful for present windows.
    pub const fn length(&self) -> u64 {
        self.limit - self.base + 1
    }

    /// Converts a device address inside this window to a host address.
    ///
    /// Wrapping subtraction, so an above-4G host window may legally
    /// translate to a below-4G device window and back.
    pub const fn to_host(&self, device_address: u64) -> u64 {
        device_address.wrapping_sub(self.translation as u64)
    }

    /// Converts a host address inside this window to a device address.
    pub const fn to_device(&self, host_address: u64) -> u64 {
        host_address.wrapping_add(self.translation as u64)
    }
}

impl Default for Aperture {
    fn default() -> Self {
        Aperture::NONE
    }
}

/// The set of windows handed to [`RootBridge::new`], all defaulting to
/// absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Apertures {
    pub bus: Aperture,
    pub io: Aperture,
    pub mem: Aperture,
    pub mem_above_4g: Aperture,
    pub pmem: Aperture,
    pub pmem_above_4g: Aperture,
}

/// One PCI host-to-bus bridge and its resource bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBridge {
    segment: u16,
    attributes: AllocationAttributes,
    apertures: Apertures,
    resource_submitted: bool,
    nodes: [ResourceNode; ResourceType::COUNT],
}

impl RootBridge {
    /// Builds a root bridge from platform configuration.
    ///
    /// Fails with `InvalidParameter` when the configuration is inconsistent:
    /// a translated bus window, prefetchable windows on a combining bridge,
    /// or above-4G windows without 64-bit decode.
    pub fn new(segment: u16, attributes: AllocationAttributes, apertures: Apertures) -> Result<Self> {
        // Bus numbers are not an address space; translation is meaningless
        // there and must be zero.
        ensure!(apertures.bus.translation == 0, EfiError::InvalidParameter);

        if attributes.contains(AllocationAttributes::COMBINE_MEM_PMEM) {
            ensure!(!apertures.pmem.is_present(), EfiError::InvalidParameter);
            ensure!(!apertures.pmem_above_4g.is_present(), EfiError::InvalidParameter);
        }
        if !attributes.contains(AllocationAttributes::MEM64_DECODE) {
            ensure!(!apertures.mem_above_4g.is_present(), EfiError::InvalidParameter);
            ensure!(!apertures.pmem_above_4g.is_present(), EfiError::InvalidParameter);
        }

        let mut nodes = [ResourceNode::new(ResourceType::Io); ResourceType::COUNT];
        for ty in ResourceType::ALL {
            nodes[ty as usize] = ResourceNode::new(ty);
        }

        Ok(Self { segment, attributes, apertures, resource_submitted: false, nodes })
    }

    /// PCI segment this bridge decodes.
    pub fn segment(&self) -> u16 {
        self.segment
    }

    /// The bridge's allocation policy switches.
    pub fn allocation_attributes(&self) -> AllocationAttributes {
        self.attributes
    }

    /// The window descriptors matching each resource type.
    pub fn aperture(&self, res_type: ResourceType) -> &Aperture {
        match res_type {
            ResourceType::Io => &self.apertures.io,
            ResourceType::Mem32 => &self.apertures.mem,
            ResourceType::PMem32 => &self.apertures.pmem,
            ResourceType::Mem64 => &self.apertures.mem_above_4g,
            ResourceType::PMem64 => &self.apertures.pmem_above_4g,
            ResourceType::Bus => &self.apertures.bus,
        }
    }

    /// Read access to a resource node.
    pub fn node(&self, res_type: ResourceType) -> &ResourceNode {
        &self.nodes[res_type as usize]
    }

    pub(crate) fn node_mut(&mut self, res_type: ResourceType) -> &mut ResourceNode {
        &mut self.nodes[res_type as usize]
    }

    /// Whether a resource submission was recorded this enumeration cycle.
    pub fn resource_submitted(&self) -> bool {
        self.resource_submitted
    }

    /// Resets every node and the submission flag for a new enumeration
    /// cycle.
    pub(crate) fn reset_nodes(&mut self) {
        for node in &mut self.nodes {
            node.reset();
        }
        self.resource_submitted = false;
    }

    /// Rearms the submission gate after resources are freed. The bus node
    /// survives; only [`Self::reset_nodes`] clears it.
    pub(crate) fn clear_resource_submitted(&mut self) {
        self.resource_submitted = false;
    }

    /// Validates and records a resource submission.
    ///
    /// All-or-nothing: the node table is untouched unless every request in
    /// the list passes validation. Submitting again overwrites the nodes
    /// named by the new list.
    pub(crate) fn submit_resources(&mut self, requests: &[ResourceRequest]) -> Result<()> {
        for request in requests {
            match request.kind {
                SpaceKind::Mem => {
                    ensure!(request.granularity == 32 || request.granularity == 64, EfiError::InvalidParameter);
                    // A 32-bit decoded span cannot describe 4GB or more.
                    if request.granularity == 32 {
                        ensure!(request.length < SIZE_4GB, EfiError::InvalidParameter);
                    }
                    if request.prefetchable {
                        ensure!(
                            !self.attributes.contains(AllocationAttributes::COMBINE_MEM_PMEM),
                            EfiError::InvalidParameter
                        );
                    }
                }
                SpaceKind::Io => (),
                SpaceKind::Bus => error!(EfiError::InvalidParameter),
            }
            ensure!(is_alignment_mask(request.alignment), EfiError::InvalidParameter);
        }

        for request in requests {
            let res_type = ResourceType::classify(request).expect("request was validated");
            let node = self.node_mut(res_type);
            node.length = request.length;
            node.alignment = request.alignment;
            node.status = ResourceStatus::Submitted;
        }
        self.resource_submitted = true;

        log::trace!("segment {:#x}: {} resource request(s) submitted", self.segment, requests.len());
        Ok(())
    }

    /// Snapshot of the five allocatable nodes in device address space.
    ///
    /// The satisfaction marker distinguishes allocated nodes, submitted
    /// nodes the engine could not satisfy, and windows nothing was
    /// requested for. Fallback allocations report through their own type's
    /// translation, matching the original engine.
    pub(crate) fn proposed_resources(&self) -> Vec<ProposedResource> {
        ResourceType::ALLOCATABLE
            .iter()
            .map(|&res_type| {
                let node = self.node(res_type);
                ProposedResource {
                    res_type,
                    device_base: self.aperture(res_type).to_device(node.base),
                    length: node.length,
                    satisfaction: match node.status {
                        ResourceStatus::Allocated => Satisfaction::Satisfied,
                        ResourceStatus::Submitted => Satisfaction::Less,
                        ResourceStatus::None => Satisfaction::Nonexistent,
                    },
                }
            })
            .collect()
    }

    /// The bus window bus enumeration starts from.
    pub(crate) fn start_bus_enumeration(&self) -> Result<BusRange> {
        ensure!(self.apertures.bus.is_present(), EfiError::Unsupported);
        Ok(BusRange { base: self.apertures.bus.base, length: self.apertures.bus.length() })
    }

    /// Records the bus range enumeration settled on.
    pub(crate) fn set_bus_numbers(&mut self, base: u64, length: u64) -> Result<()> {
        ensure!(length != 0, EfiError::InvalidParameter);
        let limit = base.checked_add(length - 1).ok_or(EfiError::InvalidParameter)?;
        ensure!(base >= self.apertures.bus.base && limit <= self.apertures.bus.limit, EfiError::InvalidParameter);

        let node = self.node_mut(ResourceType::Bus);
        node.base = base;
        node.length = length;
        node.status = ResourceStatus::Allocated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    fn test_apertures() -> Apertures {
        Apertures {
            bus: Aperture::new(0, 0xFF),
            io: Aperture::new(0x1000, 0x1FFF),
            mem: Aperture::new(0x8000_0000, 0x8FFF_FFFF),
            pmem: Aperture::new(0x9000_0000, 0x9FFF_FFFF),
            mem_above_4g: Aperture::new(0x1_0000_0000, 0x1_FFFF_FFFF),
            pmem_above_4g: Aperture::new(0x2_0000_0000, 0x2_FFFF_FFFF),
        }
    }

    fn test_bridge() -> RootBridge {
        RootBridge::new(0, AllocationAttributes::MEM64_DECODE, test_apertures()).unwrap()
    }

    #[test]
    fn construction_rejects_translated_bus_window() {
        let mut apertures = test_apertures();
        apertures.bus = Aperture::with_translation(0, 0xFF, 0x100);
        assert_eq!(
            Err(EfiError::InvalidParameter),
            RootBridge::new(0, AllocationAttributes::MEM64_DECODE, apertures).map(|_| ())
        );
    }

    #[test]
    fn construction_rejects_pmem_window_on_combining_bridge() {
        let attributes = AllocationAttributes::COMBINE_MEM_PMEM | AllocationAttributes::MEM64_DECODE;
        assert_eq!(
            Err(EfiError::InvalidParameter),
            RootBridge::new(0, attributes, test_apertures()).map(|_| ())
        );

        let mut apertures = test_apertures();
        apertures.pmem = Aperture::NONE;
        apertures.pmem_above_4g = Aperture::NONE;
        assert!(RootBridge::new(0, attributes, apertures).is_ok());
    }

    #[test]
    fn construction_rejects_above_4g_windows_without_mem64_decode() {
        assert_eq!(
            Err(EfiError::InvalidParameter),
            RootBridge::new(0, AllocationAttributes::empty(), test_apertures()).map(|_| ())
        );

        let mut apertures = test_apertures();
        apertures.mem_above_4g = Aperture::NONE;
        apertures.pmem_above_4g = Aperture::NONE;
        assert!(RootBridge::new(0, AllocationAttributes::empty(), apertures).is_ok());
    }

    #[test]
    fn submit_classifies_into_nodes() {
        let mut bridge = test_bridge();
        bridge
            .submit_resources(&[
                ResourceRequest::io(0x100, 0xFF),
                ResourceRequest::mem(32, false, 0x10_0000, 0xF_FFFF),
                ResourceRequest::mem(64, true, 0x20_0000, 0x1F_FFFF),
            ])
            .unwrap();

        assert!(bridge.resource_submitted());
        let io = bridge.node(ResourceType::Io);
        assert_eq!((0x100, 0xFF, ResourceStatus::Submitted), (io.length, io.alignment, io.status));
        let mem32 = bridge.node(ResourceType::Mem32);
        assert_eq!((0x10_0000, 0xF_FFFF, ResourceStatus::Submitted), (mem32.length, mem32.alignment, mem32.status));
        let pmem64 = bridge.node(ResourceType::PMem64);
        assert_eq!((0x20_0000, 0x1F_FFFF, ResourceStatus::Submitted), (pmem64.length, pmem64.alignment, pmem64.status));
        assert_eq!(ResourceStatus::None, bridge.node(ResourceType::Mem64).status);
    }

    #[test]
    fn submit_rejects_invalid_alignment_mask_without_mutation() {
        let mut bridge = test_bridge();
        let before = bridge.clone();

        // 0x3FE is not of the form 2^n - 1.
        let result = bridge.submit_resources(&[
            ResourceRequest::io(0x100, 0xFF),
            ResourceRequest::mem(32, false, 0x1000, 0x3FE),
        ]);

        assert_eq!(Err(EfiError::InvalidParameter), result);
        assert_eq!(before, bridge);
    }

    #[test]
    fn submit_rejects_oversized_32_bit_span() {
        let mut bridge = test_bridge();
        assert_eq!(
            Err(EfiError::InvalidParameter),
            bridge.submit_resources(&[ResourceRequest::mem(32, false, SIZE_4GB, 0xFFF)])
        );
        assert!(!bridge.resource_submitted());
    }

    #[test]
    fn submit_rejects_prefetchable_on_combining_bridge() {
        let mut apertures = test_apertures();
        apertures.pmem = Aperture::NONE;
        apertures.pmem_above_4g = Aperture::NONE;
        let attributes = AllocationAttributes::COMBINE_MEM_PMEM | AllocationAttributes::MEM64_DECODE;
        let mut bridge = RootBridge::new(0, attributes, apertures).unwrap();
        let before = bridge.clone();

        assert_eq!(
            Err(EfiError::InvalidParameter),
            bridge.submit_resources(&[ResourceRequest::mem(32, true, 0x1000, 0xFFF)])
        );
        assert_eq!(before, bridge);
    }

    #[test]
    fn submit_rejects_bus_requests() {
        let mut bridge = test_bridge();
        let bus = ResourceRequest { kind: SpaceKind::Bus, granularity: 0, prefetchable: false, length: 1, alignment: 0 };
        assert_eq!(Err(EfiError::InvalidParameter), bridge.submit_resources(&[bus]));
    }

    #[test]
    fn resubmission_overwrites_named_nodes() {
        let mut bridge = test_bridge();
        bridge.submit_resources(&[ResourceRequest::io(0x100, 0xFF)]).unwrap();
        bridge.submit_resources(&[ResourceRequest::io(0x200, 0x1FF)]).unwrap();

        let io = bridge.node(ResourceType::Io);
        assert_eq!((0x200, 0x1FF), (io.length, io.alignment));
    }

    #[test]
    fn bus_numbers_validate_against_bus_window() {
        let mut bridge = test_bridge();
        assert_eq!(BusRange { base: 0, length: 0x100 }, bridge.start_bus_enumeration().unwrap());

        assert_eq!(Err(EfiError::InvalidParameter), bridge.set_bus_numbers(0, 0));
        assert_eq!(Err(EfiError::InvalidParameter), bridge.set_bus_numbers(0x80, 0x100));

        bridge.set_bus_numbers(0x10, 0x20).unwrap();
        let bus = bridge.node(ResourceType::Bus);
        assert_eq!((0x10, 0x20, ResourceStatus::Allocated), (bus.base, bus.length, bus.status));
    }

    #[test]
    fn translation_converts_between_views() {
        let aperture = Aperture::with_translation(0x1000, 0x1FFF, -0x8000_0000_i64);
        assert_eq!(0x8000_1000, aperture.to_host(0x1000));
        assert_eq!(0x1000, aperture.to_device(0x8000_1000));
    }
}

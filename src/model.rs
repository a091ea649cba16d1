// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt::Debug;

use bit_field::BitField;

use crate::consts::*;
use crate::VCpuId;

/// A set of vCPUs of one VM, as a bitmap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VCpuSet(u64);

impl VCpuSet {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn single(vcpu: VCpuId) -> Self {
        Self(1 << vcpu)
    }

    /// Every vCPU of a VM with `count` vCPUs.
    pub const fn all(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, vcpu: VCpuId) -> bool {
        vcpu < 64 && self.0.get_bit(vcpu)
    }

    pub fn insert(&mut self, vcpu: VCpuId) {
        self.0.set_bit(vcpu, true);
    }

    pub fn remove(&mut self, vcpu: VCpuId) {
        self.0.set_bit(vcpu, false);
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn first(self) -> Option<VCpuId> {
        self.iter().next()
    }

    pub fn iter(self) -> impl Iterator<Item = VCpuId> {
        (0..64).filter(move |&i| self.0.get_bit(i))
    }
}

/// The architecture variant of the emulated controller.
///
/// Everything that differs between the legacy target-mask controller and the
/// affinity-routing controller lives behind this trait: the target descriptor
/// of shared interrupts, identification registers, and which register groups
/// exist. The variant is fixed per build.
pub trait VgicModel: Send + Sync + 'static {
    /// Target descriptor of a shared interrupt, as the guest programs it.
    type Target: Copy + Eq + Debug + Send + Sync;

    const NAME: &'static str;
    const MAX_VCPUS: usize;
    /// Whether SGIs keep one pending bit per source vCPU.
    const SGI_SOURCES: bool;
    /// Whether list registers are programmed as group 1.
    const LR_GROUP1: bool;
    /// Group registers read as all-ones (true) or all-zeros (false).
    const GROUP_RAO: bool;
    /// Whether private interrupts are visible (banked) in the distributor.
    const PRIVATE_IN_DIST: bool;
    /// Whether per-vCPU redistributor frames exist.
    const HAS_REDIST: bool;

    const DIST_SIZE: usize;
    const PIDR2_OFFSET: usize;
    const PIDR2: u32;

    const CTLR_WRITE_MASK: u32;
    const CTLR_RAO: u32;
    const CTLR_ENABLE: u32;

    /// Base offset and per-interrupt width of the target register group.
    const TARGET_BASE: usize;
    const TARGET_BITS: usize;

    /// Reset value of a shared interrupt's target.
    fn default_target() -> Self::Target;

    /// The vCPUs allowed to take an interrupt with this target.
    fn target_set(target: Self::Target, vcpu_count: usize) -> VCpuSet;

    fn encode_target(target: Self::Target) -> u64;

    /// Decodes a guest write, dropping bits the register does not implement.
    fn decode_target(raw: u64, vcpu_count: usize) -> Self::Target;

    /// Distributor `TYPER` value.
    fn dist_typer(nr_irqs: usize, vcpu_count: usize) -> u32;
}

/// Legacy (GICv2-style) model: shared interrupts carry an 8-bit CPU mask.
#[derive(Debug)]
pub struct LegacyTargets;

impl VgicModel for LegacyTargets {
    type Target = u8;

    const NAME: &'static str = "gicv2";
    const MAX_VCPUS: usize = GICV2_MAX_VCPUS;
    const SGI_SOURCES: bool = true;
    const LR_GROUP1: bool = false;
    const GROUP_RAO: bool = false;
    const PRIVATE_IN_DIST: bool = true;
    const HAS_REDIST: bool = false;

    const DIST_SIZE: usize = GICD_SIZE_V2;
    const PIDR2_OFFSET: usize = GICD_PIDR2_V2;
    const PIDR2: u32 = 0x2b;

    const CTLR_WRITE_MASK: u32 = 0b1;
    const CTLR_RAO: u32 = 0;
    const CTLR_ENABLE: u32 = 0b1;

    const TARGET_BASE: usize = GICD_ITARGETSR;
    const TARGET_BITS: usize = 8;

    fn default_target() -> u8 {
        0x01
    }

    fn target_set(target: u8, vcpu_count: usize) -> VCpuSet {
        VCpuSet::from_bits(target as u64 & VCpuSet::all(vcpu_count).bits())
    }

    fn encode_target(target: u8) -> u64 {
        target as u64
    }

    fn decode_target(raw: u64, vcpu_count: usize) -> u8 {
        // Bits of CPU interfaces that do not exist are RAZ/WI.
        (raw & VCpuSet::all(vcpu_count).bits() & 0xff) as u8
    }

    fn dist_typer(nr_irqs: usize, vcpu_count: usize) -> u32 {
        let mut typer = 0u32;
        typer.set_bits(0..5, (nr_irqs / 32 - 1) as u32);
        typer.set_bits(5..8, (vcpu_count - 1) as u32);
        typer
    }
}

/// Affinity-routing (GICv3-style) model: shared interrupts carry an `IROUTER`
/// value naming one vCPU by affinity, or "any participating vCPU".
///
/// vCPU `n` has affinity `0.0.(n >> 8).(n & 0xff)`.
#[derive(Debug)]
pub struct AffinityRouting;

impl AffinityRouting {
    /// Implemented `IROUTER` bits: Aff3, IRM, Aff2, Aff1, Aff0.
    pub const IROUTER_MASK: u64 = 0x0000_00ff_80ff_ffff;
    const IRM: usize = 31;

    /// Affinity fields of `vcpu`, laid out as in `IROUTER`/`MPIDR`.
    pub fn vcpu_affinity(vcpu: VCpuId) -> u64 {
        let mut aff = 0u64;
        aff.set_bits(0..8, (vcpu & 0xff) as u64);
        aff.set_bits(8..16, ((vcpu >> 8) & 0xff) as u64);
        aff
    }
}

impl VgicModel for AffinityRouting {
    type Target = u64;

    const NAME: &'static str = "gicv3";
    const MAX_VCPUS: usize = 64;
    const SGI_SOURCES: bool = false;
    const LR_GROUP1: bool = true;
    const GROUP_RAO: bool = true;
    const PRIVATE_IN_DIST: bool = false;
    const HAS_REDIST: bool = true;

    const DIST_SIZE: usize = GICD_SIZE_V3;
    const PIDR2_OFFSET: usize = GICD_PIDR2_V3;
    const PIDR2: u32 = 0x3b;

    // EnableGrp0 and EnableGrp1; ARE and DS are fixed to one.
    const CTLR_WRITE_MASK: u32 = 0b11;
    const CTLR_RAO: u32 = (1 << 4) | (1 << 6);
    const CTLR_ENABLE: u32 = 0b10;

    const TARGET_BASE: usize = GICD_IROUTER;
    const TARGET_BITS: usize = 64;

    fn default_target() -> u64 {
        0
    }

    fn target_set(target: u64, vcpu_count: usize) -> VCpuSet {
        if target.get_bit(Self::IRM) {
            return VCpuSet::all(vcpu_count);
        }
        if target.get_bits(16..24) != 0 || target.get_bits(32..40) != 0 {
            return VCpuSet::EMPTY;
        }
        let vcpu = (target.get_bits(8..16) << 8 | target.get_bits(0..8)) as usize;
        if vcpu < vcpu_count {
            VCpuSet::single(vcpu)
        } else {
            VCpuSet::EMPTY
        }
    }

    fn encode_target(target: u64) -> u64 {
        target
    }

    fn decode_target(raw: u64, _vcpu_count: usize) -> u64 {
        raw & Self::IROUTER_MASK
    }

    fn dist_typer(nr_irqs: usize, _vcpu_count: usize) -> u32 {
        let mut typer = 0u32;
        typer.set_bits(0..5, (nr_irqs / 32 - 1) as u32);
        // 10 interrupt id bits.
        typer.set_bits(19..24, 9);
        typer
    }
}

/// The controller model used when none is named explicitly.
#[cfg(not(feature = "gicv3"))]
pub type DefaultModel = LegacyTargets;
/// The controller model used when none is named explicitly.
#[cfg(feature = "gicv3")]
pub type DefaultModel = AffinityRouting;

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

use bit_field::BitField;

use crate::consts::{DEFAULT_PRIO, PRIVATE_COUNT, SGI_COUNT};
use crate::model::VgicModel;
use crate::{IrqId, VCpuKey};

/// Delivery state of a virtual interrupt.
///
/// The discriminants are the 2-bit state encoding used by list registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum IrqState {
    /// Neither pending nor active.
    #[default]
    Inactive = 0,
    /// Asserted, not yet acknowledged by the guest.
    Pending = 1,
    /// Acknowledged by the guest, not yet completed.
    Active = 2,
    /// Active, and asserted again before completion.
    PendingActive = 3,
}

impl IrqState {
    /// Decodes the low two bits of `bits`.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Inactive,
            1 => Self::Pending,
            2 => Self::Active,
            _ => Self::PendingActive,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    pub const fn is_pending(self) -> bool {
        self.bits() & 0b01 != 0
    }

    pub const fn is_active(self) -> bool {
        self.bits() & 0b10 != 0
    }

    pub const fn is_inactive(self) -> bool {
        matches!(self, Self::Inactive)
    }

    pub const fn with_pending(self, pending: bool) -> Self {
        if pending {
            Self::from_bits(self.bits() | 0b01)
        } else {
            Self::from_bits(self.bits() & !0b01)
        }
    }

    pub const fn with_active(self, active: bool) -> Self {
        if active {
            Self::from_bits(self.bits() | 0b10)
        } else {
            Self::from_bits(self.bits() & !0b10)
        }
    }

    /// The line is asserted: `Inactive -> Pending`, `Active -> PendingActive`.
    pub const fn assert(self) -> Self {
        self.with_pending(true)
    }

    /// The guest acknowledges the interrupt: `Pending -> Active`.
    pub const fn acknowledge(self) -> Self {
        match self {
            Self::Pending => Self::Active,
            other => other,
        }
    }

    /// The guest completes the interrupt: `Active -> Inactive`, `PendingActive -> Pending`.
    pub const fn eoi(self) -> Self {
        self.with_active(false)
    }
}

/// Trigger mode of an interrupt line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

/// Software record of one virtual interrupt.
///
/// While `slot` is `Some`, the list register on the owner's core is the
/// authoritative copy of the delivery state and `state` is only a snapshot.
#[derive(Debug)]
pub(crate) struct VirtIrq<M: VgicModel> {
    pub(crate) id: IrqId,
    pub(crate) state: IrqState,
    pub(crate) enabled: bool,
    pub(crate) prio: u8,
    pub(crate) trigger: Trigger,
    /// Physical line backing this interrupt, if any.
    pub(crate) hw: Option<IrqId>,
    pub(crate) target: M::Target,
    pub(crate) slot: Option<usize>,
    pub(crate) owner: Option<VCpuKey>,
    /// Pending source vCPUs of an SGI.
    pub(crate) sources: u8,
    /// Source of the SGI instance currently active.
    pub(crate) act_source: u8,
    /// Placed in a software slot while hardware-backed; the physical line is
    /// deactivated when that slot retires.
    pub(crate) sw_completion: bool,
    /// Placed while disabled; the pending half was withheld from the slot.
    pub(crate) masked_pending: bool,
}

impl<M: VgicModel> VirtIrq<M> {
    pub(crate) fn new_shared(id: IrqId) -> Self {
        Self::new(id, None)
    }

    /// Private interrupts are permanently owned by the vCPU of their bank.
    pub(crate) fn new_private(id: IrqId, key: VCpuKey) -> Self {
        let mut irq = Self::new(id, Some(key));
        if id < SGI_COUNT {
            irq.enabled = true;
            irq.trigger = Trigger::Edge;
        }
        irq
    }

    fn new(id: IrqId, owner: Option<VCpuKey>) -> Self {
        Self {
            id,
            state: IrqState::Inactive,
            enabled: false,
            prio: DEFAULT_PRIO,
            trigger: Trigger::Level,
            hw: None,
            target: M::default_target(),
            slot: None,
            owner,
            sources: 0,
            act_source: 0,
            sw_completion: false,
            masked_pending: false,
        }
    }

    pub(crate) fn is_sgi(&self) -> bool {
        self.id < SGI_COUNT
    }

    pub(crate) fn is_private(&self) -> bool {
        self.id < PRIVATE_COUNT
    }

    pub(crate) fn owner_vcpu(&self) -> Option<usize> {
        self.owner.map(|key| key.vcpu)
    }

    /// Enabled and holding something the guest still has to see.
    pub(crate) fn is_deliverable(&self) -> bool {
        self.enabled && !self.state.is_inactive()
    }

    /// Deliverable, or active and still owed a completion even while disabled.
    pub(crate) fn needs_slot(&self) -> bool {
        self.state.is_active() || self.is_deliverable()
    }

    /// Asserts the interrupt, recording `source` for SGIs.
    pub(crate) fn assert(&mut self, source: Option<usize>) {
        if self.is_sgi() {
            let source = if M::SGI_SOURCES { source.unwrap_or(0) } else { 0 };
            self.sources.set_bit(source, true);
        }
        self.state = self.state.assert();
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        if self.is_sgi() {
            self.sources = if pending { self.sources | 1 } else { 0 };
        }
        self.state = self.state.with_pending(pending);
    }

    /// Drops the SGI sources in `mask`; the interrupt stays pending while any remain.
    pub(crate) fn clear_sources(&mut self, mask: u8) {
        self.sources &= !mask;
        self.state = self.state.with_pending(self.sources != 0);
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.state = self.state.with_active(active);
    }

    /// Releases a shared interrupt that is neither resident nor active.
    pub(crate) fn try_yield(&mut self) -> bool {
        if self.is_private() || self.slot.is_some() || self.state.is_active() {
            return false;
        }
        self.owner = None;
        true
    }
}

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

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::marker::PhantomData;

use bit_field::BitField;
use spin::Mutex;

use crate::hal::{AxVirqHal, ListRegs, MaintenanceFlags, PhysIntc};
use crate::irq::{IrqState, VirtIrq};
use crate::lr::ListReg;
use crate::model::VgicModel;
use crate::IrqId;

/// Interrupts waiting for a free list slot, best priority first.
///
/// Interrupts of equal priority keep their insertion order.
#[derive(Debug, Default)]
pub(crate) struct SpillList {
    entries: VecDeque<(u8, IrqId)>,
}

impl SpillList {
    pub(crate) fn insert(&mut self, prio: u8, id: IrqId) {
        self.remove(id);
        let at = self.entries.partition_point(|&(p, _)| p <= prio);
        self.entries.insert(at, (prio, id));
    }

    pub(crate) fn remove(&mut self, id: IrqId) -> bool {
        match self.entries.iter().position(|&(_, i)| i == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn peek(&self) -> Option<(u8, IrqId)> {
        self.entries.front().copied()
    }

    pub(crate) fn pop(&mut self) -> Option<IrqId> {
        self.entries.pop_front().map(|(_, id)| id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = IrqId> + '_ {
        self.entries.iter().map(|&(_, id)| id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
struct Resident {
    id: IrqId,
    prio: u8,
}

struct SlotBook {
    slots: Vec<Option<Resident>>,
    spill: SpillList,
}

/// The list slots of one vCPU, and its spill list.
///
/// All methods touch the list registers of the current core, so they must only
/// be called on the core the vCPU is pinned to, with the interrupt's lock held
/// where one is passed in.
pub(crate) struct ListSlots<H: AxVirqHal> {
    book: Mutex<SlotBook>,
    _hal: PhantomData<fn() -> H>,
}

impl<H: AxVirqHal> ListSlots<H> {
    pub(crate) fn new() -> Self {
        let count = H::ListRegs::count().min(64);
        Self {
            book: Mutex::new(SlotBook {
                slots: alloc::vec![None; count],
                spill: SpillList::default(),
            }),
            _hal: PhantomData,
        }
    }

    /// Places `virq` in a free list slot.
    ///
    /// A resident interrupt is reprogrammed in place. When no slot is free the
    /// interrupt goes to the spill list instead; nothing is evicted. Returns
    /// whether the interrupt is now resident.
    ///
    /// A disabled interrupt is only placed while active, so that its
    /// completion still reaches the hypervisor.
    pub(crate) fn add_slot<M: VgicModel>(&self, virq: &mut VirtIrq<M>) -> bool {
        if !virq.needs_slot() {
            return false;
        }
        let mut book = self.book.lock();
        let Some(idx) = virq.slot.or_else(|| Self::free_slot(&book)) else {
            trace!("irq {} spilled (prio {:#x})", virq.id, virq.prio);
            book.spill.insert(virq.prio, virq.id);
            Self::update_maintenance(&book);
            return false;
        };
        let lr = Self::compose(virq);
        trace!("irq {} -> slot {}: {:?}", virq.id, idx, lr.state);
        H::ListRegs::write(idx, lr);
        book.slots[idx] = Some(Resident {
            id: virq.id,
            prio: virq.prio,
        });
        book.spill.remove(virq.id);
        virq.slot = Some(idx);
        Self::update_maintenance(&book);
        true
    }

    /// Takes `virq` out of its list slot, folding the slot's state back into
    /// the software record. Does nothing if the interrupt is not resident.
    pub(crate) fn remove_slot<M: VgicModel>(&self, virq: &mut VirtIrq<M>) -> bool {
        let Some(idx) = virq.slot else {
            return false;
        };
        let mut book = self.book.lock();
        assert!(
            idx < book.slots.len(),
            "irq {} in list slot {}, only {} implemented",
            virq.id,
            idx,
            book.slots.len()
        );
        let lr = H::ListRegs::read(idx);
        let (state, sources, act_source) = Self::fold(virq, &lr);
        if let Some(hw) = virq.hw.filter(|_| virq.sw_completion && !state.is_active()) {
            // The guest completed a slot that did not carry the physical line.
            H::PhysIntc::deactivate(hw);
        }
        virq.state = state;
        virq.sources = sources;
        virq.act_source = act_source;
        virq.sw_completion = false;
        virq.masked_pending = false;
        H::ListRegs::write(idx, ListReg::EMPTY);
        book.slots[idx] = None;
        virq.slot = None;
        Self::update_maintenance(&book);
        true
    }

    /// State of a resident interrupt as the guest currently sees it.
    pub(crate) fn peek_state<M: VgicModel>(&self, virq: &VirtIrq<M>) -> IrqState {
        match virq.slot {
            Some(idx) => Self::fold(virq, &H::ListRegs::read(idx)).0,
            None => virq.state,
        }
    }

    /// Pending SGI sources, including the one held by a resident slot.
    pub(crate) fn peek_sources<M: VgicModel>(&self, virq: &VirtIrq<M>) -> u8 {
        match virq.slot {
            Some(idx) => Self::fold(virq, &H::ListRegs::read(idx)).1,
            None => virq.sources,
        }
    }

    pub(crate) fn spill(&self, prio: u8, id: IrqId) {
        let mut book = self.book.lock();
        book.spill.insert(prio, id);
        Self::update_maintenance(&book);
    }

    pub(crate) fn unspill(&self, id: IrqId) -> bool {
        let mut book = self.book.lock();
        let removed = book.spill.remove(id);
        if removed {
            Self::update_maintenance(&book);
        }
        removed
    }

    /// Pops the best spilled interrupt, but only if a slot is free to take it.
    pub(crate) fn pop_spilled(&self) -> Option<IrqId> {
        let mut book = self.book.lock();
        Self::free_slot(&book)?;
        let id = book.spill.pop();
        Self::update_maintenance(&book);
        id
    }

    /// Snapshot of the spill list, best priority first.
    pub(crate) fn spilled(&self) -> Vec<IrqId> {
        self.book.lock().spill.ids().collect()
    }

    /// Slots still booked for an interrupt the hardware has already retired.
    pub(crate) fn retired(&self) -> Vec<(usize, IrqId)> {
        let book = self.book.lock();
        let empty = H::ListRegs::empty_mask();
        book.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, res)| res.filter(|_| empty.get_bit(idx)).map(|r| (idx, r.id)))
            .collect()
    }

    pub(crate) fn resident(&self) -> Vec<(usize, IrqId)> {
        let book = self.book.lock();
        book.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, res)| res.map(|r| (idx, r.id)))
            .collect()
    }

    /// The worst resident interrupt that is only pending and ranks strictly
    /// below the best spilled one.
    pub(crate) fn rebalance_victim(&self) -> Option<IrqId> {
        let book = self.book.lock();
        let (best, _) = book.spill.peek()?;
        book.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, res)| res.map(|r| (idx, r)))
            .filter(|&(idx, r)| r.prio > best && H::ListRegs::read(idx).state == IrqState::Pending)
            .max_by_key(|&(_, r)| r.prio)
            .map(|(_, r)| r.id)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.book.lock().slots.len()
    }

    /// Numbers of resident and spilled interrupts.
    pub(crate) fn usage(&self) -> (usize, usize) {
        let book = self.book.lock();
        let resident = book.slots.iter().filter(|s| s.is_some()).count();
        (resident, book.spill.len())
    }

    fn free_slot(book: &SlotBook) -> Option<usize> {
        let empty = H::ListRegs::empty_mask();
        (0..book.slots.len()).find(|&idx| book.slots[idx].is_none() && empty.get_bit(idx))
    }

    /// Requests a maintenance interrupt exactly while something is spilled.
    ///
    /// A spilled interrupt may be active, so completions that match no slot
    /// are counted too.
    fn update_maintenance(book: &SlotBook) {
        let mut flags = H::ListRegs::maintenance();
        flags.set(
            MaintenanceFlags::UNDERFLOW | MaintenanceFlags::EOI_COUNT,
            !book.spill.is_empty(),
        );
        H::ListRegs::set_maintenance(flags);
    }

    /// Builds the slot image of `virq`, consuming one SGI source.
    ///
    /// A disabled interrupt only shows its active half to the guest.
    fn compose<M: VgicModel>(virq: &mut VirtIrq<M>) -> ListReg {
        virq.masked_pending = !virq.enabled && virq.state.is_pending();
        let state = virq.state.with_pending(virq.state.is_pending() && virq.enabled);
        let mut lr = ListReg {
            vintid: virq.id as u32,
            priority: virq.prio,
            group1: M::LR_GROUP1,
            state,
            ..ListReg::EMPTY
        };
        // A hardware-backed slot cannot hold PendingActive.
        if let Some(pintid) = virq.hw.filter(|_| state != IrqState::PendingActive) {
            lr.pintid = Some(pintid as u32);
            return lr;
        }
        virq.sw_completion = virq.hw.is_some();
        if virq.is_sgi() {
            if virq.state.is_active() {
                // Further sources are delivered after completion.
                lr.source = virq.act_source;
                lr.state = IrqState::Active;
            } else if let Some(src) = (0..8).rev().find(|&b| virq.sources.get_bit(b)) {
                virq.sources.set_bit(src, false);
                lr.source = src as u8;
                lr.state = IrqState::Pending;
            }
        }
        lr.eoi = true;
        lr
    }

    /// Merges a slot's content with the software record: `(state, sources, act_source)`.
    fn fold<M: VgicModel>(virq: &VirtIrq<M>, lr: &ListReg) -> (IrqState, u8, u8) {
        let mut state = if lr.vintid as usize == virq.id {
            lr.state
        } else {
            IrqState::Inactive
        };
        let mut sources = virq.sources;
        let mut act_source = virq.act_source;
        if virq.is_sgi() && virq.hw.is_none() {
            if state.is_pending() {
                sources.set_bit(lr.source as usize, true);
            }
            if state.is_active() {
                act_source = lr.source;
            }
            state = state.with_pending(sources != 0);
        }
        if virq.masked_pending {
            state = state.with_pending(true);
        }
        (state, sources, act_source)
    }
}

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

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use axaddrspace::{GuestPhysAddr, GuestPhysAddrRange};
use axerrno::{ax_err, AxResult};
use bit_field::BitArray;
use spin::{Mutex, RwLock};

use crate::consts::*;
use crate::hal::{AxVirqHal, ListRegs, PhysIntc};
use crate::irq::{IrqState, Trigger, VirtIrq};
use crate::list::ListSlots;
use crate::mailbox::{EventId, Mailbox};
use crate::model::{DefaultModel, VCpuSet, VgicModel};
use crate::router::VmIrqSink;
use crate::{CpuId, IrqId, VCpuId, VCpuKey, VmId};

/// Mailbox event carrying [`VirqMsg`]s.
pub const VIRQ_EVENT: EventId = 0;

/// What the receiving core of a [`VirqMsg`] should do with the interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirqEvent {
    /// Assert the interrupt (with the message's SGI source).
    Pend,
    /// Clear its pending state.
    Unpend,
    Activate,
    Deactivate,
    /// Re-derive placement from the current state, taking the interrupt if it is free.
    Route,
}

/// Cross-core request about one virtual interrupt.
///
/// Every event is idempotent: the receiver re-checks ownership and live state
/// and forwards the request again if the interrupt moved meanwhile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirqMsg {
    pub vm: VmId,
    pub id: IrqId,
    pub source: Option<VCpuId>,
    pub event: VirqEvent,
}

/// Creation parameters of a VM's virtual interrupt controller.
#[derive(Clone, Debug)]
pub struct VIntcConfig {
    pub vm_id: VmId,
    /// `vcpu_cpus[i]` is the physical core vCPU `i` is pinned to.
    pub vcpu_cpus: Vec<CpuId>,
    /// Number of interrupt ids, rounded up to a multiple of 32.
    pub nr_irqs: usize,
    pub dist_base: GuestPhysAddr,
    /// Base of the per-vCPU redistributor frames (affinity routing only).
    pub redist_base: GuestPhysAddr,
    pub iidr: u32,
}

impl VIntcConfig {
    pub fn new(vm_id: VmId, vcpu_cpus: Vec<CpuId>) -> Self {
        Self {
            vm_id,
            vcpu_cpus,
            nr_irqs: 256,
            dist_base: GuestPhysAddr::from_usize(0x0800_0000),
            redist_base: GuestPhysAddr::from_usize(0x080a_0000),
            iidr: DEFAULT_IIDR,
        }
    }
}

pub(crate) struct VCpuBank<H: AxVirqHal, M: VgicModel> {
    pub(crate) irqs: Vec<Mutex<VirtIrq<M>>>,
    pub(crate) slots: ListSlots<H>,
    pub(crate) waker: AtomicU32,
}

/// The virtual interrupt controller of one VM.
///
/// Every vCPU is pinned to one physical core. The list slots of a vCPU are only
/// ever touched from that core; anything that needs them from elsewhere is sent
/// there as a [`VirqMsg`]. Each interrupt has its own lock and no two interrupt
/// locks are ever held together.
pub struct AxVIntc<H: AxVirqHal, M: VgicModel = DefaultModel> {
    vm_id: VmId,
    vcpu_cpus: Vec<CpuId>,
    nr_irqs: usize,
    pub(crate) dist: GuestPhysAddrRange,
    pub(crate) redist: GuestPhysAddrRange,
    pub(crate) iidr: u32,
    ctlr: AtomicU32,
    shared: Vec<Mutex<VirtIrq<M>>>,
    pub(crate) banks: Vec<VCpuBank<H, M>>,
    hw_owned: RwLock<Vec<u64>>,
    mailbox: Arc<Mailbox<H, VirqMsg>>,
}

impl<H: AxVirqHal, M: VgicModel> AxVIntc<H, M> {
    /// Creates the controller of a VM; cross-core requests go through `mailbox`.
    pub fn new(config: VIntcConfig, mailbox: Arc<Mailbox<H, VirqMsg>>) -> AxResult<Self> {
        let vm_id = config.vm_id;
        let vcpus = config.vcpu_cpus.len();
        if vcpus == 0 || vcpus > M::MAX_VCPUS {
            return ax_err!(
                InvalidInput,
                format!("vm[{}]: {} vcpus unsupported by {}", vm_id, vcpus, M::NAME)
            );
        }
        for (i, cpu) in config.vcpu_cpus.iter().enumerate() {
            if config.vcpu_cpus[..i].contains(cpu) {
                return ax_err!(
                    InvalidInput,
                    format!("vm[{}]: cpu {} hosts more than one vcpu", vm_id, cpu)
                );
            }
        }
        let nr_irqs = (config.nr_irqs.clamp(PRIVATE_COUNT, 1024) + 31) / 32 * 32;

        let banks = (0..vcpus)
            .map(|vcpu| {
                let key = VCpuKey { vm: vm_id, vcpu };
                VCpuBank {
                    irqs: (0..PRIVATE_COUNT)
                        .map(|id| Mutex::new(VirtIrq::new_private(id, key)))
                        .collect(),
                    slots: ListSlots::new(),
                    waker: AtomicU32::new(GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP),
                }
            })
            .collect();
        let redist_size = if M::HAS_REDIST {
            vcpus * GICR_FRAME_SIZE
        } else {
            0
        };

        info!(
            "vm[{}]: {} interrupt controller, {} vcpus on cpus {:?}, {} irqs",
            vm_id,
            M::NAME,
            vcpus,
            config.vcpu_cpus,
            nr_irqs
        );
        Ok(Self {
            vm_id,
            vcpu_cpus: config.vcpu_cpus,
            nr_irqs,
            dist: GuestPhysAddrRange::from_start_size(config.dist_base, M::DIST_SIZE),
            redist: GuestPhysAddrRange::from_start_size(config.redist_base, redist_size),
            iidr: config.iidr,
            ctlr: AtomicU32::new(M::CTLR_RAO),
            shared: (PRIVATE_COUNT..nr_irqs)
                .map(|id| Mutex::new(VirtIrq::new_shared(id)))
                .collect(),
            banks,
            hw_owned: RwLock::new(alloc::vec![0; (nr_irqs + 63) / 64]),
            mailbox,
        })
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpu_cpus.len()
    }

    pub fn nr_irqs(&self) -> usize {
        self.nr_irqs
    }

    pub fn vcpu_cpus(&self) -> &[CpuId] {
        &self.vcpu_cpus
    }

    /// The core running vCPU 0.
    pub fn home_cpu(&self) -> CpuId {
        self.vcpu_cpus[0]
    }

    /// The vCPU of this VM pinned to the current core.
    pub fn local_vcpu(&self) -> Option<VCpuId> {
        let cpu = H::current_cpu();
        self.vcpu_cpus.iter().position(|&c| c == cpu)
    }

    pub fn dist_enabled(&self) -> bool {
        self.ctlr.load(Ordering::Acquire) & M::CTLR_ENABLE != 0
    }

    /// Delivery state of interrupt `id` as seen by `vcpu`.
    ///
    /// Interrupts resident on the current core are read back from their list slot.
    pub fn irq_state(&self, vcpu: VCpuId, id: IrqId) -> Option<IrqState> {
        let virq = self.virq(vcpu, id)?.lock();
        Some(self.current_state(&virq))
    }

    /// Resident and spilled interrupt counts of `vcpu`.
    pub fn slot_usage(&self, vcpu: VCpuId) -> Option<(usize, usize)> {
        self.banks.get(vcpu).map(|bank| bank.slots.usage())
    }

    /// Number of list slots available to each vCPU.
    pub fn slot_capacity(&self) -> usize {
        self.banks[0].slots.capacity()
    }

    /// Asserts interrupt `id` on behalf of another hypervisor subsystem.
    ///
    /// `vcpu` selects the bank of a private interrupt and is ignored for shared ones.
    pub fn inject_irq(&self, vcpu: VCpuId, id: IrqId) -> AxResult {
        if vcpu >= self.vcpu_count() || !self.valid_id(id) {
            return ax_err!(
                InvalidInput,
                format!("vm[{}]: cannot inject irq {} into vcpu {}", self.vm_id, id, vcpu)
            );
        }
        self.pend(vcpu, id, None);
        Ok(())
    }

    /// Asserts the hardware-backed interrupt `id` after its physical line fired here.
    pub fn inject_hw_irq(&self, id: IrqId) {
        let vcpu = self.local_vcpu().unwrap_or(0);
        self.pend(vcpu, id, None);
    }

    pub fn set_enable(&self, vcpu: VCpuId, id: IrqId, enabled: bool) {
        if id < SGI_COUNT {
            return;
        }
        self.update_field(vcpu, id, |virq| {
            if virq.enabled == enabled {
                return false;
            }
            virq.enabled = enabled;
            if let Some(hw) = virq.hw {
                H::PhysIntc::enable(hw, enabled);
            }
            true
        });
    }

    pub fn set_priority(&self, vcpu: VCpuId, id: IrqId, prio: u8) {
        let prio = prio & PRIO_MASK;
        self.update_field(vcpu, id, |virq| {
            if virq.prio == prio {
                return false;
            }
            virq.prio = prio;
            if let Some(hw) = virq.hw {
                H::PhysIntc::set_priority(hw, prio);
            }
            true
        });
    }

    /// Programs the target of shared interrupt `id` from a raw register value.
    pub fn set_target(&self, id: IrqId, raw: u64) {
        if id < PRIVATE_COUNT {
            return;
        }
        let target = M::decode_target(raw, self.vcpu_count());
        self.update_field(0, id, |virq| {
            if virq.target == target {
                return false;
            }
            virq.target = target;
            if let Some(hw) = virq.hw {
                H::PhysIntc::set_route(hw, self.route_cpu(target));
            }
            true
        });
    }

    pub fn set_trigger(&self, vcpu: VCpuId, id: IrqId, trigger: Trigger) {
        if id < SGI_COUNT {
            return;
        }
        self.update_field(vcpu, id, |virq| {
            let changed = virq.trigger != trigger;
            virq.trigger = trigger;
            changed
        });
    }

    pub fn set_pending(&self, vcpu: VCpuId, id: IrqId, pending: bool) {
        let event = if pending {
            VirqEvent::Pend
        } else {
            VirqEvent::Unpend
        };
        self.update_state(vcpu, id, event, None, |virq| {
            virq.set_pending(pending);
            if let Some(hw) = virq.hw.filter(|_| !pending) {
                H::PhysIntc::clear_pending(hw);
            }
        });
    }

    pub fn set_active(&self, vcpu: VCpuId, id: IrqId, active: bool) {
        let event = if active {
            VirqEvent::Activate
        } else {
            VirqEvent::Deactivate
        };
        self.update_state(vcpu, id, event, None, |virq| {
            let was_active = virq.state.is_active();
            virq.set_active(active);
            // The list slot no longer completes the physical line for us.
            if let Some(hw) = virq.hw.filter(|_| was_active && !active) {
                H::PhysIntc::deactivate(hw);
            }
        });
    }

    /// Sends SGI `sgi` from vCPU `source` to every vCPU in `targets`.
    pub fn send_sgi(&self, source: VCpuId, targets: VCpuSet, sgi: IrqId) {
        if sgi >= SGI_COUNT {
            return;
        }
        for target in targets.iter().take_while(|&t| t < self.vcpu_count()) {
            self.pend(target, sgi, Some(source));
        }
    }

    /// Drops the pending SGI sources in `mask` of a private SGI of `vcpu`.
    pub(crate) fn clear_sgi_sources(&self, vcpu: VCpuId, sgi: IrqId, mask: u8) {
        self.update_state(vcpu, sgi, VirqEvent::Unpend, None, |virq| {
            virq.clear_sources(mask)
        });
    }

    /// Pending sources of SGI `sgi` of `vcpu`.
    pub(crate) fn sgi_sources(&self, vcpu: VCpuId, sgi: IrqId) -> u8 {
        let Some(cell) = self.virq(vcpu, sgi) else {
            return 0;
        };
        let virq = cell.lock();
        match virq.owner_vcpu() {
            Some(owner) if Some(owner) == self.local_vcpu() => {
                self.banks[owner].slots.peek_sources(&virq)
            }
            _ => virq.sources,
        }
    }

    /// Applies a request another core sent to this one.
    pub fn handle_msg(&self, msg: VirqMsg) {
        let Some(vcpu) = self.local_vcpu() else {
            warn!(
                "vm[{}]: {:?} for irq {} arrived on cpu {} hosting no vcpu",
                self.vm_id,
                msg.event,
                msg.id,
                H::current_cpu()
            );
            return;
        };
        match msg.event {
            VirqEvent::Pend => self.pend(vcpu, msg.id, msg.source),
            VirqEvent::Unpend => self.set_pending(vcpu, msg.id, false),
            VirqEvent::Activate => self.set_active(vcpu, msg.id, true),
            VirqEvent::Deactivate => self.set_active(vcpu, msg.id, false),
            VirqEvent::Route => {
                self.reevaluate(vcpu, msg.id);
                self.refill(Some(vcpu));
            }
        }
    }

    /// Maintenance interrupt of the local vCPU: reclaims retired list slots,
    /// completes spilled active interrupts the guest EOIed, refills free slots
    /// from the spill list, then swaps spilled interrupts that outrank resident
    /// pending ones.
    pub fn maintenance(&self) {
        let Some(vcpu) = self.local_vcpu() else {
            return;
        };
        let slots = &self.banks[vcpu].slots;
        for _ in 0..H::ListRegs::take_eoi_count() {
            if !self.complete_spilled(vcpu) {
                warn!(
                    "vm[{}]: vcpu {} completed an interrupt that is not active",
                    self.vm_id, vcpu
                );
                break;
            }
        }
        for (idx, id) in slots.retired() {
            let Some(cell) = self.virq(vcpu, id) else {
                continue;
            };
            let mut virq = cell.lock();
            if virq.slot != Some(idx) || virq.owner_vcpu() != Some(vcpu) {
                continue;
            }
            slots.remove_slot(&mut virq);
            self.route(&mut virq, Some(vcpu));
        }
        self.refill(Some(vcpu));
        self.rebalance(vcpu);
    }

    /// Applies a guest completion that matched no list slot to the best spilled
    /// active interrupt of `vcpu`.
    fn complete_spilled(&self, vcpu: VCpuId) -> bool {
        let slots = &self.banks[vcpu].slots;
        for id in slots.spilled() {
            let Some(cell) = self.virq(vcpu, id) else {
                continue;
            };
            let mut virq = cell.lock();
            if virq.owner_vcpu() != Some(vcpu) || virq.slot.is_some() || !virq.state.is_active() {
                continue;
            }
            slots.unspill(id);
            virq.set_active(false);
            if let Some(hw) = virq.hw {
                H::PhysIntc::deactivate(hw);
            }
            trace!("vm[{}]: spilled irq {} completed", self.vm_id, id);
            self.route(&mut virq, Some(vcpu));
            return true;
        }
        false
    }

    /// Folds every list slot of the local vCPU back into software, e.g. before
    /// the core's list registers are handed to another context.
    pub fn save_slots(&self) {
        let Some(vcpu) = self.local_vcpu() else {
            return;
        };
        let slots = &self.banks[vcpu].slots;
        for (idx, id) in slots.resident() {
            let Some(cell) = self.virq(vcpu, id) else {
                continue;
            };
            let mut virq = cell.lock();
            if virq.slot != Some(idx) {
                continue;
            }
            slots.remove_slot(&mut virq);
            if virq.needs_slot() {
                slots.spill(virq.prio, id);
            } else {
                virq.try_yield();
            }
        }
    }

    /// Re-seats the local vCPU's interrupts after [`Self::save_slots`].
    pub fn restore_slots(&self) {
        let Some(vcpu) = self.local_vcpu() else {
            return;
        };
        self.refill(Some(vcpu));
        self.rebalance(vcpu);
    }

    pub(crate) fn ctlr(&self) -> u32 {
        self.ctlr.load(Ordering::Acquire)
    }

    pub(crate) fn write_ctlr(&self, val: u32) {
        let new = (val & M::CTLR_WRITE_MASK) | M::CTLR_RAO;
        let old = self.ctlr.swap(new, Ordering::AcqRel);
        if old & M::CTLR_ENABLE == 0 && new & M::CTLR_ENABLE != 0 {
            debug!("vm[{}]: distributor enabled", self.vm_id);
            self.reroute_all();
        }
    }

    pub(crate) fn valid_id(&self, id: IrqId) -> bool {
        id < self.nr_irqs.min(MAX_IRQS)
    }

    pub(crate) fn virq(&self, vcpu: VCpuId, id: IrqId) -> Option<&Mutex<VirtIrq<M>>> {
        if id < PRIVATE_COUNT {
            self.banks.get(vcpu).map(|bank| &bank.irqs[id])
        } else if self.valid_id(id) {
            self.shared.get(id - PRIVATE_COUNT)
        } else {
            None
        }
    }

    pub(crate) fn current_state(&self, virq: &VirtIrq<M>) -> IrqState {
        match virq.owner_vcpu() {
            Some(owner) if virq.slot.is_some() && Some(owner) == self.local_vcpu() => {
                self.banks[owner].slots.peek_state(virq)
            }
            _ => virq.state,
        }
    }

    pub(crate) fn pend(&self, vcpu: VCpuId, id: IrqId, source: Option<VCpuId>) {
        self.update_state(vcpu, id, VirqEvent::Pend, source, |virq| virq.assert(source));
    }

    /// Changes the delivery state of an interrupt on the core allowed to touch
    /// its list slot. If the interrupt is owned by a vCPU on another core, the
    /// change is sent there as `event` instead; a clear is also applied to the
    /// software record at once, so later reads from here do not see it pending.
    fn update_state(
        &self,
        vcpu: VCpuId,
        id: IrqId,
        event: VirqEvent,
        source: Option<VCpuId>,
        f: impl FnOnce(&mut VirtIrq<M>),
    ) {
        let Some(cell) = self.virq(vcpu, id) else {
            return;
        };
        let local = self.local_vcpu();
        let mut virq = cell.lock();
        if let Some(owner) = virq.owner_vcpu().filter(|&o| Some(o) != local) {
            if event == VirqEvent::Unpend {
                f(&mut virq);
            }
            drop(virq);
            self.post(owner, id, source, event);
            return;
        }
        self.detach(&mut virq, local);
        f(&mut virq);
        self.route(&mut virq, local);
        drop(virq);
        self.refill(local);
    }

    /// Changes a configuration field, which lives in software only. The owning
    /// core is asked to re-evaluate placement if it is not this one.
    fn update_field(&self, vcpu: VCpuId, id: IrqId, f: impl FnOnce(&mut VirtIrq<M>) -> bool) {
        let Some(cell) = self.virq(vcpu, id) else {
            return;
        };
        let local = self.local_vcpu();
        let mut virq = cell.lock();
        if !f(&mut virq) {
            return;
        }
        if let Some(owner) = virq.owner_vcpu().filter(|&o| Some(o) != local) {
            drop(virq);
            self.post(owner, id, None, VirqEvent::Route);
            return;
        }
        self.detach(&mut virq, local);
        self.route(&mut virq, local);
        drop(virq);
        self.refill(local);
    }

    /// Takes a locally owned interrupt out of its list slot and the spill list.
    fn detach(&self, virq: &mut VirtIrq<M>, local: Option<VCpuId>) {
        if let Some(vcpu) = local.filter(|&l| virq.owner_vcpu() == Some(l)) {
            let slots = &self.banks[vcpu].slots;
            slots.remove_slot(virq);
            slots.unspill(virq.id);
        }
    }

    fn reevaluate(&self, vcpu: VCpuId, id: IrqId) {
        let Some(cell) = self.virq(vcpu, id) else {
            return;
        };
        let mut virq = cell.lock();
        if virq.owner_vcpu().is_some_and(|o| o != vcpu) {
            // Taken by another vCPU, which saw the current configuration.
            return;
        }
        self.detach(&mut virq, Some(vcpu));
        self.route(&mut virq, Some(vcpu));
    }

    /// Places a detached interrupt: into a local slot if this core may take
    /// it, otherwise hands it to its target vCPUs.
    fn route(&self, virq: &mut VirtIrq<M>, local: Option<VCpuId>) {
        let gated = !self.dist_enabled() && !virq.state.is_active();
        if !virq.needs_slot() || gated {
            virq.try_yield();
            return;
        }
        let targets = self.targets(virq);
        if let Some(vcpu) = local {
            let owner = virq.owner_vcpu();
            let free = owner.map_or(true, |o| o == vcpu);
            // An active interrupt stays with its owner until completed.
            let wanted = targets.contains(vcpu) || (owner == Some(vcpu) && virq.state.is_active());
            if free && wanted {
                virq.owner = Some(VCpuKey {
                    vm: self.vm_id,
                    vcpu,
                });
                self.banks[vcpu].slots.add_slot(virq);
                return;
            }
        }
        virq.try_yield();
        match virq.owner_vcpu() {
            Some(owner) if Some(owner) != local => {
                self.post(owner, virq.id, None, VirqEvent::Route)
            }
            Some(_) => {}
            None => {
                for target in targets.iter().filter(|&t| Some(t) != local) {
                    self.post(target, virq.id, None, VirqEvent::Route);
                }
            }
        }
    }

    /// Moves spilled interrupts of `local` into free list slots.
    fn refill(&self, local: Option<VCpuId>) {
        let Some(vcpu) = local else {
            return;
        };
        let slots = &self.banks[vcpu].slots;
        while let Some(id) = slots.pop_spilled() {
            let Some(cell) = self.virq(vcpu, id) else {
                continue;
            };
            let mut virq = cell.lock();
            if virq.owner_vcpu() != Some(vcpu) || virq.slot.is_some() {
                continue;
            }
            self.route(&mut virq, local);
        }
    }

    fn rebalance(&self, vcpu: VCpuId) {
        let slots = &self.banks[vcpu].slots;
        while let Some(id) = slots.rebalance_victim() {
            let Some(cell) = self.virq(vcpu, id) else {
                break;
            };
            {
                let mut virq = cell.lock();
                if !slots.remove_slot(&mut virq) {
                    break;
                }
                trace!("vm[{}]: irq {} yields its slot", self.vm_id, id);
                slots.spill(virq.prio, id);
            }
            self.refill(Some(vcpu));
        }
    }

    fn reroute_all(&self) {
        let Some(local) = self.local_vcpu() else {
            return;
        };
        for id in PRIVATE_COUNT..self.nr_irqs.min(MAX_IRQS) {
            self.reevaluate(local, id);
        }
        for (vcpu, bank) in self.banks.iter().enumerate() {
            for id in 0..PRIVATE_COUNT {
                if vcpu == local {
                    self.reevaluate(vcpu, id);
                } else if bank.irqs[id].lock().needs_slot() {
                    self.post(vcpu, id, None, VirqEvent::Route);
                }
            }
        }
        self.refill(Some(local));
    }

    fn targets(&self, virq: &VirtIrq<M>) -> VCpuSet {
        if virq.is_private() {
            virq.owner_vcpu().map_or(VCpuSet::EMPTY, VCpuSet::single)
        } else {
            M::target_set(virq.target, self.vcpu_count())
        }
    }

    /// Physical core a hardware-backed line with `target` should be routed to.
    fn route_cpu(&self, target: M::Target) -> CpuId {
        M::target_set(target, self.vcpu_count())
            .first()
            .map_or(self.home_cpu(), |vcpu| self.vcpu_cpus[vcpu])
    }

    fn post(&self, vcpu: VCpuId, id: IrqId, source: Option<VCpuId>, event: VirqEvent) {
        let cpu = self.vcpu_cpus[vcpu];
        debug!(
            "vm[{}]: {:?} irq {} -> vcpu {} (cpu {})",
            self.vm_id, event, id, vcpu, cpu
        );
        let msg = VirqMsg {
            vm: self.vm_id,
            id,
            source,
            event,
        };
        // A lost request would strand the interrupt, so an undersized inbox is fatal.
        if let Err(err) = self.mailbox.send(cpu, VIRQ_EVENT, msg) {
            panic!(
                "vm[{}]: cross-core inbox of cpu {} exhausted by {:?} of irq {}: {:?}",
                self.vm_id, cpu, event, id, err
            );
        }
    }
}

impl<H: AxVirqHal, M: VgicModel> VmIrqSink for AxVIntc<H, M> {
    fn vm_id(&self) -> VmId {
        self.vm_id
    }

    fn owns_irq(&self, id: IrqId) -> bool {
        id < self.nr_irqs && self.hw_owned.read().get_bit(id)
    }

    fn bind_hw_irq(&self, id: IrqId) -> AxResult {
        if id < PRIVATE_COUNT || !self.valid_id(id) {
            return ax_err!(
                InvalidInput,
                format!("vm[{}]: irq {} cannot be passed through", self.vm_id, id)
            );
        }
        let mut virq = self.shared[id - PRIVATE_COUNT].lock();
        virq.hw = Some(id);
        self.hw_owned.write().set_bit(id, true);
        H::PhysIntc::set_priority(id, virq.prio);
        H::PhysIntc::set_route(id, self.route_cpu(virq.target));
        H::PhysIntc::enable(id, virq.enabled);
        Ok(())
    }

    fn forward_hw_irq(&self, id: IrqId) {
        self.inject_hw_irq(id);
    }
}

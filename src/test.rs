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

#[cfg(test)]
mod tests {
    use crate::consts::*;
    use crate::{
        AffinityRouting, AxVIntc, AxVirqHal, AxVirqSystem, CpuId, IrqDisposition, IrqId,
        IrqState, LegacyTargets, ListReg, ListRegs, MaintenanceFlags, PhysIntc, VCpuRegs,
        VIntcAccess, VIntcConfig, VgicModel, VirqMsg, VirqSystemConfig, VIRQ_EVENT,
    };
    use alloc::{sync::Arc, vec::Vec};
    use axaddrspace::{device::AccessWidth, GuestPhysAddr};
    use axerrno::{AxError, AxResult};
    use core::cell::RefCell;
    use std::collections::BTreeMap;

    const NR_CPUS: usize = 4;
    const NR_PHYS_IRQS: usize = 256;
    const KICK_IRQ: IrqId = 1;
    const DIST: usize = 0x0800_0000;
    const REDIST: usize = 0x080a_0000;

    #[derive(Clone, Copy, Debug, Default)]
    struct MockLine {
        enabled: bool,
        pending: bool,
        prio: u8,
        route: Option<CpuId>,
        deactivations: usize,
    }

    // Simulated machine: per-core list registers plus the physical controller.
    struct MockMachine {
        cpu: CpuId,
        nr_lrs: usize,
        lrs: Vec<Vec<ListReg>>,
        maintenance: Vec<MaintenanceFlags>,
        eoi_count: Vec<usize>,
        lr_writes: Vec<(CpuId, usize)>,
        lines: BTreeMap<IrqId, MockLine>,
        ipis: Vec<(CpuId, IrqId)>,
    }

    impl MockMachine {
        fn new(nr_lrs: usize) -> Self {
            Self {
                cpu: 0,
                nr_lrs,
                lrs: (0..NR_CPUS).map(|_| alloc::vec![ListReg::EMPTY; nr_lrs]).collect(),
                maintenance: alloc::vec![MaintenanceFlags::empty(); NR_CPUS],
                eoi_count: alloc::vec![0; NR_CPUS],
                lr_writes: Vec::new(),
                lines: BTreeMap::new(),
                ipis: Vec::new(),
            }
        }
    }

    thread_local! {
        static MACHINE: RefCell<MockMachine> = RefCell::new(MockMachine::new(4));
    }

    fn with_machine<R>(f: impl FnOnce(&mut MockMachine) -> R) -> R {
        MACHINE.with(|m| f(&mut m.borrow_mut()))
    }

    fn reset(nr_lrs: usize) {
        with_machine(|m| *m = MockMachine::new(nr_lrs));
    }

    fn set_cpu(cpu: CpuId) {
        with_machine(|m| m.cpu = cpu);
    }

    fn lr(cpu: CpuId, idx: usize) -> ListReg {
        with_machine(|m| m.lrs[cpu][idx])
    }

    fn line(id: IrqId) -> MockLine {
        with_machine(|m| m.lines.get(&id).copied().unwrap_or_default())
    }

    fn lr_writes_on(cpu: CpuId) -> usize {
        with_machine(|m| m.lr_writes.iter().filter(|&&(c, _)| c == cpu).count())
    }

    // The guest acknowledges the interrupt held by a list register.
    fn guest_ack(cpu: CpuId, idx: usize) {
        with_machine(|m| {
            let lr = &mut m.lrs[cpu][idx];
            lr.state = lr.state.acknowledge();
        });
    }

    // The guest completes the interrupt held by a list register. Hardware-backed
    // slots deactivate their physical line.
    fn guest_eoi(cpu: CpuId, idx: usize) {
        with_machine(|m| {
            let lr = &mut m.lrs[cpu][idx];
            lr.state = lr.state.eoi();
            if let Some(pintid) = lr.pintid.filter(|_| !lr.state.is_active()) {
                m.lines.entry(pintid as IrqId).or_default().deactivations += 1;
            }
        });
    }

    // The guest completes an interrupt that no list register holds.
    fn guest_eoi_unlisted(cpu: CpuId) {
        with_machine(|m| m.eoi_count[cpu] += 1);
    }

    struct MockIntc;

    impl PhysIntc for MockIntc {
        fn irq_count() -> usize {
            NR_PHYS_IRQS
        }

        fn reserve(id: IrqId) -> AxResult<IrqId> {
            if id < NR_PHYS_IRQS {
                Ok(id)
            } else {
                Err(AxError::InvalidInput)
            }
        }

        fn enable(id: IrqId, enabled: bool) {
            with_machine(|m| m.lines.entry(id).or_default().enabled = enabled);
        }

        fn check_pending(id: IrqId) -> bool {
            line(id).pending
        }

        fn clear_pending(id: IrqId) {
            with_machine(|m| m.lines.entry(id).or_default().pending = false);
        }

        fn deactivate(id: IrqId) {
            with_machine(|m| m.lines.entry(id).or_default().deactivations += 1);
        }

        fn set_priority(id: IrqId, prio: u8) {
            with_machine(|m| m.lines.entry(id).or_default().prio = prio);
        }

        fn set_route(id: IrqId, cpu: CpuId) {
            with_machine(|m| m.lines.entry(id).or_default().route = Some(cpu));
        }

        fn send_ipi(cpu: CpuId, id: IrqId) {
            with_machine(|m| m.ipis.push((cpu, id)));
        }
    }

    struct MockLrs;

    impl ListRegs for MockLrs {
        fn count() -> usize {
            with_machine(|m| m.nr_lrs)
        }

        fn read(idx: usize) -> ListReg {
            with_machine(|m| m.lrs[m.cpu][idx])
        }

        fn write(idx: usize, lr: ListReg) {
            with_machine(|m| {
                let cpu = m.cpu;
                m.lrs[cpu][idx] = lr;
                m.lr_writes.push((cpu, idx));
            });
        }

        fn empty_mask() -> u64 {
            with_machine(|m| {
                m.lrs[m.cpu]
                    .iter()
                    .enumerate()
                    .filter(|(_, lr)| lr.is_empty())
                    .fold(0, |mask, (idx, _)| mask | 1 << idx)
            })
        }

        fn maintenance() -> MaintenanceFlags {
            with_machine(|m| m.maintenance[m.cpu])
        }

        fn set_maintenance(flags: MaintenanceFlags) {
            with_machine(|m| {
                let cpu = m.cpu;
                m.maintenance[cpu] = flags;
            });
        }

        fn take_eoi_count() -> usize {
            with_machine(|m| {
                let cpu = m.cpu;
                core::mem::take(&mut m.eoi_count[cpu])
            })
        }
    }

    struct MockHal;

    impl AxVirqHal for MockHal {
        type PhysIntc = MockIntc;
        type ListRegs = MockLrs;

        fn current_cpu() -> CpuId {
            with_machine(|m| m.cpu)
        }
    }

    struct MockRegs([usize; 32]);

    impl VCpuRegs for MockRegs {
        fn set_gpr(&mut self, reg: usize, val: usize) {
            self.0[reg] = val;
        }
    }

    type Vm<M> = Arc<AxVIntc<MockHal, M>>;

    fn addr(addr: usize) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(addr)
    }

    fn write<M: VgicModel>(vm: &Vm<M>, at: usize, width: AccessWidth, val: usize) {
        vm.handle_write(addr(at), width, val).unwrap();
    }

    fn read<M: VgicModel>(vm: &Vm<M>, at: usize, width: AccessWidth) -> usize {
        vm.handle_read(addr(at), width).unwrap()
    }

    /// Two VMs: vm[1] on cpus 0 and 1, vm[2] on cpus 2 and 3. Neither
    /// distributor is enabled yet.
    fn system<M: VgicModel>(nr_lrs: usize) -> (AxVirqSystem<MockHal, M>, Vm<M>) {
        system_with(VirqSystemConfig::new(NR_CPUS, KICK_IRQ), nr_lrs)
    }

    fn system_with<M: VgicModel>(
        config: VirqSystemConfig,
        nr_lrs: usize,
    ) -> (AxVirqSystem<MockHal, M>, Vm<M>) {
        reset(nr_lrs);
        let sys = AxVirqSystem::new(config).unwrap();
        let vm = sys.create_vm(VIntcConfig::new(1, alloc::vec![0, 1])).unwrap();
        sys.create_vm(VIntcConfig::new(2, alloc::vec![2, 3])).unwrap();
        (sys, vm)
    }

    /// Legacy-model system with vm[1]'s distributor enabled from cpu 0.
    fn legacy_system(nr_lrs: usize) -> (AxVirqSystem<MockHal, LegacyTargets>, Vm<LegacyTargets>) {
        let (sys, vm) = system::<LegacyTargets>(nr_lrs);
        set_cpu(0);
        write(&vm, DIST + GICD_CTLR, AccessWidth::Dword, 1);
        (sys, vm)
    }

    fn pend_spi<M: VgicModel>(vm: &Vm<M>, id: IrqId, prio: u8) {
        vm.set_enable(0, id, true);
        vm.set_priority(0, id, prio);
        vm.inject_irq(0, id).unwrap();
    }

    fn resident_count<M: VgicModel>(vm: &Vm<M>, vcpu: usize) -> usize {
        (0..vm.nr_irqs())
            .filter(|&id| {
                vm.virq(vcpu, id).is_some_and(|cell| {
                    let virq = cell.lock();
                    virq.slot.is_some() && virq.owner_vcpu() == Some(vcpu)
                })
            })
            .count()
    }

    #[test]
    fn test_static_assignment_conflicts() {
        let (sys, _) = legacy_system(4);
        assert!(sys.router().is_reserved(KICK_IRQ));

        sys.assign_to_vm(1, 42).unwrap();
        assert!(sys.router().is_assigned(42));
        assert_eq!(sys.assign_to_vm(2, 42), Err(AxError::AlreadyExists));
        assert_eq!(sys.assign_to_vm(1, 42), Err(AxError::AlreadyExists));
        assert_eq!(
            sys.reserve(42, alloc::boxed::Box::new(|_: IrqId| {})),
            Err(AxError::AlreadyExists)
        );
        assert_eq!(sys.assign_to_vm(1, KICK_IRQ), Err(AxError::AlreadyExists));
        assert_eq!(sys.assign_to_vm(1, NR_PHYS_IRQS), Err(AxError::InvalidInput));
        assert_eq!(sys.assign_to_vm(7, 43), Err(AxError::NotFound));
    }

    #[test]
    fn test_vm_creation_checks() {
        let (sys, _) = legacy_system(4);
        let dup = sys.create_vm(VIntcConfig::new(1, alloc::vec![3]));
        assert_eq!(dup.err(), Some(AxError::AlreadyExists));
        let taken = sys.create_vm(VIntcConfig::new(3, alloc::vec![1]));
        assert_eq!(taken.err(), Some(AxError::AlreadyExists));
        let missing = sys.create_vm(VIntcConfig::new(3, alloc::vec![NR_CPUS]));
        assert_eq!(missing.err(), Some(AxError::InvalidInput));
        let too_many = sys.create_vm(VIntcConfig::new(4, (0..9).collect()));
        assert_eq!(too_many.err(), Some(AxError::InvalidInput));
        assert_eq!(
            sys.mailbox().on_drain(VIRQ_EVENT, alloc::boxed::Box::new(|_: VirqMsg| {})),
            Err(AxError::AlreadyExists)
        );
    }

    #[test]
    fn test_assigned_line_is_programmed() {
        let (sys, vm) = legacy_system(4);
        with_machine(|m| m.lines.entry(42).or_default().pending = true);
        sys.assign_to_vm(1, 42).unwrap();
        assert!(!line(42).pending);
        assert!(!line(42).enabled);
        assert_eq!(line(42).route, Some(0));

        // Guest enables and programs the line through the distributor.
        write(&vm, DIST + GICD_ISENABLER + 4, AccessWidth::Dword, 1 << 10);
        write(&vm, DIST + GICD_IPRIORITYR + 42, AccessWidth::Byte, 0x50);
        write(&vm, DIST + GICD_ITARGETSR + 42, AccessWidth::Byte, 0b10);
        assert!(line(42).enabled);
        assert_eq!(line(42).prio, 0x50);
        assert_eq!(line(42).route, Some(1));
    }

    #[test]
    fn test_pending_round_trip() {
        let (_, vm) = legacy_system(4);
        write(&vm, DIST + GICD_ISENABLER + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(read(&vm, DIST + GICD_ISENABLER + 4, AccessWidth::Dword), 1 << 8);

        write(&vm, DIST + GICD_ISPENDR + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(read(&vm, DIST + GICD_ISPENDR + 4, AccessWidth::Dword), 1 << 8);
        assert_eq!(read(&vm, DIST + GICD_ICPENDR + 4, AccessWidth::Dword), 1 << 8);
        assert_eq!(lr(0, 0).vintid, 40);
        assert_eq!(lr(0, 0).state, IrqState::Pending);

        write(&vm, DIST + GICD_ICPENDR + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(read(&vm, DIST + GICD_ISPENDR + 4, AccessWidth::Dword), 0);
        assert!(lr(0, 0).is_empty());
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Inactive));
    }

    #[test]
    fn test_register_widths_and_reserved() {
        let (_, vm) = legacy_system(4);
        // ITLinesNumber = 7 (256 ids), CPUNumber = 1 (two vCPUs).
        assert_eq!(read(&vm, DIST + GICD_TYPER, AccessWidth::Dword), 0x27);
        assert_eq!(read(&vm, DIST + GICD_CTLR, AccessWidth::Dword), 1);
        assert_eq!(read(&vm, DIST + GICD_PIDR2_V2, AccessWidth::Dword), 0x2b);

        assert_eq!(
            vm.handle_read(addr(DIST + GICD_CTLR), AccessWidth::Byte),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            vm.handle_read(addr(DIST + GICD_ISENABLER + 2), AccessWidth::Dword),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            vm.handle_read(addr(DIST + 0x2000), AccessWidth::Dword),
            Err(AxError::NotFound)
        );

        // Reserved offset: RAZ/WI.
        write(&vm, DIST + 0x0d00, AccessWidth::Dword, 0xffff_ffff);
        assert_eq!(read(&vm, DIST + 0x0d00, AccessWidth::Dword), 0);

        write(&vm, DIST + GICD_IPRIORITYR + 40, AccessWidth::Byte, 0xa7);
        assert_eq!(read(&vm, DIST + GICD_IPRIORITYR + 40, AccessWidth::Byte), 0xa0);
        assert_eq!(read(&vm, DIST + GICD_IPRIORITYR + 40, AccessWidth::Dword), 0xa0);

        // Target bits of missing CPU interfaces are dropped.
        write(&vm, DIST + GICD_ITARGETSR + 40, AccessWidth::Byte, 0xff);
        assert_eq!(read(&vm, DIST + GICD_ITARGETSR + 40, AccessWidth::Byte), 0b11);
        // Private targets name the accessing CPU.
        set_cpu(1);
        assert_eq!(read(&vm, DIST + GICD_ITARGETSR + 27, AccessWidth::Byte), 0b10);

        write(&vm, DIST + GICD_ICFGR + 8, AccessWidth::Dword, 0b10 << 16);
        assert_eq!(read(&vm, DIST + GICD_ICFGR + 8, AccessWidth::Dword), 0b10 << 16);
        // SGIs are always enabled.
        write(&vm, DIST + GICD_ICENABLER, AccessWidth::Dword, 0xffff_ffff);
        assert_eq!(read(&vm, DIST + GICD_ISENABLER, AccessWidth::Dword), 0xffff);
    }

    #[test]
    fn test_distributor_enable_gates_placement() {
        let (_, vm) = system::<LegacyTargets>(4);
        set_cpu(0);
        pend_spi(&vm, 40, 0x80);
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Pending));
        assert_eq!(lr_writes_on(0), 0);

        write(&vm, DIST + GICD_CTLR, AccessWidth::Dword, 1);
        assert!(vm.dist_enabled());
        assert_eq!(lr(0, 0).vintid, 40);
        assert_eq!(lr(0, 0).state, IrqState::Pending);
    }

    #[test]
    fn test_residency_bounded_by_slots() {
        let (_, vm) = legacy_system(2);
        assert_eq!(vm.slot_capacity(), 2);
        for (i, id) in (40..46).enumerate() {
            pend_spi(&vm, id, 0x10 * i as u8);
            assert!(resident_count(&vm, 0) <= 2);
        }
        assert_eq!(vm.slot_usage(0), Some((2, 4)));
        let flags = with_machine(|m| m.maintenance[0]);
        assert!(flags.contains(MaintenanceFlags::UNDERFLOW));
        assert_eq!(vm.irq_state(0, 45), Some(IrqState::Pending));
        assert_eq!(vm.virq(0, 45).unwrap().lock().slot, None);
    }

    #[test]
    fn test_top_priorities_resident_after_maintenance() {
        let (_, vm) = legacy_system(2);
        pend_spi(&vm, 40, 0xa0);
        pend_spi(&vm, 41, 0x80);
        pend_spi(&vm, 42, 0x60);
        pend_spi(&vm, 43, 0x40);
        assert_eq!(lr(0, 0).vintid, 40);
        assert_eq!(lr(0, 1).vintid, 41);

        vm.maintenance();
        let mut resident = [lr(0, 0).vintid, lr(0, 1).vintid];
        resident.sort();
        assert_eq!(resident, [42, 43]);
        assert_eq!(vm.slot_usage(0), Some((2, 2)));

        // Completing one slot promotes the best spilled interrupt.
        let idx = (0..2).find(|&i| lr(0, i).vintid == 43).unwrap();
        guest_ack(0, idx);
        guest_eoi(0, idx);
        vm.maintenance();
        assert_eq!(vm.irq_state(0, 43), Some(IrqState::Inactive));
        assert_eq!(lr(0, idx).vintid, 41);
        assert_eq!(vm.slot_usage(0), Some((2, 1)));
    }

    #[test]
    fn test_active_slot_is_not_displaced() {
        let (_, vm) = legacy_system(1);
        pend_spi(&vm, 40, 0xa0);
        guest_ack(0, 0);
        pend_spi(&vm, 41, 0x10);
        vm.maintenance();
        assert_eq!(lr(0, 0).vintid, 40);
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Active));
        assert_eq!(vm.slot_usage(0), Some((1, 1)));
    }

    #[test]
    fn test_masked_active_irq_keeps_slot() {
        let (_, vm) = legacy_system(4);
        pend_spi(&vm, 40, 0x80);
        guest_ack(0, 0);

        write(&vm, DIST + GICD_ICENABLER + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(read(&vm, DIST + GICD_ISENABLER + 4, AccessWidth::Dword), 0);
        assert_eq!(lr(0, 0).vintid, 40);
        assert_eq!(lr(0, 0).state, IrqState::Active);

        // Asserted again while masked: the guest only sees the active half.
        vm.inject_irq(0, 40).unwrap();
        assert_eq!(lr(0, 0).state, IrqState::Active);
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::PendingActive));

        guest_eoi(0, 0);
        vm.maintenance();
        assert!(lr(0, 0).is_empty());
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Pending));
        assert_eq!(vm.slot_usage(0), Some((0, 0)));

        write(&vm, DIST + GICD_ISENABLER + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(lr(0, 0).vintid, 40);
        assert_eq!(lr(0, 0).state, IrqState::Pending);
    }

    #[test]
    fn test_masked_idle_irq_leaves_slot() {
        let (_, vm) = legacy_system(4);
        pend_spi(&vm, 40, 0x80);
        write(&vm, DIST + GICD_ICENABLER + 4, AccessWidth::Dword, 1 << 8);
        assert!(lr(0, 0).is_empty());
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Pending));
        assert_eq!(vm.virq(0, 40).unwrap().lock().owner, None);
    }

    #[test]
    fn test_spilled_active_irq_completed() {
        let (_, vm) = legacy_system(1);
        pend_spi(&vm, 40, 0x80);
        guest_ack(0, 0);
        vm.save_slots();
        assert_eq!(vm.slot_usage(0), Some((0, 1)));

        // A better interrupt takes the only slot while 40 waits, still active.
        pend_spi(&vm, 41, 0x10);
        assert_eq!(lr(0, 0).vintid, 41);
        let flags = with_machine(|m| m.maintenance[0]);
        assert!(flags.contains(MaintenanceFlags::UNDERFLOW | MaintenanceFlags::EOI_COUNT));

        guest_eoi_unlisted(0);
        vm.maintenance();
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Inactive));
        assert_eq!(vm.irq_state(0, 41), Some(IrqState::Pending));
        assert_eq!(vm.slot_usage(0), Some((1, 0)));
        assert_eq!(with_machine(|m| m.maintenance[0]), MaintenanceFlags::empty());
    }

    #[test]
    fn test_spilled_hw_irq_completed() {
        let (sys, vm) = legacy_system(1);
        sys.assign_to_vm(1, 42).unwrap();
        vm.set_enable(0, 42, true);
        vm.set_priority(0, 42, 0x80);
        assert_eq!(sys.handle_irq(42), IrqDisposition::Guest);
        guest_ack(0, 0);
        vm.save_slots();
        pend_spi(&vm, 41, 0x10);

        guest_eoi_unlisted(0);
        vm.maintenance();
        assert_eq!(vm.irq_state(0, 42), Some(IrqState::Inactive));
        assert_eq!(line(42).deactivations, 1);
    }

    #[test]
    fn test_remove_slot_of_spilled_irq_is_noop() {
        let (_, vm) = legacy_system(1);
        pend_spi(&vm, 40, 0x80);
        pend_spi(&vm, 41, 0x80);
        let writes = lr_writes_on(0);

        let mut virq = vm.virq(0, 41).unwrap().lock();
        assert!(!vm.banks[0].slots.remove_slot(&mut *virq));
        assert_eq!(virq.state, IrqState::Pending);
        assert_eq!(virq.slot, None);
        drop(virq);
        assert_eq!(lr_writes_on(0), writes);
        assert_eq!(lr(0, 0).vintid, 40);
    }

    #[test]
    fn test_hw_irq_reasserted_while_active() {
        let (sys, vm) = legacy_system(4);
        sys.assign_to_vm(1, 42).unwrap();
        vm.set_enable(0, 42, true);
        assert!(line(42).enabled);

        assert_eq!(sys.handle_irq(42), IrqDisposition::Guest);
        assert_eq!(lr(0, 0).pintid, Some(42));
        assert_eq!(lr(0, 0).state, IrqState::Pending);
        guest_ack(0, 0);

        sys.inject_hw_irq(1, 42).unwrap();
        assert_eq!(vm.irq_state(0, 42), Some(IrqState::PendingActive));
        // The slot cannot carry the physical line in this state.
        assert_eq!(lr(0, 0).pintid, None);
        assert!(lr(0, 0).eoi);

        guest_eoi(0, 0);
        assert_eq!(vm.irq_state(0, 42), Some(IrqState::Pending));
        guest_ack(0, 0);
        guest_eoi(0, 0);
        assert_eq!(line(42).deactivations, 0);
        vm.maintenance();
        assert_eq!(vm.irq_state(0, 42), Some(IrqState::Inactive));
        assert_eq!(line(42).deactivations, 1);
    }

    #[test]
    fn test_hw_irq_completed_by_guest() {
        let (sys, vm) = legacy_system(4);
        sys.assign_to_vm(1, 50).unwrap();
        vm.set_enable(0, 50, true);
        assert_eq!(sys.handle_irq(50), IrqDisposition::Guest);
        guest_ack(0, 0);
        guest_eoi(0, 0);
        assert_eq!(line(50).deactivations, 1);
        vm.maintenance();
        assert_eq!(vm.irq_state(0, 50), Some(IrqState::Inactive));
        assert_eq!(line(50).deactivations, 1);
    }

    #[test]
    #[should_panic(expected = "has no owner")]
    fn test_unowned_line_is_fatal() {
        let (sys, _) = legacy_system(4);
        sys.handle_irq(100);
    }

    #[test]
    fn test_sgi_to_remote_vcpu() {
        let (sys, vm) = legacy_system(4);
        let remote_writes = lr_writes_on(1);

        // vCPU 0 sends SGI 3 to vCPU 1 (target list filter, CPU target list = 0b10).
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 0b10 << 16 | 3);
        assert_eq!(lr_writes_on(1), remote_writes);
        assert_eq!(sys.mailbox().pending(1), 1);
        assert!(with_machine(|m| m.ipis.contains(&(1, KICK_IRQ))));
        assert_eq!(vm.irq_state(1, 3), Some(IrqState::Inactive));

        set_cpu(1);
        assert_eq!(sys.handle_irq(KICK_IRQ), IrqDisposition::Hypervisor);
        assert_eq!(sys.mailbox().pending(1), 0);
        assert_eq!(vm.irq_state(1, 3), Some(IrqState::Pending));
        assert_eq!(lr(1, 0).vintid, 3);
        assert_eq!(lr(1, 0).source, 0);

        guest_ack(1, 0);
        assert_eq!(vm.irq_state(1, 3), Some(IrqState::Active));
        guest_eoi(1, 0);
        sys.maintenance();
        assert_eq!(vm.irq_state(1, 3), Some(IrqState::Inactive));
        assert!(lr(1, 0).is_empty());
    }

    #[test]
    fn test_inbox_holds_burst_up_to_depth() {
        let config = VirqSystemConfig {
            mailbox_depth: 2,
            ..VirqSystemConfig::new(NR_CPUS, KICK_IRQ)
        };
        let (sys, vm) = system_with::<LegacyTargets>(config, 4);
        set_cpu(0);
        write(&vm, DIST + GICD_CTLR, AccessWidth::Dword, 1);
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 0b10 << 16 | 3);
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 0b10 << 16 | 4);
        assert_eq!(sys.mailbox().pending(1), 2);

        set_cpu(1);
        assert_eq!(sys.drain(), 2);
        assert_eq!(vm.irq_state(1, 3), Some(IrqState::Pending));
        assert_eq!(vm.irq_state(1, 4), Some(IrqState::Pending));
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_full_inbox_is_fatal() {
        let config = VirqSystemConfig {
            mailbox_depth: 1,
            ..VirqSystemConfig::new(NR_CPUS, KICK_IRQ)
        };
        let (_, vm) = system_with::<LegacyTargets>(config, 4);
        set_cpu(0);
        write(&vm, DIST + GICD_CTLR, AccessWidth::Dword, 1);
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 0b10 << 16 | 3);
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 0b10 << 16 | 4);
    }

    #[test]
    fn test_clear_pending_of_remote_irq() {
        let (sys, vm) = legacy_system(4);
        write(&vm, DIST + GICD_ITARGETSR + 40, AccessWidth::Byte, 0b10);
        pend_spi(&vm, 40, 0x80);
        set_cpu(1);
        sys.drain();
        assert_eq!(lr(1, 0).vintid, 40);

        set_cpu(0);
        write(&vm, DIST + GICD_ICPENDR + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(read(&vm, DIST + GICD_ISPENDR + 4, AccessWidth::Dword), 0);
        assert_eq!(sys.mailbox().pending(1), 1);

        set_cpu(1);
        assert_eq!(sys.drain(), 1);
        assert!(lr(1, 0).is_empty());
        assert_eq!(vm.irq_state(1, 40), Some(IrqState::Inactive));
    }

    #[test]
    fn test_sgi_pending_sources() {
        let (_, vm) = legacy_system(4);
        write(&vm, DIST + GICD_SPENDSGIR + 4, AccessWidth::Dword, 0b11 << 8);
        assert_eq!(read(&vm, DIST + GICD_SPENDSGIR + 4, AccessWidth::Dword), 0b11 << 8);
        assert_eq!(read(&vm, DIST + GICD_CPENDSGIR + 5, AccessWidth::Byte), 0b11);
        // One source at a time is placed in a slot.
        assert_eq!(lr(0, 0).vintid, 5);
        assert_eq!(lr(0, 0).source, 1);

        // Legacy SGIs ignore the generic pending registers.
        write(&vm, DIST + GICD_ICPENDR, AccessWidth::Dword, 1 << 5);
        assert_eq!(vm.irq_state(0, 5), Some(IrqState::Pending));

        write(&vm, DIST + GICD_CPENDSGIR + 5, AccessWidth::Byte, 0b10);
        assert_eq!(read(&vm, DIST + GICD_SPENDSGIR + 5, AccessWidth::Byte), 0b01);
        assert_eq!(lr(0, 0).source, 0);
        write(&vm, DIST + GICD_CPENDSGIR + 5, AccessWidth::Byte, 0b01);
        assert_eq!(vm.irq_state(0, 5), Some(IrqState::Inactive));
    }

    #[test]
    fn test_sgir_filters() {
        let (sys, vm) = legacy_system(4);
        // Filter 2: only the requesting vCPU.
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 2 << 24 | 7);
        assert_eq!(vm.irq_state(0, 7), Some(IrqState::Pending));
        assert_eq!(sys.mailbox().pending(1), 0);
        // Filter 1: everyone else.
        write(&vm, DIST + GICD_SGIR, AccessWidth::Dword, 1 << 24 | 8);
        assert_eq!(vm.irq_state(0, 8), Some(IrqState::Inactive));
        assert_eq!(sys.mailbox().pending(1), 1);
        // SGIR is write-only.
        assert_eq!(read(&vm, DIST + GICD_SGIR, AccessWidth::Dword), 0);
    }

    #[test]
    fn test_retarget_moves_to_remote_vcpu() {
        let (sys, vm) = legacy_system(4);
        write(&vm, DIST + GICD_ITARGETSR + 40, AccessWidth::Byte, 0b10);
        pend_spi(&vm, 40, 0x80);
        assert_eq!(lr_writes_on(0), 0);
        assert_eq!(sys.mailbox().pending(1), 1);

        set_cpu(1);
        assert_eq!(sys.drain(), 1);
        assert_eq!(lr(1, 0).vintid, 40);
        assert_eq!(vm.irq_state(1, 40), Some(IrqState::Pending));
    }

    #[test]
    fn test_save_and_restore_slots() {
        let (_, vm) = legacy_system(2);
        pend_spi(&vm, 40, 0x80);
        pend_spi(&vm, 41, 0x40);
        guest_ack(0, 0);

        vm.save_slots();
        assert!(lr(0, 0).is_empty() && lr(0, 1).is_empty());
        assert_eq!(vm.slot_usage(0), Some((0, 2)));
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Active));
        assert_eq!(vm.irq_state(0, 41), Some(IrqState::Pending));

        vm.restore_slots();
        assert_eq!(vm.slot_usage(0), Some((2, 0)));
        assert_eq!(vm.irq_state(0, 40), Some(IrqState::Active));
        assert_eq!(vm.irq_state(0, 41), Some(IrqState::Pending));
    }

    #[test]
    fn test_emulate_trapped_access() {
        let (sys, _) = legacy_system(4);
        let mut regs = MockRegs([0; 32]);
        let access = VIntcAccess::MmioRead {
            addr: addr(DIST + GICD_IIDR),
            width: AccessWidth::Dword,
            reg: 5,
        };
        sys.emulate(&access, &mut regs).unwrap();
        assert_eq!(regs.0[5], DEFAULT_IIDR as usize);

        set_cpu(NR_CPUS - 1);
        let store = VIntcAccess::MmioWrite {
            addr: addr(DIST + GICD_ISENABLER + 4),
            width: AccessWidth::Dword,
            data: 1,
        };
        sys.emulate(&store, &mut regs).unwrap();
        assert!(sys.vm(2).unwrap().virq(1, 32).unwrap().lock().enabled);
        assert!(!sys.vm(1).unwrap().virq(0, 32).unwrap().lock().enabled);
    }

    #[test]
    fn test_affinity_routing_frames() {
        let (sys, vm) = system::<AffinityRouting>(4);
        set_cpu(0);
        write(&vm, DIST + GICD_CTLR, AccessWidth::Dword, 0b10);
        assert_eq!(read(&vm, DIST + GICD_CTLR, AccessWidth::Dword), 0x52);
        assert_eq!(read(&vm, DIST + GICD_PIDR2_V3, AccessWidth::Dword), 0x3b);
        // Private ids are not visible in the distributor.
        assert_eq!(read(&vm, DIST + GICD_ISENABLER, AccessWidth::Dword), 0);

        let irouter = DIST + GICD_IROUTER + 40 * 8;
        write(&vm, irouter, AccessWidth::Qword, AffinityRouting::vcpu_affinity(1) as usize);
        assert_eq!(read(&vm, irouter, AccessWidth::Qword), 1);
        assert_eq!(read(&vm, irouter + 4, AccessWidth::Dword), 0);

        write(&vm, DIST + GICD_ISENABLER + 4, AccessWidth::Dword, 1 << 8);
        write(&vm, DIST + GICD_ISPENDR + 4, AccessWidth::Dword, 1 << 8);
        assert_eq!(lr_writes_on(0), 0);
        set_cpu(1);
        assert_eq!(sys.handle_irq(KICK_IRQ), IrqDisposition::Hypervisor);
        assert_eq!(lr(1, 0).vintid, 40);
        assert!(lr(1, 0).group1);
        assert_eq!(vm.irq_state(1, 40), Some(IrqState::Pending));
    }

    #[test]
    fn test_affinity_redistributor() {
        let (sys, vm) = system::<AffinityRouting>(4);
        set_cpu(0);
        write(&vm, DIST + GICD_CTLR, AccessWidth::Dword, 0b10);
        let rd1 = REDIST + GICR_FRAME_SIZE;
        assert_eq!(read(&vm, rd1 + GICR_TYPER, AccessWidth::Qword), 0x1_0000_0110);
        assert_eq!(read(&vm, REDIST + GICR_TYPER, AccessWidth::Qword), 0);

        assert_eq!(read(&vm, REDIST + GICR_WAKER, AccessWidth::Dword), 0b110);
        write(&vm, REDIST + GICR_WAKER, AccessWidth::Dword, 0);
        assert_eq!(read(&vm, REDIST + GICR_WAKER, AccessWidth::Dword), 0);

        let sgi0 = REDIST + GICR_SGI_BASE;
        assert_eq!(read(&vm, sgi0 + GICD_ISENABLER, AccessWidth::Dword), 0xffff);
        write(&vm, sgi0 + GICD_ISENABLER, AccessWidth::Dword, 1 << 27);
        write(&vm, sgi0 + GICD_IPRIORITYR + 27, AccessWidth::Byte, 0x30);
        assert_eq!(read(&vm, sgi0 + GICD_ISENABLER, AccessWidth::Dword), 1 << 27 | 0xffff);
        assert_eq!(read(&vm, sgi0 + GICD_IPRIORITYR + 24, AccessWidth::Dword), 0x30 << 24);

        // ICC_SGI1R_EL1: SGI 7 to target list {1} in Aff1 = 0.
        vm.handle_sgi1r(7 << 24 | 0b10);
        assert_eq!(sys.mailbox().pending(1), 1);
        set_cpu(1);
        sys.drain();
        assert_eq!(vm.irq_state(1, 7), Some(IrqState::Pending));
        assert!(lr(1, 0).group1);
    }
}

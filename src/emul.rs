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

//! Guest register interface of [`AxVIntc`].

use alloc::format;
use core::sync::atomic::Ordering;

use axaddrspace::{device::AccessWidth, GuestPhysAddr};
use axerrno::{ax_err, AxResult};
use bit_field::BitField;

use crate::access::{VCpuRegs, VIntcAccess};
use crate::consts::*;
use crate::hal::AxVirqHal;
use crate::irq::Trigger;
use crate::model::{AffinityRouting, VCpuSet, VgicModel};
use crate::vintc::AxVIntc;
use crate::{IrqId, VCpuId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Group,
    Enable,
    Pending,
    Active,
    Priority,
    Target,
    Config,
}

/// How a write to a register group is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    /// Writing 1 sets the field.
    Set,
    /// Writing 1 clears the field.
    Clear,
    /// The field takes the written value.
    Value,
}

/// A register array holding one `bits`-wide field per interrupt id.
#[derive(Clone, Copy, Debug)]
struct RegGroup {
    base: usize,
    size: usize,
    field: Field,
    kind: Kind,
    bits: usize,
}

impl RegGroup {
    const fn new(base: usize, size: usize, field: Field, kind: Kind, bits: usize) -> Self {
        Self {
            base,
            size,
            field,
            kind,
            bits,
        }
    }

    fn contains(&self, offset: usize) -> bool {
        (self.base..self.base + self.size).contains(&offset)
    }

    fn check_width(&self, size: usize) -> AxResult {
        let ok = match self.bits {
            8 => size == 1 || size == 4,
            64 => size == 4 || size == 8,
            _ => size == 4,
        };
        if ok {
            Ok(())
        } else {
            ax_err!(
                InvalidInput,
                format!("{}-byte access to {:?} register", size, self.field)
            )
        }
    }
}

/// Groups laid out identically in the distributor and the redistributor SGI frame.
const BANKED_GROUPS: [RegGroup; 9] = [
    RegGroup::new(GICD_IGROUPR, 0x80, Field::Group, Kind::Value, 1),
    RegGroup::new(GICD_ISENABLER, 0x80, Field::Enable, Kind::Set, 1),
    RegGroup::new(GICD_ICENABLER, 0x80, Field::Enable, Kind::Clear, 1),
    RegGroup::new(GICD_ISPENDR, 0x80, Field::Pending, Kind::Set, 1),
    RegGroup::new(GICD_ICPENDR, 0x80, Field::Pending, Kind::Clear, 1),
    RegGroup::new(GICD_ISACTIVER, 0x80, Field::Active, Kind::Set, 1),
    RegGroup::new(GICD_ICACTIVER, 0x80, Field::Active, Kind::Clear, 1),
    RegGroup::new(GICD_IPRIORITYR, 0x400, Field::Priority, Kind::Value, 8),
    RegGroup::new(GICD_ICFGR, 0x100, Field::Config, Kind::Value, 2),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frame {
    Dist,
    /// Redistributor control frame of a vCPU.
    Rd(VCpuId),
    /// Redistributor SGI/PPI frame of a vCPU.
    Sgi(VCpuId),
}

fn check_word(offset: usize, size: usize) -> AxResult {
    if size == 4 {
        Ok(())
    } else {
        ax_err!(
            InvalidInput,
            format!("{}-byte access to word register {:#x}", size, offset)
        )
    }
}

impl<H: AxVirqHal, M: VgicModel> AxVIntc<H, M> {
    /// Emulates one trapped access of the current vCPU.
    pub fn emulate(&self, access: &VIntcAccess, regs: &mut impl VCpuRegs) -> AxResult {
        match *access {
            VIntcAccess::MmioRead { addr, width, reg } => {
                let val = self.handle_read(addr, width)?;
                regs.set_gpr(reg, val);
                Ok(())
            }
            VIntcAccess::MmioWrite { addr, width, data } => {
                self.handle_write(addr, width, data as usize)
            }
            VIntcAccess::Sgi1rWrite { value } => {
                self.handle_sgi1r(value);
                Ok(())
            }
        }
    }

    pub fn handle_read(&self, addr: GuestPhysAddr, width: AccessWidth) -> AxResult<usize> {
        let vcpu = self.accessing_vcpu()?;
        let size = width.size();
        let (frame, offset) = self.locate(addr, size)?;
        let val = match frame {
            Frame::Dist => self.dist_read(vcpu, offset, size)?,
            Frame::Rd(target) => self.rd_read(target, offset, size)?,
            Frame::Sgi(target) => self.banked_read(frame, target, offset, size)?,
        };
        Ok(val as usize)
    }

    pub fn handle_write(&self, addr: GuestPhysAddr, width: AccessWidth, val: usize) -> AxResult {
        let vcpu = self.accessing_vcpu()?;
        let size = width.size();
        let (frame, offset) = self.locate(addr, size)?;
        let val = val as u64;
        match frame {
            Frame::Dist => self.dist_write(vcpu, offset, size, val),
            Frame::Rd(target) => self.rd_write(target, offset, size, val),
            Frame::Sgi(target) => self.banked_write(frame, target, offset, size, val),
        }
    }

    /// Emulates a write of the affinity-routing SGI generation register.
    pub fn handle_sgi1r(&self, value: u64) {
        let Some(vcpu) = self.local_vcpu() else {
            return;
        };
        let sgi = value.get_bits(24..28) as IrqId;
        let targets = if value.get_bit(40) {
            let mut others = VCpuSet::all(self.vcpu_count());
            others.remove(vcpu);
            others
        } else if value.get_bits(32..40) != 0 || value.get_bits(48..56) != 0 {
            VCpuSet::EMPTY
        } else {
            let aff1 = value.get_bits(16..24) as usize;
            let rs = value.get_bits(44..48) as usize;
            let mut set = VCpuSet::EMPTY;
            for bit in (0..16).filter(|&b| value.get_bit(b)) {
                let target = aff1 << 8 | (rs * 16 + bit);
                if target < self.vcpu_count() {
                    set.insert(target);
                }
            }
            set
        };
        self.send_sgi(vcpu, targets, sgi);
    }

    fn accessing_vcpu(&self) -> AxResult<VCpuId> {
        match self.local_vcpu() {
            Some(vcpu) => Ok(vcpu),
            None => ax_err!(BadState, "interrupt controller access from a foreign cpu"),
        }
    }

    fn locate(&self, addr: GuestPhysAddr, size: usize) -> AxResult<(Frame, usize)> {
        let (frame, offset) = if self.dist.contains(addr) {
            (Frame::Dist, addr.as_usize() - self.dist.start.as_usize())
        } else if self.redist.contains(addr) {
            let offset = addr.as_usize() - self.redist.start.as_usize();
            let vcpu = offset / GICR_FRAME_SIZE;
            match offset % GICR_FRAME_SIZE {
                off if off >= GICR_SGI_BASE => (Frame::Sgi(vcpu), off - GICR_SGI_BASE),
                off => (Frame::Rd(vcpu), off),
            }
        } else {
            return ax_err!(
                NotFound,
                format!("vm[{}]: {:?} outside the interrupt controller", self.vm_id(), addr)
            );
        };
        if !memory_addr::is_aligned(offset, size) {
            return ax_err!(
                InvalidInput,
                format!("misaligned {}-byte access at offset {:#x}", size, offset)
            );
        }
        Ok((frame, offset))
    }

    fn dist_read(&self, vcpu: VCpuId, offset: usize, size: usize) -> AxResult<u64> {
        let legacy_sgi = !M::HAS_REDIST;
        let val = match offset {
            GICD_CTLR => {
                check_word(offset, size)?;
                self.ctlr()
            }
            GICD_TYPER => {
                check_word(offset, size)?;
                M::dist_typer(self.nr_irqs(), self.vcpu_count())
            }
            GICD_IIDR => {
                check_word(offset, size)?;
                self.iidr
            }
            off if off == M::PIDR2_OFFSET => {
                check_word(offset, size)?;
                M::PIDR2
            }
            // Write-only.
            GICD_SGIR if legacy_sgi => {
                check_word(offset, size)?;
                0
            }
            off if legacy_sgi && (GICD_CPENDSGIR..GICD_SPENDSGIR + 0x10).contains(&off) => {
                return self.sgi_pend_read(vcpu, offset, size);
            }
            _ => return self.banked_read(Frame::Dist, vcpu, offset, size),
        };
        Ok(val as u64)
    }

    fn dist_write(&self, vcpu: VCpuId, offset: usize, size: usize, val: u64) -> AxResult {
        let legacy_sgi = !M::HAS_REDIST;
        match offset {
            GICD_CTLR => {
                check_word(offset, size)?;
                self.write_ctlr(val as u32);
            }
            GICD_TYPER | GICD_IIDR => check_word(offset, size)?,
            off if off == M::PIDR2_OFFSET => check_word(offset, size)?,
            GICD_SGIR if legacy_sgi => {
                check_word(offset, size)?;
                self.handle_sgir(vcpu, val as u32);
            }
            off if legacy_sgi && (GICD_CPENDSGIR..GICD_SPENDSGIR + 0x10).contains(&off) => {
                self.sgi_pend_write(vcpu, offset, size, val)?;
            }
            _ => self.banked_write(Frame::Dist, vcpu, offset, size, val)?,
        }
        Ok(())
    }

    /// Decodes `GICD_SGIR`: target list filter, CPU target list, SGI id.
    fn handle_sgir(&self, vcpu: VCpuId, val: u32) {
        let sgi = val.get_bits(0..4) as IrqId;
        let targets = match val.get_bits(24..26) {
            0 => VCpuSet::from_bits(val.get_bits(16..24) as u64),
            1 => {
                let mut others = VCpuSet::all(self.vcpu_count());
                others.remove(vcpu);
                others
            }
            2 => VCpuSet::single(vcpu),
            _ => return,
        };
        self.send_sgi(vcpu, targets, sgi);
    }

    fn sgi_pend_read(&self, vcpu: VCpuId, offset: usize, size: usize) -> AxResult<u64> {
        if size != 1 && size != 4 {
            return ax_err!(InvalidInput, "SGI pending registers are byte or word accessible");
        }
        let first = (offset - GICD_CPENDSGIR) % 0x10;
        let mut val = 0u64;
        for i in 0..size {
            val.set_bits(i * 8..i * 8 + 8, self.sgi_sources(vcpu, first + i) as u64);
        }
        Ok(val)
    }

    fn sgi_pend_write(&self, vcpu: VCpuId, offset: usize, size: usize, val: u64) -> AxResult {
        if size != 1 && size != 4 {
            return ax_err!(InvalidInput, "SGI pending registers are byte or word accessible");
        }
        let set = offset >= GICD_SPENDSGIR;
        let first = (offset - GICD_CPENDSGIR) % 0x10;
        for i in 0..size {
            let sgi = first + i;
            let mask = val.get_bits(i * 8..i * 8 + 8) as u8;
            if mask == 0 {
                continue;
            }
            if set {
                for source in (0..self.vcpu_count()).filter(|&s| mask.get_bit(s)) {
                    self.pend(vcpu, sgi, Some(source));
                }
            } else {
                self.clear_sgi_sources(vcpu, sgi, mask);
            }
        }
        Ok(())
    }

    fn rd_read(&self, vcpu: VCpuId, offset: usize, size: usize) -> AxResult<u64> {
        let Some(bank) = self.banks.get(vcpu) else {
            return Ok(0);
        };
        let val = match offset {
            GICR_TYPER | 0xc => {
                if size != 8 && size != 4 {
                    return ax_err!(InvalidInput, "GICR_TYPER is word or doubleword accessible");
                }
                let mut typer = 0u64;
                typer.set_bits(32..64, AffinityRouting::vcpu_affinity(vcpu));
                typer.set_bits(8..24, vcpu as u64);
                typer.set_bit(4, vcpu + 1 == self.vcpu_count());
                if size == 8 {
                    typer
                } else {
                    typer.get_bits((offset - GICR_TYPER) * 8..(offset - GICR_TYPER) * 8 + 32)
                }
            }
            GICR_CTLR => {
                check_word(offset, size)?;
                0
            }
            GICR_IIDR => {
                check_word(offset, size)?;
                self.iidr as u64
            }
            GICR_WAKER => {
                check_word(offset, size)?;
                bank.waker.load(Ordering::Acquire) as u64
            }
            GICR_PIDR2 => {
                check_word(offset, size)?;
                M::PIDR2 as u64
            }
            _ => {
                debug!("vm[{}]: read of reserved GICR offset {:#x}", self.vm_id(), offset);
                0
            }
        };
        Ok(val)
    }

    fn rd_write(&self, vcpu: VCpuId, offset: usize, size: usize, val: u64) -> AxResult {
        let Some(bank) = self.banks.get(vcpu) else {
            return Ok(());
        };
        if offset == GICR_WAKER {
            check_word(offset, size)?;
            let sleep = val as u32 & GICR_WAKER_PROCESSOR_SLEEP != 0;
            let waker = if sleep {
                GICR_WAKER_PROCESSOR_SLEEP | GICR_WAKER_CHILDREN_ASLEEP
            } else {
                0
            };
            bank.waker.store(waker, Ordering::Release);
        } else {
            debug!("vm[{}]: write to read-only GICR offset {:#x}", self.vm_id(), offset);
        }
        Ok(())
    }

    fn group_at(offset: usize) -> Option<RegGroup> {
        let target_size = if M::TARGET_BITS == 64 { 0x2000 } else { 0x400 };
        let target = RegGroup::new(M::TARGET_BASE, target_size, Field::Target, Kind::Value, M::TARGET_BITS);
        BANKED_GROUPS
            .iter()
            .copied()
            .chain(core::iter::once(target))
            .find(|g| g.contains(offset))
    }

    /// Whether `frame` gives access to interrupt `id`.
    fn in_scope(frame: Frame, id: IrqId) -> bool {
        match frame {
            Frame::Dist => id >= PRIVATE_COUNT || M::PRIVATE_IN_DIST,
            Frame::Sgi(_) => id < PRIVATE_COUNT,
            Frame::Rd(_) => false,
        }
    }

    fn banked_read(&self, frame: Frame, vcpu: VCpuId, offset: usize, size: usize) -> AxResult<u64> {
        let Some(group) = Self::group_at(offset).filter(|g| g.field != Field::Target || frame == Frame::Dist) else {
            debug!("vm[{}]: read of reserved offset {:#x} ({:?})", self.vm_id(), offset, frame);
            return Ok(0);
        };
        group.check_width(size)?;
        if group.bits == 64 {
            let id = (offset - group.base) / 8;
            let val = self.read_field(frame, vcpu, id, group.field);
            let shift = (offset % 8) * 8;
            return Ok(if size == 8 { val } else { (val >> shift) & 0xffff_ffff });
        }
        let first = (offset - group.base) * 8 / group.bits;
        let mut val = 0u64;
        for i in 0..size * 8 / group.bits {
            let field = self.read_field(frame, vcpu, first + i, group.field);
            let mask = (1u64 << group.bits) - 1;
            val.set_bits(i * group.bits..(i + 1) * group.bits, field & mask);
        }
        Ok(val)
    }

    fn banked_write(&self, frame: Frame, vcpu: VCpuId, offset: usize, size: usize, val: u64) -> AxResult {
        let Some(group) = Self::group_at(offset).filter(|g| g.field != Field::Target || frame == Frame::Dist) else {
            debug!("vm[{}]: write to reserved offset {:#x} ({:?})", self.vm_id(), offset, frame);
            return Ok(());
        };
        group.check_width(size)?;
        if group.bits == 64 {
            let id = (offset - group.base) / 8;
            let val = if size == 8 {
                val
            } else {
                let shift = (offset % 8) * 8;
                let old = self.read_field(frame, vcpu, id, group.field);
                (old & !(0xffff_ffff << shift)) | ((val & 0xffff_ffff) << shift)
            };
            self.write_field(frame, vcpu, id, group.field, group.kind, val);
            return Ok(());
        }
        let first = (offset - group.base) * 8 / group.bits;
        for i in 0..size * 8 / group.bits {
            let field = val.get_bits(i * group.bits..(i + 1) * group.bits);
            self.write_field(frame, vcpu, first + i, group.field, group.kind, field);
        }
        Ok(())
    }

    fn read_field(&self, frame: Frame, vcpu: VCpuId, id: IrqId, field: Field) -> u64 {
        if !Self::in_scope(frame, id) {
            return 0;
        }
        let Some(cell) = self.virq(vcpu, id) else {
            return 0;
        };
        let virq = cell.lock();
        match field {
            Field::Group => M::GROUP_RAO as u64,
            Field::Enable => virq.enabled as u64,
            Field::Pending => self.current_state(&virq).is_pending() as u64,
            Field::Active => self.current_state(&virq).is_active() as u64,
            Field::Priority => virq.prio as u64,
            // Private targets are read-only and name the accessing CPU.
            Field::Target if virq.is_private() => match M::TARGET_BITS {
                8 => 1 << vcpu,
                _ => 0,
            },
            Field::Target => M::encode_target(virq.target),
            Field::Config => match virq.trigger {
                Trigger::Edge => 0b10,
                Trigger::Level => 0b00,
            },
        }
    }

    fn write_field(&self, frame: Frame, vcpu: VCpuId, id: IrqId, field: Field, kind: Kind, val: u64) {
        if !Self::in_scope(frame, id) || self.virq(vcpu, id).is_none() {
            return;
        }
        // Legacy SGIs are pended and cleared through the SGI pending registers.
        let sgi_locked = id < SGI_COUNT && M::SGI_SOURCES;
        match (field, kind) {
            (Field::Group, _) => {}
            (Field::Enable, Kind::Set) if val != 0 => self.set_enable(vcpu, id, true),
            (Field::Enable, Kind::Clear) if val != 0 => self.set_enable(vcpu, id, false),
            (Field::Pending, Kind::Set) if val != 0 && !sgi_locked => {
                self.set_pending(vcpu, id, true)
            }
            (Field::Pending, Kind::Clear) if val != 0 && !sgi_locked => {
                self.set_pending(vcpu, id, false)
            }
            (Field::Active, Kind::Set) if val != 0 => self.set_active(vcpu, id, true),
            (Field::Active, Kind::Clear) if val != 0 => self.set_active(vcpu, id, false),
            (Field::Priority, _) => self.set_priority(vcpu, id, val as u8),
            (Field::Target, _) => self.set_target(id, val),
            (Field::Config, _) => {
                let trigger = if val.get_bit(1) {
                    Trigger::Edge
                } else {
                    Trigger::Level
                };
                self.set_trigger(vcpu, id, trigger)
            }
            _ => {}
        }
    }
}

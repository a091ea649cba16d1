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

use axerrno::AxResult;
use bit_field::BitArray;

use crate::lr::ListReg;
use crate::{CpuId, IrqId};

bitflags::bitflags! {
    /// Maintenance interrupt enables of the virtual CPU interface
    /// (`GICH_HCR` / `ICH_HCR_EL2` layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MaintenanceFlags: u32 {
        /// At most one list register holds a valid interrupt.
        const UNDERFLOW = 1 << 1;
        /// A completion arrived for an interrupt not in any list register.
        const EOI_COUNT = 1 << 2;
    }
}

/// The physical interrupt controller, as seen by the interrupt virtualization layer.
pub trait PhysIntc {
    /// Number of physical interrupt lines.
    fn irq_count() -> usize;

    /// Reserves a physical line for exclusive use, returning the id actually reserved.
    fn reserve(id: IrqId) -> AxResult<IrqId>;

    /// Whether reserving `id` collides with an already assigned line.
    ///
    /// `assigned` is the bitmap of every line reserved so far. Controllers whose
    /// lines alias each other override this.
    fn conflicts(id: IrqId, assigned: &[u64]) -> bool {
        assigned.get_bit(id)
    }

    fn enable(id: IrqId, enabled: bool);

    fn check_pending(id: IrqId) -> bool;

    fn clear_pending(id: IrqId);

    /// Drops the active state of a line whose completion was deferred to a guest.
    fn deactivate(id: IrqId);

    fn set_priority(id: IrqId, prio: u8);

    /// Routes a shared line to one physical core.
    fn set_route(id: IrqId, cpu: CpuId);

    /// Sends software-generated interrupt `id` to core `cpu`.
    fn send_ipi(cpu: CpuId, id: IrqId);
}

/// List registers of the virtual CPU interface of the **current** core.
pub trait ListRegs {
    /// Number of implemented list registers.
    fn count() -> usize;

    fn read(idx: usize) -> ListReg;

    fn write(idx: usize, lr: ListReg);

    /// Bitmap of list registers holding no valid interrupt (`ELSR`).
    fn empty_mask() -> u64;

    fn maintenance() -> MaintenanceFlags;

    fn set_maintenance(flags: MaintenanceFlags);

    /// Reads and clears the count of completions that matched no list register
    /// (`EOIcount`).
    fn take_eoi_count() -> usize;
}

/// The interfaces which the underlying hypervisor must implement.
pub trait AxVirqHal: 'static {
    type PhysIntc: PhysIntc;
    type ListRegs: ListRegs;

    /// Id of the physical core executing the caller.
    fn current_cpu() -> CpuId;
}

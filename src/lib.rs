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

//! AxVirq - Interrupt virtualization for ArceOS static-partitioning hypervisors.
//!
//! This crate routes physical interrupts either to the hypervisor or to the one
//! VM that owns them, and emulates a GIC-style interrupt controller for every VM.
//! Virtual interrupts are delivered through the list registers of the physical
//! core a vCPU is pinned to; whatever does not fit waits in a per-vCPU spill list.
//! Hardware-specific operations are delegated to implementations of the
//! `AxVirqHal` trait.
//!
//! # Features
//!
//! - Exclusive, static ownership of physical interrupt lines
//! - Per-VM emulated distributor (and redistributors with affinity routing)
//! - Hardware-backed pass-through interrupts completed by the guest
//! - Lock-per-interrupt design with cross-core hand-off messages
//! - Legacy target-mask or affinity-routing controller model, chosen at build time

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod access; // Trapped guest access descriptors
mod consts; // Register map and architectural limits
mod emul; // Guest register interface of the virtual controller
mod hal; // Hardware abstraction layer interfaces
mod irq; // Virtual interrupt record and its state machine
mod list; // List-slot allocator and spill list
mod lr; // Architecture-neutral list register image
mod mailbox; // Cross-core message channel
mod model; // Controller model variants
mod router; // Physical interrupt ownership and dispatch
mod system; // Top-level wiring of router, mailbox and VMs
mod test; // Unit tests with a simulated machine
mod vintc; // Per-VM virtual interrupt controller

// Public API exports
pub use access::{VCpuRegs, VIntcAccess};
pub use hal::{AxVirqHal, ListRegs, MaintenanceFlags, PhysIntc};
pub use irq::{IrqState, Trigger};
pub use lr::ListReg;
pub use mailbox::{DrainFn, EventId, Mailbox};
pub use model::{AffinityRouting, DefaultModel, LegacyTargets, VCpuSet, VgicModel};
pub use router::{AxIrqRouter, IrqDisposition, IrqHandler, VmIrqSink};
pub use system::{AxVirqSystem, VirqSystemConfig};
pub use vintc::{AxVIntc, VIntcConfig, VirqEvent, VirqMsg, VIRQ_EVENT};

/// Identifier of a VM.
pub type VmId = usize;
/// Index of a vCPU within its VM.
pub type VCpuId = usize;
/// Identifier of a physical core.
pub type CpuId = usize;
/// Interrupt id, physical or virtual.
pub type IrqId = usize;

/// Globally identifies one vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VCpuKey {
    pub vm: VmId,
    pub vcpu: VCpuId,
}

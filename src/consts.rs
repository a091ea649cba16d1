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

//! Architectural constants of the emulated interrupt controller.

/// Number of software-generated interrupts (ids `0..16`).
pub const SGI_COUNT: usize = 16;
/// Number of per-vCPU private interrupts (SGIs and PPIs, ids `0..32`).
pub const PRIVATE_COUNT: usize = 32;
/// Upper bound (exclusive) of usable interrupt ids; 1020..=1023 are special.
pub const MAX_IRQS: usize = 1020;

/// Implemented priority bits (5 bits, matching the list-register field).
pub const PRIO_MASK: u8 = 0xf8;
/// Reset priority of every interrupt.
pub const DEFAULT_PRIO: u8 = 0;

/// CPU interfaces addressable by the legacy target-mask registers.
pub const GICV2_MAX_VCPUS: usize = 8;
/// Implementer ARM, revision 0.
pub const DEFAULT_IIDR: u32 = 0x0000_043b;

// Distributor register map.
pub const GICD_CTLR: usize = 0x0000;
pub const GICD_TYPER: usize = 0x0004;
pub const GICD_IIDR: usize = 0x0008;
pub const GICD_IGROUPR: usize = 0x0080;
pub const GICD_ISENABLER: usize = 0x0100;
pub const GICD_ICENABLER: usize = 0x0180;
pub const GICD_ISPENDR: usize = 0x0200;
pub const GICD_ICPENDR: usize = 0x0280;
pub const GICD_ISACTIVER: usize = 0x0300;
pub const GICD_ICACTIVER: usize = 0x0380;
pub const GICD_IPRIORITYR: usize = 0x0400;
pub const GICD_ITARGETSR: usize = 0x0800;
pub const GICD_ICFGR: usize = 0x0c00;
pub const GICD_SGIR: usize = 0x0f00;
pub const GICD_CPENDSGIR: usize = 0x0f10;
pub const GICD_SPENDSGIR: usize = 0x0f20;
pub const GICD_IROUTER: usize = 0x6000;
pub const GICD_PIDR2_V2: usize = 0x0fe8;
pub const GICD_PIDR2_V3: usize = 0xffe8;

pub const GICD_SIZE_V2: usize = 0x1000;
pub const GICD_SIZE_V3: usize = 0x10000;

// Redistributor register map (one RD frame followed by one SGI frame per vCPU).
pub const GICR_CTLR: usize = 0x0000;
pub const GICR_IIDR: usize = 0x0004;
pub const GICR_TYPER: usize = 0x0008;
pub const GICR_WAKER: usize = 0x0014;
pub const GICR_PIDR2: usize = 0xffe8;
pub const GICR_SGI_BASE: usize = 0x10000;
pub const GICR_FRAME_SIZE: usize = 0x20000;

pub const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
pub const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

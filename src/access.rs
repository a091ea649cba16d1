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

use axaddrspace::{device::AccessWidth, GuestPhysAddr};

/// A trapped guest access to the emulated interrupt controller, already
/// decoded from the exit information by the vCPU layer.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub enum VIntcAccess {
    /// The vcpu performs a MMIO read of a controller register.
    MmioRead {
        /// The physical address of the MMIO read.
        addr: GuestPhysAddr,
        /// The width of the MMIO read.
        width: AccessWidth,
        /// The index of the GPR receiving the value.
        reg: usize,
    },
    /// The vcpu performs a MMIO write of a controller register.
    MmioWrite {
        /// The physical address of the MMIO write.
        addr: GuestPhysAddr,
        /// The width of the MMIO write.
        width: AccessWidth,
        /// The data to be written.
        data: u64,
    },
    /// The vcpu writes the SGI generation system register (`ICC_SGI1R_EL1`).
    Sgi1rWrite {
        /// Data to be written.
        value: u64,
    },
}

/// General purpose registers of the trapping vCPU.
pub trait VCpuRegs {
    fn set_gpr(&mut self, reg: usize, val: usize);
}

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

use crate::irq::IrqState;

/// Content of one list register, independent of the hardware encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListReg {
    /// Interrupt id presented to the guest.
    pub vintid: u32,
    /// Physical line deactivated together with the virtual one (hardware-backed slots).
    pub pintid: Option<u32>,
    /// Full 8-bit priority; the legacy encoding keeps the top 5 bits.
    pub priority: u8,
    pub state: IrqState,
    /// Requesting vCPU of an SGI (legacy encoding only).
    pub source: u8,
    /// Raise a maintenance interrupt when the guest completes this slot.
    pub eoi: bool,
    pub group1: bool,
}

impl ListReg {
    pub const EMPTY: Self = Self {
        vintid: 0,
        pintid: None,
        priority: 0,
        state: IrqState::Inactive,
        source: 0,
        eoi: false,
        group1: false,
    };

    pub const fn is_empty(&self) -> bool {
        self.state.is_inactive()
    }

    /// Encodes as a GICv2 `GICH_LR<n>`.
    pub fn to_gicv2(self) -> u32 {
        let mut raw = 0u32;
        raw.set_bits(0..10, self.vintid & 0x3ff);
        raw.set_bits(23..28, (self.priority >> 3) as u32);
        raw.set_bits(28..30, self.state.bits() as u32);
        raw.set_bit(30, self.group1);
        match self.pintid {
            Some(pintid) => {
                raw.set_bits(10..20, pintid & 0x3ff);
                raw.set_bit(31, true);
            }
            None => {
                raw.set_bits(10..13, (self.source & 0x7) as u32);
                raw.set_bit(19, self.eoi);
            }
        }
        raw
    }

    pub fn from_gicv2(raw: u32) -> Self {
        let hw = raw.get_bit(31);
        Self {
            vintid: raw.get_bits(0..10),
            pintid: hw.then(|| raw.get_bits(10..20)),
            priority: (raw.get_bits(23..28) << 3) as u8,
            state: IrqState::from_bits(raw.get_bits(28..30) as u8),
            source: if hw { 0 } else { raw.get_bits(10..13) as u8 },
            eoi: !hw && raw.get_bit(19),
            group1: raw.get_bit(30),
        }
    }

    /// Encodes as a GICv3 `ICH_LR<n>_EL2`.
    pub fn to_gicv3(self) -> u64 {
        let mut raw = 0u64;
        raw.set_bits(0..32, self.vintid as u64);
        raw.set_bits(48..56, self.priority as u64);
        raw.set_bit(60, self.group1);
        raw.set_bits(62..64, self.state.bits() as u64);
        match self.pintid {
            Some(pintid) => {
                raw.set_bits(32..45, (pintid & 0x1fff) as u64);
                raw.set_bit(61, true);
            }
            None => {
                raw.set_bit(41, self.eoi);
            }
        }
        raw
    }

    pub fn from_gicv3(raw: u64) -> Self {
        let hw = raw.get_bit(61);
        Self {
            vintid: raw.get_bits(0..32) as u32,
            pintid: hw.then(|| raw.get_bits(32..45) as u32),
            priority: raw.get_bits(48..56) as u8,
            state: IrqState::from_bits(raw.get_bits(62..64) as u8),
            source: 0,
            eoi: !hw && raw.get_bit(41),
            group1: raw.get_bit(60),
        }
    }
}

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

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use axerrno::{ax_err, AxResult};
use bit_field::BitArray;
use spin::Mutex;

use crate::hal::{AxVirqHal, PhysIntc};
use crate::{IrqId, VmId};

/// Handler of a hypervisor-reserved physical interrupt.
pub type IrqHandler = Box<dyn Fn(IrqId) + Send + Sync>;

/// A VM as seen by the physical interrupt router.
pub trait VmIrqSink {
    fn vm_id(&self) -> VmId;

    /// Whether physical line `id` is passed through to this VM.
    fn owns_irq(&self, id: IrqId) -> bool;

    /// Makes `id` a hardware-backed interrupt of this VM and routes the
    /// physical line to the VM's cores.
    fn bind_hw_irq(&self, id: IrqId) -> AxResult;

    /// Delivers an occurrence of physical line `id`.
    fn forward_hw_irq(&self, id: IrqId);
}

/// Outcome of [`AxIrqRouter::handle`], telling the caller how to complete the
/// physical interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqDisposition {
    /// A hypervisor handler ran; complete the physical interrupt now.
    Hypervisor,
    /// Forwarded to the running VM; the physical line is deactivated by the
    /// guest's completion of the hardware-backed virtual interrupt.
    Guest,
}

struct RouterInner {
    /// Lines the hypervisor handles itself.
    reserved: Vec<u64>,
    /// Every line with an owner, hypervisor or VM.
    assigned: Vec<u64>,
    handlers: Vec<Option<Arc<dyn Fn(IrqId) + Send + Sync>>>,
}

/// Static ownership of physical interrupt lines.
///
/// Each line is either reserved by the hypervisor or assigned to exactly one
/// VM, once, at boot.
pub struct AxIrqRouter<H: AxVirqHal> {
    nr_irqs: usize,
    inner: Mutex<RouterInner>,
    _hal: PhantomData<fn() -> H>,
}

impl<H: AxVirqHal> AxIrqRouter<H> {
    pub fn new() -> Self {
        let nr_irqs = H::PhysIntc::irq_count();
        let words = (nr_irqs + 63) / 64;
        Self {
            nr_irqs,
            inner: Mutex::new(RouterInner {
                reserved: alloc::vec![0; words],
                assigned: alloc::vec![0; words],
                handlers: (0..nr_irqs).map(|_| None).collect(),
            }),
            _hal: PhantomData,
        }
    }

    fn check_free(&self, inner: &RouterInner, id: IrqId) -> AxResult {
        if id >= self.nr_irqs {
            return ax_err!(
                InvalidInput,
                format!("irq {} beyond the {} physical lines", id, self.nr_irqs)
            );
        }
        if H::PhysIntc::conflicts(id, &inner.assigned) {
            return ax_err!(AlreadyExists, format!("irq {} is already assigned", id));
        }
        Ok(())
    }

    /// Reserves physical line `id` for the hypervisor and enables it.
    pub fn reserve(&self, id: IrqId, handler: IrqHandler) -> AxResult {
        let mut inner = self.inner.lock();
        self.check_free(&inner, id)?;
        let id = H::PhysIntc::reserve(id)?;
        inner.reserved.set_bit(id, true);
        inner.assigned.set_bit(id, true);
        inner.handlers[id] = Some(Arc::from(handler));
        H::PhysIntc::enable(id, true);
        info!("irq {} reserved for the hypervisor", id);
        Ok(())
    }

    /// Passes physical line `id` through to `vm`.
    pub fn assign_to_vm(&self, vm: &dyn VmIrqSink, id: IrqId) -> AxResult {
        let mut inner = self.inner.lock();
        self.check_free(&inner, id)?;
        let id = H::PhysIntc::reserve(id)?;
        if H::PhysIntc::check_pending(id) {
            H::PhysIntc::clear_pending(id);
        }
        vm.bind_hw_irq(id)?;
        inner.assigned.set_bit(id, true);
        info!("irq {} assigned to vm[{}]", id, vm.vm_id());
        Ok(())
    }

    pub fn is_reserved(&self, id: IrqId) -> bool {
        id < self.nr_irqs && self.inner.lock().reserved.get_bit(id)
    }

    pub fn is_assigned(&self, id: IrqId) -> bool {
        id < self.nr_irqs && self.inner.lock().assigned.get_bit(id)
    }

    /// Dispatches an occurrence of physical line `id` on the current core.
    ///
    /// `current` is the VM running here, if any.
    ///
    /// # Panics
    ///
    /// Panics if neither the hypervisor nor `current` owns the line.
    pub fn handle(&self, id: IrqId, current: Option<&dyn VmIrqSink>) -> IrqDisposition {
        if let Some(vm) = current.filter(|vm| vm.owns_irq(id)) {
            vm.forward_hw_irq(id);
            return IrqDisposition::Guest;
        }
        let handler = {
            let inner = self.inner.lock();
            if id < self.nr_irqs && inner.reserved.get_bit(id) {
                inner.handlers[id].clone()
            } else {
                None
            }
        };
        match handler {
            Some(handler) => {
                handler(id);
                IrqDisposition::Hypervisor
            }
            None => panic!("irq {} has no owner on cpu {}", id, H::current_cpu()),
        }
    }
}

impl<H: AxVirqHal> Default for AxIrqRouter<H> {
    fn default() -> Self {
        Self::new()
    }
}

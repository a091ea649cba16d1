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
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::marker::PhantomData;

use axerrno::{ax_err, AxResult};
use crossbeam_queue::ArrayQueue;
use spin::RwLock;

use crate::hal::{AxVirqHal, PhysIntc};
use crate::{CpuId, IrqId};

/// Identifies which drain callback handles a message.
pub type EventId = usize;

/// Callback run on the receiving core for every message of one event.
pub type DrainFn<P> = Box<dyn Fn(P) + Send + Sync>;

struct Envelope<P> {
    event: EventId,
    payload: P,
}

/// Fire-and-forget messages between physical cores.
///
/// Every core has a bounded inbox. Sending enqueues into the target's inbox and
/// kicks the target with the `kick_irq` software interrupt; the target calls
/// [`Mailbox::drain`] from that interrupt's handler. Messages are hints: the
/// receiver must re-check the live state they refer to.
pub struct Mailbox<H: AxVirqHal, P: Send> {
    inboxes: Vec<ArrayQueue<Envelope<P>>>,
    callbacks: RwLock<BTreeMap<EventId, DrainFn<P>>>,
    kick_irq: IrqId,
    _hal: PhantomData<fn() -> H>,
}

impl<H: AxVirqHal, P: Send> Mailbox<H, P> {
    /// Creates inboxes for `nr_cpus` cores, holding at most `depth` messages each.
    pub fn new(nr_cpus: usize, depth: usize, kick_irq: IrqId) -> Self {
        Self {
            inboxes: (0..nr_cpus).map(|_| ArrayQueue::new(depth.max(1))).collect(),
            callbacks: RwLock::new(BTreeMap::new()),
            kick_irq,
            _hal: PhantomData,
        }
    }

    pub fn kick_irq(&self) -> IrqId {
        self.kick_irq
    }

    /// Registers the callback for `event`.
    pub fn on_drain(&self, event: EventId, callback: DrainFn<P>) -> AxResult {
        let mut callbacks = self.callbacks.write();
        if callbacks.contains_key(&event) {
            return ax_err!(AlreadyExists, "mailbox event already has a callback");
        }
        callbacks.insert(event, callback);
        Ok(())
    }

    /// Posts `payload` to core `cpu` and kicks it.
    pub fn send(&self, cpu: CpuId, event: EventId, payload: P) -> AxResult {
        let Some(inbox) = self.inboxes.get(cpu) else {
            return ax_err!(InvalidInput, "mailbox target cpu out of range");
        };
        if inbox.push(Envelope { event, payload }).is_err() {
            return ax_err!(NoMemory, "mailbox inbox full");
        }
        H::PhysIntc::send_ipi(cpu, self.kick_irq);
        Ok(())
    }

    /// Runs the callbacks of every message queued for the current core.
    /// Returns the number of messages consumed.
    pub fn drain(&self) -> usize {
        let cpu = H::current_cpu();
        let Some(inbox) = self.inboxes.get(cpu) else {
            return 0;
        };
        let mut count = 0;
        while let Some(Envelope { event, payload }) = inbox.pop() {
            match self.callbacks.read().get(&event) {
                Some(callback) => callback(payload),
                None => warn!("cpu {}: no callback for mailbox event {}", cpu, event),
            }
            count += 1;
        }
        count
    }

    /// Number of messages waiting for core `cpu`.
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.inboxes.get(cpu).map_or(0, |inbox| inbox.len())
    }
}

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
use alloc::format;
use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::access::{VCpuRegs, VIntcAccess};
use crate::hal::AxVirqHal;
use crate::mailbox::Mailbox;
use crate::model::{DefaultModel, VgicModel};
use crate::router::{AxIrqRouter, IrqDisposition, IrqHandler, VmIrqSink};
use crate::vintc::{AxVIntc, VIntcConfig, VirqMsg, VIRQ_EVENT};
use crate::{CpuId, IrqId, VCpuId, VmId};

/// Process-wide parameters of the interrupt virtualization layer.
#[derive(Clone, Copy, Debug)]
pub struct VirqSystemConfig {
    pub nr_cpus: usize,
    /// Software interrupt used to kick a core when its inbox has messages.
    pub kick_irq: IrqId,
    /// Capacity of each core's inbox.
    pub mailbox_depth: usize,
}

impl VirqSystemConfig {
    pub const fn new(nr_cpus: usize, kick_irq: IrqId) -> Self {
        Self {
            nr_cpus,
            kick_irq,
            mailbox_depth: 256,
        }
    }
}

struct VmTable<H: AxVirqHal, M: VgicModel> {
    vms: RwLock<BTreeMap<VmId, Arc<AxVIntc<H, M>>>>,
    /// Physical core -> VM partitioned onto it.
    cpus: RwLock<BTreeMap<CpuId, VmId>>,
}

impl<H: AxVirqHal, M: VgicModel> VmTable<H, M> {
    fn get(&self, vm_id: VmId) -> Option<Arc<AxVIntc<H, M>>> {
        self.vms.read().get(&vm_id).cloned()
    }

    fn on_cpu(&self, cpu: CpuId) -> Option<Arc<AxVIntc<H, M>>> {
        let vm_id = *self.cpus.read().get(&cpu)?;
        self.get(vm_id)
    }

    fn dispatch(&self, msg: VirqMsg) {
        match self.get(msg.vm) {
            Some(vm) => vm.handle_msg(msg),
            None => warn!("{:?} for unknown vm[{}] dropped", msg.event, msg.vm),
        }
    }
}

/// The interrupt virtualization layer of a hypervisor: physical routing,
/// every VM's virtual controller, and the cross-core channel between them.
pub struct AxVirqSystem<H: AxVirqHal, M: VgicModel = DefaultModel> {
    router: AxIrqRouter<H>,
    mailbox: Arc<Mailbox<H, VirqMsg>>,
    vms: Arc<VmTable<H, M>>,
    nr_cpus: usize,
}

impl<H: AxVirqHal, M: VgicModel> AxVirqSystem<H, M> {
    /// Sets up routing and reserves the kick interrupt of the cross-core channel.
    pub fn new(config: VirqSystemConfig) -> AxResult<Self> {
        let router = AxIrqRouter::new();
        let mailbox = Arc::new(Mailbox::new(
            config.nr_cpus,
            config.mailbox_depth,
            config.kick_irq,
        ));
        let vms = Arc::new(VmTable {
            vms: RwLock::new(BTreeMap::new()),
            cpus: RwLock::new(BTreeMap::new()),
        });

        let table = Arc::downgrade(&vms);
        mailbox.on_drain(
            VIRQ_EVENT,
            Box::new(move |msg: VirqMsg| {
                if let Some(table) = table.upgrade() {
                    table.dispatch(msg);
                }
            }),
        )?;
        let inbox = Arc::downgrade(&mailbox);
        router.reserve(
            mailbox.kick_irq(),
            Box::new(move |_| {
                if let Some(inbox) = inbox.upgrade() {
                    inbox.drain();
                }
            }),
        )?;

        Ok(Self {
            router,
            mailbox,
            vms,
            nr_cpus: config.nr_cpus,
        })
    }

    pub fn router(&self) -> &AxIrqRouter<H> {
        &self.router
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<H, VirqMsg>> {
        &self.mailbox
    }

    /// Creates the virtual controller of a VM on its dedicated cores.
    pub fn create_vm(&self, config: VIntcConfig) -> AxResult<Arc<AxVIntc<H, M>>> {
        if let Some(&cpu) = config.vcpu_cpus.iter().find(|&&c| c >= self.nr_cpus) {
            return ax_err!(InvalidInput, format!("cpu {} does not exist", cpu));
        }
        let mut vms = self.vms.vms.write();
        let mut cpus = self.vms.cpus.write();
        if vms.contains_key(&config.vm_id) {
            return ax_err!(AlreadyExists, format!("vm[{}] already exists", config.vm_id));
        }
        if let Some(&cpu) = config.vcpu_cpus.iter().find(|&&c| cpus.contains_key(&c)) {
            return ax_err!(
                AlreadyExists,
                format!("cpu {} already belongs to vm[{}]", cpu, cpus[&cpu])
            );
        }
        let vm = Arc::new(AxVIntc::new(config, self.mailbox.clone())?);
        for &cpu in vm.vcpu_cpus() {
            cpus.insert(cpu, vm.vm_id());
        }
        vms.insert(vm.vm_id(), vm.clone());
        Ok(vm)
    }

    pub fn vm(&self, vm_id: VmId) -> Option<Arc<AxVIntc<H, M>>> {
        self.vms.get(vm_id)
    }

    /// The VM partitioned onto the current core.
    pub fn current_vm(&self) -> Option<Arc<AxVIntc<H, M>>> {
        self.vms.on_cpu(H::current_cpu())
    }

    pub fn reserve(&self, id: IrqId, handler: IrqHandler) -> AxResult {
        self.router.reserve(id, handler)
    }

    pub fn assign_to_vm(&self, vm_id: VmId, id: IrqId) -> AxResult {
        let Some(vm) = self.vm(vm_id) else {
            return ax_err!(NotFound, format!("vm[{}] does not exist", vm_id));
        };
        self.router.assign_to_vm(&*vm, id)
    }

    /// Physical interrupt entry of the current core.
    pub fn handle_irq(&self, id: IrqId) -> IrqDisposition {
        let vm = self.current_vm();
        self.router
            .handle(id, vm.as_deref().map(|vm| vm as &dyn VmIrqSink))
    }

    pub fn inject_irq(&self, vm_id: VmId, vcpu: VCpuId, id: IrqId) -> AxResult {
        match self.vm(vm_id) {
            Some(vm) => vm.inject_irq(vcpu, id),
            None => ax_err!(NotFound, format!("vm[{}] does not exist", vm_id)),
        }
    }

    pub fn inject_hw_irq(&self, vm_id: VmId, id: IrqId) -> AxResult {
        match self.vm(vm_id) {
            Some(vm) if vm.owns_irq(id) => {
                vm.inject_hw_irq(id);
                Ok(())
            }
            Some(_) => ax_err!(InvalidInput, format!("irq {} is not passed through", id)),
            None => ax_err!(NotFound, format!("vm[{}] does not exist", vm_id)),
        }
    }

    /// Emulates a trapped access of the vCPU running on the current core.
    pub fn emulate(&self, access: &VIntcAccess, regs: &mut impl VCpuRegs) -> AxResult {
        match self.current_vm() {
            Some(vm) => vm.emulate(access, regs),
            None => ax_err!(NotFound, "no vm on the current cpu"),
        }
    }

    /// Maintenance interrupt entry of the current core.
    pub fn maintenance(&self) {
        if let Some(vm) = self.current_vm() {
            vm.maintenance();
        }
    }

    /// Consumes the current core's inbox.
    pub fn drain(&self) -> usize {
        self.mailbox.drain()
    }
}

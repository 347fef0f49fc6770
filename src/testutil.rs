//! A scriptable in-memory backend for the session and registry tests.
//!
//! All mutable state sits behind shared handles so a test can keep a
//! [`MockProbes`] view after the driver itself has been moved into a
//! session.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    ops::Deref,
    rc::Rc,
    time::Duration,
};

use vmscope_core::{
    AccessMode, Driver, Error, FrameProtection, Gfn, GuestEvent, MappedFrame, Pa, RegAccess,
    RegEventDesc, RegisterId, SinglestepDesc, VcpuId, VmInfo,
};

const PAGE_SIZE: u64 = 4096;

/// A frame that reports its release back to the driver.
struct MockFrame {
    bytes: Vec<u8>,
    releases: Rc<Cell<usize>>,
}

impl Deref for MockFrame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl Drop for MockFrame {
    fn drop(&mut self) {
        self.releases.set(self.releases.get() + 1);
    }
}

#[derive(Default)]
struct MockState {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    registers: RefCell<HashMap<(RegisterId, VcpuId), u64>>,

    /// The access state "programmed in the hypervisor".
    mem_access: RefCell<HashMap<Gfn, AccessMode>>,
    reg_access: RefCell<HashMap<RegisterId, RegAccess>>,
    stepping: RefCell<HashSet<VcpuId>>,
    pending: RefCell<VecDeque<GuestEvent>>,

    maps: Cell<usize>,
    releases: Rc<Cell<usize>>,
    paused: Cell<bool>,
    fail_set_mem_access: Cell<bool>,
    fail_singlestep: RefCell<HashSet<VcpuId>>,
}

pub struct MockDriver {
    state: Rc<MockState>,
    names: HashMap<u64, String>,
    memsize: u64,
    vcpus: u16,
    events: bool,
}

impl MockDriver {
    pub fn new(events: bool) -> Self {
        Self {
            state: Rc::new(MockState::default()),
            names: HashMap::from([(7, "alpha".to_string()), (12, "beta".to_string())]),
            memsize: 16 << 20,
            vcpus: 2,
            events,
        }
    }

    /// A handle for driving and inspecting the mock after the driver has
    /// been moved into a session.
    pub fn probes(&self) -> MockProbes {
        MockProbes {
            state: self.state.clone(),
        }
    }
}

/// Shared view of the mock's hypervisor-side state.
pub struct MockProbes {
    state: Rc<MockState>,
}

impl MockProbes {
    pub fn mem_access_of(&self, gfn: Gfn) -> Option<AccessMode> {
        self.state.mem_access.borrow().get(&gfn).copied()
    }

    pub fn reg_access_of(&self, reg: RegisterId) -> Option<RegAccess> {
        self.state.reg_access.borrow().get(&reg).copied()
    }

    pub fn frames_outstanding(&self) -> usize {
        self.state.maps.get() - self.state.releases.get()
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.get()
    }

    pub fn stepping_vcpus(&self) -> usize {
        self.state.stepping.borrow().len()
    }

    pub fn queue_event(&self, event: GuestEvent) {
        self.state.pending.borrow_mut().push_back(event);
    }

    pub fn fail_next_set_mem_access(&self) {
        self.state.fail_set_mem_access.set(true);
    }

    /// Makes single-step start/stop fail for one vCPU until cleared.
    pub fn fail_singlestep_on(&self, vcpu: VcpuId) {
        self.state.fail_singlestep.borrow_mut().insert(vcpu);
    }

    pub fn clear_singlestep_faults(&self) {
        self.state.fail_singlestep.borrow_mut().clear();
    }
}

impl Driver for MockDriver {
    fn info(&self) -> Result<VmInfo, Error> {
        Ok(VmInfo {
            page_size: PAGE_SIZE,
            page_shift: 12,
            memsize: self.memsize,
            vcpus: self.vcpus,
            address_width: 8,
            hvm: true,
        })
    }

    fn id(&self) -> u64 {
        7
    }

    fn name(&self) -> Result<String, Error> {
        self.name_from_id(self.id())
    }

    fn id_from_name(&self, name: &str) -> Result<u64, Error> {
        self.names
            .iter()
            .find(|(_, candidate)| candidate.as_str() == name)
            .map(|(id, _)| *id)
            .ok_or(Error::NotFound)
    }

    fn name_from_id(&self, id: u64) -> Result<String, Error> {
        self.names.get(&id).cloned().ok_or(Error::NotFound)
    }

    fn map_frame(&self, gfn: Gfn, _protection: FrameProtection) -> Result<MappedFrame, Error> {
        if gfn.0 >= self.memsize / PAGE_SIZE {
            return Err(Error::OutOfBounds);
        }

        let bytes = self
            .state
            .pages
            .borrow()
            .get(&gfn)
            .cloned()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE as usize]);

        self.state.maps.set(self.state.maps.get() + 1);
        Ok(MappedFrame::new(MockFrame {
            bytes,
            releases: self.state.releases.clone(),
        }))
    }

    fn write(&self, paddr: Pa, buf: &[u8]) -> Result<(), Error> {
        if paddr.0 + buf.len() as u64 > self.memsize {
            return Err(Error::OutOfBounds);
        }

        let mut position = 0usize;
        let mut remaining = buf.len();
        let mut pages = self.state.pages.borrow_mut();

        while remaining > 0 {
            let address = paddr.0 + position as u64;
            let gfn = Gfn(address >> 12);
            let offset = (address & (PAGE_SIZE - 1)) as usize;
            let length = remaining.min(PAGE_SIZE as usize - offset);

            let page = pages.entry(gfn).or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
            page[offset..offset + length].copy_from_slice(&buf[position..position + length]);

            position += length;
            remaining -= length;
        }

        Ok(())
    }

    fn vcpureg(&self, reg: RegisterId, vcpu: VcpuId) -> Result<u64, Error> {
        Ok(self
            .state
            .registers
            .borrow()
            .get(&(reg, vcpu))
            .copied()
            .unwrap_or(0))
    }

    fn set_vcpureg(&self, reg: RegisterId, value: u64, vcpu: VcpuId) -> Result<(), Error> {
        self.state.registers.borrow_mut().insert((reg, vcpu), value);
        Ok(())
    }

    fn pause(&self) -> Result<(), Error> {
        self.state.paused.set(true);
        Ok(())
    }

    fn resume(&self) -> Result<(), Error> {
        self.state.paused.set(false);
        Ok(())
    }

    fn events_supported(&self) -> bool {
        self.events
    }

    fn set_reg_access(&self, desc: &RegEventDesc) -> Result<(), Error> {
        if desc.access.is_empty() {
            self.state.reg_access.borrow_mut().remove(&desc.reg);
        } else {
            self.state.reg_access.borrow_mut().insert(desc.reg, desc.access);
        }
        Ok(())
    }

    fn set_mem_access(&self, gfn: Gfn, access: AccessMode) -> Result<(), Error> {
        if self.state.fail_set_mem_access.replace(false) {
            return Err(Error::AccessDenied);
        }

        if access == AccessMode::None {
            self.state.mem_access.borrow_mut().remove(&gfn);
        } else {
            self.state.mem_access.borrow_mut().insert(gfn, access);
        }
        Ok(())
    }

    fn start_single_step(&self, desc: &SinglestepDesc) -> Result<(), Error> {
        for vcpu in desc.vcpus.iter(self.vcpus) {
            if self.state.fail_singlestep.borrow().contains(&vcpu) {
                return Err(Error::AccessDenied);
            }
            self.state.stepping.borrow_mut().insert(vcpu);
        }
        Ok(())
    }

    fn stop_single_step(&self, vcpu: VcpuId) -> Result<(), Error> {
        if self.state.fail_singlestep.borrow().contains(&vcpu) {
            return Err(Error::AccessDenied);
        }
        self.state.stepping.borrow_mut().remove(&vcpu);
        Ok(())
    }

    fn shutdown_single_step(&self) -> Result<(), Error> {
        self.state.stepping.borrow_mut().clear();
        Ok(())
    }

    fn listen(&self, _timeout: Duration, sink: &mut dyn FnMut(&GuestEvent)) -> Result<(), Error> {
        loop {
            let event = self.state.pending.borrow_mut().pop_front();
            match event {
                Some(event) => sink(&event),
                None => return Ok(()),
            }
        }
    }
}

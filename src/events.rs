//! The event registry: per-page, per-byte, per-register, and per-vCPU
//! bookkeeping, reconciled with the backend's access-control primitives.
//!
//! The invariant maintained throughout is that a page descriptor's
//! effective mask equals the combination of every registration still on
//! the page, and that the mask the registry believes in is the mask the
//! hypervisor has actually been programmed with. Every mutation programs
//! the backend first and updates the tables only on success.

use std::{
    cell::{Cell, RefCell},
    collections::{hash_map::Entry, HashMap},
    rc::Rc,
    time::Duration,
};

use vmscope_core::{
    AccessMode, Driver, Error, Gfn, Granularity, GuestEvent, MemEventDesc, RegAccess,
    RegEventDesc, RegisterId, SinglestepDesc, VcpuId, VcpuSet,
};

use crate::Vmscope;

/// A user callback invoked for each delivered event.
pub type EventCallback = Box<dyn FnMut(&Vmscope, &GuestEvent)>;

struct Registration<D> {
    desc: D,
    callback: Rc<RefCell<EventCallback>>,
}

impl<D> Registration<D> {
    fn new(desc: D, callback: EventCallback) -> Rc<Self> {
        Rc::new(Self {
            desc,
            callback: Rc::new(RefCell::new(callback)),
        })
    }
}

struct PageDescriptor {
    /// The access mask currently programmed in the hypervisor.
    mask: AccessMode,

    /// The page-granularity registration, if any.
    page_event: Option<Rc<Registration<MemEventDesc>>>,

    /// Byte-granularity registrations keyed by physical address.
    byte_events: HashMap<u64, Rc<Registration<MemEventDesc>>>,
}

impl PageDescriptor {
    /// Recomputes the combination over the registrations still present.
    fn combined(&self) -> Result<AccessMode, Error> {
        let mut mask = AccessMode::None;

        if let Some(page_event) = &self.page_event {
            mask = mask.combine(page_event.desc.access)?;
        }
        for byte_event in self.byte_events.values() {
            mask = mask.combine(byte_event.desc.access)?;
        }

        Ok(mask)
    }

    fn is_empty(&self) -> bool {
        self.page_event.is_none() && self.byte_events.is_empty()
    }
}

/// The three registration tables of one instance.
pub(crate) struct EventRegistry {
    mem: RefCell<HashMap<Gfn, PageDescriptor>>,
    reg: RefCell<HashMap<RegisterId, Rc<Registration<RegEventDesc>>>>,
    ss: RefCell<HashMap<VcpuId, Rc<Registration<SinglestepDesc>>>>,

    /// During teardown, clear operations keep table entries in place so
    /// the teardown walk stays well-defined.
    shutting_down: Cell<bool>,
}

fn page_key(paddr: u64) -> Gfn {
    Gfn(paddr >> 12)
}

impl EventRegistry {
    pub(crate) fn new() -> Self {
        Self {
            mem: RefCell::new(HashMap::new()),
            reg: RefCell::new(HashMap::new()),
            ss: RefCell::new(HashMap::new()),
            shutting_down: Cell::new(false),
        }
    }

    pub(crate) fn set_shutting_down(&self) {
        self.shutting_down.set(true);
    }

    ///////////////////////////////////////////////////////////////////////
    // Memory events
    ///////////////////////////////////////////////////////////////////////

    pub(crate) fn register_mem(
        &self,
        driver: &dyn Driver,
        desc: MemEventDesc,
        callback: EventCallback,
    ) -> Result<(), Error> {
        let key = page_key(desc.paddr.0);
        let mut mem = self.mem.borrow_mut();

        let page = match mem.entry(key) {
            Entry::Vacant(slot) => {
                // First registration on this page: the effective mask is
                // exactly the requested access.
                driver.set_mem_access(key, desc.access)?;

                let mut page = PageDescriptor {
                    mask: desc.access,
                    page_event: None,
                    byte_events: HashMap::new(),
                };

                let registration = Registration::new(desc, callback);
                match desc.granularity {
                    Granularity::Page => page.page_event = Some(registration),
                    Granularity::Byte => {
                        page.byte_events.insert(desc.paddr.0, registration);
                    }
                }

                tracing::debug!(gfn = %key, access = %desc.access, "memory event enabled");
                slot.insert(page);
                return Ok(());
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        let new_mask = page.mask.combine(desc.access)?;

        match desc.granularity {
            Granularity::Page => {
                if page.page_event.is_some() {
                    return Err(Error::AlreadyRegistered);
                }

                driver.set_mem_access(key, new_mask)?;
                page.page_event = Some(Registration::new(desc, callback));
                page.mask = new_mask;
            }
            Granularity::Byte => {
                if page.byte_events.contains_key(&desc.paddr.0) {
                    return Err(Error::AlreadyRegistered);
                }

                driver.set_mem_access(key, new_mask)?;
                page.byte_events.insert(desc.paddr.0, Registration::new(desc, callback));
                page.mask = new_mask;
            }
        }

        Ok(())
    }

    pub(crate) fn clear_mem(
        &self,
        driver: &dyn Driver,
        paddr: u64,
        granularity: Granularity,
    ) -> Result<(), Error> {
        let key = page_key(paddr);
        let mut mem = self.mem.borrow_mut();

        let Some(page) = mem.get_mut(&key) else {
            return Err(Error::NotFound);
        };

        match granularity {
            Granularity::Page => {
                if page.page_event.is_none() {
                    return Err(Error::NotFound);
                }

                // The new mask is the combination over what remains.
                let removed = page.page_event.take();
                let new_mask = page.combined()?;

                if let Err(err) = driver.set_mem_access(key, new_mask) {
                    page.page_event = removed;
                    return Err(err);
                }

                page.mask = new_mask;
            }
            Granularity::Byte => {
                let Some(removed) = page.byte_events.remove(&paddr) else {
                    return Err(Error::NotFound);
                };

                let new_mask = page.combined()?;

                if let Err(err) = driver.set_mem_access(key, new_mask) {
                    // The hypervisor still enforces the old mask; put the
                    // entry back so the tables agree with it.
                    page.byte_events.insert(paddr, removed);
                    return Err(err);
                }

                page.mask = new_mask;
            }
        }

        if page.is_empty() && !self.shutting_down.get() {
            mem.remove(&key);
        }

        Ok(())
    }

    /// Looks up a memory registration's descriptor.
    pub(crate) fn mem_event(&self, paddr: u64, granularity: Granularity) -> Option<MemEventDesc> {
        let mem = self.mem.borrow();
        let page = mem.get(&page_key(paddr))?;

        match granularity {
            Granularity::Page => page.page_event.as_ref().map(|r| r.desc),
            Granularity::Byte => page.byte_events.get(&paddr).map(|r| r.desc),
        }
    }

    /// The effective mask currently recorded for a page.
    #[cfg(test)]
    pub(crate) fn mem_mask(&self, paddr: u64) -> Option<AccessMode> {
        self.mem.borrow().get(&page_key(paddr)).map(|page| page.mask)
    }

    /// Checks the registry invariant: every descriptor's recorded mask
    /// equals the combination of its remaining registrations.
    #[cfg(test)]
    pub(crate) fn check_mask_invariant(&self) -> bool {
        self.mem
            .borrow()
            .values()
            .all(|page| page.combined().map(|mask| mask == page.mask).unwrap_or(false))
    }

    ///////////////////////////////////////////////////////////////////////
    // Register events
    ///////////////////////////////////////////////////////////////////////

    pub(crate) fn register_reg(
        &self,
        driver: &dyn Driver,
        desc: RegEventDesc,
        callback: EventCallback,
    ) -> Result<(), Error> {
        let mut reg = self.reg.borrow_mut();

        if reg.contains_key(&desc.reg) {
            return Err(Error::AlreadyRegistered);
        }

        driver.set_reg_access(&desc)?;
        tracing::debug!(register = ?desc.reg, "register event enabled");

        reg.insert(desc.reg, Registration::new(desc, callback));
        Ok(())
    }

    pub(crate) fn clear_reg(&self, driver: &dyn Driver, register: RegisterId) -> Result<(), Error> {
        let mut reg = self.reg.borrow_mut();

        if !reg.contains_key(&register) {
            return Err(Error::NotFound);
        }

        // Ask the backend to stop trapping; the stored registration is
        // left untouched in case the backend refuses.
        driver.set_reg_access(&RegEventDesc {
            reg: register,
            access: RegAccess::empty(),
        })?;

        if !self.shutting_down.get() {
            reg.remove(&register);
        }

        Ok(())
    }

    pub(crate) fn reg_event(&self, register: RegisterId) -> Option<RegEventDesc> {
        self.reg.borrow().get(&register).map(|r| r.desc)
    }

    ///////////////////////////////////////////////////////////////////////
    // Single-step events
    ///////////////////////////////////////////////////////////////////////

    /// Registers single-stepping on a set of vCPUs.
    ///
    /// Every selected vCPU is attempted: one the backend refuses (or that
    /// already carries a registration) does not stop the rest of the set.
    /// The call succeeds if at least one vCPU started.
    pub(crate) fn register_singlestep(
        &self,
        driver: &dyn Driver,
        desc: SinglestepDesc,
        callback: EventCallback,
        num_vcpus: u16,
    ) -> Result<(), Error> {
        let registration = Registration::new(desc, callback);
        let mut ss = self.ss.borrow_mut();
        let mut started = false;
        let mut failure = None;

        for vcpu in desc.vcpus.iter(num_vcpus) {
            if ss.contains_key(&vcpu) {
                tracing::debug!(%vcpu, "single-step already registered");
                continue;
            }

            let result = driver.start_single_step(&SinglestepDesc {
                vcpus: VcpuSet::single(vcpu),
            });

            match result {
                Ok(()) => {
                    ss.insert(vcpu, registration.clone());
                    started = true;
                }
                Err(err) => {
                    tracing::error!(?err, %vcpu, "failed to start single-step");
                    failure = Some(err);
                }
            }
        }

        if started {
            Ok(())
        } else {
            Err(failure.unwrap_or(Error::AlreadyRegistered))
        }
    }

    /// Clears single-stepping on a set of vCPUs.
    ///
    /// Every selected vCPU is attempted; a vCPU the backend refuses to
    /// stop keeps its registration, the rest are still cleared, and the
    /// refusal is reported after the walk.
    pub(crate) fn clear_singlestep(
        &self,
        driver: &dyn Driver,
        vcpus: VcpuSet,
        num_vcpus: u16,
    ) -> Result<(), Error> {
        let mut ss = self.ss.borrow_mut();
        let mut failure = None;

        for vcpu in vcpus.iter(num_vcpus) {
            match driver.stop_single_step(vcpu) {
                Ok(()) => {
                    if !self.shutting_down.get() {
                        ss.remove(&vcpu);
                    }
                }
                Err(err) => {
                    tracing::error!(?err, %vcpu, "failed to stop single-step");
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops single-stepping one vCPU and forgets its registration.
    pub(crate) fn stop_singlestep_vcpu(
        &self,
        driver: &dyn Driver,
        vcpu: VcpuId,
    ) -> Result<(), Error> {
        self.ss.borrow_mut().remove(&vcpu);
        driver.stop_single_step(vcpu)
    }

    /// Disables single-stepping everywhere and resets the table.
    pub(crate) fn shutdown_singlestep(&self, driver: &dyn Driver) -> Result<(), Error> {
        driver.shutdown_single_step()?;
        self.ss.borrow_mut().clear();
        Ok(())
    }

    pub(crate) fn singlestep_event(&self, vcpu: VcpuId) -> Option<SinglestepDesc> {
        self.ss.borrow().get(&vcpu).map(|r| r.desc)
    }

    ///////////////////////////////////////////////////////////////////////
    // Delivery and teardown
    ///////////////////////////////////////////////////////////////////////

    /// Routes one delivered event to its registration.
    ///
    /// On a page that carries both granularities, a byte registration at
    /// the exact address wins over the page registration.
    pub(crate) fn dispatch(&self, vmscope: &Vmscope, event: &GuestEvent) {
        let registration = match event {
            GuestEvent::Memory { gpa, .. } => {
                let mem = self.mem.borrow();
                mem.get(&page_key(gpa.0)).and_then(|page| {
                    page.byte_events
                        .get(&gpa.0)
                        .map(|r| r.callback.clone())
                        .or_else(|| page.page_event.as_ref().map(|r| r.callback.clone()))
                })
            }
            GuestEvent::Register { reg, .. } => self
                .reg
                .borrow()
                .get(reg)
                .map(|r| r.callback.clone()),
            GuestEvent::Singlestep { vcpu, .. } => self
                .ss
                .borrow()
                .get(vcpu)
                .map(|r| r.callback.clone()),
        };

        match registration {
            // The table borrows end before the callback runs, so the
            // callback may register and clear events itself.
            Some(callback) => (*callback.borrow_mut())(vmscope, event),
            None => tracing::debug!(?event, "event without a registration dropped"),
        }
    }

    /// Blocks in the backend, routing each delivered event.
    pub(crate) fn listen(
        &self,
        vmscope: &Vmscope,
        driver: &dyn Driver,
        timeout: Duration,
    ) -> Result<(), Error> {
        driver.listen(timeout, &mut |event| self.dispatch(vmscope, event))
    }

    /// Clears every registration, returning the hypervisor to default
    /// access, then empties the tables.
    ///
    /// Clear operations observe `shutting_down` and leave the entries of
    /// the table being walked in place, so iteration stays well-defined;
    /// the tables are dropped wholesale afterwards.
    pub(crate) fn teardown(&self, driver: &dyn Driver) {
        self.set_shutting_down();

        let pages: Vec<(u64, Vec<u64>, bool)> = self
            .mem
            .borrow()
            .iter()
            .map(|(gfn, page)| {
                (
                    gfn.0 << 12,
                    page.byte_events.keys().copied().collect(),
                    page.page_event.is_some(),
                )
            })
            .collect();

        for (page_paddr, byte_addrs, has_page_event) in pages {
            if has_page_event {
                if let Err(err) = self.clear_mem(driver, page_paddr, Granularity::Page) {
                    tracing::error!(?err, paddr = page_paddr, "failed to clear page event");
                }
            }
            for paddr in byte_addrs {
                if let Err(err) = self.clear_mem(driver, paddr, Granularity::Byte) {
                    tracing::error!(?err, paddr, "failed to clear byte event");
                }
            }
        }
        self.mem.borrow_mut().clear();

        let registers: Vec<RegisterId> = self.reg.borrow().keys().copied().collect();
        for register in registers {
            if let Err(err) = self.clear_reg(driver, register) {
                tracing::error!(?err, ?register, "failed to clear register event");
            }
        }
        self.reg.borrow_mut().clear();

        let vcpus: Vec<VcpuId> = self.ss.borrow().keys().copied().collect();
        for vcpu in vcpus {
            if let Err(err) = driver.stop_single_step(vcpu) {
                tracing::error!(?err, %vcpu, "failed to stop single-step");
            }
        }
        self.ss.borrow_mut().clear();
    }
}

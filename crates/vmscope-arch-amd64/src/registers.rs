use vmscope_core::RegisterId;

/// One segment register: selector, cached base/limit, and access-rights
/// bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Segment base address.
    pub base: u64,

    /// Segment limit.
    pub limit: u32,

    /// Segment selector.
    pub selector: u16,

    /// Access-rights bytes as the hypervisor caches them.
    pub arbytes: u32,
}

/// The IDTR/GDTR pair of base and limit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    /// Table base address.
    pub base: u64,

    /// Table limit.
    pub limit: u32,
}

/// The full register file of one virtual CPU.
///
/// Backends fill this from their own CPU save records; the accessors below
/// are the single case table that maps the unified register namespace onto
/// the fields.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub cs: SegmentDescriptor,
    pub ds: SegmentDescriptor,
    pub es: SegmentDescriptor,
    pub fs: SegmentDescriptor,
    pub gs: SegmentDescriptor,
    pub ss: SegmentDescriptor,
    pub tr: SegmentDescriptor,
    pub ldtr: SegmentDescriptor,

    pub idtr: DescriptorTable,
    pub gdtr: DescriptorTable,

    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub shadow_gs: u64,

    pub msr_flags: u64,
    pub msr_lstar: u64,
    pub msr_star: u64,
    pub msr_cstar: u64,
    pub msr_syscall_mask: u64,
    pub msr_efer: u64,
    pub msr_tsc_aux: u64,

    pub tsc: u64,
}

impl Registers {
    /// Reads one register by its unified identifier.
    pub fn read(&self, reg: RegisterId) -> u64 {
        use RegisterId::*;

        match reg {
            Rax => self.rax,
            Rbx => self.rbx,
            Rcx => self.rcx,
            Rdx => self.rdx,
            Rbp => self.rbp,
            Rsi => self.rsi,
            Rdi => self.rdi,
            Rsp => self.rsp,
            R8 => self.r8,
            R9 => self.r9,
            R10 => self.r10,
            R11 => self.r11,
            R12 => self.r12,
            R13 => self.r13,
            R14 => self.r14,
            R15 => self.r15,
            Rip => self.rip,
            Rflags => self.rflags,

            Cr0 => self.cr0,
            Cr2 => self.cr2,
            Cr3 => self.cr3,
            Cr4 => self.cr4,

            Dr0 => self.dr0,
            Dr1 => self.dr1,
            Dr2 => self.dr2,
            Dr3 => self.dr3,
            Dr6 => self.dr6,
            Dr7 => self.dr7,

            CsSel => self.cs.selector as u64,
            DsSel => self.ds.selector as u64,
            EsSel => self.es.selector as u64,
            FsSel => self.fs.selector as u64,
            GsSel => self.gs.selector as u64,
            SsSel => self.ss.selector as u64,
            TrSel => self.tr.selector as u64,
            LdtrSel => self.ldtr.selector as u64,

            CsLimit => self.cs.limit as u64,
            DsLimit => self.ds.limit as u64,
            EsLimit => self.es.limit as u64,
            FsLimit => self.fs.limit as u64,
            GsLimit => self.gs.limit as u64,
            SsLimit => self.ss.limit as u64,
            TrLimit => self.tr.limit as u64,
            LdtrLimit => self.ldtr.limit as u64,
            IdtrLimit => self.idtr.limit as u64,
            GdtrLimit => self.gdtr.limit as u64,

            CsBase => self.cs.base,
            DsBase => self.ds.base,
            EsBase => self.es.base,
            FsBase => self.fs.base,
            GsBase => self.gs.base,
            SsBase => self.ss.base,
            TrBase => self.tr.base,
            LdtrBase => self.ldtr.base,
            IdtrBase => self.idtr.base,
            GdtrBase => self.gdtr.base,

            CsArbytes => self.cs.arbytes as u64,
            DsArbytes => self.ds.arbytes as u64,
            EsArbytes => self.es.arbytes as u64,
            FsArbytes => self.fs.arbytes as u64,
            GsArbytes => self.gs.arbytes as u64,
            SsArbytes => self.ss.arbytes as u64,
            TrArbytes => self.tr.arbytes as u64,
            LdtrArbytes => self.ldtr.arbytes as u64,

            SysenterCs => self.sysenter_cs,
            SysenterEsp => self.sysenter_esp,
            SysenterEip => self.sysenter_eip,
            ShadowGs => self.shadow_gs,

            MsrFlags => self.msr_flags,
            MsrLstar => self.msr_lstar,
            MsrStar => self.msr_star,
            MsrCstar => self.msr_cstar,
            MsrSyscallMask => self.msr_syscall_mask,
            MsrEfer => self.msr_efer,
            MsrTscAux => self.msr_tsc_aux,

            Tsc => self.tsc,
        }
    }

    /// Writes one register by its unified identifier.
    pub fn write(&mut self, reg: RegisterId, value: u64) {
        use RegisterId::*;

        match reg {
            Rax => self.rax = value,
            Rbx => self.rbx = value,
            Rcx => self.rcx = value,
            Rdx => self.rdx = value,
            Rbp => self.rbp = value,
            Rsi => self.rsi = value,
            Rdi => self.rdi = value,
            Rsp => self.rsp = value,
            R8 => self.r8 = value,
            R9 => self.r9 = value,
            R10 => self.r10 = value,
            R11 => self.r11 = value,
            R12 => self.r12 = value,
            R13 => self.r13 = value,
            R14 => self.r14 = value,
            R15 => self.r15 = value,
            Rip => self.rip = value,
            Rflags => self.rflags = value,

            Cr0 => self.cr0 = value,
            Cr2 => self.cr2 = value,
            Cr3 => self.cr3 = value,
            Cr4 => self.cr4 = value,

            Dr0 => self.dr0 = value,
            Dr1 => self.dr1 = value,
            Dr2 => self.dr2 = value,
            Dr3 => self.dr3 = value,
            Dr6 => self.dr6 = value,
            Dr7 => self.dr7 = value,

            CsSel => self.cs.selector = value as u16,
            DsSel => self.ds.selector = value as u16,
            EsSel => self.es.selector = value as u16,
            FsSel => self.fs.selector = value as u16,
            GsSel => self.gs.selector = value as u16,
            SsSel => self.ss.selector = value as u16,
            TrSel => self.tr.selector = value as u16,
            LdtrSel => self.ldtr.selector = value as u16,

            CsLimit => self.cs.limit = value as u32,
            DsLimit => self.ds.limit = value as u32,
            EsLimit => self.es.limit = value as u32,
            FsLimit => self.fs.limit = value as u32,
            GsLimit => self.gs.limit = value as u32,
            SsLimit => self.ss.limit = value as u32,
            TrLimit => self.tr.limit = value as u32,
            LdtrLimit => self.ldtr.limit = value as u32,
            IdtrLimit => self.idtr.limit = value as u32,
            GdtrLimit => self.gdtr.limit = value as u32,

            CsBase => self.cs.base = value,
            DsBase => self.ds.base = value,
            EsBase => self.es.base = value,
            FsBase => self.fs.base = value,
            GsBase => self.gs.base = value,
            SsBase => self.ss.base = value,
            TrBase => self.tr.base = value,
            LdtrBase => self.ldtr.base = value,
            IdtrBase => self.idtr.base = value,
            GdtrBase => self.gdtr.base = value,

            CsArbytes => self.cs.arbytes = value as u32,
            DsArbytes => self.ds.arbytes = value as u32,
            EsArbytes => self.es.arbytes = value as u32,
            FsArbytes => self.fs.arbytes = value as u32,
            GsArbytes => self.gs.arbytes = value as u32,
            SsArbytes => self.ss.arbytes = value as u32,
            TrArbytes => self.tr.arbytes = value as u32,
            LdtrArbytes => self.ldtr.arbytes = value as u32,

            SysenterCs => self.sysenter_cs = value,
            SysenterEsp => self.sysenter_esp = value,
            SysenterEip => self.sysenter_eip = value,
            ShadowGs => self.shadow_gs = value,

            MsrFlags => self.msr_flags = value,
            MsrLstar => self.msr_lstar = value,
            MsrStar => self.msr_star = value,
            MsrCstar => self.msr_cstar = value,
            MsrSyscallMask => self.msr_syscall_mask = value,
            MsrEfer => self.msr_efer = value,
            MsrTscAux => self.msr_tsc_aux = value,

            Tsc => self.tsc = value,
        }
    }
}

/// The EFER bit consulted for 64-bit guest detection.
pub const EFER_LONG_MODE_BIT: u64 = 8;

/// Checks whether an EFER value indicates a 64-bit guest.
pub fn efer_long_mode(efer: u64) -> bool {
    efer & (1 << EFER_LONG_MODE_BIT) != 0
}

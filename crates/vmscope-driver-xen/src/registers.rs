//! Marshalling between the hypervisor's CPU save records and the unified
//! register file.
//!
//! HVM guests expose the full register file. Paravirtual guests expose
//! only the subset their context record carries: general-purpose
//! registers, flags, instruction pointer, control and debug registers,
//! and the FS/GS/LDT bases. Anything else fails with
//! `UnsupportedRegister` rather than reading as zero.

use vmscope_arch_amd64::Registers;
use vmscope_core::RegisterId;

use crate::{
    sys::{cr3_to_pfn, pfn_to_cr3, HvmHwCpu, VcpuGuestContextX32, VcpuGuestContextX64},
    Error,
};

impl From<&HvmHwCpu> for Registers {
    fn from(cpu: &HvmHwCpu) -> Self {
        let mut regs = Self {
            rax: cpu.rax,
            rbx: cpu.rbx,
            rcx: cpu.rcx,
            rdx: cpu.rdx,
            rbp: cpu.rbp,
            rsi: cpu.rsi,
            rdi: cpu.rdi,
            rsp: cpu.rsp,
            r8: cpu.r8,
            r9: cpu.r9,
            r10: cpu.r10,
            r11: cpu.r11,
            r12: cpu.r12,
            r13: cpu.r13,
            r14: cpu.r14,
            r15: cpu.r15,
            rip: cpu.rip,
            rflags: cpu.rflags,

            cr0: cpu.cr0,
            cr2: cpu.cr2,
            cr3: cpu.cr3,
            cr4: cpu.cr4,

            dr0: cpu.dr0,
            dr1: cpu.dr1,
            dr2: cpu.dr2,
            dr3: cpu.dr3,
            dr6: cpu.dr6,
            dr7: cpu.dr7,

            sysenter_cs: cpu.sysenter_cs,
            sysenter_esp: cpu.sysenter_esp,
            sysenter_eip: cpu.sysenter_eip,
            shadow_gs: cpu.shadow_gs,

            msr_flags: cpu.msr_flags,
            msr_lstar: cpu.msr_lstar,
            msr_star: cpu.msr_star,
            msr_cstar: cpu.msr_cstar,
            msr_syscall_mask: cpu.msr_syscall_mask,
            msr_efer: cpu.msr_efer,
            msr_tsc_aux: cpu.msr_tsc_aux,

            tsc: cpu.tsc,

            ..Self::default()
        };

        for (segment, sel, base, limit, arbytes) in [
            (&mut regs.cs, cpu.cs_sel, cpu.cs_base, cpu.cs_limit, cpu.cs_arbytes),
            (&mut regs.ds, cpu.ds_sel, cpu.ds_base, cpu.ds_limit, cpu.ds_arbytes),
            (&mut regs.es, cpu.es_sel, cpu.es_base, cpu.es_limit, cpu.es_arbytes),
            (&mut regs.fs, cpu.fs_sel, cpu.fs_base, cpu.fs_limit, cpu.fs_arbytes),
            (&mut regs.gs, cpu.gs_sel, cpu.gs_base, cpu.gs_limit, cpu.gs_arbytes),
            (&mut regs.ss, cpu.ss_sel, cpu.ss_base, cpu.ss_limit, cpu.ss_arbytes),
            (&mut regs.tr, cpu.tr_sel, cpu.tr_base, cpu.tr_limit, cpu.tr_arbytes),
            (&mut regs.ldtr, cpu.ldtr_sel, cpu.ldtr_base, cpu.ldtr_limit, cpu.ldtr_arbytes),
        ] {
            segment.selector = sel as u16;
            segment.base = base;
            segment.limit = limit;
            segment.arbytes = arbytes;
        }

        regs.idtr.base = cpu.idtr_base;
        regs.idtr.limit = cpu.idtr_limit;
        regs.gdtr.base = cpu.gdtr_base;
        regs.gdtr.limit = cpu.gdtr_limit;

        regs
    }
}

/// Writes a register file back into an HVM CPU save record, leaving the
/// FPU block and pending-event fields untouched.
pub fn apply_to_hvm(regs: &Registers, cpu: &mut HvmHwCpu) {
    cpu.rax = regs.rax;
    cpu.rbx = regs.rbx;
    cpu.rcx = regs.rcx;
    cpu.rdx = regs.rdx;
    cpu.rbp = regs.rbp;
    cpu.rsi = regs.rsi;
    cpu.rdi = regs.rdi;
    cpu.rsp = regs.rsp;
    cpu.r8 = regs.r8;
    cpu.r9 = regs.r9;
    cpu.r10 = regs.r10;
    cpu.r11 = regs.r11;
    cpu.r12 = regs.r12;
    cpu.r13 = regs.r13;
    cpu.r14 = regs.r14;
    cpu.r15 = regs.r15;
    cpu.rip = regs.rip;
    cpu.rflags = regs.rflags;

    cpu.cr0 = regs.cr0;
    cpu.cr2 = regs.cr2;
    cpu.cr3 = regs.cr3;
    cpu.cr4 = regs.cr4;

    cpu.dr0 = regs.dr0;
    cpu.dr1 = regs.dr1;
    cpu.dr2 = regs.dr2;
    cpu.dr3 = regs.dr3;
    cpu.dr6 = regs.dr6;
    cpu.dr7 = regs.dr7;

    cpu.cs_sel = regs.cs.selector as u32;
    cpu.ds_sel = regs.ds.selector as u32;
    cpu.es_sel = regs.es.selector as u32;
    cpu.fs_sel = regs.fs.selector as u32;
    cpu.gs_sel = regs.gs.selector as u32;
    cpu.ss_sel = regs.ss.selector as u32;
    cpu.tr_sel = regs.tr.selector as u32;
    cpu.ldtr_sel = regs.ldtr.selector as u32;

    cpu.cs_limit = regs.cs.limit;
    cpu.ds_limit = regs.ds.limit;
    cpu.es_limit = regs.es.limit;
    cpu.fs_limit = regs.fs.limit;
    cpu.gs_limit = regs.gs.limit;
    cpu.ss_limit = regs.ss.limit;
    cpu.tr_limit = regs.tr.limit;
    cpu.ldtr_limit = regs.ldtr.limit;
    cpu.idtr_limit = regs.idtr.limit;
    cpu.gdtr_limit = regs.gdtr.limit;

    cpu.cs_base = regs.cs.base;
    cpu.ds_base = regs.ds.base;
    cpu.es_base = regs.es.base;
    cpu.fs_base = regs.fs.base;
    cpu.gs_base = regs.gs.base;
    cpu.ss_base = regs.ss.base;
    cpu.tr_base = regs.tr.base;
    cpu.ldtr_base = regs.ldtr.base;
    cpu.idtr_base = regs.idtr.base;
    cpu.gdtr_base = regs.gdtr.base;

    cpu.cs_arbytes = regs.cs.arbytes;
    cpu.ds_arbytes = regs.ds.arbytes;
    cpu.es_arbytes = regs.es.arbytes;
    cpu.fs_arbytes = regs.fs.arbytes;
    cpu.gs_arbytes = regs.gs.arbytes;
    cpu.ss_arbytes = regs.ss.arbytes;
    cpu.tr_arbytes = regs.tr.arbytes;
    cpu.ldtr_arbytes = regs.ldtr.arbytes;

    cpu.sysenter_cs = regs.sysenter_cs;
    cpu.sysenter_esp = regs.sysenter_esp;
    cpu.sysenter_eip = regs.sysenter_eip;
    cpu.shadow_gs = regs.shadow_gs;

    cpu.msr_flags = regs.msr_flags;
    cpu.msr_lstar = regs.msr_lstar;
    cpu.msr_star = regs.msr_star;
    cpu.msr_cstar = regs.msr_cstar;
    cpu.msr_syscall_mask = regs.msr_syscall_mask;
    cpu.msr_efer = regs.msr_efer;
    cpu.msr_tsc_aux = regs.msr_tsc_aux;

    cpu.tsc = regs.tsc;
}

/// Reads one register from a 64-bit PV context.
pub fn pv64_read(ctx: &VcpuGuestContextX64, reg: RegisterId) -> Result<u64, Error> {
    use RegisterId::*;

    let regs = &ctx.user_regs;
    Ok(match reg {
        Rax => regs.rax,
        Rbx => regs.rbx,
        Rcx => regs.rcx,
        Rdx => regs.rdx,
        Rbp => regs.rbp,
        Rsi => regs.rsi,
        Rdi => regs.rdi,
        Rsp => regs.rsp,
        R8 => regs.r8,
        R9 => regs.r9,
        R10 => regs.r10,
        R11 => regs.r11,
        R12 => regs.r12,
        R13 => regs.r13,
        R14 => regs.r14,
        R15 => regs.r15,
        Rip => regs.rip,
        Rflags => regs.rflags,

        Cr0 => ctx.ctrlreg[0],
        Cr2 => ctx.ctrlreg[2],
        // PV stores CR3 as a frame number in the hypervisor's encoding.
        Cr3 => cr3_to_pfn(ctx.ctrlreg[3], 8) << 12,
        Cr4 => ctx.ctrlreg[4],

        Dr0 => ctx.debugreg[0],
        Dr1 => ctx.debugreg[1],
        Dr2 => ctx.debugreg[2],
        Dr3 => ctx.debugreg[3],
        Dr6 => ctx.debugreg[6],
        Dr7 => ctx.debugreg[7],

        FsBase => ctx.fs_base,
        GsBase => ctx.gs_base_kernel,
        LdtrBase => ctx.ldt_base,

        _ => return Err(Error::UnsupportedRegister),
    })
}

/// Writes one register into a 64-bit PV context.
pub fn pv64_write(ctx: &mut VcpuGuestContextX64, reg: RegisterId, value: u64) -> Result<(), Error> {
    use RegisterId::*;

    let regs = &mut ctx.user_regs;
    match reg {
        Rax => regs.rax = value,
        Rbx => regs.rbx = value,
        Rcx => regs.rcx = value,
        Rdx => regs.rdx = value,
        Rbp => regs.rbp = value,
        Rsi => regs.rsi = value,
        Rdi => regs.rdi = value,
        Rsp => regs.rsp = value,
        R8 => regs.r8 = value,
        R9 => regs.r9 = value,
        R10 => regs.r10 = value,
        R11 => regs.r11 = value,
        R12 => regs.r12 = value,
        R13 => regs.r13 = value,
        R14 => regs.r14 = value,
        R15 => regs.r15 = value,
        Rip => regs.rip = value,
        Rflags => regs.rflags = value,

        Cr0 => ctx.ctrlreg[0] = value,
        Cr2 => ctx.ctrlreg[2] = value,
        Cr3 => ctx.ctrlreg[3] = pfn_to_cr3(value >> 12, 8),
        Cr4 => ctx.ctrlreg[4] = value,

        Dr0 => ctx.debugreg[0] = value,
        Dr1 => ctx.debugreg[1] = value,
        Dr2 => ctx.debugreg[2] = value,
        Dr3 => ctx.debugreg[3] = value,
        Dr6 => ctx.debugreg[6] = value,
        Dr7 => ctx.debugreg[7] = value,

        FsBase => ctx.fs_base = value,
        GsBase => ctx.gs_base_kernel = value,
        LdtrBase => ctx.ldt_base = value,

        _ => return Err(Error::UnsupportedRegister),
    }

    Ok(())
}

/// Reads one register from a 32-bit PV context.
pub fn pv32_read(ctx: &VcpuGuestContextX32, reg: RegisterId) -> Result<u64, Error> {
    use RegisterId::*;

    let regs = &ctx.user_regs;
    Ok(match reg {
        Rax => regs.eax as u64,
        Rbx => regs.ebx as u64,
        Rcx => regs.ecx as u64,
        Rdx => regs.edx as u64,
        Rbp => regs.ebp as u64,
        Rsi => regs.esi as u64,
        Rdi => regs.edi as u64,
        Rsp => regs.esp as u64,
        Rip => regs.eip as u64,
        Rflags => regs.eflags as u64,

        Cr0 => ctx.ctrlreg[0] as u64,
        Cr2 => ctx.ctrlreg[2] as u64,
        Cr3 => cr3_to_pfn(ctx.ctrlreg[3] as u64, 4) << 12,
        Cr4 => ctx.ctrlreg[4] as u64,

        Dr0 => ctx.debugreg[0] as u64,
        Dr1 => ctx.debugreg[1] as u64,
        Dr2 => ctx.debugreg[2] as u64,
        Dr3 => ctx.debugreg[3] as u64,
        Dr6 => ctx.debugreg[6] as u64,
        Dr7 => ctx.debugreg[7] as u64,

        LdtrBase => ctx.ldt_base as u64,

        _ => return Err(Error::UnsupportedRegister),
    })
}

/// Writes one register into a 32-bit PV context.
pub fn pv32_write(ctx: &mut VcpuGuestContextX32, reg: RegisterId, value: u64) -> Result<(), Error> {
    use RegisterId::*;

    let regs = &mut ctx.user_regs;
    match reg {
        Rax => regs.eax = value as u32,
        Rbx => regs.ebx = value as u32,
        Rcx => regs.ecx = value as u32,
        Rdx => regs.edx = value as u32,
        Rbp => regs.ebp = value as u32,
        Rsi => regs.esi = value as u32,
        Rdi => regs.edi = value as u32,
        Rsp => regs.esp = value as u32,
        Rip => regs.eip = value as u32,
        Rflags => regs.eflags = value as u32,

        Cr0 => ctx.ctrlreg[0] = value as u32,
        Cr2 => ctx.ctrlreg[2] = value as u32,
        Cr3 => ctx.ctrlreg[3] = pfn_to_cr3(value >> 12, 4) as u32,
        Cr4 => ctx.ctrlreg[4] = value as u32,

        Dr0 => ctx.debugreg[0] = value as u32,
        Dr1 => ctx.debugreg[1] = value as u32,
        Dr2 => ctx.debugreg[2] = value as u32,
        Dr3 => ctx.debugreg[3] = value as u32,
        Dr6 => ctx.debugreg[6] = value as u32,
        Dr7 => ctx.debugreg[7] = value as u32,

        LdtrBase => ctx.ldt_base = value as u32,

        _ => return Err(Error::UnsupportedRegister),
    }

    Ok(())
}

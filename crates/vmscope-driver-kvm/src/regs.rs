//! Parsing of the monitor's `info registers` text into the register file.

use vmscope_arch_amd64::Registers;

fn set_named(regs: &mut Registers, key: &str, value: u64) {
    match key {
        "RAX" | "EAX" => regs.rax = value,
        "RBX" | "EBX" => regs.rbx = value,
        "RCX" | "ECX" => regs.rcx = value,
        "RDX" | "EDX" => regs.rdx = value,
        "RSI" | "ESI" => regs.rsi = value,
        "RDI" | "EDI" => regs.rdi = value,
        "RBP" | "EBP" => regs.rbp = value,
        "RSP" | "ESP" => regs.rsp = value,
        "R8" => regs.r8 = value,
        "R9" => regs.r9 = value,
        "R10" => regs.r10 = value,
        "R11" => regs.r11 = value,
        "R12" => regs.r12 = value,
        "R13" => regs.r13 = value,
        "R14" => regs.r14 = value,
        "R15" => regs.r15 = value,
        "RIP" | "EIP" => regs.rip = value,
        "RFL" => regs.rflags = value,
        "CR0" => regs.cr0 = value,
        "CR2" => regs.cr2 = value,
        "CR3" => regs.cr3 = value,
        "CR4" => regs.cr4 = value,
        "DR0" => regs.dr0 = value,
        "DR1" => regs.dr1 = value,
        "DR2" => regs.dr2 = value,
        "DR3" => regs.dr3 = value,
        "DR6" => regs.dr6 = value,
        "DR7" => regs.dr7 = value,
        "EFER" => regs.msr_efer = value,
        _ => (),
    }
}

fn parse_segment_line(regs: &mut Registers, line: &str) -> bool {
    let Some((name, rest)) = line.split_once('=') else {
        return false;
    };
    let name = name.trim();

    let mut fields = rest.split_whitespace();
    let (Some(sel), Some(base), Some(limit)) = (fields.next(), fields.next(), fields.next())
    else {
        return false;
    };

    let (Ok(sel), Ok(base), Ok(limit)) = (
        u16::from_str_radix(sel, 16),
        u64::from_str_radix(base, 16),
        u32::from_str_radix(limit, 16),
    ) else {
        return false;
    };

    let arbytes = fields
        .next()
        .and_then(|f| u32::from_str_radix(f, 16).ok())
        .unwrap_or(0);

    let segment = match name {
        "ES" => &mut regs.es,
        "CS" => &mut regs.cs,
        "SS" => &mut regs.ss,
        "DS" => &mut regs.ds,
        "FS" => &mut regs.fs,
        "GS" => &mut regs.gs,
        "LDT" => &mut regs.ldtr,
        "TR" => &mut regs.tr,
        _ => return false,
    };

    segment.selector = sel;
    segment.base = base;
    segment.limit = limit;
    segment.arbytes = arbytes;
    true
}

/// Parses the output of `info registers` into a register file.
///
/// Unknown keys are ignored, so the parser tolerates monitor-version
/// differences in the trailing FPU/XMM dump.
pub fn parse_info_registers(text: &str) -> Registers {
    let mut regs = Registers::default();

    for line in text.lines() {
        let head = line.split_whitespace().next().unwrap_or("");

        match head {
            "ES" | "CS" | "SS" | "DS" | "FS" | "GS" | "TR" => {
                if parse_segment_line(&mut regs, line) {
                    continue;
                }
            }
            _ if head.starts_with("LDT") => {
                if parse_segment_line(&mut regs, line) {
                    continue;
                }
            }
            _ if head.starts_with("GDT") || head.starts_with("IDT") => {
                let Some((name, rest)) = line.split_once('=') else {
                    continue;
                };
                let mut fields = rest.split_whitespace();
                let (Some(base), Some(limit)) = (fields.next(), fields.next()) else {
                    continue;
                };
                let (Ok(base), Ok(limit)) =
                    (u64::from_str_radix(base, 16), u32::from_str_radix(limit, 16))
                else {
                    continue;
                };

                let table = if name.trim() == "GDT" {
                    &mut regs.gdtr
                } else {
                    &mut regs.idtr
                };
                table.base = base;
                table.limit = limit;
                continue;
            }
            _ => (),
        }

        // Generic KEY=HEX pairs, tolerating the space in "R8 =...".
        let mut prev: Option<&str> = None;
        for token in line.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                let key = if key.is_empty() {
                    prev.unwrap_or("")
                } else {
                    key
                };
                if let Ok(value) = u64::from_str_radix(value, 16) {
                    set_named(&mut regs, key, value);
                }
            }
            prev = Some(token);
        }
    }

    regs
}

//! 逆アセンブル機能
//!
//! スコープに入ったときの現在命令の表示と、ブロック中のシステムコール命令の
//! 検出に使います。

use crate::backend::Instruction;
use crate::syscall::Arch;
use crate::Result;
use capstone::prelude::*;

/// アーキテクチャに合わせたCapstoneを作る
fn build_capstone(target: Arch) -> Result<Capstone> {
    let cs = match target {
        Arch::X64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build(),
        Arch::Ia32 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build(),
        Arch::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build(),
        Arch::Arm => Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Arm)
            .build(),
        Arch::Other => return Err(anyhow::anyhow!("Unsupported architecture for disassembly")),
    };
    cs.map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

/// バイト列を逆アセンブルする
///
/// # Arguments
/// * `code` - 命令のバイト列
/// * `base_addr` - 先頭命令のアドレス
pub fn disassemble(arch: Arch, code: &[u8], base_addr: u64) -> Result<Vec<Instruction>> {
    let cs = build_capstone(arch)?;
    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;

    Ok(insns
        .as_ref()
        .iter()
        .map(|insn| {
            Instruction::new(
                insn.address(),
                insn.bytes().len(),
                insn.mnemonic().unwrap_or(""),
                insn.op_str().unwrap_or(""),
            )
        })
        .collect())
}

/// 先頭の1命令だけを逆アセンブルする
pub fn disassemble_one(arch: Arch, code: &[u8], addr: u64) -> Option<Instruction> {
    let cs = build_capstone(arch).ok()?;
    let insns = cs.disasm_count(code, addr, 1).ok()?;
    let insn = insns.as_ref().first()?;
    Some(Instruction::new(
        insn.address(),
        insn.bytes().len(),
        insn.mnemonic().unwrap_or(""),
        insn.op_str().unwrap_or(""),
    ))
}

/// ブロック中のシステムコール命令のアドレスを検出する
pub fn find_syscalls(arch: Arch, code: &[u8], base_addr: u64) -> Result<Vec<u64>> {
    Ok(disassemble(arch, code, base_addr)?
        .iter()
        .filter(|insn| arch.is_syscall(insn))
        .map(|insn| insn.address)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_simple() {
        // mov rax, 1; ret
        let code = [0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3];
        let insns = disassemble(Arch::X64, &code, 0x1000).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic, "mov");
        assert_eq!(insns[0].op_str, "rax, 1");
        assert_eq!(insns[1].address, 0x1007);
        assert_eq!(insns[1].mnemonic, "ret");
    }

    #[test]
    fn test_find_syscalls_x64() {
        // mov eax, 0x27; syscall; int 0x80; ret
        let code = [
            0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 0x27
            0x0f, 0x05, // syscall
            0xcd, 0x80, // int 0x80
            0xc3, // ret
        ];
        let found = find_syscalls(Arch::X64, &code, 0x2000).unwrap();
        assert_eq!(found, vec![0x2005, 0x2007]);
    }

    #[test]
    fn test_find_syscalls_arm64() {
        // mov x8, #172; svc #0; ret
        let code = [
            0x88, 0x15, 0x80, 0xd2, // mov x8, #0xac
            0x01, 0x00, 0x00, 0xd4, // svc #0
            0xc0, 0x03, 0x5f, 0xd6, // ret
        ];
        let found = find_syscalls(Arch::Arm64, &code, 0x4000).unwrap();
        assert_eq!(found, vec![0x4004]);
    }

    #[test]
    fn test_disassemble_one() {
        let code = [0x0f, 0x05, 0xc3];
        let insn = disassemble_one(Arch::X64, &code, 0x3000).unwrap();
        assert_eq!(insn.mnemonic, "syscall");
        assert_eq!(insn.size, 2);
    }

    #[test]
    fn test_other_arch_is_error() {
        assert!(disassemble(Arch::Other, &[0x90], 0).is_err());
    }
}

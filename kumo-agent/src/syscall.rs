//! アーキテクチャごとのシステムコール命令

use crate::backend::Instruction;

/// 対応アーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm,
    Arm64,
    Ia32,
    X64,
    /// 未対応（システムコールは検出しない）
    Other,
}

impl Arch {
    /// ビルド対象のアーキテクチャ
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X64
        } else if cfg!(target_arch = "x86") {
            Arch::Ia32
        } else if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "arm") {
            Arch::Arm
        } else {
            Arch::Other
        }
    }

    /// アーキテクチャ名から（`x64`・`x86_64`どちらの表記も受け付ける）
    pub fn from_name(name: &str) -> Self {
        match name {
            "arm" => Arch::Arm,
            "arm64" | "aarch64" => Arch::Arm64,
            "ia32" | "x86" => Arch::Ia32,
            "x64" | "x86_64" => Arch::X64,
            _ => Arch::Other,
        }
    }

    /// システムコールを発行する命令のニーモニック
    pub fn syscall_mnemonics(self) -> &'static [&'static str] {
        match self {
            Arch::Arm | Arch::Arm64 => &["svc"],
            Arch::Ia32 | Arch::X64 => &["syscall", "int"],
            Arch::Other => &[],
        }
    }

    /// 命令がシステムコールか
    pub fn is_syscall(self, insn: &Instruction) -> bool {
        self.syscall_mnemonics()
            .iter()
            .any(|m| insn.mnemonic.eq_ignore_ascii_case(m))
    }

    pub fn pointer_size(self) -> usize {
        match self {
            Arch::Arm | Arch::Ia32 => 4,
            Arch::Arm64 | Arch::X64 => 8,
            Arch::Other => std::mem::size_of::<usize>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_sets() {
        assert_eq!(Arch::Arm64.syscall_mnemonics(), &["svc"]);
        assert_eq!(Arch::X64.syscall_mnemonics(), &["syscall", "int"]);
        assert!(Arch::Other.syscall_mnemonics().is_empty());
    }

    #[test]
    fn test_is_syscall() {
        let syscall = Instruction::new(0x1000, 2, "syscall", "");
        let svc = Instruction::new(0x2000, 4, "svc", "#0");
        let mov = Instruction::new(0x1002, 3, "mov", "rax, rbx");

        assert!(Arch::X64.is_syscall(&syscall));
        assert!(!Arch::X64.is_syscall(&mov));
        assert!(Arch::Arm64.is_syscall(&svc));
        assert!(!Arch::Arm64.is_syscall(&syscall));
        assert!(!Arch::Other.is_syscall(&syscall));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Arch::from_name("x64"), Arch::X64);
        assert_eq!(Arch::from_name("arm64"), Arch::Arm64);
        assert_eq!(Arch::from_name("mips"), Arch::Other);
    }
}

//! CPUコンテキスト

use std::fmt::Write as _;

/// レジスタ1つ分の値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub value: u64,
}

/// コールアウト・フック時点のレジスタ状態
///
/// 書き換えはバックエンドが命令の再開時に反映します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuContext {
    /// プログラムカウンタ
    pub pc: u64,
    /// スタックポインタ
    pub sp: u64,
    /// フレームポインタ（rbp / x29）
    pub fp: u64,
    registers: Vec<Register>,
}

impl CpuContext {
    pub fn new(pc: u64, sp: u64, fp: u64) -> Self {
        Self {
            pc,
            sp,
            fp,
            registers: Vec::new(),
        }
    }

    /// 汎用レジスタを追加する（表示順は追加順）
    pub fn with_register(mut self, name: impl Into<String>, value: u64) -> Self {
        self.registers.push(Register {
            name: name.into(),
            value,
        });
        self
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// 名前でレジスタを読む（大文字小文字は区別しない）
    ///
    /// `pc` `sp` `fp`はアーキテクチャ固有名の別名として常に使えます。
    pub fn get(&self, name: &str) -> Option<u64> {
        match name.to_ascii_lowercase().as_str() {
            "pc" => Some(self.pc),
            "sp" => Some(self.sp),
            "fp" => Some(self.fp),
            lower => self
                .registers
                .iter()
                .find(|r| r.name.eq_ignore_ascii_case(lower))
                .map(|r| r.value),
        }
    }

    /// 名前でレジスタを書き換える
    pub fn set(&mut self, name: &str, value: u64) -> bool {
        match name.to_ascii_lowercase().as_str() {
            "pc" => self.pc = value,
            "sp" => self.sp = value,
            "fp" => self.fp = value,
            lower => match self
                .registers
                .iter_mut()
                .find(|r| r.name.eq_ignore_ascii_case(lower))
            {
                Some(reg) => reg.value = value,
                None => return false,
            },
        }
        true
    }

    /// `name=0000...`をタブ区切りで1行4個ずつ並べる
    pub fn render_registers(&self, pointer_size: usize) -> String {
        let width = pointer_size * 2;
        let mut out = String::new();
        let all = [("pc", self.pc), ("sp", self.sp), ("fp", self.fp)]
            .into_iter()
            .chain(self.registers.iter().map(|r| (r.name.as_str(), r.value)));

        for (i, (name, value)) in all.enumerate() {
            if i > 0 && i % 4 == 0 {
                out.push('\n');
            }
            let _ = write!(out, "{}={:0width$x}\t", name, value, width = width);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CpuContext {
        CpuContext::new(0x401000, 0x7ffe0000, 0x7ffe0040)
            .with_register("rax", 2)
            .with_register("rdi", 0x1234)
    }

    #[test]
    fn test_register_lookup_is_case_insensitive() {
        let ctx = sample();
        assert_eq!(ctx.get("RAX"), Some(2));
        assert_eq!(ctx.get("pc"), Some(0x401000));
        assert_eq!(ctx.get("r15"), None);
    }

    #[test]
    fn test_set_register() {
        let mut ctx = sample();
        assert!(ctx.set("rdi", 7));
        assert!(ctx.set("PC", 0x402000));
        assert!(!ctx.set("xmm0", 1));
        assert_eq!(ctx.get("rdi"), Some(7));
        assert_eq!(ctx.pc, 0x402000);
    }

    #[test]
    fn test_render_registers_rows() {
        let rendered = sample().render_registers(8);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("pc=0000000000401000\t"));
        assert!(lines[1].starts_with("rdi=0000000000001234"));
    }
}

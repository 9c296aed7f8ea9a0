//! ソース行情報

use crate::loader::{DwarfSlice, ModuleImage};
use crate::Result;

/// ソース上の位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    /// ディレクトリを除いたファイル名
    pub fn file_name(&self) -> &str {
        self.file.rsplit('/').next().unwrap_or(&self.file)
    }
}

/// モジュールの行番号表
pub struct LineTable {
    context: addr2line::Context<DwarfSlice>,
}

impl LineTable {
    /// デバッグ情報がなければNone
    pub fn from_image(image: &ModuleImage) -> Result<Option<Self>> {
        if !image.has_debug_info() {
            return Ok(None);
        }
        let context = addr2line::Context::from_dwarf(image.dwarf()?).map_err(|e| {
            anyhow::anyhow!("Broken line table in {:?}: {}", image.path(), e)
        })?;
        Ok(Some(Self { context }))
    }

    /// ファイル内アドレスの位置
    pub fn locate(&self, addr: u64) -> Option<SourceLocation> {
        let loc = self.context.find_location(addr).ok()??;
        Some(SourceLocation {
            file: loc.file?.to_string(),
            line: loc.line?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        let loc = SourceLocation {
            file: "/home/user/src/main.rs".to_string(),
            line: 42,
        };
        assert_eq!(loc.file_name(), "main.rs");
    }
}

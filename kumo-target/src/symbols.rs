//! プロセス全体のシンボル解決

use crate::maps::Mappings;
use crate::Result;
use kumo_dwarf::{
    DebugSymbol, DebugSymbols, LineTable, ModuleImage, ModuleInfo, RangeProvider, Symbol,
    SymbolTable,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// モジュール1つ分の読み込み済みシンボル
struct ModuleSymbols {
    image: ModuleImage,
    table: SymbolTable,
    /// 行番号表（ロックして使う）
    lines: Option<Mutex<LineTable>>,
}

impl ModuleSymbols {
    fn load(path: &Path) -> Result<Self> {
        let image = ModuleImage::open(path)?;
        let table = SymbolTable::from_image(&image);
        let lines = match LineTable::from_image(&image) {
            Ok(lines) => lines.map(Mutex::new),
            Err(e) => {
                tracing::debug!("Ignoring line info of {:?}: {}", path, e);
                None
            }
        };
        Ok(Self {
            image,
            table,
            lines,
        })
    }

    fn runtime_address(&self, module: &ModuleInfo, sym: &Symbol) -> u64 {
        self.image.runtime_address(module.base, sym.address)
    }
}

/// プロセスにロードされた全モジュールのシンボル
///
/// モジュールごとのシンボル表はそのモジュールが初めて参照されたときに読み込みます。
pub struct ProcessSymbols {
    mappings: Mappings,
    cache: Mutex<HashMap<PathBuf, Option<Arc<ModuleSymbols>>>>,
}

impl ProcessSymbols {
    /// 指定プロセスのシンボル
    pub fn new(pid: i32) -> Self {
        Self::with_mappings(Mappings::new(pid))
    }

    /// 自プロセスのシンボル
    pub fn current() -> Self {
        Self::with_mappings(Mappings::current())
    }

    fn with_mappings(mappings: Mappings) -> Self {
        Self {
            mappings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// マッピング情報を取得する
    pub fn mappings(&self) -> &Mappings {
        &self.mappings
    }

    fn module_symbols(&self, module: &ModuleInfo) -> Option<Arc<ModuleSymbols>> {
        let mut cache = self.cache.lock();
        cache
            .entry(module.path.clone())
            .or_insert_with(|| match ModuleSymbols::load(&module.path) {
                Ok(symbols) => Some(Arc::new(symbols)),
                Err(e) => {
                    tracing::debug!("Failed to load symbols for {:?}: {}", module.path, e);
                    None
                }
            })
            .clone()
    }

    /// `module`から名前で探す（`exports_only`ならエクスポートを優先）
    fn lookup_in(&self, module: &ModuleInfo, name: &str, exports_only: bool) -> Option<u64> {
        let symbols = self.module_symbols(module)?;
        let sym = if exports_only {
            symbols
                .table
                .export(name)
                .or_else(|| symbols.table.lookup(name).filter(|s| s.is_function))
        } else {
            symbols.table.lookup(name)
        }?;
        Some(symbols.runtime_address(module, sym))
    }
}

impl DebugSymbols for ProcessSymbols {
    fn symbol_at(&self, addr: u64) -> Option<DebugSymbol> {
        let module = self.mappings.module_at(addr)?;
        let symbols = self.module_symbols(&module)?;
        let file_addr = symbols.image.file_address(module.base, addr);

        let name = symbols
            .table
            .containing(file_addr)
            .map(|(sym, _)| sym.pretty.clone());
        let location = symbols
            .lines
            .as_ref()
            .and_then(|lines| lines.lock().locate(file_addr));

        Some(DebugSymbol {
            address: addr,
            name,
            module_name: Some(module.name.clone()),
            file_name: location.as_ref().map(|l| l.file.clone()),
            line_number: location.map(|l| l.line),
        })
    }

    fn address_of(&self, name: &str) -> Option<u64> {
        self.mappings
            .modules()
            .iter()
            .find_map(|module| self.lookup_in(module, name, false))
    }

    fn find_export(&self, module: Option<&str>, name: &str) -> Option<u64> {
        match module {
            Some(module_name) => {
                let module = self.mappings.module_by_name(module_name)?;
                self.lookup_in(&module, name, true)
            }
            None => self
                .mappings
                .modules()
                .iter()
                .find_map(|module| self.lookup_in(module, name, true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    #[no_mangle]
    extern "C" fn kumo_target_symbol_marker() -> u64 {
        42
    }

    #[test]
    fn test_symbol_at_own_function() {
        let addr = kumo_target_symbol_marker as usize as u64;
        let symbols = ProcessSymbols::current();

        let symbol = symbols.symbol_at(addr).unwrap();
        assert_eq!(symbol.address, addr);
        assert_eq!(symbol.name.as_deref(), Some("kumo_target_symbol_marker"));
        assert!(symbol.module_name.is_some());
        assert_eq!(kumo_target_symbol_marker(), 42);
    }

    #[test]
    fn test_address_of_round_trip() {
        let addr = kumo_target_symbol_marker as usize as u64;
        let symbols = ProcessSymbols::current();
        assert_eq!(symbols.address_of("kumo_target_symbol_marker"), Some(addr));
    }

    #[test]
    fn test_find_export_in_libc() {
        let symbols = ProcessSymbols::current();
        assert!(symbols.find_export(Some("libc"), "getpid").is_some());
        assert!(symbols.find_export(Some("libc"), "kumo_no_such_export").is_none());
    }
}

//! アドレスの名前解決
//!
//! 任意のアドレスを人間が読める名前に変換します。優先順位は次の通りです。
//!
//! 1. ユーザー定義の名前（[`NameOverride`]）
//! 2. デバッグシンボル + メモリ範囲
//! 3. メモリ範囲のみ（バッキングファイルのパス付き）
//! 4. デバッグシンボルのみ（シンボル先頭からのオフセットと file:line 付き）
//! 5. 生のアドレス
//!
//! どの段階でも失敗することはなく、最悪でもアドレス文字列を返します。

use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// ユーザー定義のアドレス範囲名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOverride {
    pub base: u64,
    pub size: u64,
    pub label: String,
}

impl NameOverride {
    /// アドレスが範囲内か
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// メモリ保護属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    /// `r-x` 形式の文字列からパースする
    pub fn parse(perms: &str) -> Self {
        let mut chars = perms.chars();
        Self {
            read: chars.next() == Some('r'),
            write: chars.next() == Some('w'),
            execute: chars.next() == Some('x'),
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )
    }
}

/// マップされたメモリ範囲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
    pub protection: Protection,
    /// バッキングファイル（匿名マッピングならNone）
    pub file: Option<PathBuf>,
}

impl MemoryRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// ロード済みモジュール
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub path: PathBuf,
}

impl ModuleInfo {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// アドレスに対応するデバッグシンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSymbol {
    pub address: u64,
    pub name: Option<String>,
    pub module_name: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
}

impl fmt::Display for DebugSymbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.address)?;
        match (&self.module_name, &self.name) {
            (Some(module), Some(name)) => write!(f, " {}!{}", module, name)?,
            (Some(module), None) => write!(f, " {}", module)?,
            (None, Some(name)) => write!(f, " {}", name)?,
            (None, None) => {}
        }
        if let (Some(file), Some(line)) = (&self.file_name, self.line_number) {
            write!(f, " {}:{}", file, line)?;
        }
        Ok(())
    }
}

/// デバッグシンボルの提供元
pub trait DebugSymbols: Send + Sync {
    /// アドレスを含むシンボルを探す
    fn symbol_at(&self, addr: u64) -> Option<DebugSymbol>;

    /// シンボル名からアドレスを探す
    fn address_of(&self, name: &str) -> Option<u64>;

    /// モジュールのエクスポート（`module`がNoneなら全モジュール）を探す
    fn find_export(&self, module: Option<&str>, name: &str) -> Option<u64>;
}

/// メモリ範囲とモジュールの提供元
pub trait RangeProvider: Send + Sync {
    /// アドレスを含むメモリ範囲
    fn range_at(&self, addr: u64) -> Option<MemoryRange>;

    /// ロード済みモジュール一覧
    fn modules(&self) -> Vec<ModuleInfo>;

    /// アドレスを含むモジュール
    fn module_at(&self, addr: u64) -> Option<ModuleInfo> {
        self.modules().into_iter().find(|m| m.contains(addr))
    }

    /// 名前（前方一致）でモジュールを探す
    ///
    /// `libc.so` で `libc.so.6` が見つかります。
    fn module_by_name(&self, name: &str) -> Option<ModuleInfo> {
        self.modules().into_iter().find(|m| m.name.starts_with(name))
    }
}

/// アドレス名前解決器
///
/// 名前テーブルを所有し、`Arc`で各コンポーネントに共有されます。
#[derive(Default)]
pub struct AddressNamer {
    overrides: RwLock<Vec<NameOverride>>,
    symbols: Option<Arc<dyn DebugSymbols>>,
    ranges: Option<Arc<dyn RangeProvider>>,
}

impl AddressNamer {
    /// シンボル・範囲情報を持たない名前解決器を作成する
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbols(mut self, symbols: Arc<dyn DebugSymbols>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn with_ranges(mut self, ranges: Arc<dyn RangeProvider>) -> Self {
        self.ranges = Some(ranges);
        self
    }

    pub fn symbols(&self) -> Option<&Arc<dyn DebugSymbols>> {
        self.symbols.as_ref()
    }

    pub fn ranges(&self) -> Option<&Arc<dyn RangeProvider>> {
        self.ranges.as_ref()
    }

    /// 範囲に名前を付ける
    ///
    /// 重複や重なりは検査しません。検索時は先に登録されたものが優先されます。
    pub fn add_override(&self, base: u64, size: u64, label: impl Into<String>) {
        self.overrides.write().push(NameOverride {
            base,
            size,
            label: label.into(),
        });
    }

    /// 登録済みの名前一覧
    pub fn overrides(&self) -> Vec<NameOverride> {
        self.overrides.read().clone()
    }

    /// アドレスを名前に解決する
    pub fn resolve(&self, addr: u64) -> String {
        if let Some(name) = self.resolve_override(addr) {
            return name;
        }

        let symbol = self.symbols.as_ref().and_then(|s| s.symbol_at(addr));
        let range = self.ranges.as_ref().and_then(|r| r.range_at(addr));

        match (symbol, range) {
            (Some(symbol), Some(range)) => {
                format!("{} (0x{:x}+0x{:x})", symbol, range.base, addr - range.base)
            }
            (None, Some(range)) => {
                let prefix = range
                    .file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                format!("{}(0x{:x}+0x{:x})", prefix, range.base, addr - range.base)
            }
            (Some(symbol), None) => self.format_symbol_only(addr, &symbol),
            (None, None) => format!("0x{:x}", addr),
        }
    }

    fn resolve_override(&self, addr: u64) -> Option<String> {
        let overrides = self.overrides.read();
        let hit = overrides.iter().find(|o| o.contains(addr))?;
        let offset = addr - hit.base;
        if offset == 0 {
            Some(hit.label.clone())
        } else {
            Some(format!("{}+0x{:x}", hit.label, offset))
        }
    }

    fn format_symbol_only(&self, addr: u64, symbol: &DebugSymbol) -> String {
        let mut name = format!("0x{:x}", addr);
        if let Some(module) = &symbol.module_name {
            name.push(' ');
            name.push_str(module);
        }
        if let Some(sym_name) = &symbol.name {
            let base = self
                .symbols
                .as_ref()
                .and_then(|s| s.address_of(sym_name))
                .filter(|base| *base <= addr)
                .unwrap_or(addr);
            name.push_str(&format!("!{}+0x{:x}", sym_name, addr - base));
        }
        if let Some(file) = &symbol.file_name {
            let basename = file.rsplit('/').next().unwrap_or(file);
            let line = symbol.line_number.unwrap_or(0);
            name.push_str(&format!("({}:{})", basename, line));
        }
        name
    }

    /// アドレスについて分かっている情報をすべて表示する
    pub fn addr_info(&self, addr: u64) -> String {
        let symbol = self.symbols.as_ref().and_then(|s| s.symbol_at(addr));
        let module = self.ranges.as_ref().and_then(|r| r.module_at(addr));
        let range = self.ranges.as_ref().and_then(|r| r.range_at(addr));

        format!(
            "AddrInfo of 0x{:x} :\n\t{:?}\n\t{:?}\n\t{:?}",
            addr, symbol, module, range
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSymbols;

    impl DebugSymbols for FixedSymbols {
        fn symbol_at(&self, addr: u64) -> Option<DebugSymbol> {
            (0x5000..0x6000).contains(&addr).then(|| DebugSymbol {
                address: addr,
                name: Some("do_work".to_string()),
                module_name: Some("libwork.so".to_string()),
                file_name: Some("/src/work/work.c".to_string()),
                line_number: Some(17),
            })
        }

        fn address_of(&self, name: &str) -> Option<u64> {
            (name == "do_work").then_some(0x5000)
        }

        fn find_export(&self, _module: Option<&str>, name: &str) -> Option<u64> {
            self.address_of(name)
        }
    }

    struct FixedRanges;

    impl RangeProvider for FixedRanges {
        fn range_at(&self, addr: u64) -> Option<MemoryRange> {
            (0x1000..0x3000).contains(&addr).then(|| MemoryRange {
                base: 0x1000,
                size: 0x2000,
                protection: Protection::parse("r-x"),
                file: Some(PathBuf::from("/usr/lib/libdemo.so")),
            })
        }

        fn modules(&self) -> Vec<ModuleInfo> {
            vec![ModuleInfo {
                name: "libdemo.so".to_string(),
                base: 0x1000,
                size: 0x2000,
                path: PathBuf::from("/usr/lib/libdemo.so"),
            }]
        }
    }

    #[test]
    fn test_override_exact_and_offset() {
        let namer = AddressNamer::new();
        namer.add_override(0x4000, 0x100, "decrypt");

        assert_eq!(namer.resolve(0x4000), "decrypt");
        assert_eq!(namer.resolve(0x4010), "decrypt+0x10");
        assert_eq!(namer.resolve(0x4100), "0x4100");
    }

    #[test]
    fn test_first_inserted_override_wins() {
        let namer = AddressNamer::new();
        namer.add_override(0x4000, 0x1000, "outer");
        namer.add_override(0x4800, 0x10, "inner");
        namer.add_override(0x4000, 0x1000, "outer");

        assert_eq!(namer.resolve(0x4804), "outer+0x804");
        assert_eq!(namer.overrides().len(), 3);
    }

    #[test]
    fn test_override_beats_symbols_and_ranges() {
        let namer = AddressNamer::new()
            .with_symbols(Arc::new(FixedSymbols))
            .with_ranges(Arc::new(FixedRanges));
        namer.add_override(0x1000, 0x10, "entry");

        assert_eq!(namer.resolve(0x1004), "entry+0x4");
    }

    #[test]
    fn test_raw_address_is_idempotent() {
        let namer = AddressNamer::new();
        let first = namer.resolve(0xdead_beef);
        let second = namer.resolve(0xdead_beef);
        assert_eq!(first, "0xdeadbeef");
        assert_eq!(first, second);
    }

    #[test]
    fn test_range_only_has_file_prefix() {
        let namer = AddressNamer::new().with_ranges(Arc::new(FixedRanges));
        assert_eq!(namer.resolve(0x1234), "/usr/lib/libdemo.so(0x1000+0x234)");
    }

    #[test]
    fn test_symbol_only_has_offset_and_line() {
        let namer = AddressNamer::new().with_symbols(Arc::new(FixedSymbols));
        assert_eq!(
            namer.resolve(0x5010),
            "0x5010 libwork.so!do_work+0x10(work.c:17)"
        );
    }

    #[test]
    fn test_symbol_and_range_combined() {
        struct Both;
        impl RangeProvider for Both {
            fn range_at(&self, addr: u64) -> Option<MemoryRange> {
                Some(MemoryRange {
                    base: 0x5000,
                    size: 0x1000,
                    protection: Protection::parse("r-x"),
                    file: None,
                })
                .filter(|r| r.contains(addr))
            }
            fn modules(&self) -> Vec<ModuleInfo> {
                Vec::new()
            }
        }

        let namer = AddressNamer::new()
            .with_symbols(Arc::new(FixedSymbols))
            .with_ranges(Arc::new(Both));
        assert_eq!(
            namer.resolve(0x5008),
            "0x5008 libwork.so!do_work /src/work/work.c:17 (0x5000+0x8)"
        );
    }

    #[test]
    fn test_protection_round_trip_display() {
        assert_eq!(Protection::parse("r-xp").to_string(), "r-x");
        assert_eq!(Protection::parse("---p").to_string(), "---");
    }

    #[test]
    fn test_module_by_name_prefix() {
        let ranges = FixedRanges;
        assert!(ranges.module_by_name("libdemo").is_some());
        assert!(ranges.module_by_name("libc.so").is_none());
        assert_eq!(ranges.module_at(0x1800).unwrap().name, "libdemo.so");
    }
}

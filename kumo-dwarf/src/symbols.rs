//! モジュールのシンボル表

use crate::loader::ModuleImage;
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;

/// シンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// リンカが見る名前
    pub name: String,
    /// 表示用の名前（Rustシンボルはデマングル済み）
    pub pretty: String,
    /// ファイル内アドレス
    pub address: u64,
    pub size: u64,
    pub is_function: bool,
    /// `.dynsym`にある（他のモジュールから見える）
    pub exported: bool,
}

impl Symbol {
    pub fn new(name: &str, address: u64, size: u64) -> Self {
        Self {
            pretty: pretty_name(name),
            name: name.to_string(),
            address,
            size,
            is_function: true,
            exported: false,
        }
    }

    /// `addr`がこのシンボルの範囲内か（サイズ0なら先頭だけ）
    pub fn covers(&self, addr: u64) -> bool {
        addr == self.address || addr.wrapping_sub(self.address) < self.size
    }
}

/// Rustのハッシュ付きシンボルは`{:#}`でハッシュを落とす
fn pretty_name(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{:#}", demangled),
        Err(_) => name.to_string(),
    }
}

/// 1モジュール分のシンボル表
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// アドレス順
    symbols: Vec<Symbol>,
    /// 名前（リンカ名・表示名） → `symbols`の添字
    by_name: HashMap<String, usize>,
}

impl SymbolTable {
    /// `.symtab`と`.dynsym`から表を作る
    ///
    /// 同じ名前が両方にあれば1つにまとめ、エクスポート扱いにします。
    pub fn from_image(image: &ModuleImage) -> Self {
        let file = image.object();
        let mut merged: HashMap<String, Symbol> = HashMap::new();

        let tables = [(file.symbols(), false), (file.dynamic_symbols(), true)];
        for (table, exported) in tables {
            for sym in table {
                if !sym.is_definition() || sym.address() == 0 {
                    continue;
                }
                let Ok(name) = sym.name() else { continue };
                if name.is_empty() {
                    continue;
                }
                let entry = merged
                    .entry(name.to_string())
                    .or_insert_with(|| Symbol::new(name, sym.address(), sym.size()));
                entry.is_function = sym.kind() == SymbolKind::Text;
                entry.exported |= exported;
            }
        }

        Self::from_symbols(merged.into_values().collect())
    }

    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));

        let mut by_name = HashMap::new();
        for (i, sym) in symbols.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_insert(i);
            by_name.entry(sym.pretty.clone()).or_insert(i);
        }
        Self { symbols, by_name }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    /// リンカ名か表示名で探す
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.symbols[i])
    }

    /// エクスポートされた関数だけを名前で探す
    pub fn export(&self, name: &str) -> Option<&Symbol> {
        self.lookup(name).filter(|s| s.exported && s.is_function)
    }

    /// アドレスを含むシンボルとそこからのオフセット
    pub fn containing(&self, addr: u64) -> Option<(&Symbol, u64)> {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        // 同じ先頭アドレスの別名があれば、範囲に入るものを優先する
        self.symbols[..idx]
            .iter()
            .rev()
            .take_while(|s| s.address == self.symbols[idx - 1].address)
            .find(|s| s.covers(addr))
            .map(|s| (s, addr - s.address))
    }

    /// 名前に`pattern`を含むシンボル（アドレス順）
    pub fn matching<'a>(&'a self, pattern: &'a str) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.symbols
            .iter()
            .filter(move |s| s.name.contains(pattern) || s.pretty.contains(pattern))
    }
}

//! メモリマッピング情報（/proc/pid/maps）

use crate::Result;
use kumo_dwarf::{MemoryRange, ModuleInfo, Protection, RangeProvider};
use std::fs;
use std::path::PathBuf;

/// /proc/pid/maps の1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub range: MemoryRange,
    /// ファイル内オフセット
    pub offset: u64,
    /// パス名欄（`[stack]`などの擬似名を含む）
    pub pathname: Option<String>,
}

/// プロセスのメモリマッピング
///
/// 呼び出しのたびに /proc/pid/maps を読み直すので、dlopen後のモジュールも見えます。
#[derive(Debug, Clone)]
pub struct Mappings {
    pid: Option<i32>,
}

impl Mappings {
    /// 指定プロセスのマッピング
    pub fn new(pid: i32) -> Self {
        Self { pid: Some(pid) }
    }

    /// 自プロセスのマッピング
    pub fn current() -> Self {
        Self { pid: None }
    }

    fn maps_path(&self) -> String {
        match self.pid {
            Some(pid) => format!("/proc/{}/maps", pid),
            None => "/proc/self/maps".to_string(),
        }
    }

    /// マッピング一覧を読む
    pub fn entries(&self) -> Result<Vec<MapEntry>> {
        let maps_path = self.maps_path();
        let text = fs::read_to_string(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        Ok(parse_maps(&text))
    }
}

/// maps形式のテキストをパースする
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456   /lib/libc.so"
pub fn parse_maps(text: &str) -> Vec<MapEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut parts = line.splitn(6, ' ');
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    // 実ファイルのみをバッキングファイルとして扱う
    let file = pathname
        .as_deref()
        .filter(|p| p.starts_with('/'))
        .map(|p| PathBuf::from(p.trim_end_matches(" (deleted)")));

    Some(MapEntry {
        range: MemoryRange {
            base: start,
            size: end.saturating_sub(start),
            protection: Protection::parse(perms),
            file,
        },
        offset,
        pathname,
    })
}

/// ファイルごとにまとめたモジュール一覧を作る
///
/// ベースは最初のマッピングの開始アドレスからそのファイルオフセットを引いたもの
/// （ロードバイアス）です。
pub fn modules_from_entries(entries: &[MapEntry]) -> Vec<ModuleInfo> {
    let mut modules: Vec<ModuleInfo> = Vec::new();

    for entry in entries {
        let Some(path) = &entry.range.file else {
            continue;
        };
        let end = entry.range.base + entry.range.size;

        if let Some(module) = modules.iter_mut().find(|m| &m.path == path) {
            let module_end = module.base + module.size;
            module.size = module_end.max(end) - module.base;
            continue;
        }

        let base = entry.range.base.saturating_sub(entry.offset);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        modules.push(ModuleInfo {
            name,
            base,
            size: end - base,
            path: path.clone(),
        });
    }

    modules
}

impl RangeProvider for Mappings {
    fn range_at(&self, addr: u64) -> Option<MemoryRange> {
        let entries = self.entries().ok()?;
        entries
            .into_iter()
            .map(|e| e.range)
            .find(|r| r.contains(addr))
    }

    fn modules(&self) -> Vec<ModuleInfo> {
        self.entries()
            .map(|entries| modules_from_entries(&entries))
            .unwrap_or_default()
    }
}

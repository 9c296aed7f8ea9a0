//! モジュールイメージの読み込み

use crate::Result;
use object::{Object, ObjectKind, ObjectSection};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 'staticなDWARFセクションスライス
pub type DwarfSlice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// ディスク上のモジュール（実行ファイル・共有ライブラリ）
///
/// ファイルの中身はプロセスが終わるまで保持します。同じモジュールを
/// 何度も読まないよう、呼び出し側でキャッシュしてください。
pub struct ModuleImage {
    path: PathBuf,
    file: Arc<object::File<'static>>,
}

impl ModuleImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read module {:?}: {}", path, e))?;
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let file = object::File::parse(bytes)
            .map_err(|e| anyhow::anyhow!("{:?} is not a loadable object: {}", path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object(&self) -> &object::File<'static> {
        &self.file
    }

    /// ET_DYN（PIE・共有ライブラリ）ならシンボルはロードベースからの相対
    pub fn is_relocatable(&self) -> bool {
        self.file.kind() == ObjectKind::Dynamic
    }

    /// 実行時アドレス → ファイル内アドレス
    pub fn file_address(&self, base: u64, addr: u64) -> u64 {
        if self.is_relocatable() {
            addr.wrapping_sub(base)
        } else {
            addr
        }
    }

    /// ファイル内アドレス → 実行時アドレス
    pub fn runtime_address(&self, base: u64, addr: u64) -> u64 {
        if self.is_relocatable() {
            base.wrapping_add(addr)
        } else {
            addr
        }
    }

    /// DWARFセクションを組み立てる
    ///
    /// セクションがなければ空のまま返します（行情報なしとして扱われます）。
    pub fn dwarf(&self) -> Result<gimli::Dwarf<DwarfSlice>> {
        let endian = if self.file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let file = Arc::clone(&self.file);

        gimli::Dwarf::load(|id: gimli::SectionId| -> Result<DwarfSlice> {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        })
    }

    /// `.debug_info`を持っているか
    pub fn has_debug_info(&self) -> bool {
        self.file
            .section_by_name(".debug_info")
            .is_some_and(|s| s.size() > 0)
    }
}

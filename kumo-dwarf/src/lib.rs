//! Kumo シンボル・値デコード
//!
//! このクレートは、ELFとDWARFデバッグ情報の読み込み、アドレスの名前解決、
//! 書式記述子による生の値のデコードを提供します。

pub mod loader;
pub mod symbols;
pub mod lines;
pub mod names;
pub mod descriptor;
pub mod decode;
pub mod hexdump;

pub use loader::ModuleImage;
pub use symbols::{Symbol, SymbolTable};
pub use lines::{LineTable, SourceLocation};
pub use names::{
    AddressNamer, DebugSymbol, DebugSymbols, MemoryRange, ModuleInfo, NameOverride, Protection,
    RangeProvider,
};
pub use descriptor::{ValueDescriptor, ValueTag};
pub use decode::{DecodeConfig, MemoryReader, SharedMemory, ValueDecoder};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;

//! Kumo ターゲットプロセス操作
//!
//! このクレートは、ターゲットプロセスを扱うための低レベル機能を提供します。
//! プロセスの起動・アタッチ・終了、メモリアクセス、メモリマッピング、
//! メモリダンプ、プロセス全体のシンボル解決などを行います。

pub mod process;
pub mod thread;
pub mod memory;
pub mod maps;
pub mod dump;
pub mod symbols;

pub use process::{ExitStatus, Process};
pub use thread::{current_thread_id, list_threads, ThreadId, ThreadStat};
pub use memory::Memory;
pub use maps::{MapEntry, Mappings};
pub use dump::dump_memory;
pub use symbols::ProcessSymbols;

/// ターゲット操作の結果型
pub type Result<T> = anyhow::Result<T>;

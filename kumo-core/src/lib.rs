//! Kumo コントローラのコア機能
//!
//! ターゲットプロセスへのアタッチ・起動、ペイロードのビルドと読み込み、
//! スコープでの対話的な評価をまとめて管理します。

pub mod build;
pub mod command;
pub mod config;
pub mod device;
pub mod errors;
pub mod local;
pub mod manager;

pub use build::{BuildEvent, Builder, CargoBuilder, SourceWatcher};
pub use command::Command;
pub use config::Config;
pub use device::{DetachReason, Device, Script, Session, SessionEvent, Target};
pub use errors::{BuildError, DeviceError, EvalError};
pub use local::LocalDevice;
pub use manager::{Notice, SessionInfo, SessionManager};

// 他のクレートから使用するために再エクスポート
pub use kumo_agent::LogLevel;

/// コントローラの結果型
pub type Result<T> = anyhow::Result<T>;

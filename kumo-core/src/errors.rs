//! コントローラ側のエラー型

use thiserror::Error;

/// セッションがない場合のエラーメッセージ
pub const ERR_NO_SESSION: &str = "No session attached";

/// ペイロードがビルドされていない場合のエラーメッセージ
pub const ERR_NO_ARTIFACT: &str = "Payload has not been compiled";

/// デバイス操作のエラー
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Process not found: {0}")]
    NotFound(String),
    /// 名前に一致するプロセスが複数ある
    #[error("Ambiguous name '{name}': candidates {candidates:?}")]
    Ambiguous { name: String, candidates: Vec<i32> },
    /// エージェントに接続できない
    #[error("Agent unavailable in process {pid}: {reason}")]
    AgentUnavailable { pid: i32, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// リモート評価のエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    /// 前の評価がまだ返ってきていない
    #[error("Another evaluation is in progress")]
    Busy,
    /// 評価中にセッションが切れた
    #[error("Session detached")]
    Detached,
    #[error("{}", ERR_NO_SESSION)]
    NoSession,
    /// ターゲット側のエラー
    #[error("{0}")]
    Remote(String),
}

/// ペイロードのビルドエラー
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to run cargo: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Build failed:\n{0}")]
    Failed(String),
    #[error("Build produced no cdylib artifact")]
    NoArtifact,
}

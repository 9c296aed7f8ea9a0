//! デバイス・セッション・スクリプトの抽象
//!
//! プロセスへのアタッチ・起動と、エージェントとの通信路を表します。

use crate::errors::DeviceError;
use crate::Result;
use async_trait::async_trait;
use kumo_agent::{ControllerMessage, TargetMessage};
use std::fmt;
use std::path::Path;
use tokio::sync::mpsc;

/// アタッチ先の指定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Pid(i32),
    Name(String),
}

impl Target {
    /// 数字だけならPID、それ以外はプロセス名
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input.parse::<i32>() {
            Ok(pid) => Target::Pid(pid),
            Err(_) => Target::Name(input.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Pid(pid) => write!(f, "{}", pid),
            Target::Name(name) => write!(f, "{}", name),
        }
    }
}

/// セッションが切れた理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachReason {
    /// コントローラから切断した
    ApplicationRequested,
    /// プロセスが終了した（分かれば終了状態）
    ProcessTerminated(Option<String>),
    /// 接続が切れた
    ConnectionLost,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DetachReason::ApplicationRequested => write!(f, "detached"),
            DetachReason::ProcessTerminated(Some(status)) => write!(f, "process {}", status),
            DetachReason::ProcessTerminated(None) => write!(f, "process terminated"),
            DetachReason::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

/// セッションからの通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(TargetMessage),
    /// 子プロセスが生まれた
    Child { pid: i32 },
    Detached(DetachReason),
}

/// 読み込み済みのペイロード
#[async_trait]
pub trait Script: Send + Sync {
    /// ターゲットに渡したファイル
    fn path(&self) -> &Path;
    /// ペイロードを取り外す
    async fn unload(&self) -> Result<()>;
}

/// 1つのターゲットプロセスとの接続
#[async_trait]
pub trait Session: Send + Sync {
    fn pid(&self) -> i32;
    fn name(&self) -> &str;
    /// エージェントにメッセージを送る
    async fn post(&self, message: ControllerMessage) -> Result<()>;
    /// ペイロードを読み込ませる
    async fn load_script(&self, artifact: &Path) -> Result<Box<dyn Script>>;
    /// 通知の受信口（最初の1回だけSome）
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;
    async fn detach(&self) -> Result<()>;
}

/// プロセスの供給元
#[async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    async fn attach(&self, target: &Target) -> std::result::Result<Box<dyn Session>, DeviceError>;
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> std::result::Result<Box<dyn Session>, DeviceError>;
    async fn kill(&self, pid: i32) -> std::result::Result<(), DeviceError>;
}

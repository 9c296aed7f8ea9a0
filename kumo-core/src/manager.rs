//! セッションマネージャー
//!
//! アタッチ中のセッションを管理し、ビルド・読み込み・再開の流れと
//! スコープメッセージの処理を行います。
//!
//! セッションからの通知はすべて1本のイベントループに集められます。
//! 状態は`parking_lot::Mutex`で保護し、`.await`をまたいでロックを持ちません。

use crate::build::{BuildEvent, Builder, SourceWatcher};
use crate::config::Config;
use crate::device::{DetachReason, Device, Script, Session, SessionEvent, Target};
use crate::errors::{DeviceError, EvalError, ERR_NO_ARTIFACT, ERR_NO_SESSION};
use crate::Result;
use kumo_agent::{ControllerMessage, ExpressionEvaluator, LogLevel, ScopeReport, TargetMessage};
use kumo_dwarf::{AddressNamer, DecodeConfig, SharedMemory, ValueDecoder};
use kumo_target::Memory;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// ソース変更からリロードまでの待ち時間
const WATCH_SETTLE: Duration = Duration::from_millis(50);

/// 操作者への通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// ターゲットからのログ
    Log {
        pid: i32,
        level: LogLevel,
        text: String,
    },
    Info(String),
    Warn(String),
    Build(BuildEvent),
    /// プロンプトが変わった
    Prompt(String),
}

/// セッション一覧の1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub pid: i32,
    pub name: String,
    pub depth: usize,
    pub current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Scope,
    Exec(u64),
}

/// 返事待ちのリモート評価
struct PendingEval {
    kind: PendingKind,
    reply: oneshot::Sender<std::result::Result<String, EvalError>>,
}

/// アタッチ中の1プロセス
struct TraceSession {
    pid: i32,
    name: String,
    session: Arc<dyn Session>,
    script: Option<Arc<dyn Script>>,
    /// スコープの入れ子の深さ
    depth: usize,
    pending: Option<PendingEval>,
    /// 読み込み結果の返事待ち
    loading: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

#[derive(Default)]
struct ManagerState {
    sessions: Vec<TraceSession>,
    current: Option<i32>,
    artifact: Option<PathBuf>,
    next_exec_id: u64,
}

impl ManagerState {
    fn session(&self, pid: i32) -> Option<&TraceSession> {
        self.sessions.iter().find(|s| s.pid == pid)
    }

    fn session_mut(&mut self, pid: i32) -> Option<&mut TraceSession> {
        self.sessions.iter_mut().find(|s| s.pid == pid)
    }

    fn current(&self) -> Option<&TraceSession> {
        self.current.and_then(|pid| self.session(pid))
    }
}

/// セッションマネージャー
pub struct SessionManager {
    device: Arc<dyn Device>,
    builder: Arc<dyn Builder>,
    config: Config,
    state: Mutex<ManagerState>,
    /// compileとreloadを直列化する
    build: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<(i32, SessionEvent)>,
    notices: mpsc::UnboundedSender<Notice>,
    local: ExpressionEvaluator,
}

impl SessionManager {
    /// マネージャーを作り、イベントループを起動する
    ///
    /// tokioランタイムの中で呼ぶ必要があります。
    pub fn new(
        device: Arc<dyn Device>,
        builder: Arc<dyn Builder>,
        config: Config,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Notice>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let memory: SharedMemory = Arc::new(Memory::current());
        let decoder = ValueDecoder::new(memory.clone(), DecodeConfig::default());
        let local = ExpressionEvaluator::new(memory, Arc::new(AddressNamer::new()), decoder);

        let manager = Arc::new(Self {
            device,
            builder,
            config,
            state: Mutex::new(ManagerState::default()),
            build: tokio::sync::Mutex::new(()),
            events: events_tx,
            notices: notices_tx,
            local,
        });
        tokio::spawn(event_loop(Arc::downgrade(&manager), events_rx));

        (manager, notices_rx)
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn notify_prompt(&self) {
        self.notify(Notice::Prompt(self.prompt()));
    }

    /// 現在のプロンプト
    pub fn prompt(&self) -> String {
        let state = self.state.lock();
        match state.current() {
            None => "[local] > ".to_string(),
            Some(s) if s.depth > 0 => format!(
                "[{}->{}>scope({})] > ",
                self.device.name(),
                s.name,
                s.depth
            ),
            Some(s) => format!("[{}->{}] > ", self.device.name(), s.name),
        }
    }

    /// アタッチ中のセッション一覧
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.lock();
        state
            .sessions
            .iter()
            .map(|s| SessionInfo {
                pid: s.pid,
                name: s.name.clone(),
                depth: s.depth,
                current: state.current == Some(s.pid),
            })
            .collect()
    }

    pub fn current_pid(&self) -> Option<i32> {
        self.state.lock().current
    }

    /// 現在のセッションを切り替える
    pub fn switch(&self, pid: i32) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.session(pid).is_none() {
                anyhow::bail!("No session for pid {}", pid);
            }
            state.current = Some(pid);
        }
        self.notify_prompt();
        Ok(())
    }

    fn target_pid(&self, pid: Option<i32>) -> Result<i32> {
        pid.or(self.current_pid())
            .ok_or_else(|| anyhow::anyhow!(ERR_NO_SESSION))
    }

    fn session_handle(&self, pid: i32) -> Result<Arc<dyn Session>> {
        self.state
            .lock()
            .session(pid)
            .map(|s| Arc::clone(&s.session))
            .ok_or_else(|| anyhow::anyhow!("No session for pid {}", pid))
    }

    /// デバイスにアタッチする（名前が曖昧なら最初の候補で1回だけ再試行）
    async fn attach_device(&self, target: &Target) -> std::result::Result<Box<dyn Session>, DeviceError> {
        match self.device.attach(target).await {
            Err(DeviceError::Ambiguous { name, candidates }) => {
                let Some(first) = candidates.first().copied() else {
                    return Err(DeviceError::NotFound(name));
                };
                self.notify(Notice::Warn(format!(
                    "[!] '{}' matches {:?}, attaching to {}",
                    name, candidates, first
                )));
                self.device.attach(&Target::Pid(first)).await
            }
            result => result,
        }
    }

    /// セッションを登録して現在のセッションにする
    fn register(&self, mut session: Box<dyn Session>) -> i32 {
        let pid = session.pid();
        let name = session.name().to_string();

        if let Some(mut events) = session.take_events() {
            let forward = self.events.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if forward.send((pid, event)).is_err() {
                        break;
                    }
                }
            });
        }

        {
            let mut state = self.state.lock();
            if let Some(pos) = state.sessions.iter().position(|s| s.pid == pid) {
                state.sessions.remove(pos);
            }
            state.sessions.push(TraceSession {
                pid,
                name: name.clone(),
                session: Arc::from(session),
                script: None,
                depth: 0,
                pending: None,
                loading: None,
            });
            state.current = Some(pid);
        }

        self.notify(Notice::Info(format!("[+] attached to {}({})", name, pid)));
        self.notify_prompt();
        pid
    }

    /// プロセスにアタッチする
    pub async fn attach(&self, target: &str) -> Result<i32> {
        let session = self.attach_device(&Target::parse(target)).await?;
        Ok(self.register(session))
    }

    /// プロセスを起動してアタッチする
    pub async fn spawn(&self, program: &str, args: &[String]) -> Result<i32> {
        let session = self.device.spawn(program, args).await?;
        Ok(self.register(session))
    }

    /// アタッチを試み、プロセスが見つからなければ起動する
    pub async fn attach_or_run(&self, target: &str, args: &[String]) -> Result<i32> {
        match self.attach_device(&Target::parse(target)).await {
            Ok(session) => Ok(self.register(session)),
            Err(DeviceError::NotFound(_)) => {
                self.notify(Notice::Info(format!("[+] {} is not running, spawning", target)));
                self.spawn(target, args).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// ペイロードをビルドする
    pub async fn compile(&self) -> Result<PathBuf> {
        let _guard = self.build.lock().await;
        self.compile_locked().await
    }

    async fn compile_locked(&self) -> Result<PathBuf> {
        self.notify(Notice::Build(BuildEvent::Started));
        match self.builder.build().await {
            Ok(artifact) => {
                self.state.lock().artifact = Some(artifact.clone());
                self.notify(Notice::Build(BuildEvent::Succeeded {
                    artifact: artifact.clone(),
                }));
                Ok(artifact)
            }
            Err(e) => {
                tracing::error!("{}", e);
                self.notify(Notice::Build(BuildEvent::Failed {
                    message: e.to_string(),
                }));
                Err(e.into())
            }
        }
    }

    /// ビルド済みのペイロードを読み込む（前のペイロードは取り外す）
    ///
    /// エージェントが`loaded`か`error`を返すまで待ちます。
    pub async fn load(&self, pid: Option<i32>) -> Result<()> {
        let pid = self.target_pid(pid)?;
        let (session, old, artifact) = {
            let mut state = self.state.lock();
            let artifact = state
                .artifact
                .clone()
                .ok_or_else(|| anyhow::anyhow!(ERR_NO_ARTIFACT))?;
            let ts = state
                .session_mut(pid)
                .ok_or_else(|| anyhow::anyhow!("No session for pid {}", pid))?;
            (Arc::clone(&ts.session), ts.script.take(), artifact)
        };

        if let Some(old) = old {
            old.unload().await?;
        }

        let (tx, rx) = oneshot::channel();
        match self.state.lock().session_mut(pid) {
            Some(ts) => ts.loading = Some(tx),
            None => anyhow::bail!("Session {} detached while loading", pid),
        }
        let script: Arc<dyn Script> = match session.load_script(&artifact).await {
            Ok(script) => Arc::from(script),
            Err(e) => {
                self.take_loading(pid);
                return Err(e);
            }
        };

        match tokio::time::timeout(self.config.load_timeout, rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(message))) => {
                anyhow::bail!("Failed to load payload into {}: {}", pid, message)
            }
            Ok(Err(_)) => anyhow::bail!("Session {} detached while loading", pid),
            Err(_) => {
                self.take_loading(pid);
                anyhow::bail!("Timed out waiting for {} to load the payload", pid)
            }
        }

        if let Some(ts) = self.state.lock().session_mut(pid) {
            ts.script = Some(script);
        }
        Ok(())
    }

    fn take_loading(&self, pid: i32) -> Option<oneshot::Sender<std::result::Result<(), String>>> {
        self.state.lock().session_mut(pid)?.loading.take()
    }

    /// 起動時ゲートを開けて実行を再開させる
    pub async fn resume(&self, pid: Option<i32>) -> Result<()> {
        let pid = self.target_pid(pid)?;
        self.session_handle(pid)?
            .post(ControllerMessage::Resume)
            .await
    }

    /// アタッチ（または起動）→ ビルド → 読み込み → 再開
    pub async fn inject(&self, target: &str, args: &[String]) -> Result<i32> {
        let pid = self.attach_or_run(target, args).await?;
        self.compile().await?;
        self.load(Some(pid)).await?;
        self.resume(Some(pid)).await?;
        Ok(pid)
    }

    /// すべてのセッションでペイロードをビルドし直して読み込み直す
    ///
    /// スコープで停止中のセッションがあれば何もせずfalseを返します。
    pub async fn reload(&self) -> Result<bool> {
        let _guard = self.build.lock().await;

        let suspended: Vec<String> = self
            .state
            .lock()
            .sessions
            .iter()
            .filter(|s| s.depth > 0)
            .map(|s| format!("{}({})", s.name, s.pid))
            .collect();
        if !suspended.is_empty() {
            tracing::warn!("Reload refused: {} in scope", suspended.join(", "));
            self.notify(Notice::Warn(format!(
                "[!] reload refused: {} suspended in scope",
                suspended.join(", ")
            )));
            return Ok(false);
        }

        self.compile_locked().await?;
        let pids: Vec<i32> = self.state.lock().sessions.iter().map(|s| s.pid).collect();
        for pid in pids {
            if let Err(e) = self.load(Some(pid)).await {
                self.notify(Notice::Warn(format!("[!] reload failed for {}: {:#}", pid, e)));
            }
        }
        self.notify(Notice::Info("[+] reloaded".to_string()));
        Ok(true)
    }

    /// ソースの変更を監視してリロードする
    pub fn watch(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let mut watcher = SourceWatcher::new(self.builder.source_roots());

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let changed = watcher.poll();
                if changed.is_empty() {
                    continue;
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };

                tokio::time::sleep(WATCH_SETTLE).await;
                watcher.poll();
                manager.notify(Notice::Info(format!(
                    "[+] {} file(s) changed",
                    changed.len()
                )));

                if manager.build.try_lock().is_err() {
                    tracing::debug!("Build in progress, skipping reload");
                    continue;
                }
                if let Err(e) = manager.reload().await {
                    tracing::debug!("Reload failed: {:#}", e);
                }
            }
        })
    }

    /// 式を評価する
    ///
    /// セッションがなければこのプロセス内で評価します。スコープ中なら停止中の
    /// スレッドで、そうでなければエージェントのスレッドで評価します。
    /// `c`・`ni`は結果を待たずにNoneを返します。
    pub async fn evaluate(&self, code: &str) -> std::result::Result<Option<String>, EvalError> {
        let code = code.trim().to_string();

        let (pid, session, message, reply) = {
            let mut state = self.state.lock();
            let Some(pid) = state.current else {
                drop(state);
                return Ok(Some(self.local.evaluate_to_string(&code, None)));
            };
            state.next_exec_id += 1;
            let exec_id = state.next_exec_id;
            let ts = state.session_mut(pid).ok_or(EvalError::NoSession)?;
            let session = Arc::clone(&ts.session);

            if ts.depth > 0 && (code == "c" || code == "ni") {
                (pid, session, ControllerMessage::Scope { code }, None)
            } else {
                if ts.pending.is_some() {
                    return Err(EvalError::Busy);
                }
                let (tx, rx) = oneshot::channel();
                let (kind, message) = if ts.depth > 0 {
                    (PendingKind::Scope, ControllerMessage::Scope { code })
                } else {
                    (
                        PendingKind::Exec(exec_id),
                        ControllerMessage::Exec { id: exec_id, code },
                    )
                };
                ts.pending = Some(PendingEval { kind, reply: tx });
                (pid, session, message, Some(rx))
            }
        };

        if let Err(e) = session.post(message).await {
            if let Some(ts) = self.state.lock().session_mut(pid) {
                ts.pending = None;
            }
            return Err(EvalError::Remote(e.to_string()));
        }

        match reply {
            None => Ok(None),
            Some(rx) => match rx.await {
                Ok(result) => result.map(Some),
                Err(_) => Err(EvalError::Detached),
            },
        }
    }

    /// セッションを外し、返事待ちの評価を`Detached`で終わらせる
    fn remove_session(&self, pid: i32) -> Option<TraceSession> {
        let removed = {
            let mut state = self.state.lock();
            let pos = state.sessions.iter().position(|s| s.pid == pid)?;
            let mut ts = state.sessions.remove(pos);
            if let Some(pending) = ts.pending.take() {
                let _ = pending.reply.send(Err(EvalError::Detached));
            }
            if state.current == Some(pid) {
                state.current = state.sessions.first().map(|s| s.pid);
            }
            ts
        };
        self.notify_prompt();
        Some(removed)
    }

    /// セッションから切断する
    pub async fn detach(&self, pid: Option<i32>) -> Result<()> {
        let pid = self.target_pid(pid)?;
        let ts = self
            .remove_session(pid)
            .ok_or_else(|| anyhow::anyhow!("No session for pid {}", pid))?;

        if let Some(script) = &ts.script {
            if let Err(e) = script.unload().await {
                tracing::debug!("Unload before detach failed: {}", e);
            }
        }
        ts.session.detach().await?;
        self.notify(Notice::Info(format!("[+] detached from {}({})", ts.name, pid)));
        Ok(())
    }

    /// プロセスを終了させる
    pub async fn kill(&self, pid: Option<i32>) -> Result<()> {
        let pid = self.target_pid(pid)?;
        self.device.kill(pid).await?;
        if let Some(ts) = self.remove_session(pid) {
            self.notify(Notice::Info(format!("[+] killed {}({})", ts.name, pid)));
        }
        Ok(())
    }

    pub async fn detach_all(&self) {
        let pids: Vec<i32> = self.state.lock().sessions.iter().map(|s| s.pid).collect();
        for pid in pids {
            if let Err(e) = self.detach(Some(pid)).await {
                tracing::warn!("Failed to detach {}: {:#}", pid, e);
            }
        }
    }

    pub async fn kill_all(&self) {
        let pids: Vec<i32> = self.state.lock().sessions.iter().map(|s| s.pid).collect();
        for pid in pids {
            if let Err(e) = self.kill(Some(pid)).await {
                tracing::warn!("Failed to kill {}: {:#}", pid, e);
            }
        }
    }

    /// 子プロセスにアタッチしてペイロードを読み込む
    async fn adopt_child(&self, parent: i32, child: i32) {
        self.notify(Notice::Info(format!("[+] child {} spawned by {}", child, parent)));
        let result = async {
            let session = self.device.attach(&Target::Pid(child)).await?;
            self.register(session);
            if self.state.lock().artifact.is_some() {
                self.load(Some(child)).await?;
            }
            self.resume(Some(child)).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            self.notify(Notice::Warn(format!("[!] failed to adopt child {}: {:#}", child, e)));
        }
    }

    /// セッションからの通知を処理する
    pub fn handle_event(self: &Arc<Self>, pid: i32, event: SessionEvent) {
        match event {
            SessionEvent::Message(message) => self.handle_message(pid, message),
            SessionEvent::Child { pid: child } => {
                if self.config.child_gating {
                    let manager = Arc::clone(self);
                    tokio::spawn(async move { manager.adopt_child(pid, child).await });
                }
            }
            SessionEvent::Detached(reason) => {
                let Some(ts) = self.remove_session(pid) else {
                    return;
                };
                match &reason {
                    DetachReason::ProcessTerminated(Some(status)) if status.starts_with("killed") => {
                        self.notify(Notice::Warn(format!(
                            "[!] {}({}) crashed: {}",
                            ts.name, pid, status
                        )));
                    }
                    reason => self.notify(Notice::Warn(format!(
                        "[!] {}({}) detached: {}",
                        ts.name, pid, reason
                    ))),
                }
            }
        }
    }

    fn handle_message(&self, pid: i32, message: TargetMessage) {
        match message {
            TargetMessage::Scope(ScopeReport::Enter) => {
                if let Some(ts) = self.state.lock().session_mut(pid) {
                    ts.depth += 1;
                }
                self.notify_prompt();
            }
            TargetMessage::Scope(ScopeReport::Quit) => {
                if let Some(ts) = self.state.lock().session_mut(pid) {
                    ts.depth = ts.depth.saturating_sub(1);
                }
                self.notify_prompt();
            }
            TargetMessage::Scope(ScopeReport::Result { result }) => {
                match self.take_pending(pid, |kind| kind == PendingKind::Scope) {
                    Some(reply) => {
                        let _ = reply.send(Ok(result));
                    }
                    None => self.notify(Notice::Info(result)),
                }
            }
            TargetMessage::Exec { id, result, error } => {
                let Some(reply) = self.take_pending(pid, |kind| kind == PendingKind::Exec(id)) else {
                    tracing::debug!("Unexpected exec reply {} from {}", id, pid);
                    return;
                };
                let outcome = match (result, error) {
                    (Some(result), _) => Ok(result),
                    (None, error) => Err(EvalError::Remote(error.unwrap_or_default())),
                };
                let _ = reply.send(outcome);
            }
            TargetMessage::Log { level, text } => self.notify(Notice::Log { pid, level, text }),
            TargetMessage::Loaded => {
                if let Some(reply) = self.take_loading(pid) {
                    let _ = reply.send(Ok(()));
                }
                self.notify(Notice::Info(format!("[+] payload loaded in {}", pid)));
            }
            TargetMessage::Error { message } => {
                if let Some(reply) = self.take_loading(pid) {
                    let _ = reply.send(Err(message));
                    return;
                }
                match self.take_pending(pid, |kind| kind == PendingKind::Scope) {
                    Some(reply) => {
                        let _ = reply.send(Err(EvalError::Remote(message)));
                    }
                    None => self.notify(Notice::Warn(format!("[!] {}: {}", pid, message))),
                }
            }
        }
    }

    fn take_pending(
        &self,
        pid: i32,
        matches: impl Fn(PendingKind) -> bool,
    ) -> Option<oneshot::Sender<std::result::Result<String, EvalError>>> {
        let mut state = self.state.lock();
        let ts = state.session_mut(pid)?;
        if !ts.pending.as_ref().is_some_and(|p| matches(p.kind)) {
            return None;
        }
        ts.pending.take().map(|p| p.reply)
    }
}

/// 全セッションの通知を順に処理する
async fn event_loop(manager: Weak<SessionManager>, mut events: mpsc::UnboundedReceiver<(i32, SessionEvent)>) {
    while let Some((pid, event)) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_event(pid, event);
    }
}

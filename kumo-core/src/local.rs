//! ローカルデバイス
//!
//! 同じマシン上のプロセスを扱います。起動するプロセスには`LD_PRELOAD`で
//! エージェントを読み込ませ、エージェントのUnixソケットに接続します。

use crate::config::Config;
use crate::device::{DetachReason, Device, Script, Session, SessionEvent, Target};
use crate::errors::DeviceError;
use crate::Result;
use async_trait::async_trait;
use kumo_agent::message::{decode_line, encode_line};
use kumo_agent::{socket_path, ControllerMessage, TargetMessage};
use kumo_target::process;
use kumo_target::Process;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// 接続の再試行間隔
const CONNECT_RETRY: Duration = Duration::from_millis(50);
/// 子プロセスの検出間隔
const CHILD_POLL: Duration = Duration::from_millis(200);

/// ローカルデバイス
pub struct LocalDevice {
    config: Config,
    next_script: Arc<AtomicU64>,
}

impl LocalDevice {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            next_script: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 名前・PIDから1つのPIDを決める
    fn resolve_pid(&self, target: &Target) -> std::result::Result<i32, DeviceError> {
        match target {
            Target::Pid(pid) => {
                if process::exists(*pid) {
                    Ok(*pid)
                } else {
                    Err(DeviceError::NotFound(pid.to_string()))
                }
            }
            Target::Name(name) => {
                let pids = process::find_by_name(name)?;
                match pids.as_slice() {
                    [] => Err(DeviceError::NotFound(name.clone())),
                    [pid] => Ok(*pid),
                    _ => Err(DeviceError::Ambiguous {
                        name: name.clone(),
                        candidates: pids,
                    }),
                }
            }
        }
    }

    /// エージェントのソケットに接続する（起動直後はソケットができるまで待つ）
    async fn connect(&self, pid: i32) -> std::result::Result<LocalSession, DeviceError> {
        let path = socket_path(&self.config.socket_dir, pid as u32);
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;

        let stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline || !process::exists(pid) {
                        return Err(DeviceError::AgentUnavailable {
                            pid,
                            reason: format!("{:?}: {}", path, e),
                        });
                    }
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        };

        tracing::debug!("Connected to agent at {:?}", path);
        Ok(LocalSession::start(
            pid,
            stream,
            self.config.socket_dir.clone(),
            self.config.child_gating,
            Arc::clone(&self.next_script),
        ))
    }

    fn spawn_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "LD_PRELOAD".to_string(),
                self.config.agent_library.display().to_string(),
            ),
            (
                "KUMO_SOCKET_DIR".to_string(),
                self.config.socket_dir.display().to_string(),
            ),
            ("KUMO_SPAWN_GATE".to_string(), "1".to_string()),
        ];
        if self.config.child_gating {
            env.push(("KUMO_CHILD_GATING".to_string(), "1".to_string()));
        }
        env
    }
}

#[async_trait]
impl Device for LocalDevice {
    fn name(&self) -> &str {
        &self.config.device
    }

    async fn attach(&self, target: &Target) -> std::result::Result<Box<dyn Session>, DeviceError> {
        let pid = self.resolve_pid(target)?;
        let session = self.connect(pid).await?;
        Ok(Box::new(session))
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> std::result::Result<Box<dyn Session>, DeviceError> {
        let program = self.config.resolve(Path::new(program));
        let args = args.to_vec();
        let env = self.spawn_env();

        let pid = tokio::task::spawn_blocking(move || -> Result<i32> {
            let process = Process::spawn_with_env(&program, &args, &env)?;
            process.release()
        })
        .await
        .map_err(anyhow::Error::from)??;
        tracing::info!("[+] spawned process {}", pid);

        let session = self.connect(pid).await?;
        Ok(Box::new(session))
    }

    async fn kill(&self, pid: i32) -> std::result::Result<(), DeviceError> {
        process::kill(pid)?;
        Ok(())
    }
}

/// 送信側
struct Connection {
    writer: Mutex<OwnedWriteHalf>,
}

impl Connection {
    async fn send(&self, message: &ControllerMessage) -> Result<()> {
        let line = encode_line(message)?;
        self.writer.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// エージェントとの接続
pub struct LocalSession {
    pid: i32,
    name: String,
    conn: Arc<Connection>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    detaching: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    script_dir: PathBuf,
    next_script: Arc<AtomicU64>,
}

impl LocalSession {
    fn start(
        pid: i32,
        stream: UnixStream,
        script_dir: PathBuf,
        child_gating: bool,
        next_script: Arc<AtomicU64>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let detaching = Arc::new(AtomicBool::new(false));

        let mut tasks = vec![tokio::spawn(read_messages(
            pid,
            reader,
            tx.clone(),
            Arc::clone(&detaching),
        ))];
        if child_gating {
            tasks.push(tokio::spawn(watch_children(pid, tx)));
        }

        Self {
            pid,
            name: process::process_name(pid).unwrap_or_else(|| pid.to_string()),
            conn: Arc::new(Connection {
                writer: Mutex::new(writer),
            }),
            events: Some(rx),
            detaching,
            tasks,
            script_dir,
            next_script,
        }
    }
}

/// エージェントからのメッセージを通知に変換する
async fn read_messages(
    pid: i32,
    reader: tokio::net::unix::OwnedReadHalf,
    tx: mpsc::UnboundedSender<SessionEvent>,
    detaching: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<TargetMessage>(&line) {
                Ok(message) => {
                    let _ = tx.send(SessionEvent::Message(message));
                }
                Err(e) => tracing::warn!("Bad message from {}: {}", pid, e),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", pid, e);
                break;
            }
        }
    }

    // 終了直後は/procに残っていることがある
    tokio::time::sleep(CONNECT_RETRY).await;
    let reason = if detaching.load(Ordering::SeqCst) {
        DetachReason::ApplicationRequested
    } else if let Some(status) = process::try_wait(pid) {
        DetachReason::ProcessTerminated(Some(status.to_string()))
    } else if !process::exists(pid) {
        DetachReason::ProcessTerminated(None)
    } else {
        DetachReason::ConnectionLost
    };
    let _ = tx.send(SessionEvent::Detached(reason));
}

/// 新しい子プロセスを通知する
async fn watch_children(pid: i32, tx: mpsc::UnboundedSender<SessionEvent>) {
    let mut seen = HashSet::new();
    let mut interval = tokio::time::interval(CHILD_POLL);
    loop {
        interval.tick().await;
        let Ok(children) = process::children_of(pid) else {
            continue;
        };
        for child in children {
            if seen.insert(child) && tx.send(SessionEvent::Child { pid: child }).is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Session for LocalSession {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, message: ControllerMessage) -> Result<()> {
        self.conn.send(&message).await
    }

    /// 成果物を毎回別名でコピーしてから読み込ませる
    ///
    /// 同じパスを`dlopen`し直すと古いイメージが返ることがあるためです。
    async fn load_script(&self, artifact: &Path) -> Result<Box<dyn Script>> {
        let n = self.next_script.fetch_add(1, Ordering::SeqCst);
        let path = self
            .script_dir
            .join(format!("kumo-payload-{}-{}.so", self.pid, n));
        tokio::fs::copy(artifact, &path).await.map_err(|e| {
            anyhow::anyhow!("Failed to stage {:?} as {:?}: {}", artifact, path, e)
        })?;

        self.conn
            .send(&ControllerMessage::Load {
                path: path.display().to_string(),
            })
            .await?;
        Ok(Box::new(LocalScript {
            path,
            conn: Arc::clone(&self.conn),
        }))
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    async fn detach(&self) -> Result<()> {
        self.detaching.store(true, Ordering::SeqCst);
        for task in self.tasks.iter().skip(1) {
            task.abort();
        }
        self.conn.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// 読み込み済みのペイロード
struct LocalScript {
    path: PathBuf,
    conn: Arc<Connection>,
}

#[async_trait]
impl Script for LocalScript {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn unload(&self) -> Result<()> {
        self.conn.send(&ControllerMessage::Unload).await?;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!("Failed to remove {:?}: {}", self.path, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kumo_agent::ScopeReport;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn config(dir: &Path) -> Config {
        Config {
            socket_dir: dir.to_path_buf(),
            connect_timeout: Duration::from_millis(500),
            ..Config::default()
        }
    }

    #[test]
    fn test_resolve_unknown_name() {
        let device = LocalDevice::new(Config::default());
        let err = device
            .resolve_pid(&Target::Name("kumo-no-such-process".to_string()))
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }

    #[test]
    fn test_spawn_env_contains_agent() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(Config {
            child_gating: true,
            ..config(dir.path())
        });
        let env = device.spawn_env();
        assert!(env.iter().any(|(k, _)| k == "LD_PRELOAD"));
        assert!(env.contains(&("KUMO_SPAWN_GATE".to_string(), "1".to_string())));
        assert!(env.contains(&("KUMO_CHILD_GATING".to_string(), "1".to_string())));
    }

    #[tokio::test]
    async fn test_attach_without_agent_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(config(dir.path()));
        let own = Target::Pid(std::process::id() as i32);
        match device.attach(&own).await {
            Err(DeviceError::AgentUnavailable { pid, .. }) => {
                assert_eq!(pid, std::process::id() as i32)
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("attach should fail"),
        }
    }

    #[tokio::test]
    async fn test_session_over_fake_agent() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id() as i32;
        let listener = UnixListener::bind(socket_path(dir.path(), pid as u32)).unwrap();
        let agent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let line = encode_line(&TargetMessage::Scope(ScopeReport::Enter)).unwrap();
            stream.write_all(line.as_bytes()).await.unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).await.unwrap();
            received
        });

        let device = LocalDevice::new(config(dir.path()));
        let mut session = device.attach(&Target::Pid(pid)).await.unwrap();
        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Message(TargetMessage::Scope(ScopeReport::Enter)))
        );

        session
            .post(ControllerMessage::Scope {
                code: "1+1".to_string(),
            })
            .await
            .unwrap();
        session.detach().await.unwrap();

        assert_eq!(
            agent.await.unwrap(),
            "{\"type\":\"scope\",\"code\":\"1+1\"}\n"
        );
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Detached(DetachReason::ApplicationRequested))
        );
    }
}

//! エージェントランタイム
//!
//! ターゲットプロセス内でUnixソケットを待ち受け、コントローラからの
//! メッセージを処理します。ペイロード（cdylib）の読み込みもここで行います。

use crate::backend::{Backtracer, FramePointerBacktracer, Interceptor, Stalker};
use crate::channel::SuspendChannel;
use crate::console::{Console, MessageSink};
use crate::eval::{error_trace, ExpressionEvaluator};
use crate::interceptor::CallTracer;
use crate::message::{decode_line, encode_line, ControllerMessage, TargetMessage};
use crate::scope::{Scope, ScopeConfig};
use crate::stalker::{InstructionTracer, ScopeObserver, TracerConfig};
use crate::syscall::Arch;
use crate::fault;
use crate::Result;
use kumo_dwarf::{AddressNamer, DecodeConfig, SharedMemory, ValueDecoder};
use kumo_target::{Mappings, Memory, ProcessSymbols};
use nix::libc;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// ペイロードの初期化関数名
pub const PAYLOAD_MAIN: &str = "kumo_payload_main";
/// ペイロードの終了関数名（任意）
pub const PAYLOAD_UNLOAD: &str = "kumo_payload_unload";

type PayloadMain = unsafe extern "C" fn(*const Agent) -> i32;
type PayloadUnload = unsafe extern "C" fn(*const Agent);

/// 接続前に溜めておくメッセージ数の上限
const BACKLOG_LIMIT: usize = 1024;

/// エージェントのソケットパス
pub fn socket_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("kumo-{}.sock", pid))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// エージェント設定
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// ソケットを置くディレクトリ
    pub socket_dir: PathBuf,
    pub decode: DecodeConfig,
    pub scope: ScopeConfig,
    pub tracer: TracerConfig,
    /// 起動直後にコントローラの`resume`を待つ
    pub spawn_gate: bool,
    /// 子プロセスにもエージェントを引き継ぐ
    pub child_gating: bool,
    pub gate_timeout: Duration,
    /// SIGSEGVなどで落ちる前にレジスタを報告する
    pub report_faults: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            decode: DecodeConfig::default(),
            scope: ScopeConfig::default(),
            tracer: TracerConfig::default(),
            spawn_gate: false,
            child_gating: false,
            gate_timeout: Duration::from_secs(30),
            report_faults: false,
        }
    }
}

impl AgentConfig {
    /// `KUMO_*`環境変数から設定を作る
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = std::env::var_os("KUMO_SOCKET_DIR") {
            config.socket_dir = PathBuf::from(dir);
        }
        config.scope.resume_timeout = std::env::var("KUMO_SCOPE_TIMEOUT_MS")
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(Duration::from_millis);
        config.tracer.trace_syscalls = env_flag("KUMO_TRACE_SYSCALLS");
        config.spawn_gate = env_flag("KUMO_SPAWN_GATE");
        config.child_gating = env_flag("KUMO_CHILD_GATING");
        config.report_faults = env_flag("KUMO_REPORT_FAULTS");

        config
    }
}

/// 起動時ゲート
///
/// コントローラがフックを仕掛け終わるまで、ターゲットの本処理を止めておきます。
#[derive(Default)]
pub struct ResumeGate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl ResumeGate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// ゲートが開くまで待つ。開いたらtrue、タイムアウトならfalse
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if *open {
            return true;
        }
        let result = self.opened.wait_while_for(&mut open, |open| !*open, timeout);
        !result.timed_out() || *open
    }
}

/// ソケットへのメッセージ送信
///
/// 未接続の間は`BACKLOG_LIMIT`件まで溜め、接続時にまとめて送ります。
#[derive(Default)]
pub struct SocketSink {
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    stream: Option<UnixStream>,
    backlog: VecDeque<String>,
}

impl SocketSink {
    /// 接続を登録し、溜まったメッセージを送る
    pub fn connect(&self, mut stream: UnixStream) {
        let mut state = self.state.lock();
        while let Some(line) = state.backlog.pop_front() {
            if let Err(e) = stream.write_all(line.as_bytes()) {
                tracing::warn!("Failed to flush backlog: {}", e);
                return;
            }
        }
        state.stream = Some(stream);
    }

    pub fn disconnect(&self) {
        self.state.lock().stream = None;
    }
}

impl MessageSink for SocketSink {
    fn post(&self, message: TargetMessage) {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode message: {}", e);
                return;
            }
        };

        self.state.lock().deliver(line);
    }

    fn try_post(&self, message: TargetMessage) -> bool {
        let Ok(line) = encode_line(&message) else {
            return false;
        };
        match self.state.try_lock() {
            Some(mut state) => {
                state.deliver(line);
                true
            }
            None => false,
        }
    }
}

impl SinkState {
    fn deliver(&mut self, line: String) {
        if let Some(stream) = self.stream.as_mut() {
            if stream.write_all(line.as_bytes()).is_ok() {
                return;
            }
            tracing::debug!("Controller connection lost");
            self.stream = None;
        }
        if self.backlog.len() >= BACKLOG_LIMIT {
            self.backlog.pop_front();
        }
        self.backlog.push_back(line);
    }
}

/// 読み込み済みのペイロード
struct Payload {
    handle: *mut libc::c_void,
    path: String,
}

// dlopenのハンドルはスレッドをまたいで使える
unsafe impl Send for Payload {}

fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

fn dl_symbol(handle: *mut libc::c_void, name: &str) -> Option<*mut libc::c_void> {
    let name = CString::new(name).ok()?;
    let sym = unsafe { libc::dlsym(handle, name.as_ptr()) };
    (!sym.is_null()).then_some(sym)
}

/// ターゲット内エージェント
///
/// ペイロードには`*const Agent`が渡され、ここから名前解決・デコード・
/// トレーサーの構築に必要なものを取り出します。
pub struct Agent {
    config: AgentConfig,
    namer: Arc<AddressNamer>,
    memory: SharedMemory,
    decoder: ValueDecoder,
    console: Console,
    evaluator: ExpressionEvaluator,
    scope: Arc<Scope>,
    symbols: Arc<ProcessSymbols>,
    mappings: Arc<Mappings>,
    /// プロセス内で共有する呼び出しID
    call_ids: Arc<AtomicU64>,
    gate: ResumeGate,
    payload: Mutex<Option<Payload>>,
}

impl Agent {
    pub fn new(config: AgentConfig, sink: Arc<dyn MessageSink>) -> Self {
        let memory: SharedMemory = Arc::new(Memory::current());
        let symbols = Arc::new(ProcessSymbols::current());
        let mappings = Arc::new(Mappings::current());
        let namer = Arc::new(
            AddressNamer::new()
                .with_symbols(symbols.clone())
                .with_ranges(mappings.clone()),
        );
        let decoder = ValueDecoder::new(memory.clone(), config.decode.clone());
        let console = Console::new(sink);
        let backtracer: Arc<dyn Backtracer> =
            Arc::new(FramePointerBacktracer::new(Memory::current()));
        let evaluator = ExpressionEvaluator::new(memory.clone(), namer.clone(), decoder.clone())
            .with_backtracer(backtracer);
        let scope = Arc::new(Scope::new(
            Arc::new(SuspendChannel::new()),
            console.clone(),
            evaluator.clone(),
            memory.clone(),
            config.scope.clone(),
        ));

        Self {
            config,
            namer,
            memory,
            decoder,
            console,
            evaluator,
            scope,
            symbols,
            mappings,
            call_ids: Arc::new(AtomicU64::new(1)),
            gate: ResumeGate::default(),
            payload: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn namer(&self) -> &Arc<AddressNamer> {
        &self.namer
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn decoder(&self) -> &ValueDecoder {
        &self.decoder
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// 致命的なシグナルの報告を有効にする（既に有効ならfalse）
    pub fn install_fault_reporter(&self) -> Result<bool> {
        fault::install(self.console.clone(), self.namer.clone(), Arch::current())
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn symbols(&self) -> &Arc<ProcessSymbols> {
        &self.symbols
    }

    pub fn mappings(&self) -> &Arc<Mappings> {
        &self.mappings
    }

    pub fn gate(&self) -> &ResumeGate {
        &self.gate
    }

    /// 関数フックのバックエンドから関数トレーサーを作る
    pub fn call_tracer(&self, interceptor: Arc<dyn Interceptor>) -> CallTracer {
        CallTracer::new(
            interceptor,
            self.namer.clone(),
            self.decoder.clone(),
            self.console.clone(),
        )
        .with_call_ids(self.call_ids.clone())
    }

    /// 命令トレーサーを作る
    pub fn instruction_tracer(
        &self,
        interceptor: Arc<dyn Interceptor>,
        stalker: Arc<dyn Stalker>,
    ) -> Arc<InstructionTracer> {
        Arc::new(InstructionTracer::new(
            interceptor,
            stalker,
            self.mappings.clone(),
            self.config.tracer.clone(),
        ))
    }

    /// ブロックごとにスコープで止まるオブザーバー
    pub fn scope_observer(&self) -> Arc<ScopeObserver> {
        Arc::new(ScopeObserver::new(self.scope.clone()))
    }

    /// コントローラからのメッセージを処理する
    pub fn dispatch(&self, message: ControllerMessage) {
        match message {
            ControllerMessage::Scope { code } => {
                if self.scope.suspended() == 0 {
                    self.post_error("not in scope");
                    return;
                }
                if let Err(e) = self.scope.channel().send(code) {
                    self.post_error(e.to_string());
                }
            }
            ControllerMessage::Exec { id, code } => {
                let reply = match self.evaluator.evaluate(&code, None) {
                    Ok(value) => TargetMessage::Exec {
                        id,
                        result: Some(value.to_string()),
                        error: None,
                    },
                    Err(e) => TargetMessage::Exec {
                        id,
                        result: None,
                        error: Some(error_trace(&e, &code)),
                    },
                };
                self.console.post(reply);
            }
            ControllerMessage::Load { path } => match self.load_payload(&path) {
                Ok(()) => self.console.post(TargetMessage::Loaded),
                Err(e) => self.post_error(format!("{:#}", e)),
            },
            ControllerMessage::Unload => self.unload_payload(),
            ControllerMessage::Resume => {
                tracing::debug!("Resume requested");
                self.gate.open();
            }
        }
    }

    fn post_error(&self, message: impl Into<String>) {
        self.console.post(TargetMessage::Error {
            message: message.into(),
        });
    }

    /// ペイロードを読み込んで初期化関数を呼ぶ
    ///
    /// 読み込み済みのペイロードがあれば先に取り外します。
    pub fn load_payload(&self, path: &str) -> Result<()> {
        let mut slot = self.payload.lock();
        if let Some(old) = slot.take() {
            self.release_payload(old);
        }

        let c_path = CString::new(path)?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            anyhow::bail!("dlopen({}) failed: {}", path, dl_error());
        }

        let Some(entry) = dl_symbol(handle, PAYLOAD_MAIN) else {
            unsafe { libc::dlclose(handle) };
            anyhow::bail!("{} not found in {}", PAYLOAD_MAIN, path);
        };

        let entry: PayloadMain = unsafe { std::mem::transmute(entry) };
        let status = unsafe { entry(self as *const Agent) };
        if status != 0 {
            unsafe { libc::dlclose(handle) };
            anyhow::bail!("{} returned {}", PAYLOAD_MAIN, status);
        }

        tracing::info!("[+] payload loaded: {}", path);
        *slot = Some(Payload {
            handle,
            path: path.to_string(),
        });
        Ok(())
    }

    /// ペイロードを取り外す
    pub fn unload_payload(&self) {
        if let Some(payload) = self.payload.lock().take() {
            self.release_payload(payload);
        }
    }

    fn release_payload(&self, payload: Payload) {
        if let Some(unload) = dl_symbol(payload.handle, PAYLOAD_UNLOAD) {
            let unload: PayloadUnload = unsafe { std::mem::transmute(unload) };
            unsafe { unload(self as *const Agent) };
        }
        unsafe { libc::dlclose(payload.handle) };
        tracing::info!("[+] payload unloaded: {}", payload.path);
    }
}

/// ペイロードの入口を包む
///
/// エラーとパニックはコンソールに出力し、0以外の終了コードにします。
pub fn run_payload_entry<F>(agent: *const Agent, f: F) -> i32
where
    F: FnOnce(&Agent) -> Result<()>,
{
    if agent.is_null() {
        return 1;
    }
    let agent = unsafe { &*agent };

    match panic::catch_unwind(AssertUnwindSafe(|| f(agent))) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            agent.console().error(format!("[!] payload failed: {:#}", e));
            2
        }
        Err(_) => {
            agent.console().error("[!] payload panicked");
            3
        }
    }
}

/// 起動中のエージェント
pub struct RunningAgent {
    pub agent: Arc<Agent>,
    pub socket: PathBuf,
}

/// ソケットを開いてエージェントを起動する
///
/// 起動時ゲートが有効なら、`resume`を受け取るかタイムアウトするまで戻りません。
pub fn start(config: AgentConfig) -> Result<RunningAgent> {
    if !config.child_gating {
        std::env::remove_var("KUMO_SPAWN_GATE");
        std::env::remove_var("LD_PRELOAD");
    }

    std::fs::create_dir_all(&config.socket_dir)?;
    let socket = socket_path(&config.socket_dir, std::process::id());
    if socket.exists() {
        std::fs::remove_file(&socket)?;
    }
    let listener = UnixListener::bind(&socket)
        .map_err(|e| anyhow::anyhow!("Failed to bind {:?}: {}", socket, e))?;

    let sink = Arc::new(SocketSink::default());
    let agent = Arc::new(Agent::new(config, sink.clone()));

    {
        let agent = Arc::clone(&agent);
        thread::Builder::new()
            .name("kumo-agent".to_string())
            .spawn(move || serve(agent, listener, sink))?;
    }
    tracing::info!("[+] agent listening on {:?}", socket);

    if agent.config.report_faults {
        if let Err(e) = agent.install_fault_reporter() {
            tracing::warn!("[!] {}", e);
        }
    }

    if agent.config.spawn_gate {
        let timeout = agent.config.gate_timeout;
        if !agent.gate.wait(timeout) {
            tracing::warn!("[!] no resume within {:?}, continuing", timeout);
        }
    }

    Ok(RunningAgent { agent, socket })
}

/// 環境変数の設定でエージェントを起動する
pub fn start_from_env() -> Result<RunningAgent> {
    start(AgentConfig::from_env())
}

/// コントローラの接続を1つずつ処理する
fn serve(agent: Arc<Agent>, listener: UnixListener, sink: Arc<SocketSink>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                continue;
            }
        };
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!("Failed to clone connection: {}", e);
                continue;
            }
        };

        tracing::debug!("Controller connected");
        agent.scope.channel().reopen();
        sink.connect(writer);

        for line in BufReader::new(stream).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::debug!("Read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_line::<ControllerMessage>(&line) {
                Ok(message) => agent.dispatch(message),
                Err(e) => agent.post_error(format!("bad message: {}", e)),
            }
        }

        tracing::debug!("Controller disconnected");
        sink.disconnect();
        // 停止中のスレッドを解放する
        agent.scope.channel().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferSink;
    use crate::scope::Resume;
    use crate::context::CpuContext;

    fn agent() -> (Arc<Agent>, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        (Arc::new(Agent::new(AgentConfig::default(), sink.clone())), sink)
    }

    #[test]
    fn test_exec_replies_with_result() {
        let (agent, sink) = agent();
        agent.dispatch(ControllerMessage::Exec {
            id: 3,
            code: "1+1".to_string(),
        });
        agent.dispatch(ControllerMessage::Exec {
            id: 4,
            code: "oops".to_string(),
        });

        let messages = sink.take();
        assert_eq!(
            messages[0],
            TargetMessage::Exec {
                id: 3,
                result: Some("2".to_string()),
                error: None
            }
        );
        match &messages[1] {
            TargetMessage::Exec {
                id: 4,
                result: None,
                error: Some(error),
            } => assert!(error.starts_with("ReferenceError: oops")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scope_code_outside_scope_is_rejected() {
        let (agent, sink) = agent();
        agent.dispatch(ControllerMessage::Scope {
            code: "1".to_string(),
        });
        assert_eq!(
            sink.take(),
            vec![TargetMessage::Error {
                message: "not in scope".to_string()
            }]
        );
    }

    #[test]
    fn test_scope_code_reaches_suspended_thread() {
        let (agent, _sink) = agent();
        let worker = {
            let scope = Arc::clone(agent.scope());
            thread::spawn(move || scope.suspend(&CpuContext::default()))
        };
        while agent.scope().suspended() == 0 {
            thread::yield_now();
        }
        agent.dispatch(ControllerMessage::Scope {
            code: "ni".to_string(),
        });
        assert_eq!(worker.join().unwrap(), Resume::Step);
    }

    #[test]
    fn test_call_tracers_share_call_ids() {
        use crate::backend::mock::{MockInterceptor, MockInvocation};
        use crate::interceptor::{FunctionTarget, NoHooks, ReturnSpec};

        let (agent, sink) = agent();
        let interceptor = Arc::new(MockInterceptor::default());
        for (addr, name) in [(0x5000, "first"), (0x6000, "second")] {
            agent
                .call_tracer(interceptor.clone())
                .trace_function(
                    &FunctionTarget::Address(addr),
                    name,
                    ReturnSpec::from_descriptors(&["p"]),
                    Vec::new(),
                    Arc::new(NoHooks),
                )
                .unwrap();
        }

        interceptor.invoke(0x5000, &mut MockInvocation::new(1, 0, &[]), 0);
        interceptor.invoke(0x6000, &mut MockInvocation::new(1, 0, &[]), 0);

        let logs = sink.log_texts();
        assert!(logs[0].starts_with("[1](1): first("));
        assert!(logs[2].starts_with("[1](2): second("));
    }

    #[test]
    fn test_resume_opens_gate() {
        let (agent, _sink) = agent();
        assert!(!agent.gate().wait(Duration::from_millis(1)));
        agent.dispatch(ControllerMessage::Resume);
        assert!(agent.gate().is_open());
        assert!(agent.gate().wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_load_missing_payload_reports_error() {
        let (agent, sink) = agent();
        agent.dispatch(ControllerMessage::Load {
            path: "/nonexistent/libpayload.so".to_string(),
        });
        match sink.take().as_slice() {
            [TargetMessage::Error { message }] => assert!(message.contains("dlopen")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_payload_entry_contains_errors() {
        let (agent, sink) = agent();
        let ptr = Arc::as_ptr(&agent);

        assert_eq!(run_payload_entry(ptr, |_| Ok(())), 0);
        assert_eq!(
            run_payload_entry(ptr, |_| Err(anyhow::anyhow!("bad hook"))),
            2
        );
        assert_eq!(run_payload_entry(ptr, |_| panic!("boom")), 3);
        assert_eq!(run_payload_entry(std::ptr::null(), |_| Ok(())), 1);

        let logs = sink.log_texts();
        assert_eq!(logs[0], "[!] payload failed: bad hook");
        assert_eq!(logs[1], "[!] payload panicked");
    }

    #[test]
    fn test_socket_sink_backlog() {
        let sink = SocketSink::default();
        sink.post(TargetMessage::Loaded);

        let (ours, theirs) = UnixStream::pair().unwrap();
        sink.connect(ours);
        sink.post(TargetMessage::Scope(crate::message::ScopeReport::Quit));
        sink.disconnect();

        let mut lines = BufReader::new(theirs).lines();
        assert_eq!(lines.next().unwrap().unwrap(), r#"{"type":"loaded"}"#);
        assert_eq!(
            lines.next().unwrap().unwrap(),
            r#"{"type":"scope","act":"quit"}"#
        );
    }
}

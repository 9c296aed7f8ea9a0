//! 関数呼び出しのトレース
//!
//! 関数の入口で引数を記録して1行の要約を出力し、出口で戻り値と
//! 出力引数（呼び出し後に読み直す引数）を出力します。

use crate::backend::{HookId, InvocationContext, InvocationListener, Interceptor};
use crate::console::Console;
use crate::Result;
use kumo_dwarf::{AddressNamer, DebugSymbols, ValueDecoder, ValueDescriptor};
use kumo_target::ThreadId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// フック対象の関数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionTarget {
    Address(u64),
    /// モジュールのエクスポート（`module`がNoneなら全モジュールから探す）
    Export { module: Option<String>, name: String },
}

impl FunctionTarget {
    pub fn export(module: Option<&str>, name: &str) -> Self {
        FunctionTarget::Export {
            module: module.map(str::to_string),
            name: name.to_string(),
        }
    }
}

/// 戻り値の記述
#[derive(Debug, Clone)]
pub enum ReturnSpec {
    /// 戻り値のみ
    Scalar(ValueDescriptor),
    /// 戻り値と、呼び出し後に読み直す引数
    ///
    /// `fields[i]`は`i`番目の引数に対応します。
    WithOutParams {
        ret: ValueDescriptor,
        fields: Vec<ValueDescriptor>,
    },
}

impl ReturnSpec {
    /// 記述子の列（先頭が戻り値）から作る
    pub fn from_descriptors(tokens: &[&str]) -> Self {
        match tokens {
            [] => ReturnSpec::Scalar(ValueDescriptor::parse("p")),
            [ret] => ReturnSpec::Scalar(ValueDescriptor::parse(ret)),
            [ret, fields @ ..] => ReturnSpec::WithOutParams {
                ret: ValueDescriptor::parse(ret),
                fields: fields.iter().map(|f| ValueDescriptor::parse(f)).collect(),
            },
        }
    }

    fn ret(&self) -> &ValueDescriptor {
        match self {
            ReturnSpec::Scalar(ret) => ret,
            ReturnSpec::WithOutParams { ret, .. } => ret,
        }
    }

    fn fields(&self) -> &[ValueDescriptor] {
        match self {
            ReturnSpec::Scalar(_) => &[],
            ReturnSpec::WithOutParams { fields, .. } => fields,
        }
    }
}

/// 1回の呼び出しの記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub thread_id: ThreadId,
    pub call_id: u64,
    /// 入口で記録した引数
    pub args: Vec<u64>,
    /// 呼び出し元の名前
    pub caller: String,
}

/// ユーザー定義のフック
///
/// どちらも既定では何もしません。`on_leave`は組み込みの出力より前に呼ばれるので、
/// 記録した引数や戻り値を書き換えて出力に反映させられます。
pub trait CallHooks: Send + Sync {
    fn on_enter(&self, _record: &mut CallRecord, _ctx: &mut dyn InvocationContext) {}
    fn on_leave(&self, _record: &mut CallRecord, _ctx: &mut dyn InvocationContext) {}
}

/// フックなし
pub struct NoHooks;

impl CallHooks for NoHooks {}

/// トレースの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Armed,
    Detached,
}

/// 取り付けたフックのハンドル
pub struct TraceHandle {
    id: HookId,
    interceptor: Arc<dyn Interceptor>,
    state: Mutex<HookState>,
}

impl TraceHandle {
    fn new(id: HookId, interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            id,
            interceptor,
            state: Mutex::new(HookState::Armed),
        }
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn state(&self) -> HookState {
        *self.state.lock()
    }

    /// フックを取り外す（2回目以降は何もしない）
    pub fn detach(&self) {
        let mut state = self.state.lock();
        if *state == HookState::Armed {
            self.interceptor.detach(self.id);
            *state = HookState::Detached;
        }
    }
}

/// 関数トレーサー
///
/// 呼び出しIDはこのトレーサーで取り付けたすべての関数で共有され、1から始まります。
pub struct CallTracer {
    interceptor: Arc<dyn Interceptor>,
    namer: Arc<AddressNamer>,
    decoder: ValueDecoder,
    console: Console,
    next_call_id: Arc<AtomicU64>,
}

impl CallTracer {
    pub fn new(
        interceptor: Arc<dyn Interceptor>,
        namer: Arc<AddressNamer>,
        decoder: ValueDecoder,
        console: Console,
    ) -> Self {
        Self {
            interceptor,
            namer,
            decoder,
            console,
            next_call_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// 呼び出しIDのカウンタを他のトレーサーと共有する
    pub fn with_call_ids(mut self, next_call_id: Arc<AtomicU64>) -> Self {
        self.next_call_id = next_call_id;
        self
    }

    /// 関数のアドレスを決める
    pub fn resolve_target(&self, target: &FunctionTarget) -> Result<u64> {
        match target {
            FunctionTarget::Address(addr) => Ok(*addr),
            FunctionTarget::Export { module, name } => self
                .namer
                .symbols()
                .and_then(|symbols| symbols.find_export(module.as_deref(), name))
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Export '{}' not found in {}",
                        name,
                        module.as_deref().unwrap_or("any module")
                    )
                }),
        }
    }

    /// 関数の呼び出しをトレースする
    ///
    /// # Arguments
    /// * `name` - 出力に使う関数名
    /// * `ret` - 戻り値（と出力引数）の記述
    /// * `args` - 入口で表示する引数の記述
    /// * `hooks` - ユーザー定義のフック
    pub fn trace_function(
        &self,
        target: &FunctionTarget,
        name: &str,
        ret: ReturnSpec,
        args: Vec<ValueDescriptor>,
        hooks: Arc<dyn CallHooks>,
    ) -> Result<TraceHandle> {
        let addr = self.resolve_target(target)?;
        let listener = Arc::new(FunctionTrace {
            name: name.to_string(),
            ret,
            args,
            hooks,
            namer: Arc::clone(&self.namer),
            decoder: self.decoder.clone(),
            console: self.console.clone(),
            next_call_id: Arc::clone(&self.next_call_id),
            stacks: Mutex::new(HashMap::new()),
        });

        let id = self.interceptor.attach(addr, listener)?;
        tracing::debug!("Tracing {} at 0x{:x}", name, addr);
        Ok(TraceHandle::new(id, Arc::clone(&self.interceptor)))
    }

    /// 呼び出されたことと戻り値だけを出力する
    pub fn trace_called(&self, target: &FunctionTarget, name: &str) -> Result<TraceHandle> {
        let addr = self.resolve_target(target)?;
        let listener = Arc::new(CalledTrace {
            name: name.to_string(),
            namer: Arc::clone(&self.namer),
            console: self.console.clone(),
        });

        let id = self.interceptor.attach(addr, listener)?;
        Ok(TraceHandle::new(id, Arc::clone(&self.interceptor)))
    }
}

/// `trace_function`のリスナー
struct FunctionTrace {
    name: String,
    ret: ReturnSpec,
    args: Vec<ValueDescriptor>,
    hooks: Arc<dyn CallHooks>,
    namer: Arc<AddressNamer>,
    decoder: ValueDecoder,
    console: Console,
    next_call_id: Arc<AtomicU64>,
    /// スレッドごとの未返却の呼び出し（再帰呼び出しに対応するためスタック）
    stacks: Mutex<HashMap<ThreadId, Vec<CallRecord>>>,
}

impl FunctionTrace {
    fn captured_arg_count(&self) -> usize {
        self.args.len().max(self.ret.fields().len())
    }

    fn render_enter(&self, record: &CallRecord) -> String {
        let mut dumps = Vec::new();
        let rendered: Vec<String> = self
            .args
            .iter()
            .zip(&record.args)
            .map(|(desc, raw)| {
                if desc.is_blob() {
                    dumps.push(self.decoder.decode(*raw, desc));
                    format!("{}=0x{:x}", desc.field(), raw)
                } else {
                    format!("{}={}", desc.field(), self.decoder.decode(*raw, desc))
                }
            })
            .collect();

        let mut line = format!(
            "[{}]({}): {}({}) \n\t\tCalled by {}",
            record.thread_id,
            record.call_id,
            self.name,
            rendered.join(", "),
            record.caller
        );
        for dump in dumps {
            line.push_str(&dump);
        }
        line
    }

    fn render_leave(&self, record: &CallRecord, ret: u64) -> String {
        let mut line = format!(
            "[{}]({}): {} returned {}.",
            record.thread_id,
            record.call_id,
            self.name,
            self.decoder.decode(ret, self.ret.ret())
        );

        let fields = self.ret.fields();
        if !fields.is_empty() {
            let rendered: Vec<String> = fields
                .iter()
                .zip(&record.args)
                .map(|(desc, raw)| format!("{}: {}", desc.field(), self.decoder.decode(*raw, desc)))
                .collect();
            line.push_str("\nargs on return: \t");
            line.push_str(&rendered.join(", "));
        }
        line.push('\n');
        line
    }

    fn fallback_line(&self, record: &CallRecord, what: &str) -> String {
        format!(
            "[{}]({}): {} <{} failed>",
            record.thread_id, record.call_id, self.name, what
        )
    }
}

impl InvocationListener for FunctionTrace {
    fn on_enter(&self, ctx: &mut dyn InvocationContext) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let thread_id = ctx.thread_id();
        let args = (0..self.captured_arg_count()).map(|i| ctx.arg(i)).collect();
        let caller = self.namer.resolve(ctx.return_address());

        let mut record = CallRecord {
            thread_id,
            call_id,
            args,
            caller,
        };

        let line = catch_unwind(AssertUnwindSafe(|| self.render_enter(&record)))
            .unwrap_or_else(|_| self.fallback_line(&record, "format"));
        self.console.log(line);

        let hooked = catch_unwind(AssertUnwindSafe(|| self.hooks.on_enter(&mut record, ctx)));
        if hooked.is_err() {
            self.console
                .error(format!("[!] {}: on_enter hook panicked", self.name));
        }

        self.stacks.lock().entry(thread_id).or_default().push(record);
    }

    fn on_leave(&self, ctx: &mut dyn InvocationContext) {
        let thread_id = ctx.thread_id();
        let record = {
            let mut stacks = self.stacks.lock();
            let record = stacks.get_mut(&thread_id).and_then(|stack| stack.pop());
            if stacks.get(&thread_id).is_some_and(|stack| stack.is_empty()) {
                stacks.remove(&thread_id);
            }
            record
        };
        // フックを付ける前に入った呼び出しの出口
        let Some(mut record) = record else {
            return;
        };

        let hooked = catch_unwind(AssertUnwindSafe(|| self.hooks.on_leave(&mut record, ctx)));
        if hooked.is_err() {
            self.console
                .error(format!("[!] {}: on_leave hook panicked", self.name));
        }

        let ret = ctx.return_value();
        let line = catch_unwind(AssertUnwindSafe(|| self.render_leave(&record, ret)))
            .unwrap_or_else(|_| self.fallback_line(&record, "format"));
        self.console.log(line);
    }
}

/// `trace_called`のリスナー
struct CalledTrace {
    name: String,
    namer: Arc<AddressNamer>,
    console: Console,
}

impl InvocationListener for CalledTrace {
    fn on_enter(&self, ctx: &mut dyn InvocationContext) {
        let caller = self.namer.resolve(ctx.return_address());
        self.console.log(format!(
            "\n[{}]\t{} called at {}",
            ctx.thread_id(),
            self.name,
            caller
        ));
    }

    fn on_leave(&self, ctx: &mut dyn InvocationContext) {
        self.console.log(format!(
            "\n[{}]\t{} return 0x{:x}",
            ctx.thread_id(),
            self.name,
            ctx.return_value()
        ));
    }
}

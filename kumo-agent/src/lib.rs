//! Kumo ターゲット側エージェント
//!
//! このクレートは、ターゲットプロセスの中で動く計装エンジンを提供します。
//! 関数呼び出しのトレース、命令ストリームの追跡、対話スコープ、
//! 式評価、コントローラとのメッセージ通信などを行います。
//!
//! 関数フックと命令の書き換えそのものは [`backend`] のトレイトを通して
//! 外部のエンジンに任せます。

pub mod context;
pub mod backend;
pub mod syscall;
pub mod disasm;
pub mod message;
pub mod console;
pub mod channel;
pub mod interceptor;
pub mod eval;
pub mod scope;
pub mod stalker;
pub mod fault;
pub mod runtime;

pub use backend::{
    Backtracer, BlockIterator, Callout, FramePointerBacktracer, HookId, Instruction,
    InvocationContext, InvocationListener, Interceptor, Stalker, Transformer,
};
pub use channel::{ChannelError, RecvError, SuspendChannel};
pub use console::{BufferSink, Console, MessageSink};
pub use context::{CpuContext, Register};
pub use fault::{Fault, FaultKind, MemoryAccess, MemoryOperation};
pub use eval::{parse_expression, ExprError, Expression, ExpressionEvaluator, Value};
pub use interceptor::{
    CallHooks, CallRecord, CallTracer, FunctionTarget, HookState, NoHooks, ReturnSpec,
    TraceHandle,
};
pub use message::{ControllerMessage, LogLevel, ScopeReport, TargetMessage};
pub use runtime::{socket_path, start, start_from_env, Agent, AgentConfig, RunningAgent};
pub use scope::{Resume, Scope, ScopeConfig};
pub use stalker::{
    BlockObserver, Flow, GatedTransformer, InstructionTracer, ScopeObserver, SyscallPhase,
    TracerConfig,
};
pub use syscall::Arch;

/// エージェントの結果型
pub type Result<T> = anyhow::Result<T>;

/// ペイロードの入口を定義する
///
/// ```ignore
/// fn init(agent: &kumo_agent::Agent) -> kumo_agent::Result<()> {
///     agent.console().log("hello from payload");
///     Ok(())
/// }
///
/// kumo_agent::payload!(init);
/// ```
#[macro_export]
macro_rules! payload {
    ($init:path) => {
        #[no_mangle]
        pub extern "C" fn kumo_payload_main(agent: *const $crate::Agent) -> i32 {
            $crate::runtime::run_payload_entry(agent, $init)
        }
    };
    ($init:path, $unload:path) => {
        $crate::payload!($init);

        #[no_mangle]
        pub extern "C" fn kumo_payload_unload(agent: *const $crate::Agent) {
            $crate::runtime::run_payload_entry(agent, |agent| {
                $unload(agent);
                Ok(())
            });
        }
    };
}

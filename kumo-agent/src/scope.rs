//! 対話スコープ（ターゲット側）
//!
//! 実行中のスレッドをその場で止め、コントローラから送られてくる式を
//! レジスタ・メモリに対して評価します。`c`で再開、`ni`で次のブロックまで進みます。

use crate::channel::{RecvError, SuspendChannel};
use crate::console::Console;
use crate::context::CpuContext;
use crate::disasm;
use crate::eval::ExpressionEvaluator;
use crate::message::{ScopeReport, TargetMessage};
use crate::syscall::Arch;
use kumo_dwarf::SharedMemory;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// スコープを抜けた後の動作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// 通常実行に戻る（呼び出し元は追跡を止める）
    Continue,
    /// 次のブロックで再び止まる
    Step,
}

/// スコープ設定
#[derive(Debug, Clone, Default)]
pub struct ScopeConfig {
    /// コマンド待ちの上限。超えたら`c`として扱う
    pub resume_timeout: Option<Duration>,
}

/// 対話スコープ
pub struct Scope {
    channel: Arc<SuspendChannel>,
    console: Console,
    evaluator: ExpressionEvaluator,
    memory: SharedMemory,
    arch: Arch,
    config: ScopeConfig,
    suspended: AtomicUsize,
}

impl Scope {
    pub fn new(
        channel: Arc<SuspendChannel>,
        console: Console,
        evaluator: ExpressionEvaluator,
        memory: SharedMemory,
        config: ScopeConfig,
    ) -> Self {
        Self {
            channel,
            console,
            evaluator,
            memory,
            arch: Arch::current(),
            config,
            suspended: AtomicUsize::new(0),
        }
    }

    pub fn channel(&self) -> &Arc<SuspendChannel> {
        &self.channel
    }

    /// 停止中のスレッド数
    pub fn suspended(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    /// 現在のスレッドを止めてコマンドを待つ
    pub fn suspend(&self, ctx: &CpuContext) -> Resume {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        self.console.post(TargetMessage::Scope(ScopeReport::Enter));
        self.show_context(ctx);

        let resume = loop {
            let code = match self.channel.recv(self.config.resume_timeout) {
                Ok(code) => code,
                Err(RecvError::Timeout) => {
                    tracing::warn!("[!] scope timed out at 0x{:x}, continuing", ctx.pc);
                    break Resume::Continue;
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("Scope channel closed at 0x{:x}", ctx.pc);
                    break Resume::Continue;
                }
            };

            match code.trim() {
                "c" => break Resume::Continue,
                "ni" => break Resume::Step,
                code => {
                    let result = self.evaluator.evaluate_to_string(code, Some(ctx));
                    self.console
                        .post(TargetMessage::Scope(ScopeReport::Result { result }));
                }
            }
        };

        self.console.post(TargetMessage::Scope(ScopeReport::Quit));
        self.suspended.fetch_sub(1, Ordering::SeqCst);
        resume
    }

    /// 停止位置の命令・レジスタ・バックトレースを出力する
    fn show_context(&self, ctx: &CpuContext) {
        let name = self.evaluator.namer().resolve(ctx.pc);
        let insn = self
            .memory
            .read(ctx.pc as usize, 16)
            .ok()
            .and_then(|code| disasm::disassemble_one(self.arch, &code, ctx.pc))
            .map(|insn| insn.to_string())
            .unwrap_or_else(|| "??".to_string());

        self.console.log(format!(
            "{} {}\n{}",
            name,
            insn,
            ctx.render_registers(self.arch.pointer_size())
        ));
        self.console.log(self.evaluator.render_backtrace(ctx));
    }
}

//! 命令トレーサー
//!
//! 指定アドレスに一度だけ発火するフックを仕掛け、発火したスレッドの
//! 命令ストリームを追跡します。追跡開始後、アーミングアドレスと同じ
//! メモリ範囲に実行が入るまではブロックに何も挿入しません（ゲート）。

use crate::backend::{
    BlockIterator, HookId, Instruction, InvocationContext, InvocationListener, Interceptor,
    Stalker, Transformer,
};
use crate::context::CpuContext;
use crate::scope::{Resume, Scope};
use crate::syscall::Arch;
use crate::Result;
use kumo_dwarf::RangeProvider;
use kumo_target::ThreadId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// ブロックコールアウトの後の追跡継続
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Keep,
    Unfollow,
}

/// システムコール命令のどちら側か
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallPhase {
    Before,
    After,
}

/// ブロック単位のコールバック
pub trait BlockObserver: Send + Sync {
    /// ブロックの先頭命令の実行直後に呼ばれる
    fn on_block(&self, ctx: &mut CpuContext, insns: &[Instruction]) -> Flow;

    /// システムコール命令の前後に呼ばれる
    fn on_syscall(&self, _ctx: &mut CpuContext, _insn: &Instruction, _phase: SyscallPhase) {}
}

/// トレーサー設定
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// システムコール命令の前後にもコールアウトを入れる
    pub trace_syscalls: bool,
    /// 追跡しないモジュール名（前方一致）
    pub exclude_modules: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            trace_syscalls: false,
            exclude_modules: vec!["libc.so".to_string(), "libkumo_preload.so".to_string()],
        }
    }
}

type BlockTable = Arc<Mutex<HashMap<u64, Arc<Vec<Instruction>>>>>;

/// ブロック書き換えの方針
///
/// ゲートが閉じている間は命令をそのまま出力します。ブロック先頭の命令が
/// `gate_base`から始まる範囲にあればゲートが開き、以後は閉じません。
pub struct GatedTransformer {
    tid: ThreadId,
    gate_base: u64,
    open: bool,
    arch: Arch,
    trace_syscalls: bool,
    ranges: Arc<dyn RangeProvider>,
    stalker: Arc<dyn Stalker>,
    observer: Arc<dyn BlockObserver>,
    blocks: BlockTable,
}

impl GatedTransformer {
    fn gate_opens_at(&self, addr: u64) -> bool {
        self.ranges
            .range_at(addr)
            .is_some_and(|range| range.base == self.gate_base)
    }

    fn block_callout(&self, start: u64) -> crate::backend::Callout {
        let tid = self.tid;
        let blocks = Arc::clone(&self.blocks);
        let observer = Arc::clone(&self.observer);
        let stalker = Arc::clone(&self.stalker);

        Box::new(move |ctx: &mut CpuContext| {
            let Some(insns) = blocks.lock().get(&start).cloned() else {
                return;
            };
            if observer.on_block(ctx, &insns) == Flow::Unfollow {
                stalker.unfollow(tid);
            }
        })
    }

    fn syscall_callout(&self, insn: &Instruction, phase: SyscallPhase) -> crate::backend::Callout {
        let insn = insn.clone();
        let observer = Arc::clone(&self.observer);
        Box::new(move |ctx: &mut CpuContext| observer.on_syscall(ctx, &insn, phase))
    }
}

impl Transformer for GatedTransformer {
    fn transform(&mut self, iterator: &mut dyn BlockIterator) {
        let mut insns = Vec::new();
        let mut start = None;

        while let Some(insn) = iterator.next() {
            if start.is_none() {
                start = Some(insn.address);
                if !self.open && self.gate_opens_at(insn.address) {
                    tracing::debug!("Tracer gate opened at 0x{:x}", insn.address);
                    self.open = true;
                }
            }

            if !self.open {
                iterator.keep();
                continue;
            }

            let syscall = self.trace_syscalls && self.arch.is_syscall(&insn);
            if syscall {
                iterator.put_callout(self.syscall_callout(&insn, SyscallPhase::Before));
            }
            iterator.keep();
            if syscall {
                iterator.put_callout(self.syscall_callout(&insn, SyscallPhase::After));
            }
            if insns.is_empty() {
                iterator.put_callout(self.block_callout(insn.address));
            }
            insns.push(insn);
        }

        if let (Some(start), false) = (start, insns.is_empty()) {
            self.blocks.lock().insert(start, Arc::new(insns));
        }
    }
}

/// 命令トレーサー
pub struct InstructionTracer {
    interceptor: Arc<dyn Interceptor>,
    stalker: Arc<dyn Stalker>,
    ranges: Arc<dyn RangeProvider>,
    config: TracerConfig,
    arch: Arch,
    excluded: AtomicBool,
}

impl InstructionTracer {
    pub fn new(
        interceptor: Arc<dyn Interceptor>,
        stalker: Arc<dyn Stalker>,
        ranges: Arc<dyn RangeProvider>,
        config: TracerConfig,
    ) -> Self {
        Self {
            interceptor,
            stalker,
            ranges,
            config,
            arch: Arch::current(),
            excluded: AtomicBool::new(false),
        }
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    /// `addr`が最初に実行されたスレッドの追跡を仕掛ける
    pub fn arm_at(self: &Arc<Self>, addr: u64, observer: Arc<dyn BlockObserver>) -> Result<HookId> {
        let gate_base = self
            .ranges
            .range_at(addr)
            .map(|range| range.base)
            .ok_or_else(|| anyhow::anyhow!("Address 0x{:x} is not mapped", addr))?;

        let hook = Arc::new(ArmingHook {
            tracer: Arc::clone(self),
            gate_base,
            observer,
            state: Mutex::new(ArmState::default()),
        });
        let id = self
            .interceptor
            .attach(addr, Arc::clone(&hook) as Arc<dyn InvocationListener>)?;
        // attachが返る前に他のスレッドが発火させていれば、ここで外す
        hook.settle(id);

        tracing::info!("[+] tracer armed at 0x{:x} (gate base 0x{:x})", addr, gate_base);
        Ok(id)
    }

    /// 除外モジュールを一度だけ登録する
    fn exclude_modules(&self) {
        if self.excluded.swap(true, Ordering::SeqCst) {
            return;
        }
        for name in &self.config.exclude_modules {
            if let Some(module) = self.ranges.module_by_name(name) {
                tracing::debug!("Excluding {} from tracing", module.name);
                self.stalker.exclude(module.base, module.size);
            }
        }
    }

    fn follow(&self, tid: ThreadId, gate_base: u64, observer: Arc<dyn BlockObserver>) -> Result<()> {
        self.exclude_modules();
        let transformer = GatedTransformer {
            tid,
            gate_base,
            open: false,
            arch: self.arch,
            trace_syscalls: self.config.trace_syscalls,
            ranges: Arc::clone(&self.ranges),
            stalker: Arc::clone(&self.stalker),
            observer,
            blocks: Arc::new(Mutex::new(HashMap::new())),
        };
        self.stalker.follow(tid, Box::new(transformer))
    }
}

#[derive(Debug, Default)]
struct ArmState {
    id: Option<HookId>,
    fired: bool,
    detached: bool,
}

impl ArmState {
    /// 発火済みでIDが分かっていて、まだ外していなければそのID
    fn take_detach(&mut self) -> Option<HookId> {
        if !self.fired || self.detached {
            return None;
        }
        let id = self.id?;
        self.detached = true;
        Some(id)
    }
}

/// 一度だけ発火するアーミング用フック
struct ArmingHook {
    tracer: Arc<InstructionTracer>,
    gate_base: u64,
    observer: Arc<dyn BlockObserver>,
    state: Mutex<ArmState>,
}

impl ArmingHook {
    /// `attach`が返したIDを記録する
    fn settle(&self, id: HookId) {
        let detach = {
            let mut state = self.state.lock();
            state.id = Some(id);
            state.take_detach()
        };
        if let Some(id) = detach {
            self.tracer.interceptor.detach(id);
        }
    }
}

impl InvocationListener for ArmingHook {
    fn on_enter(&self, ctx: &mut dyn InvocationContext) {
        let detach = {
            let mut state = self.state.lock();
            if state.fired {
                return;
            }
            state.fired = true;
            state.take_detach()
        };
        if let Some(id) = detach {
            self.tracer.interceptor.detach(id);
        }
        self.tracer.interceptor.flush();

        let tid = ctx.thread_id();
        if let Err(e) = self
            .tracer
            .follow(tid, self.gate_base, Arc::clone(&self.observer))
        {
            tracing::error!("[!] failed to follow thread {}: {}", tid, e);
        }
    }

    fn on_leave(&self, _ctx: &mut dyn InvocationContext) {}
}

/// ブロックごとにスコープで止まるオブザーバー
pub struct ScopeObserver {
    scope: Arc<Scope>,
}

impl ScopeObserver {
    pub fn new(scope: Arc<Scope>) -> Self {
        Self { scope }
    }
}

impl BlockObserver for ScopeObserver {
    fn on_block(&self, ctx: &mut CpuContext, _insns: &[Instruction]) -> Flow {
        match self.scope.suspend(ctx) {
            Resume::Continue => Flow::Unfollow,
            Resume::Step => Flow::Keep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Emitted, MockBlock, MockInterceptor, MockInvocation, MockStalker};
    use kumo_dwarf::{MemoryRange, ModuleInfo, Protection};

    /// 0x1000-0x2000 が main、0x8000-0x9000 が libc.so
    struct FakeRanges;

    impl RangeProvider for FakeRanges {
        fn range_at(&self, addr: u64) -> Option<MemoryRange> {
            let (base, file) = match addr {
                0x1000..=0x1fff => (0x1000, "/bin/main"),
                0x8000..=0x8fff => (0x8000, "/lib/libc.so.6"),
                _ => return None,
            };
            Some(MemoryRange {
                base,
                size: 0x1000,
                protection: Protection::parse("r-x"),
                file: Some(file.into()),
            })
        }

        fn modules(&self) -> Vec<ModuleInfo> {
            vec![
                ModuleInfo {
                    name: "main".to_string(),
                    path: "/bin/main".into(),
                    base: 0x1000,
                    size: 0x1000,
                },
                ModuleInfo {
                    name: "libc.so.6".to_string(),
                    path: "/lib/libc.so.6".into(),
                    base: 0x8000,
                    size: 0x1000,
                },
            ]
        }
    }

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<Vec<u64>>>,
        syscalls: Mutex<Vec<(u64, SyscallPhase)>>,
        flow: Mutex<Option<Flow>>,
    }

    impl BlockObserver for Recorder {
        fn on_block(&self, _ctx: &mut CpuContext, insns: &[Instruction]) -> Flow {
            self.blocks
                .lock()
                .push(insns.iter().map(|i| i.address).collect());
            self.flow.lock().unwrap_or(Flow::Keep)
        }

        fn on_syscall(&self, _ctx: &mut CpuContext, insn: &Instruction, phase: SyscallPhase) {
            self.syscalls.lock().push((insn.address, phase));
        }
    }

    struct Fixture {
        interceptor: Arc<MockInterceptor>,
        stalker: Arc<MockStalker>,
        recorder: Arc<Recorder>,
    }

    fn armed(config: TracerConfig) -> Fixture {
        let interceptor = Arc::new(MockInterceptor::default());
        let stalker = Arc::new(MockStalker::default());
        let recorder = Arc::new(Recorder::default());
        let tracer = Arc::new(
            InstructionTracer::new(
                interceptor.clone(),
                stalker.clone(),
                Arc::new(FakeRanges),
                config,
            )
            .with_arch(Arch::X64),
        );
        tracer.arm_at(0x1100, recorder.clone()).unwrap();

        let mut call = MockInvocation::new(7, 0x1234, &[]);
        interceptor.invoke(0x1100, &mut call, 0);

        Fixture {
            interceptor,
            stalker,
            recorder,
        }
    }

    fn block(insns: &[(u64, &str)]) -> MockBlock {
        MockBlock::new(
            insns
                .iter()
                .map(|(addr, mnemonic)| Instruction::new(*addr, 2, mnemonic, ""))
                .collect(),
        )
    }

    fn run_callouts(block: &MockBlock) {
        let mut ctx = CpuContext::default();
        for callout in &block.callouts {
            callout(&mut ctx);
        }
    }

    #[test]
    fn test_arming_hook_fires_once() {
        let f = armed(TracerConfig::default());
        assert_eq!(f.interceptor.attached(), 0);
        assert!(f.interceptor.flushes.load(Ordering::SeqCst) >= 1);

        let followed = f.stalker.followed.lock();
        assert_eq!(followed.len(), 1);
        assert_eq!(followed[0].0, 7);
        assert_eq!(*f.stalker.excluded.lock(), vec![(0x8000, 0x1000)]);
    }

    /// `attach`の中で即座に発火させるInterceptor
    #[derive(Default)]
    struct EagerInterceptor {
        inner: MockInterceptor,
    }

    impl Interceptor for EagerInterceptor {
        fn attach(&self, target: u64, listener: Arc<dyn InvocationListener>) -> Result<HookId> {
            let id = self.inner.attach(target, Arc::clone(&listener))?;
            listener.on_enter(&mut MockInvocation::new(9, 0x1234, &[]));
            Ok(id)
        }

        fn detach(&self, id: HookId) {
            self.inner.detach(id);
        }

        fn flush(&self) {
            self.inner.flush();
        }
    }

    #[test]
    fn test_arming_hook_hit_before_attach_returns() {
        let interceptor = Arc::new(EagerInterceptor::default());
        let stalker = Arc::new(MockStalker::default());
        let tracer = Arc::new(InstructionTracer::new(
            interceptor.clone(),
            stalker.clone(),
            Arc::new(FakeRanges),
            TracerConfig::default(),
        ));

        tracer.arm_at(0x1100, Arc::new(Recorder::default())).unwrap();
        assert_eq!(interceptor.inner.attached(), 0);
        assert_eq!(stalker.followed.lock().len(), 1);

        // 外れたあとに再度呼ばれても何も起きない
        let mut call = MockInvocation::new(9, 0x1234, &[]);
        interceptor.inner.invoke(0x1100, &mut call, 0);
        assert_eq!(stalker.followed.lock().len(), 1);
    }

    #[test]
    fn test_arming_unmapped_address_fails() {
        let tracer = Arc::new(InstructionTracer::new(
            Arc::new(MockInterceptor::default()),
            Arc::new(MockStalker::default()),
            Arc::new(FakeRanges),
            TracerConfig::default(),
        ));
        assert!(tracer
            .arm_at(0x5000, Arc::new(Recorder::default()))
            .is_err());
    }

    #[test]
    fn test_gate_keeps_foreign_blocks_untouched() {
        let f = armed(TracerConfig::default());

        let mut foreign = block(&[(0x8010, "push"), (0x8012, "ret")]);
        f.stalker.transform(&mut foreign);
        assert_eq!(
            foreign.emitted,
            vec![Emitted::Keep(0x8010), Emitted::Keep(0x8012)]
        );
        assert!(foreign.callouts.is_empty());
    }

    #[test]
    fn test_gate_opens_and_stays_open() {
        let f = armed(TracerConfig::default());

        let mut own = block(&[(0x1100, "push"), (0x1102, "mov"), (0x1104, "call")]);
        f.stalker.transform(&mut own);
        assert_eq!(
            own.emitted,
            vec![
                Emitted::Keep(0x1100),
                Emitted::Callout(0),
                Emitted::Keep(0x1102),
                Emitted::Keep(0x1104),
            ]
        );

        // ゲートは閉じない
        let mut foreign = block(&[(0x8010, "push")]);
        f.stalker.transform(&mut foreign);
        assert_eq!(foreign.callouts.len(), 1);

        run_callouts(&own);
        run_callouts(&foreign);
        assert_eq!(
            *f.recorder.blocks.lock(),
            vec![vec![0x1100, 0x1102, 0x1104], vec![0x8010]]
        );
    }

    #[test]
    fn test_syscalls_are_bracketed() {
        let f = armed(TracerConfig {
            trace_syscalls: true,
            ..TracerConfig::default()
        });

        let mut own = block(&[(0x1200, "mov"), (0x1202, "syscall"), (0x1204, "ret")]);
        f.stalker.transform(&mut own);
        assert_eq!(
            own.emitted,
            vec![
                Emitted::Keep(0x1200),
                Emitted::Callout(0),
                Emitted::Callout(1),
                Emitted::Keep(0x1202),
                Emitted::Callout(2),
                Emitted::Keep(0x1204),
            ]
        );

        run_callouts(&own);
        assert_eq!(
            *f.recorder.syscalls.lock(),
            vec![(0x1202, SyscallPhase::Before), (0x1202, SyscallPhase::After)]
        );
    }

    #[test]
    fn test_syscalls_untraced_by_default() {
        let f = armed(TracerConfig::default());
        let mut own = block(&[(0x1200, "syscall")]);
        f.stalker.transform(&mut own);
        assert_eq!(own.callouts.len(), 1);
    }

    #[test]
    fn test_unfollow_from_observer() {
        let f = armed(TracerConfig::default());
        *f.recorder.flow.lock() = Some(Flow::Unfollow);

        let mut own = block(&[(0x1100, "nop")]);
        f.stalker.transform(&mut own);
        run_callouts(&own);
        assert_eq!(*f.stalker.unfollowed.lock(), vec![7]);
    }
}

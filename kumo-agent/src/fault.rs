//! 致命的なシグナルの報告
//!
//! SIGSEGV・SIGBUS・SIGILL・SIGFPEを受けたら、障害の種類とアドレス、
//! その時点のレジスタを報告してから既定の動作に戻し、プロセスを終わらせます。
//!
//! ハンドラはシグナルコンテキストで動きます。まず確保なしで1行を標準エラーに
//! 書き、その後で名前解決付きの報告をコンソールに送ります。後者は
//! シンクのロックが取れたときだけ送られます。

use crate::console::Console;
use crate::context::CpuContext;
use crate::message::{LogLevel, TargetMessage};
use crate::syscall::Arch;
use crate::Result;
use kumo_dwarf::AddressNamer;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// 報告対象のシグナル
pub const FAULT_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    AccessViolation,
    IllegalInstruction,
    Arithmetic,
}

impl FaultKind {
    pub fn from_signal(signal: Signal) -> Option<Self> {
        match signal {
            Signal::SIGSEGV | Signal::SIGBUS => Some(Self::AccessViolation),
            Signal::SIGILL => Some(Self::IllegalInstruction),
            Signal::SIGFPE => Some(Self::Arithmetic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessViolation => "access-violation",
            Self::IllegalInstruction => "illegal-instruction",
            Self::Arithmetic => "arithmetic",
        }
    }
}

/// 不正アクセスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperation {
    Read,
    Write,
    Execute,
    Unknown,
}

impl MemoryOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::Unknown => "unknown",
        }
    }

    /// x86_64のページフォルトのエラーコードから
    pub fn from_page_fault_error(err: u64) -> Self {
        if err & 0x10 != 0 {
            Self::Execute
        } else if err & 0x2 != 0 {
            Self::Write
        } else {
            Self::Read
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub operation: MemoryOperation,
    pub address: u64,
}

/// 1回の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    /// 障害を起こした命令
    pub address: u64,
    pub memory: Option<MemoryAccess>,
}

struct Hex(u64);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Fault {
    /// `access-violation write 0x0 at <pc>`
    fn write_summary<W, N>(&self, out: &mut W, name: impl Fn(u64) -> N) -> fmt::Result
    where
        W: fmt::Write,
        N: fmt::Display,
    {
        out.write_str(self.kind.as_str())?;
        if let Some(mem) = &self.memory {
            write!(out, " {} {}", mem.operation.as_str(), name(mem.address))?;
        }
        write!(out, " at {}", name(self.address))
    }

    /// 名前解決した要約とレジスタ一覧
    pub fn render(&self, context: &CpuContext, namer: &AddressNamer, pointer_size: usize) -> String {
        let mut out = String::new();
        let _ = self.write_summary(&mut out, |addr| namer.resolve(addr));
        out.push('\n');
        out.push_str(&context.render_registers(pointer_size));
        out
    }

    /// 確保なしで要約を書く
    fn write_raw(&self, out: &mut StackLine) {
        let _ = fmt::Write::write_str(out, "[!] kumo: ");
        let _ = self.write_summary(out, Hex);
        let _ = fmt::Write::write_str(out, "\n");
    }
}

/// 固定長の行バッファ（あふれた分は捨てる）
struct StackLine {
    buf: [u8; 256],
    len: usize,
}

impl StackLine {
    fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for StackLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
mod regs {
    use super::*;

    const NAMED: [(&str, libc::c_int); 14] = [
        ("rax", libc::REG_RAX),
        ("rbx", libc::REG_RBX),
        ("rcx", libc::REG_RCX),
        ("rdx", libc::REG_RDX),
        ("rsi", libc::REG_RSI),
        ("rdi", libc::REG_RDI),
        ("r8", libc::REG_R8),
        ("r9", libc::REG_R9),
        ("r10", libc::REG_R10),
        ("r11", libc::REG_R11),
        ("r12", libc::REG_R12),
        ("r13", libc::REG_R13),
        ("r14", libc::REG_R14),
        ("r15", libc::REG_R15),
    ];

    unsafe fn gregs<'a>(uc: *const libc::c_void) -> &'a [libc::greg_t] {
        &(*(uc as *const libc::ucontext_t)).uc_mcontext.gregs
    }

    pub unsafe fn pc(uc: *const libc::c_void) -> u64 {
        gregs(uc)[libc::REG_RIP as usize] as u64
    }

    pub unsafe fn context(uc: *const libc::c_void) -> CpuContext {
        let g = gregs(uc);
        NAMED.iter().fold(
            CpuContext::new(
                g[libc::REG_RIP as usize] as u64,
                g[libc::REG_RSP as usize] as u64,
                g[libc::REG_RBP as usize] as u64,
            ),
            |ctx, (name, index)| ctx.with_register(*name, g[*index as usize] as u64),
        )
    }

    pub unsafe fn operation(uc: *const libc::c_void, _addr: u64) -> MemoryOperation {
        MemoryOperation::from_page_fault_error(gregs(uc)[libc::REG_ERR as usize] as u64)
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux", target_env = "gnu"))]
mod regs {
    use super::*;

    const NAMES: [&str; 29] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28",
    ];

    unsafe fn mcontext<'a>(uc: *const libc::c_void) -> &'a libc::mcontext_t {
        &(*(uc as *const libc::ucontext_t)).uc_mcontext
    }

    pub unsafe fn pc(uc: *const libc::c_void) -> u64 {
        mcontext(uc).pc
    }

    pub unsafe fn context(uc: *const libc::c_void) -> CpuContext {
        let m = mcontext(uc);
        NAMES
            .iter()
            .zip(m.regs.iter())
            .fold(CpuContext::new(m.pc, m.sp, m.regs[29]), |ctx, (name, value)| {
                ctx.with_register(*name, *value)
            })
            .with_register("lr", m.regs[30])
    }

    // ESRを読まない限り読み書きは区別できない
    pub unsafe fn operation(uc: *const libc::c_void, addr: u64) -> MemoryOperation {
        if addr == pc(uc) {
            MemoryOperation::Execute
        } else {
            MemoryOperation::Unknown
        }
    }
}

#[cfg(not(any(
    all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"),
    all(target_arch = "aarch64", target_os = "linux", target_env = "gnu")
)))]
mod regs {
    use super::*;

    pub unsafe fn pc(_uc: *const libc::c_void) -> u64 {
        0
    }

    pub unsafe fn context(_uc: *const libc::c_void) -> CpuContext {
        CpuContext::default()
    }

    pub unsafe fn operation(_uc: *const libc::c_void, _addr: u64) -> MemoryOperation {
        MemoryOperation::Unknown
    }
}

impl Fault {
    /// # Safety
    ///
    /// `info`と`uc`はカーネルがSA_SIGINFOハンドラに渡したものであること
    unsafe fn from_signal(
        signal: Signal,
        info: *const libc::siginfo_t,
        uc: *const libc::c_void,
    ) -> Option<Self> {
        let kind = FaultKind::from_signal(signal)?;
        if info.is_null() || uc.is_null() {
            return None;
        }
        let memory = match kind {
            FaultKind::AccessViolation => {
                let address = (*info).si_addr() as u64;
                Some(MemoryAccess {
                    operation: regs::operation(uc, address),
                    address,
                })
            }
            _ => None,
        };
        Some(Self {
            kind,
            address: regs::pc(uc),
            memory,
        })
    }
}

struct Reporter {
    console: Console,
    namer: Arc<AddressNamer>,
    pointer_size: usize,
}

impl Reporter {
    fn report(&self, fault: &Fault, context: &CpuContext) {
        let text = fault.render(context, &self.namer, self.pointer_size);
        if !self.console.try_post(TargetMessage::Log {
            level: LogLevel::Error,
            text,
        }) {
            write_stderr(b"[!] kumo: console busy, report dropped\n");
        }
    }
}

static REPORTER: OnceLock<Reporter> = OnceLock::new();
static REPORTING: AtomicBool = AtomicBool::new(false);

fn write_stderr(bytes: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

fn restore_default(signal: Signal) {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { sigaction(signal, &default) };
}

extern "C" fn on_fault(signo: libc::c_int, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    let Ok(signal) = Signal::try_from(signo) else {
        return;
    };

    // 報告中に落ちたら何もせず既定の動作で終わる
    if !REPORTING.swap(true, Ordering::SeqCst) {
        if let Some(fault) = unsafe { Fault::from_signal(signal, info, uc) } {
            let mut line = StackLine::new();
            fault.write_raw(&mut line);
            write_stderr(line.as_bytes());

            if let Some(reporter) = REPORTER.get() {
                let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    let context = unsafe { regs::context(uc) };
                    reporter.report(&fault, &context);
                }));
            }
        }
    }

    restore_default(signal);
    // ハンドラから戻ると保留中のシグナルが既定の動作で届く
    unsafe {
        libc::raise(signo);
    }
}

/// 障害の報告を有効にする
///
/// 既に有効ならfalseを返します。Rust標準ライブラリのスタックオーバーフロー
/// 検出用ハンドラも置き換えます。
pub fn install(console: Console, namer: Arc<AddressNamer>, arch: Arch) -> Result<bool> {
    let reporter = Reporter {
        console,
        namer,
        pointer_size: arch.pointer_size(),
    };
    if REPORTER.set(reporter).is_err() {
        return Ok(false);
    }

    let action = SigAction::new(
        SigHandler::SigAction(on_fault),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    for signal in FAULT_SIGNALS {
        unsafe { sigaction(signal, &action) }
            .map_err(|e| anyhow::anyhow!("Failed to install {} handler: {}", signal, e))?;
    }
    tracing::debug!("Fault reporter installed");
    Ok(true)
}

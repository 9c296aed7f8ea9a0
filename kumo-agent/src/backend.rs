//! 命令レベルの書き換えエンジンとの境界
//!
//! 関数フック（[`Interceptor`]）と命令ストリームの追跡（[`Stalker`]）は
//! 外部のバックエンドが提供します。このクレートはこれらのトレイトを通して
//! バックエンドを使うだけで、コード生成は行いません。

use crate::context::CpuContext;
use crate::Result;
use kumo_dwarf::MemoryReader;
use kumo_target::ThreadId;
use std::sync::Arc;

/// フックID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

/// 1回の関数呼び出しの文脈
pub trait InvocationContext {
    fn thread_id(&self) -> ThreadId;
    fn return_address(&self) -> u64;
    /// `index`番目の引数（呼び出し規約に従う）
    fn arg(&self, index: usize) -> u64;
    fn set_arg(&mut self, index: usize, value: u64);
    /// 戻り値（on_leaveでのみ意味を持つ）
    fn return_value(&self) -> u64;
    fn set_return_value(&mut self, value: u64);
    fn cpu_context(&self) -> &CpuContext;
}

/// 関数の入口・出口で呼ばれるリスナー
pub trait InvocationListener: Send + Sync {
    fn on_enter(&self, ctx: &mut dyn InvocationContext);
    fn on_leave(&self, ctx: &mut dyn InvocationContext);
}

/// 関数フックのバックエンド
pub trait Interceptor: Send + Sync {
    /// 関数の先頭にリスナーを取り付ける
    fn attach(&self, target: u64, listener: Arc<dyn InvocationListener>) -> Result<HookId>;
    /// リスナーを取り外す
    fn detach(&self, id: HookId);
    /// 保留中の書き換えを反映する
    fn flush(&self);
}

/// 逆アセンブル済みの1命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub size: usize,
    pub mnemonic: String,
    pub op_str: String,
}

impl Instruction {
    pub fn new(address: u64, size: usize, mnemonic: &str, op_str: &str) -> Self {
        Self {
            address,
            size,
            mnemonic: mnemonic.to_string(),
            op_str: op_str.to_string(),
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.op_str.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.op_str)
        }
    }
}

/// 書き換え後のコードから呼ばれるコールバック
pub type Callout = Box<dyn Fn(&mut CpuContext) + Send + Sync>;

/// ブロック1つ分の命令列を書き換えるイテレータ
pub trait BlockIterator {
    /// 次の命令。ブロックの終わりでNone
    fn next(&mut self) -> Option<Instruction>;
    /// 直前に返した命令をそのまま出力する
    fn keep(&mut self);
    /// この位置にコールアウトを挿入する
    fn put_callout(&mut self, callout: Callout);
}

/// ブロックごとの書き換え方針
pub trait Transformer: Send {
    fn transform(&mut self, iterator: &mut dyn BlockIterator);
}

/// 命令ストリーム追跡のバックエンド
pub trait Stalker: Send + Sync {
    /// スレッドの追跡を開始する
    fn follow(&self, tid: ThreadId, transformer: Box<dyn Transformer>) -> Result<()>;
    /// スレッドの追跡を止める
    fn unfollow(&self, tid: ThreadId);
    /// 範囲内のコードを追跡対象から外す
    fn exclude(&self, base: u64, size: u64);
}

/// スタックの巻き戻し
pub trait Backtracer: Send + Sync {
    /// 呼び出し元のリターンアドレスを内側から順に返す
    fn backtrace(&self, ctx: &CpuContext) -> Vec<u64>;
}

/// フレームポインタを辿るバックトレーサー
///
/// `[fp]`に1つ外側のフレームポインタ、`[fp + ptr]`にリターンアドレスがある
/// 標準的なフレーム配置を前提とします。
pub struct FramePointerBacktracer<M> {
    memory: M,
    max_frames: usize,
}

impl<M: MemoryReader> FramePointerBacktracer<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            max_frames: 64,
        }
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }
}

impl<M: MemoryReader + Send + Sync> Backtracer for FramePointerBacktracer<M> {
    fn backtrace(&self, ctx: &CpuContext) -> Vec<u64> {
        let mut frames = Vec::new();
        let mut fp = ctx.fp;

        while fp != 0 && frames.len() < self.max_frames {
            let Ok(ret) = self.memory.read_u64(fp as usize + std::mem::size_of::<usize>()) else {
                break;
            };
            if ret == 0 {
                break;
            }
            frames.push(ret);

            let Ok(next) = self.memory.read_u64(fp as usize) else {
                break;
            };
            // スタックは高位アドレスへ向かって巻き戻る
            if next <= fp {
                break;
            }
            fp = next;
        }

        frames
    }
}

//! 値デコード機能
//!
//! フック内で捕まえた生の値（レジスタ幅の整数）を、[`ValueDescriptor`]に従って
//! 文字列にします。フック内から呼ばれるため、デコードは決して失敗しません。
//! 読めないメモリや不明なタグは固定の代替文字列になります。

use crate::descriptor::{ValueDescriptor, ValueTag};
use crate::hexdump::hexdump;
use crate::Result;
use std::sync::Arc;

/// メモリ読み取りトレイト
///
/// ターゲットのメモリインターフェースを抽象化します。
pub trait MemoryReader {
    fn read_u8(&self, addr: usize) -> Result<u8>;
    fn read_u16(&self, addr: usize) -> Result<u16>;
    fn read_u32(&self, addr: usize) -> Result<u32>;
    fn read_u64(&self, addr: usize) -> Result<u64>;
    fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>>;
}

/// スレッド間で共有するメモリリーダー
pub type SharedMemory = Arc<dyn MemoryReader + Send + Sync>;

/// デコード設定
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// 文字列の最大読み取りバイト数
    pub max_string_bytes: usize,
    /// `d`で長さ指定がない場合のダンプ長
    pub default_dump_bytes: usize,
    /// ダンプ長の上限
    pub max_dump_bytes: usize,
    /// ポインタサイズ
    pub pointer_size: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_string_bytes: 4096,
            default_dump_bytes: 256,
            max_dump_bytes: 0x10000,
            pointer_size: std::mem::size_of::<usize>(),
        }
    }
}

/// 文字列読み取りのチャンクサイズ
const STRING_CHUNK: usize = 64;

/// 値デコーダー
#[derive(Clone)]
pub struct ValueDecoder {
    memory: SharedMemory,
    config: DecodeConfig,
}

impl ValueDecoder {
    /// 新しい値デコーダーを作成する
    pub fn new(memory: SharedMemory, config: DecodeConfig) -> Self {
        Self { memory, config }
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// 生の値を記述子に従って文字列にする
    pub fn decode(&self, raw: u64, descriptor: &ValueDescriptor) -> String {
        match descriptor.tag() {
            ValueTag::Pointer => format!("0x{:x}", raw),
            ValueTag::Int32 => (raw as u32 as i32).to_string(),
            ValueTag::CString => {
                if raw == 0 {
                    return "null".to_string();
                }
                self.read_c_string(raw)
                    .unwrap_or_else(|| unreadable(raw))
            }
            ValueTag::WideString => {
                if raw == 0 {
                    return "null".to_string();
                }
                self.read_wide_string(raw)
                    .unwrap_or_else(|| unreadable(raw))
            }
            ValueTag::Blob(length) => {
                if raw == 0 {
                    return "null".to_string();
                }
                let length = length
                    .unwrap_or(self.config.default_dump_bytes)
                    .min(self.config.max_dump_bytes);
                match self.memory.read(raw as usize, length) {
                    Ok(bytes) => format!("\n{}\n", hexdump(raw, &bytes)),
                    Err(_) => unreadable(raw),
                }
            }
            ValueTag::Deref => match self.read_pointer(raw) {
                Some(value) => format!("0x{:x}=>0x{:x}", raw, value),
                None => unreadable(raw),
            },
            ValueTag::DoubleDeref => {
                let Some(first) = self.read_pointer(raw) else {
                    return unreadable(raw);
                };
                match self.read_pointer(first) {
                    Some(second) => format!("0x{:x}=>0x{:x}=>0x{:x}", raw, first, second),
                    None => format!("0x{:x}=>0x{:x}=>{}", raw, first, unreadable(first)),
                }
            }
            ValueTag::Register | ValueTag::Unknown => format!("0x{:x}(miss type)", raw),
        }
    }

    /// ポインタサイズの値を読む
    pub fn read_pointer(&self, addr: u64) -> Option<u64> {
        let value = if self.config.pointer_size == 4 {
            self.memory.read_u32(addr as usize).map(u64::from)
        } else {
            self.memory.read_u64(addr as usize)
        };
        value.ok()
    }

    /// NUL終端文字列を読む
    pub fn read_c_string(&self, addr: u64) -> Option<String> {
        let bytes = self.read_until_nul(addr, 1)?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// NUL終端のUTF-16文字列を読む
    pub fn read_wide_string(&self, addr: u64) -> Option<String> {
        let bytes = self.read_until_nul(addr, 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// libc++の`std::string`を読む
    ///
    /// 先頭バイトの最下位ビットが0ならSSO（文字列は1バイト目から）、
    /// 1ならヒープ上のバッファへのポインタが`2 * pointer_size`の位置にあります。
    pub fn read_std_string(&self, addr: u64) -> Option<String> {
        let flag = self.memory.read_u8(addr as usize).ok()?;
        if flag & 1 == 0 {
            return self.read_c_string(addr + 1);
        }
        let data = self.read_pointer(addr + 2 * self.config.pointer_size as u64)?;
        self.read_c_string(data)
    }

    /// `unit`バイト単位のNUL（ゼロ）が現れるまで読む
    ///
    /// チャンク単位で読み、チャンクがマップ境界をまたいで失敗した場合は
    /// 1単位ずつの読み取りに切り替えます。先頭が読めなければNone。
    fn read_until_nul(&self, addr: u64, unit: usize) -> Option<Vec<u8>> {
        let limit = self.config.max_string_bytes;
        let mut out = Vec::new();
        let mut cursor = addr;

        while out.len() < limit {
            let want = STRING_CHUNK.min(limit - out.len());
            let chunk = match self.memory.read(cursor as usize, want) {
                Ok(chunk) => chunk,
                Err(_) => match self.memory.read(cursor as usize, unit) {
                    Ok(chunk) => chunk,
                    Err(_) if out.is_empty() => return None,
                    Err(_) => break,
                },
            };

            for piece in chunk.chunks(unit) {
                if piece.len() < unit || piece.iter().all(|b| *b == 0) {
                    return Some(out);
                }
                out.extend_from_slice(piece);
            }
            cursor += chunk.len() as u64;
        }

        Some(out)
    }
}

fn unreadable(raw: u64) -> String {
    format!("0x{:x}(unreadable)", raw)
}

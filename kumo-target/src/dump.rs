//! 自プロセスのメモリダンプ

use crate::maps::Mappings;
use crate::memory::Memory;
use crate::Result;
use kumo_dwarf::{Protection, RangeProvider};
use nix::errno::Errno;
use nix::libc;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;

/// 保護属性の変更とダンプを直列化するロック
static DUMP_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// ページサイズを取得する
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn to_prot_flags(protection: Protection) -> libc::c_int {
    let mut flags = libc::PROT_NONE;
    if protection.read {
        flags |= libc::PROT_READ;
    }
    if protection.write {
        flags |= libc::PROT_WRITE;
    }
    if protection.execute {
        flags |= libc::PROT_EXEC;
    }
    flags
}

fn mprotect(addr: usize, len: usize, flags: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, flags) };
    Errno::result(ret)
        .map_err(|e| anyhow::anyhow!("mprotect(0x{:x}, 0x{:x}) failed: {}", addr, len, e))?;
    Ok(())
}

/// 一時的に読み取り可能にしたページ
struct Flipped {
    addr: usize,
    len: usize,
    original: libc::c_int,
}

/// `[start, end)`のうち読み取り不可のページを読み取り可能にする
fn make_readable(
    mappings: &Mappings,
    start: usize,
    end: usize,
    page: usize,
    flipped: &mut Vec<Flipped>,
) -> Result<()> {
    let aligned_end = (end + page - 1) & !(page - 1);
    let mut cursor = start;
    while cursor < end {
        let range = mappings
            .range_at(cursor as u64)
            .ok_or_else(|| anyhow::anyhow!("Address 0x{:x} is not mapped", cursor))?;
        let chunk_end = ((range.base + range.size) as usize).min(aligned_end);

        if !range.protection.read {
            let original = to_prot_flags(range.protection);
            mprotect(cursor, chunk_end - cursor, original | libc::PROT_READ)?;
            flipped.push(Flipped {
                addr: cursor,
                len: chunk_end - cursor,
                original,
            });
        }
        cursor = chunk_end;
    }
    Ok(())
}

/// 自プロセスのメモリ範囲をファイルに書き出す
///
/// 読み取り不可の範囲は一時的に読み取り可能にし、読み終えたら元の保護属性に戻します。
/// 書き出したバイト数を返します。
pub fn dump_memory<P: AsRef<Path>>(addr: usize, size: usize, path: P) -> Result<usize> {
    let path = path.as_ref();
    let _guard = DUMP_LOCK.lock();

    let mappings = Mappings::current();
    let page = page_size();
    let start = addr & !(page - 1);
    let end = addr
        .checked_add(size)
        .ok_or_else(|| anyhow::anyhow!("Dump range overflows: 0x{:x}+0x{:x}", addr, size))?;

    let mut flipped = Vec::new();
    let flip_result = make_readable(&mappings, start, end, page, &mut flipped);
    let data = flip_result.and_then(|()| Memory::current().read(addr, size));

    for f in flipped.iter().rev() {
        if let Err(e) = mprotect(f.addr, f.len, f.original) {
            tracing::warn!("Failed to restore protection at 0x{:x}: {}", f.addr, e);
        }
    }

    let data = data?;
    fs::write(path, &data)
        .map_err(|e| anyhow::anyhow!("Failed to write dump to {:?}: {}", path, e))?;
    tracing::info!("[+] dumped 0x{:x} bytes at 0x{:x} to {:?}", data.len(), addr, path);

    Ok(data.len())
}

//! プロセスメモリの読み書き

use crate::Result;
use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::fs::FileExt;

/// プロセスのアドレス空間へのハンドル
///
/// 自プロセスに対しても`process_vm_readv`を使うので、未マップのアドレスは
/// SIGSEGVではなくエラーとして返ります。エージェントが任意のポインタを
/// たどるときはこちらを使ってください。
#[derive(Debug, Clone, Copy)]
pub struct Memory {
    pid: Pid,
}

impl Memory {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    pub fn current() -> Self {
        Self {
            pid: nix::unistd::getpid(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        if size == 0 {
            return Ok(buf);
        }

        let remote = [RemoteIoVec { base: addr, len: size }];
        let copied = process_vm_readv(self.pid, &mut [IoSliceMut::new(&mut buf)], &remote);
        match copied {
            Ok(n) if n == size => Ok(buf),
            // 途中までしか読めないのは範囲の後半が未マップのとき
            Ok(n) => Err(anyhow::anyhow!(
                "Memory at 0x{:x} is readable for {} of {} bytes",
                addr,
                n,
                size
            )),
            // seccompやYama制限下ではシステムコール自体が拒否される
            Err(Errno::EPERM | Errno::ENOSYS) => {
                self.proc_mem(false)?
                    .read_exact_at(&mut buf, addr as u64)
                    .map_err(|e| anyhow::anyhow!("Cannot read 0x{:x}+{}: {}", addr, size, e))?;
                Ok(buf)
            }
            Err(e) => Err(anyhow::anyhow!("Cannot read 0x{:x}+{}: {}", addr, size, e)),
        }
    }

    /// 書き込み
    ///
    /// 読み取り専用ページは`process_vm_writev`では書けないため、その場合は
    /// 保護を無視できる`/proc/<pid>/mem`で書きます。
    pub fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let remote = [RemoteIoVec { base: addr, len: data.len() }];
        match process_vm_writev(self.pid, &[IoSlice::new(data)], &remote) {
            Ok(n) if n == data.len() => Ok(()),
            _ => self
                .proc_mem(true)?
                .write_all_at(data, addr as u64)
                .map_err(|e| {
                    anyhow::anyhow!("Cannot write {} bytes at 0x{:x}: {}", data.len(), addr, e)
                }),
        }
    }

    fn proc_mem(&self, writable: bool) -> Result<std::fs::File> {
        let path = format!("/proc/{}/mem", self.pid);
        std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path, e))
    }

    fn read_array<const N: usize>(&self, addr: usize) -> Result<[u8; N]> {
        let bytes = self.read(addr, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl kumo_dwarf::MemoryReader for Memory {
    fn read_u8(&self, addr: usize) -> Result<u8> {
        self.read_array::<1>(addr).map(|[b]| b)
    }

    fn read_u16(&self, addr: usize) -> Result<u16> {
        self.read_array(addr).map(u16::from_le_bytes)
    }

    fn read_u32(&self, addr: usize) -> Result<u32> {
        self.read_array(addr).map(u32::from_le_bytes)
    }

    fn read_u64(&self, addr: usize) -> Result<u64> {
        self.read_array(addr).map(u64::from_le_bytes)
    }

    fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        Memory::read(self, addr, size)
    }
}

//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs;
use std::path::Path;

/// 起動・アタッチしたターゲットプロセス
///
/// 保持している間はptraceで停止・制御でき、ドロップするとデタッチして実行を再開させます。
pub struct Process {
    pid: Pid,
}

impl Process {
    /// 実行可能ファイルを起動してターゲットプロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// プロセスはexecve直後（動的ローダーの実行前）で停止した状態で返されます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        Self::spawn_with_env(program, args, &[])
    }

    /// 追加の環境変数付きで起動する
    ///
    /// `LD_PRELOAD`でエージェントを読み込ませる場合に使います。
    pub fn spawn_with_env<P: AsRef<Path>>(
        program: P,
        args: &[String],
        extra_env: &[(String, String)],
    ) -> Result<Self> {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承し、追加分で上書きする
        let env: Vec<CString> = std::env::vars()
            .filter(|(key, _)| !extra_env.iter().any(|(k, _)| k == key))
            .chain(extra_env.iter().cloned())
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Stopped(_, _) => Ok(Self { pid: child }),
                status => Err(anyhow::anyhow!(
                    "Unexpected wait status after execve: {:?}",
                    status
                )),
            },
            ForkResult::Child => {
                ptrace::traceme()?;

                // 成功すると戻ってこない
                execve(&program_cstring, &cstring_args, &env)?;

                unreachable!("execve failed");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)?;
        Ok(Self { pid })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// プロセスを実行継続する
    pub fn continue_execution(&self) -> Result<()> {
        ptrace::cont(self.pid, None)?;
        Ok(())
    }

    /// デタッチしてプロセスを自由に実行させ、PIDを返す
    pub fn release(self) -> Result<i32> {
        let pid = self.pid;
        std::mem::forget(self);
        ptrace::detach(pid, None)?;
        Ok(pid.as_raw())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = ptrace::detach(self.pid, None);
    }
}

/// プロセスを強制終了する
pub fn kill(pid: i32) -> Result<()> {
    signal::kill(Pid::from_raw(pid), Signal::SIGKILL)?;
    Ok(())
}

/// プロセスが存在するか
pub fn exists(pid: i32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// 終了したプロセスの状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(String),
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "killed by {}", signal),
        }
    }
}

/// 自分が起動した子プロセスの終了状態を回収する（ブロックしない）
///
/// まだ動いている、または自分の子ではない場合はNoneを返します。
pub fn try_wait(pid: i32) -> Option<ExitStatus> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus::Exited(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Some(ExitStatus::Signaled(signal.as_str().to_string())),
        _ => None,
    }
}

/// 親プロセスが`pid`であるプロセスを列挙する
pub fn children_of(pid: i32) -> Result<Vec<i32>> {
    let mut children = Vec::new();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(child) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if parent_of(child) == Some(pid) {
            children.push(child);
        }
    }

    children.sort_unstable();
    Ok(children)
}

fn parent_of(pid: i32) -> Option<i32> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|ppid| ppid.trim().parse().ok())
}

/// プロセス名（`/proc/<pid>/comm`）
pub fn process_name(pid: i32) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|comm| comm.trim_end().to_string())
}

/// 名前が一致するプロセスのPIDを列挙する
///
/// `/proc/<pid>/comm`（15文字に切り詰められる）と、コマンドラインの
/// 第1引数のファイル名のどちらかが一致すれば対象とします。
pub fn find_by_name(name: &str) -> Result<Vec<i32>> {
    let mut pids = Vec::new();
    let own_pid = std::process::id() as i32;

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        if process_name_matches(pid, name) {
            pids.push(pid);
        }
    }

    pids.sort_unstable();
    Ok(pids)
}

fn process_name_matches(pid: i32, name: &str) -> bool {
    // プロセスが途中で終了することもあるので読み取りエラーは不一致として扱う
    if let Ok(comm) = fs::read_to_string(format!("/proc/{}/comm", pid)) {
        let truncated: String = name.chars().take(15).collect();
        if comm.trim_end() == truncated {
            return true;
        }
    }

    fs::read(format!("/proc/{}/cmdline", pid))
        .ok()
        .and_then(|cmdline| {
            let argv0 = cmdline.split(|b| *b == 0).next()?;
            let argv0 = String::from_utf8_lossy(argv0).into_owned();
            Some(argv0.rsplit('/').next() == Some(name))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_exists() {
        assert!(exists(std::process::id() as i32));
    }

    #[test]
    fn test_find_by_name_excludes_self() {
        let comm = fs::read_to_string("/proc/self/comm").unwrap();
        let pids = find_by_name(comm.trim_end()).unwrap();
        assert!(!pids.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn test_find_by_name_unknown() {
        let pids = find_by_name("kumo-no-such-process-name").unwrap();
        assert!(pids.is_empty());
    }

    #[test]
    fn test_children_and_exit_status() {
        let child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id() as i32;

        let children = children_of(std::process::id() as i32).unwrap();
        assert!(children.contains(&pid));
        assert_eq!(try_wait(pid), None);

        kill(pid).unwrap();
        let mut status = None;
        for _ in 0..100 {
            status = try_wait(pid);
            if status.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(status, Some(ExitStatus::Signaled("SIGKILL".to_string())));
        assert_eq!(
            ExitStatus::Signaled("SIGKILL".to_string()).to_string(),
            "killed by SIGKILL"
        );
    }

    #[test]
    fn test_own_process_name() {
        let comm = fs::read_to_string("/proc/self/comm").unwrap();
        assert_eq!(process_name(std::process::id() as i32), Some(comm.trim_end().to_string()));
    }

    #[test]
    fn test_find_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        // execが終わるまで待つ
        std::thread::sleep(std::time::Duration::from_millis(200));
        let pids = find_by_name("sleep").unwrap();
        let found = pids.contains(&(child.id() as i32));
        child.kill().unwrap();
        let _ = child.wait();
        assert!(found);
    }
}

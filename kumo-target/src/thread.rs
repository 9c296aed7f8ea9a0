//! スレッド情報

use crate::Result;
use std::fs;

/// スレッドID
pub type ThreadId = i32;

/// 呼び出し元スレッドのIDを取得する
pub fn current_thread_id() -> ThreadId {
    nix::unistd::gettid().as_raw()
}

/// プロセスのスレッドID一覧を取得する
pub fn list_threads(pid: i32) -> Result<Vec<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let mut tids: Vec<ThreadId> = fs::read_dir(&task_dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// スレッド名（/proc/pid/task/tid/comm）を取得する
pub fn thread_name(pid: i32, tid: ThreadId) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/task/{}/comm", pid, tid))
        .ok()
        .map(|name| name.trim_end().to_string())
}

/// `/proc/<pid>/task/<tid>/stat`から読めるスレッドの状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStat {
    /// `R`・`S`・`D`・`T`など
    pub state: char,
    /// 最後に記録された命令ポインタ（カーネルが隠していればNone）
    pub pc: Option<u64>,
}

impl ThreadStat {
    pub fn read(pid: i32, tid: ThreadId) -> Option<Self> {
        let stat = fs::read_to_string(format!("/proc/{}/task/{}/stat", pid, tid)).ok()?;
        Self::parse(&stat)
    }

    /// commに空白や`)`が含まれうるので、最後の`)`より後ろを数える
    pub fn parse(stat: &str) -> Option<Self> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.chars().next()?;
        // 3番目のstateから数えてkstkeipは30番目
        let pc = fields
            .nth(26)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|pc| *pc != 0);
        Some(Self { state, pc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_own_threads() {
        let pid = std::process::id() as i32;
        let handle = std::thread::Builder::new()
            .name("kumo-worker".to_string())
            .spawn(|| {
                let tid = current_thread_id();
                std::thread::sleep(std::time::Duration::from_millis(100));
                tid
            })
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let tids = list_threads(pid).unwrap();
        assert!(tids.contains(&current_thread_id()));

        let worker = handle.join().unwrap();
        assert!(tids.contains(&worker));
    }

    #[test]
    fn test_main_thread_id_equals_pid() {
        let pid = std::process::id() as i32;
        let tids = list_threads(pid).unwrap();
        assert_eq!(tids.first(), Some(&pid));
        assert!(thread_name(pid, pid).is_some());
    }

    #[test]
    fn test_parse_thread_stat() {
        let mut fields = vec!["0"; 49];
        fields[0] = "S";
        fields[27] = "4198400";
        let stat = format!("1234 (my (odd) app) {}\n", fields.join(" "));
        assert_eq!(
            ThreadStat::parse(&stat),
            Some(ThreadStat {
                state: 'S',
                pc: Some(0x401000),
            })
        );

        // 近年のカーネルはkstkeipを0で隠す
        fields[27] = "0";
        let stat = format!("1234 (app) {}", fields.join(" "));
        assert_eq!(ThreadStat::parse(&stat).unwrap().pc, None);
        assert_eq!(ThreadStat::parse("garbage"), None);
    }

    #[test]
    fn test_own_thread_stat() {
        let pid = std::process::id() as i32;
        let stat = ThreadStat::read(pid, current_thread_id()).unwrap();
        assert_eq!(stat.state, 'R');
    }
}

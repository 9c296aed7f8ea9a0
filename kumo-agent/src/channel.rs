//! スコープ用の単一スロットチャネル
//!
//! 受信側は本物のOSスレッドを停止させます。ターゲットのスレッドが
//! コマンドを待つ間、そのスレッドはブロックしたままになります。

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// 送信エラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// 前のメッセージがまだ受信されていない
    #[error("suspend channel already holds a pending command")]
    Full,
    #[error("suspend channel is closed")]
    Closed,
}

/// 受信エラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("timed out waiting for a command")]
    Timeout,
    #[error("suspend channel is closed")]
    Closed,
}

#[derive(Default)]
struct Slot {
    value: Option<String>,
    closed: bool,
}

/// 停止中のスレッドへコマンドを渡すランデブー
#[derive(Default)]
pub struct SuspendChannel {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl SuspendChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// コマンドを1つ置く
    pub fn send(&self, message: String) -> Result<(), ChannelError> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Err(ChannelError::Closed);
        }
        if slot.value.is_some() {
            return Err(ChannelError::Full);
        }
        slot.value = Some(message);
        self.ready.notify_one();
        Ok(())
    }

    /// コマンドが届くまでブロックする
    ///
    /// `timeout`がNoneなら無期限に待ちます。閉じられたチャネルは即座に
    /// [`RecvError::Closed`]を返します。
    pub fn recv(&self, timeout: Option<Duration>) -> Result<String, RecvError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.slot.lock();

        loop {
            if let Some(value) = slot.value.take() {
                return Ok(value);
            }
            if slot.closed {
                return Err(RecvError::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out()
                        && slot.value.is_none()
                        && !slot.closed
                    {
                        return Err(RecvError::Timeout);
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
    }

    /// チャネルを閉じ、待っているスレッドをすべて起こす
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        slot.value = None;
        self.ready.notify_all();
    }

    /// 閉じたチャネルを再び使えるようにする
    pub fn reopen(&self) {
        let mut slot = self.slot.lock();
        slot.closed = false;
        slot.value = None;
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_send_then_recv() {
        let channel = SuspendChannel::new();
        channel.send("1+1".to_string()).unwrap();
        assert_eq!(channel.recv(None).unwrap(), "1+1");
    }

    #[test]
    fn test_single_slot_rejects_second_send() {
        let channel = SuspendChannel::new();
        channel.send("a".to_string()).unwrap();
        assert_eq!(channel.send("b".to_string()), Err(ChannelError::Full));
        assert_eq!(channel.recv(None).unwrap(), "a");
        channel.send("b".to_string()).unwrap();
    }

    #[test]
    fn test_recv_blocks_until_send() {
        let channel = Arc::new(SuspendChannel::new());
        let receiver = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.recv(None))
        };

        thread::sleep(Duration::from_millis(50));
        channel.send("ni".to_string()).unwrap();
        assert_eq!(receiver.join().unwrap(), Ok("ni".to_string()));
    }

    #[test]
    fn test_recv_timeout() {
        let channel = SuspendChannel::new();
        let started = Instant::now();
        assert_eq!(
            channel.recv(Some(Duration::from_millis(30))),
            Err(RecvError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let channel = Arc::new(SuspendChannel::new());
        let receiver = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.recv(None))
        };

        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert_eq!(receiver.join().unwrap(), Err(RecvError::Closed));
        assert_eq!(channel.send("c".to_string()), Err(ChannelError::Closed));

        channel.reopen();
        channel.send("c".to_string()).unwrap();
    }
}

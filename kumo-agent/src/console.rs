//! ターゲット内からの出力

use crate::message::{LogLevel, TargetMessage};
use parking_lot::Mutex;
use std::sync::Arc;

/// コントローラへのメッセージ送信口
pub trait MessageSink: Send + Sync {
    fn post(&self, message: TargetMessage);

    /// ブロックせずに送る。送れなければfalse
    ///
    /// シグナルハンドラから使われます。
    fn try_post(&self, message: TargetMessage) -> bool {
        self.post(message);
        true
    }
}

/// 送信したメッセージを溜めておくシンク
#[derive(Default)]
pub struct BufferSink {
    messages: Mutex<Vec<TargetMessage>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 溜まったメッセージを取り出す
    pub fn take(&self) -> Vec<TargetMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// 溜まっているログ本文
    pub fn log_texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                TargetMessage::Log { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MessageSink for BufferSink {
    fn post(&self, message: TargetMessage) {
        self.messages.lock().push(message);
    }

    fn try_post(&self, message: TargetMessage) -> bool {
        match self.messages.try_lock() {
            Some(mut messages) => {
                messages.push(message);
                true
            }
            None => false,
        }
    }
}

/// トレース出力
///
/// テキストは`log`メッセージとしてコントローラに転送します。
#[derive(Clone)]
pub struct Console {
    sink: Arc<dyn MessageSink>,
}

impl Console {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.sink
    }

    /// メッセージをそのまま送る
    pub fn post(&self, message: TargetMessage) {
        self.sink.post(message);
    }

    pub fn try_post(&self, message: TargetMessage) -> bool {
        self.sink.try_post(message)
    }

    pub fn log(&self, text: impl Into<String>) {
        self.emit(LogLevel::Info, text.into());
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.emit(LogLevel::Warning, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(LogLevel::Error, text.into());
    }

    fn emit(&self, level: LogLevel, text: String) {
        tracing::trace!(?level, "{}", text);
        self.sink.post(TargetMessage::Log { level, text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_forwards_logs() {
        let sink = Arc::new(BufferSink::new());
        let console = Console::new(sink.clone());

        console.log("hello");
        console.error("boom");

        let messages = sink.take();
        assert_eq!(
            messages,
            vec![
                TargetMessage::Log {
                    level: LogLevel::Info,
                    text: "hello".to_string()
                },
                TargetMessage::Log {
                    level: LogLevel::Error,
                    text: "boom".to_string()
                },
            ]
        );
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_try_post_gives_up_while_locked() {
        let sink = Arc::new(BufferSink::new());
        let console = Console::new(sink.clone());
        let message = TargetMessage::Log {
            level: LogLevel::Error,
            text: "fault".to_string(),
        };

        {
            let _held = sink.messages.lock();
            assert!(!console.try_post(message.clone()));
        }
        assert!(console.try_post(message.clone()));
        assert_eq!(sink.take(), vec![message]);
    }
}

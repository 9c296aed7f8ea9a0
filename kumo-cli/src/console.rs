//! 行エディタと通知の表示
//!
//! rustylineは読み取り中にプロンプトを差し替えられないため、読み取り中に
//! プロンプトが変わったら状態行を出し、入力行の後ろにヒントとして新しい
//! プロンプトを表示します。次の行からは新しいプロンプトで読みます。

use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::{Context, Editor, ExternalPrinter};
use rustyline_derive::{Completer, Helper, Highlighter, Validator};
use std::fmt::Display;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

pub type SharedPrompt = Arc<Mutex<PromptState>>;

#[derive(Debug, Default)]
pub struct PromptState {
    /// マネージャが最後に通知したプロンプト
    live: String,
    /// 読み取り中の行を始めたときのプロンプト
    reading: Option<String>,
}

impl PromptState {
    pub fn shared() -> SharedPrompt {
        Arc::new(Mutex::new(Self::default()))
    }

    /// 新しいプロンプトを記録する
    ///
    /// 読み取り中の行の表示を描き直す必要があればtrueを返します。
    pub fn update(&mut self, prompt: String) -> bool {
        let changed = self.live != prompt;
        self.live = prompt;
        changed && self.reading.is_some()
    }

    fn begin(&mut self, prompt: &str) {
        self.live = prompt.to_string();
        self.reading = Some(prompt.to_string());
    }

    fn end(&mut self) {
        self.reading = None;
    }

    /// 読み取り開始後に変わったプロンプト
    pub fn pending(&self) -> Option<&str> {
        match &self.reading {
            Some(started) if *started != self.live => Some(&self.live),
            _ => None,
        }
    }
}

/// `[local->app>scope(1)] > ` → `[local->app>scope(1)]`
pub fn prompt_label(prompt: &str) -> &str {
    prompt.trim_end_matches([' ', '>'])
}

#[derive(Helper, Completer, Highlighter, Validator)]
struct ReplHelper {
    prompt: SharedPrompt,
}

impl Hinter for ReplHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        if pos < line.len() {
            return None;
        }
        self.prompt
            .lock()
            .pending()
            .map(|p| format!("  <- {} (Enter to refresh)", prompt_label(p)))
    }
}

/// 編集中の行を壊さずに通知を出す
pub struct NoticePrinter {
    printer: Option<Box<dyn ExternalPrinter + Send>>,
}

impl NoticePrinter {
    pub fn info(&mut self, msg: impl Display) {
        self.print(msg, false);
    }

    pub fn warn(&mut self, msg: impl Display) {
        self.print(msg, true);
    }

    fn print(&mut self, msg: impl Display, error: bool) {
        let msg = format!("{msg}\n");
        if let Some(printer) = self.printer.as_mut() {
            match printer.print(msg.clone()) {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!("External printer failed: {}", e);
                    self.printer = None;
                }
            }
        }
        if error {
            eprint!("{msg}");
        } else {
            print!("{msg}");
        }
    }
}

/// 別スレッドで動く行エディタ
///
/// プロンプトを送るたびに1行読みます。EOFやエラーでは`None`が届きます。
pub struct LineEditor {
    prompts: std_mpsc::Sender<Option<String>>,
    lines: mpsc::UnboundedReceiver<Option<String>>,
    thread: JoinHandle<()>,
}

impl LineEditor {
    pub fn spawn(prompt: SharedPrompt) -> (Self, NoticePrinter) {
        let (printer_tx, printer_rx) = std_mpsc::channel();
        let (prompts, prompt_rx) = std_mpsc::channel::<Option<String>>();
        let (line_tx, lines) = mpsc::unbounded_channel();

        let thread = std::thread::spawn(move || {
            let mut rl: Editor<ReplHelper, DefaultHistory> = match Editor::new() {
                Ok(rl) => rl,
                Err(e) => {
                    eprintln!("Error: {:?}", e);
                    let _ = printer_tx.send(None);
                    let _ = line_tx.send(None);
                    return;
                }
            };
            rl.set_helper(Some(ReplHelper {
                prompt: prompt.clone(),
            }));
            let printer = rl
                .create_external_printer()
                .ok()
                .map(|p| Box::new(p) as Box<dyn ExternalPrinter + Send>);
            let _ = printer_tx.send(printer);

            while let Ok(Some(text)) = prompt_rx.recv() {
                prompt.lock().begin(&text);
                let line = match rl.readline(&text) {
                    Ok(line) => {
                        if !line.trim().is_empty() {
                            let _ = rl.add_history_entry(line.as_str());
                        }
                        Some(line)
                    }
                    Err(ReadlineError::Interrupted) => Some(String::new()),
                    Err(ReadlineError::Eof) => None,
                    Err(err) => {
                        eprintln!("Error: {:?}", err);
                        None
                    }
                };
                prompt.lock().end();

                let done = line.is_none();
                if line_tx.send(line).is_err() || done {
                    break;
                }
            }
        });

        let printer = NoticePrinter {
            printer: printer_rx.recv().ok().flatten(),
        };
        (
            Self {
                prompts,
                lines,
                thread,
            },
            printer,
        )
    }

    /// `prompt`で1行読む。エディタが終わっていればNone
    pub async fn read_line(&mut self, prompt: String) -> Option<String> {
        self.prompts.send(Some(prompt)).ok()?;
        self.lines.recv().await.flatten()
    }

    pub async fn close(self) {
        let _ = self.prompts.send(None);
        drop(self.prompts);
        let thread = self.thread;
        let _ = tokio::task::spawn_blocking(move || thread.join()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_change_while_reading() {
        let mut state = PromptState::default();
        state.begin("[local->app] > ");
        assert_eq!(state.pending(), None);

        assert!(state.update("[local->app>scope(1)] > ".to_string()));
        assert_eq!(state.pending(), Some("[local->app>scope(1)] > "));
        // 同じプロンプトの再通知では状態行を出さない
        assert!(!state.update("[local->app>scope(1)] > ".to_string()));

        // 元に戻ったら描き直してヒントを消す
        assert!(state.update("[local->app] > ".to_string()));
        assert_eq!(state.pending(), None);
    }

    #[test]
    fn test_prompt_change_between_lines() {
        let mut state = PromptState::default();
        state.begin("[local] > ");
        state.end();

        assert!(!state.update("[local->app] > ".to_string()));
        assert_eq!(state.pending(), None);
    }

    #[test]
    fn test_prompt_label() {
        assert_eq!(prompt_label("[local->app>scope(2)] > "), "[local->app>scope(2)]");
        assert_eq!(prompt_label("[local] > "), "[local]");
    }
}

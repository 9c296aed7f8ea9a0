//! Kumo CLI - コマンドラインインターフェース
//!
//! ターゲットへのペイロード注入と、スコープでの対話的な評価を行うREPL

mod console;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::{prompt_label, LineEditor, NoticePrinter, PromptState, SharedPrompt};
use kumo_core::command::HELP;
use kumo_core::{
    BuildEvent, CargoBuilder, Command, Config, LocalDevice, LogLevel, Notice, SessionManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// ソース監視のポーリング間隔
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Kumo - dynamic instrumentation toolkit
#[derive(Parser, Debug)]
#[command(name = "kumo")]
#[command(version = "0.1.0")]
#[command(about = "Inject Rust payloads into running processes and trace them interactively", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<StartCommand>,

    /// Cargo project of the payload
    #[arg(long, env = "KUMO_PAYLOAD_DIR", default_value = "payload", global = true)]
    payload_dir: PathBuf,

    /// Payload package inside a workspace
    #[arg(long, env = "KUMO_PAYLOAD_PACKAGE", global = true)]
    package: Option<String>,

    /// Build the payload with --release
    #[arg(long, global = true)]
    release: bool,

    /// Directory holding the agent sockets
    #[arg(long, env = "KUMO_SOCKET_DIR", global = true)]
    socket_dir: Option<PathBuf>,

    /// Agent library preloaded into spawned processes
    #[arg(long, env = "KUMO_AGENT_LIBRARY", global = true)]
    agent: Option<PathBuf>,

    /// Device to use
    #[arg(long, env = "KUMO_DEVICE", default_value = "local", global = true)]
    device: String,

    /// Also instrument child processes
    #[arg(
        long,
        env = "KUMO_CHILD_GATING",
        global = true,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    child_gating: bool,

    /// Rebuild and reload when the payload sources change
    #[arg(long, global = true)]
    watch: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum StartCommand {
    /// Spawn a program and inject the payload
    Run {
        /// Path to the executable
        program: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to a running process without loading anything
    Attach {
        /// Process ID or name
        target: String,
    },

    /// Attach to a process (or spawn it) and inject the payload
    Inject {
        /// Process ID, name or executable
        target: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Cli {
    fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            payload_dir: defaults.resolve(&self.payload_dir),
            payload_package: self.package.clone(),
            release: self.release,
            socket_dir: self.socket_dir.clone().unwrap_or(defaults.socket_dir.clone()),
            agent_library: self
                .agent
                .as_deref()
                .map(|p| defaults.resolve(p))
                .unwrap_or(defaults.agent_library.clone()),
            device: self.device.clone(),
            child_gating: self.child_gating,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    if config.device != "local" {
        anyhow::bail!("Unknown device: {}", config.device);
    }

    println!("Kumo - dynamic instrumentation toolkit");
    println!("Type .help for available commands, .quit to exit.");
    println!();

    let device = Arc::new(LocalDevice::new(config.clone()));
    let builder = Arc::new(
        CargoBuilder::new(config.payload_dir.clone())
            .with_package(config.payload_package.clone())
            .with_release(config.release),
    );
    let (manager, notices) = SessionManager::new(device, builder, config);
    let prompt = PromptState::shared();
    let (editor, printer) = LineEditor::spawn(prompt.clone());
    tokio::spawn(print_notices(notices, printer, prompt));

    if let Some(command) = cli.command {
        if let Err(e) = start(&manager, command).await {
            println!("[!] {:#}", e);
        }
    }

    let mut watcher = None;
    if cli.watch {
        watcher = Some(manager.watch(WATCH_INTERVAL));
    }

    run_repl(&manager, editor, &mut watcher).await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    manager.detach_all().await;
    Ok(())
}

/// 起動時のサブコマンドを実行する
async fn start(manager: &SessionManager, command: StartCommand) -> Result<()> {
    match command {
        StartCommand::Run { program, args } => {
            let pid = manager.spawn(&program, &args).await?;
            manager.compile().await?;
            manager.load(Some(pid)).await?;
            manager.resume(Some(pid)).await?;
        }
        StartCommand::Attach { target } => {
            manager.attach(&target).await?;
        }
        StartCommand::Inject { target, args } => {
            manager.inject(&target, &args).await?;
        }
    }
    Ok(())
}

/// 通知の表示文字列と、警告かどうか
fn render_notice(notice: Notice) -> Option<(String, bool)> {
    let rendered = match notice {
        Notice::Log { level, text, .. } => (text, level != LogLevel::Info),
        Notice::Info(text) => (text, false),
        Notice::Warn(text) => (text, true),
        Notice::Build(BuildEvent::Started) => ("[+] compiling payload...".to_string(), false),
        Notice::Build(BuildEvent::Succeeded { artifact }) => {
            (format!("[+] built {}", artifact.display()), false)
        }
        Notice::Build(BuildEvent::Failed { message }) => (format!("[!] {}", message), true),
        Notice::Prompt(_) => return None,
    };
    Some(rendered)
}

/// 通知を表示する
///
/// プロンプトの変更は行エディタに伝え、入力中の行があれば状態行を出して描き直します。
async fn print_notices(
    mut notices: mpsc::UnboundedReceiver<Notice>,
    mut printer: NoticePrinter,
    prompt: SharedPrompt,
) {
    while let Some(notice) = notices.recv().await {
        if let Notice::Prompt(text) = notice {
            let redraw = prompt.lock().update(text.clone());
            if redraw {
                printer.info(format!("[+] now at {}", prompt_label(&text)));
            }
            continue;
        }
        match render_notice(notice) {
            Some((text, true)) => printer.warn(text),
            Some((text, false)) => printer.info(text),
            None => {}
        }
    }
}

/// REPLループを実行する
async fn run_repl(
    manager: &Arc<SessionManager>,
    mut editor: LineEditor,
    watcher: &mut Option<JoinHandle<()>>,
) {
    while let Some(line) = editor.read_line(manager.prompt()).await {
        match Command::parse(&line) {
            Some(Command::Quit) => break,
            Some(command) => {
                if let Err(e) = handle_command(manager, watcher, command).await {
                    println!("[!] {:#}", e);
                }
            }
            None if line.trim().is_empty() => {}
            None => println!("[!] Unknown command: {} (try .help)", line.trim()),
        }
    }
    editor.close().await;
}

async fn handle_command(
    manager: &Arc<SessionManager>,
    watcher: &mut Option<JoinHandle<()>>,
    command: Command,
) -> Result<()> {
    tracing::debug!("Command: {:?}", command);
    match command {
        Command::Eval(code) => match manager.evaluate(&code).await {
            Ok(Some(result)) => println!("{}", result),
            Ok(None) => {}
            Err(e) => println!("{}", e),
        },
        Command::Sessions => {
            let sessions = manager.sessions();
            if sessions.is_empty() {
                println!("No sessions");
            }
            for s in sessions {
                let marker = if s.current { "*" } else { " " };
                let scope = if s.depth > 0 {
                    format!(" scope({})", s.depth)
                } else {
                    String::new()
                };
                println!("{} {:>7}  {}{}", marker, s.pid, s.name, scope);
            }
        }
        Command::Switch(pid) => manager.switch(pid)?,
        Command::Attach(target) => {
            manager.attach(&target).await?;
        }
        Command::Spawn { program, args } => {
            manager.spawn(&program, &args).await?;
        }
        Command::Inject { target, args } => {
            manager.inject(&target, &args).await?;
        }
        Command::Compile => {
            manager.compile().await?;
        }
        Command::Load => manager.load(None).await?,
        Command::Reload => {
            manager.reload().await?;
        }
        Command::Resume => manager.resume(None).await?,
        Command::Watch(true) => {
            if watcher.is_none() {
                *watcher = Some(manager.watch(WATCH_INTERVAL));
                println!("[+] watching payload sources");
            }
        }
        Command::Watch(false) => {
            if let Some(handle) = watcher.take() {
                handle.abort();
                println!("[+] stopped watching");
            }
        }
        Command::Detach(pid) => manager.detach(pid).await?,
        Command::Kill(pid) => manager.kill(pid).await?,
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_notices() {
        let failed = Notice::Build(BuildEvent::Failed {
            message: "Build failed:\nerror[E0425]".to_string(),
        });
        assert_eq!(
            render_notice(failed),
            Some(("[!] Build failed:\nerror[E0425]".to_string(), true))
        );

        let log = Notice::Log {
            pid: 42,
            level: LogLevel::Info,
            text: "[1](1): open()".to_string(),
        };
        assert_eq!(render_notice(log), Some(("[1](1): open()".to_string(), false)));
        assert_eq!(render_notice(Notice::Prompt("[local] > ".to_string())), None);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["kumo"]).unwrap();
        assert_eq!(cli.command, None);
        let config = cli.config();
        assert!(config.payload_dir.ends_with("payload"));
        assert!(config.payload_dir.is_absolute());
        assert_eq!(config.device, "local");
    }

    #[test]
    fn test_cli_run_with_trailing_args() {
        let cli = Cli::try_parse_from([
            "kumo",
            "--release",
            "run",
            "./app",
            "--flag",
            "x",
        ])
        .unwrap();
        assert!(cli.release);
        assert_eq!(
            cli.command,
            Some(StartCommand::Run {
                program: "./app".to_string(),
                args: vec!["--flag".to_string(), "x".to_string()],
            })
        );
    }

    #[test]
    fn test_cli_socket_dir_override() {
        let cli = Cli::try_parse_from(["kumo", "--socket-dir", "/run/kumo", "attach", "1234"])
            .unwrap();
        assert_eq!(cli.config().socket_dir, PathBuf::from("/run/kumo"));
        assert_eq!(
            cli.command,
            Some(StartCommand::Attach {
                target: "1234".to_string()
            })
        );
    }
}

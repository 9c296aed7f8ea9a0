//! Kumo プリロードライブラリ
//!
//! `LD_PRELOAD`で読み込まれると、`main`より前にエージェントを起動します。
//! `KUMO_DISABLE`が設定されていれば何もしません。

use kumo_agent::RunningAgent;
use std::panic;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static AGENT: OnceLock<RunningAgent> = OnceLock::new();

#[used]
#[link_section = ".init_array"]
static KUMO_PRELOAD_INIT: extern "C" fn() = kumo_preload_init;

extern "C" fn kumo_preload_init() {
    if std::env::var_os("KUMO_DISABLE").is_some() {
        return;
    }

    let filter = EnvFilter::try_from_env("KUMO_AGENT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let started = panic::catch_unwind(kumo_agent::start_from_env);
    match started {
        Ok(Ok(running)) => {
            let _ = AGENT.set(running);
        }
        Ok(Err(e)) => tracing::error!("[!] kumo agent failed to start: {:#}", e),
        Err(_) => tracing::error!("[!] kumo agent panicked during startup"),
    }
}

/// 起動済みのエージェント（起動に失敗していればNone）
pub fn running_agent() -> Option<&'static RunningAgent> {
    AGENT.get()
}

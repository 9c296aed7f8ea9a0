//! コントローラ設定

use std::path::{Path, PathBuf};
use std::time::Duration;

/// プリロードライブラリのファイル名
pub const AGENT_LIBRARY_NAME: &str = "libkumo_preload.so";

/// コントローラ設定
///
/// CLIの引数（と`KUMO_*`環境変数）から組み立てます。
#[derive(Debug, Clone)]
pub struct Config {
    /// 相対パスの基準ディレクトリ
    pub base_dir: PathBuf,
    /// ペイロードのcargoプロジェクト
    pub payload_dir: PathBuf,
    /// ワークスペース内のペイロードパッケージ名
    pub payload_package: Option<String>,
    /// `--release`でビルドする
    pub release: bool,
    /// エージェントのソケットを置くディレクトリ
    pub socket_dir: PathBuf,
    /// `LD_PRELOAD`するエージェントライブラリ
    pub agent_library: PathBuf,
    /// デバイス名
    pub device: String,
    /// 子プロセスにもペイロードを読み込む
    pub child_gating: bool,
    /// エージェントへの接続待ちの上限
    pub connect_timeout: Duration,
    /// ペイロード読み込みの返事待ちの上限
    pub load_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            payload_dir: base_dir.join("payload"),
            base_dir,
            payload_package: None,
            release: false,
            socket_dir: std::env::temp_dir(),
            agent_library: default_agent_library(),
            device: "local".to_string(),
            child_gating: false,
            connect_timeout: Duration::from_secs(10),
            load_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// `base_dir`基準で絶対パスにする
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// 実行ファイルと同じディレクトリのエージェントライブラリ
fn default_agent_library() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(AGENT_LIBRARY_NAME)))
        .unwrap_or_else(|| PathBuf::from(AGENT_LIBRARY_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_paths() {
        let config = Config {
            base_dir: PathBuf::from("/work"),
            ..Config::default()
        };
        assert_eq!(config.resolve(Path::new("payload")), PathBuf::from("/work/payload"));
        assert_eq!(config.resolve(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn test_default_agent_library_name() {
        let config = Config::default();
        assert!(config.agent_library.ends_with(AGENT_LIBRARY_NAME));
        assert_eq!(config.device, "local");
    }
}

//! ペイロードのビルドとソース監視

use crate::errors::BuildError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use tokio::process::Command;
use walkdir::WalkDir;

/// ビルドの経過
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Started,
    Succeeded { artifact: PathBuf },
    Failed { message: String },
}

/// ペイロードのビルダー
#[async_trait]
pub trait Builder: Send + Sync {
    /// ビルドして成果物（共有ライブラリ）のパスを返す
    async fn build(&self) -> Result<PathBuf, BuildError>;
    /// 監視対象のディレクトリ
    fn source_roots(&self) -> Vec<PathBuf>;
}

/// `cargo build`でcdylibをビルドする
#[derive(Debug, Clone)]
pub struct CargoBuilder {
    project_dir: PathBuf,
    package: Option<String>,
    release: bool,
}

/// `--message-format=json`の1行（必要なフィールドだけ）
#[derive(Debug, Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    target: Option<CargoTarget>,
    #[serde(default)]
    filenames: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CargoTarget {
    #[serde(default)]
    kind: Vec<String>,
}

impl CargoBuilder {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            package: None,
            release: false,
        }
    }

    pub fn with_package(mut self, package: Option<String>) -> Self {
        self.package = package;
        self
    }

    pub fn with_release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("cargo");
        cmd.arg("build")
            .arg("--message-format=json-render-diagnostics")
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(package) = &self.package {
            cmd.arg("-p").arg(package);
        }
        if self.release {
            cmd.arg("--release");
        }
        cmd
    }
}

/// cargoの出力から最後のcdylib成果物を探す
fn find_cdylib(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .filter(|msg| msg.reason == "compiler-artifact")
        .filter(|msg| {
            msg.target
                .as_ref()
                .is_some_and(|t| t.kind.iter().any(|k| k == "cdylib"))
        })
        .flat_map(|msg| msg.filenames)
        .filter(|path| path.extension().is_some_and(|ext| ext == "so"))
        .last()
}

#[async_trait]
impl Builder for CargoBuilder {
    async fn build(&self) -> Result<PathBuf, BuildError> {
        tracing::info!("[+] building payload in {:?}", self.project_dir);
        let output = self.command().output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Failed(stderr.trim_end().to_string()));
        }

        find_cdylib(&stdout).ok_or(BuildError::NoArtifact)
    }

    fn source_roots(&self) -> Vec<PathBuf> {
        vec![self.project_dir.clone()]
    }
}

/// 更新時刻のポーリングによるソース監視
pub struct SourceWatcher {
    roots: Vec<PathBuf>,
    snapshot: HashMap<PathBuf, SystemTime>,
}

impl SourceWatcher {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let mut watcher = Self {
            roots,
            snapshot: HashMap::new(),
        };
        watcher.snapshot = watcher.scan();
        watcher
    }

    fn is_source(path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some("Cargo.toml") => true,
            Some(name) => name.ends_with(".rs"),
            None => false,
        }
    }

    fn scan(&self) -> HashMap<PathBuf, SystemTime> {
        let mut files = HashMap::new();
        for root in &self.roots {
            let walker = WalkDir::new(root)
                .into_iter()
                .filter_entry(|e| e.file_name() != "target" && e.file_name() != ".git");
            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() || !Self::is_source(entry.path()) {
                    continue;
                }
                if let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) {
                    files.insert(entry.path().to_path_buf(), modified);
                }
            }
        }
        files
    }

    /// 前回から変化したファイル（追加・削除を含む）
    pub fn poll(&mut self) -> Vec<PathBuf> {
        let current = self.scan();
        let mut changed: Vec<PathBuf> = current
            .iter()
            .filter(|(path, time)| self.snapshot.get(*path) != Some(*time))
            .map(|(path, _)| path.clone())
            .chain(
                self.snapshot
                    .keys()
                    .filter(|path| !current.contains_key(*path))
                    .cloned(),
            )
            .collect();
        changed.sort();
        self.snapshot = current;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn test_find_cdylib_in_cargo_output() {
        let stdout = r#"{"reason":"compiler-artifact","target":{"kind":["lib"]},"filenames":["/t/libdep.rlib"]}
{"reason":"compiler-artifact","target":{"kind":["cdylib"]},"filenames":["/t/debug/libpayload.so"]}
{"reason":"build-finished","success":true}"#;
        assert_eq!(
            find_cdylib(stdout),
            Some(PathBuf::from("/t/debug/libpayload.so"))
        );
        assert_eq!(find_cdylib("not json"), None);
    }

    #[test]
    fn test_builder_command_flags() {
        let builder = CargoBuilder::new("/p")
            .with_package(Some("hooks".to_string()))
            .with_release(true);
        let cmd = builder.command();
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "build",
                "--message-format=json-render-diagnostics",
                "-p",
                "hooks",
                "--release"
            ]
        );
    }

    #[test]
    fn test_watcher_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(src.join("lib.rs"), "fn a() {}").unwrap();

        let mut watcher = SourceWatcher::new(vec![dir.path().to_path_buf()]);
        assert!(watcher.poll().is_empty());

        // ビルド成果物とソース以外は無視する
        fs::write(dir.path().join("target/out.rs"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert!(watcher.poll().is_empty());

        std::thread::sleep(Duration::from_millis(20));
        fs::write(src.join("hooks.rs"), "fn b() {}").unwrap();
        assert_eq!(watcher.poll(), vec![src.join("hooks.rs")]);

        fs::remove_file(src.join("lib.rs")).unwrap();
        assert_eq!(watcher.poll(), vec![src.join("lib.rs")]);
    }
}

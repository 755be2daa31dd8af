//! ファイル自動発見機能
//!
//! 規約ベースのディレクトリ構造から宣言ファイルを発見します。
//!
//! ```text
//! my-infra/
//! ├── sky.kdl            # ルート（project / variables / stack）
//! ├── stacks/**/*.kdl    # スタック定義
//! ├── variables/**/*.kdl # 変数定義
//! ├── sky.local.kdl      # ローカルオーバーライド
//! └── .env
//! ```

use crate::error::{FlowError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// ルートファイル名
pub const ROOT_FILE: &str = "sky.kdl";
/// プロジェクト固有ファイルを置くディレクトリ
pub const PROJECT_DIR: &str = ".skyflow";

/// 発見されたファイル群
#[derive(Debug, Clone, Default)]
pub struct DiscoveredFiles {
    /// ルートファイル (sky.kdl)
    pub root: Option<PathBuf>,
    /// スタック定義ファイル (stacks/**/*.kdl)
    pub stacks: Vec<PathBuf>,
    /// 変数定義ファイル (variables/**/*.kdl)
    pub variables: Vec<PathBuf>,
    /// ローカルオーバーライドファイル (sky.local.kdl)
    pub local_override: Option<PathBuf>,
    /// 環境変数ファイル (.env)
    pub env_file: Option<PathBuf>,
}

impl DiscoveredFiles {
    /// 読み込み順に並べたKDLファイル
    ///
    /// variables → ルート → stacks → ローカルオーバーライド
    pub fn kdl_files(&self) -> Vec<PathBuf> {
        let mut files = self.variables.clone();
        files.extend(self.root.iter().cloned());
        files.extend(self.stacks.iter().cloned());
        files.extend(self.local_override.iter().cloned());
        files
    }
}

/// プロジェクトルートを検出
///
/// 1. 環境変数 SKYFLOW_PROJECT_ROOT
/// 2. カレントディレクトリから上に向かって sky.kdl / .skyflow/sky.kdl を探す
#[tracing::instrument]
pub fn find_project_root() -> Result<PathBuf> {
    if let Ok(root) = std::env::var("SKYFLOW_PROJECT_ROOT") {
        let path = PathBuf::from(&root);
        debug!(env_root = %root, "Checking SKYFLOW_PROJECT_ROOT");
        if has_root_file(&path) {
            info!(project_root = %path.display(), "Found project root from environment variable");
            return Ok(path);
        }
    }

    find_project_root_from(&std::env::current_dir()?)
}

/// 指定ディレクトリから上に向かってプロジェクトルートを探す
pub fn find_project_root_from(start_dir: &Path) -> Result<PathBuf> {
    let mut current = start_dir.to_path_buf();
    debug!(start_dir = %start_dir.display(), "Searching for project root");

    loop {
        if has_root_file(&current) {
            info!(project_root = %current.display(), "Found project root");
            return Ok(current);
        }
        if !current.pop() {
            break;
        }
    }

    warn!(start_dir = %start_dir.display(), "Project root not found");
    Err(FlowError::ProjectRootNotFound(start_dir.to_path_buf()))
}

fn has_root_file(dir: &Path) -> bool {
    dir.join(ROOT_FILE).exists() || dir.join(PROJECT_DIR).join(ROOT_FILE).exists()
}

/// `name` または `.skyflow/name` のうち存在する方
fn project_file(project_root: &Path, name: &str) -> Option<PathBuf> {
    [
        project_root.join(name),
        project_root.join(PROJECT_DIR).join(name),
    ]
    .into_iter()
    .find(|p| p.exists())
}

/// プロジェクトルートからファイルを自動発見
#[tracing::instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn discover_files(project_root: &Path) -> Result<DiscoveredFiles> {
    debug!("Starting file discovery");

    let discovered = DiscoveredFiles {
        root: project_file(project_root, ROOT_FILE),
        stacks: discover_kdl_files(&project_root.join("stacks"))?,
        variables: discover_kdl_files(&project_root.join("variables"))?,
        local_override: project_file(project_root, "sky.local.kdl"),
        env_file: project_file(project_root, ".env"),
    };

    info!(
        stack_file_count = discovered.stacks.len(),
        variable_file_count = discovered.variables.len(),
        has_local_override = discovered.local_override.is_some(),
        "Discovered project files"
    );

    Ok(discovered)
}

/// ディレクトリ配下の .kdl ファイルをアルファベット順で返す
fn discover_kdl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = dir.join("**").join("*.kdl");
    let pattern = pattern.to_str().ok_or_else(|| FlowError::DiscoveryError {
        path: dir.to_path_buf(),
        message: "パスがUTF-8ではありません".to_string(),
    })?;

    let entries = glob::glob(pattern).map_err(|e| FlowError::DiscoveryError {
        path: dir.to_path_buf(),
        message: format!("globパターンが不正です: {}", e),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path");
            }
        }
    }
    files.sort();

    Ok(files)
}

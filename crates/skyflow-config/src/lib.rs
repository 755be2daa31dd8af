pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 既定の並列度
pub const DEFAULT_PARALLELISM: usize = 4;

const SETTINGS_FILE: &str = "config.yaml";
const DECLARATION_CANDIDATES: [&str; 2] = ["sky.local.kdl", "sky.kdl"];

/// SkyFlowの設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("skyflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// sky.kdl を探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 SKYFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: sky.local.kdl, sky.kdl
/// 3. ./.skyflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/skyflow/sky.kdl (グローバル設定)
pub fn find_declaration_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("SKYFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    if let Some(path) = find_in(&current_dir) {
        return Ok(path);
    }

    let project_dir = current_dir.join(".skyflow");
    if project_dir.is_dir()
        && let Some(path) = find_in(&project_dir)
    {
        return Ok(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("skyflow").join("sky.kdl");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::DeclarationNotFound)
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    DECLARATION_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// 実行設定（config.yaml）
///
/// ```yaml
/// parallelism: 8
/// state_dir: /var/lib/skyflow
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 同時に実行するプロバイダー呼び出しの上限
    pub parallelism: usize,
    /// 状態ファイルの置き場所（未指定ならプロジェクトの .skyflow/）
    pub state_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            state_dir: None,
        }
    }
}

/// 部分的な設定（後から読んだファイルが上書き）
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    parallelism: Option<usize>,
    state_dir: Option<PathBuf>,
}

impl Settings {
    /// グローバル設定とプロジェクト設定を重ねて読み込む
    ///
    /// `~/.config/skyflow/config.yaml` → `<project>/.skyflow/config.yaml` の順に上書きします。
    pub fn load(project_root: Option<&Path>) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("skyflow").join(SETTINGS_FILE));
        }
        if let Some(root) = project_root {
            paths.push(root.join(".skyflow").join(SETTINGS_FILE));
        }
        Self::load_layers(&paths)
    }

    /// 指定したファイルを順に重ねて読み込む（存在しないファイルは無視）
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut settings = Settings::default();
        for path in paths {
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            let layer: SettingsFile = if content.trim().is_empty() {
                SettingsFile::default()
            } else {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidSettings {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            };

            if let Some(parallelism) = layer.parallelism {
                settings.parallelism = parallelism;
            }
            if let Some(state_dir) = layer.state_dir {
                settings.state_dir = Some(state_dir);
            }
            tracing::debug!(path = %path.display(), "Loaded settings");
        }

        if settings.parallelism == 0 {
            tracing::warn!("parallelism: 0 は無効なため 1 として扱います");
            settings.parallelism = 1;
        }
        Ok(settings)
    }

    /// 状態ディレクトリ（未設定ならプロジェクトの .skyflow/）
    pub fn state_dir_for(&self, project_root: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| project_root.join(".skyflow"))
    }
}

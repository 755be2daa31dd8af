use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "宣言ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: sky.local.kdl, sky.kdl\n\
        - ./.skyflow/ ディレクトリ\n\
        - ~/.config/skyflow/sky.kdl\n\
        または SKYFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    DeclarationNotFound,

    #[error("設定ファイルの形式が不正です: {path}\n理由: {message}")]
    InvalidSettings { path: PathBuf, message: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

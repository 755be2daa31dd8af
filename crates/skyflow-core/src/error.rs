use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("テンプレートエラー: {file}\n理由: {message}")]
    TemplateError { file: PathBuf, message: String },

    #[error("テンプレート展開エラー: {0}")]
    TemplateRenderError(String),

    #[error("ファイル発見エラー: {path}\n理由: {message}")]
    DiscoveryError { path: PathBuf, message: String },

    #[error(
        "プロジェクトルートが見つかりません\n探索開始位置: {0}\nヒント: sky.kdl ファイルを含むディレクトリで実行してください"
    )]
    ProjectRootNotFound(PathBuf),

    #[error("未知のリソース種別: {0}")]
    UnknownKind(String),

    #[error("未知の値型: {0}")]
    UnknownValueType(String),

    #[error("不正な参照式: {0}（形式: Node.output または Stack/Node.output）")]
    InvalidReference(String),

    #[error("スタックが重複しています: {0}")]
    DuplicateStack(String),

    #[error("リソースが重複しています: {0}")]
    DuplicateNode(String),

    #[error("スタック '{stack}' にリソース '{node}' が見つかりません")]
    NodeNotFound { stack: String, node: String },

    #[error("スタックが見つかりません: {0}")]
    StackNotFound(String),

    #[error("出力は既に確定しています: {0}")]
    OutputsAlreadySet(String),

    #[error("リソース '{producer}' は出力 '{output}' を返していません")]
    MissingOutput { producer: String, output: String },
}

pub type Result<T> = std::result::Result<T, FlowError>;

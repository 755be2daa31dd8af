use skyflow_cloud::CloudError;
use skyflow_core::ValueType;
use thiserror::Error;

/// 宣言の不整合
///
/// リソースを1つも作成する前に検出され、実行全体を中止します。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("循環依存を検出しました: {}", .members.join(" → "))]
    CyclicDependency { members: Vec<String> },

    #[error("参照先が存在しません: {consumer} の {input} → {target}")]
    BrokenReference {
        consumer: String,
        input: String,
        target: String,
    },

    #[error("スタック '{stack}' はエクスポート '{export}' を持っていません（{consumer} が要求）")]
    UnknownExport {
        stack: String,
        export: String,
        consumer: String,
    },

    #[error("リソース '{producer}' ({kind}) は出力 '{output}' を宣言していません")]
    UnknownOutput {
        producer: String,
        kind: String,
        output: String,
    },

    #[error(
        "型が一致しません: {producer} は {produced} を出力しますが、{consumer} の {input} は {expected} を要求しています"
    )]
    TypeMismatch {
        producer: String,
        produced: ValueType,
        consumer: String,
        input: String,
        expected: ValueType,
    },

    #[error("不正な入力 {node} の {input}: {reason}")]
    InvalidInput {
        node: String,
        input: String,
        reason: String,
    },

    #[error("必須入力がありません: {node} の {input}")]
    MissingInput { node: String, input: String },

    #[error("スタック '{stack}' の入力 '{input}' に値がありません（from= かパラメータが必要です）")]
    MissingParameter { stack: String, input: String },

    #[error("スタックが見つかりません: {0}")]
    UnknownStack(String),

    #[error("スタックが重複しています: {0}")]
    DuplicateStack(String),

    #[error("リソースが重複しています: {0}")]
    DuplicateNode(String),
}

/// エンジンのエラー
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// 実行中に出力を解決できなかった（未確定、または記録済み出力に無い）
    #[error("未解決の参照: {consumer} の {input} ← {producer}.{output}")]
    UnresolvedReference {
        producer: String,
        output: String,
        consumer: String,
        input: String,
    },

    #[error("スタック '{0}' は別の実行がロックしています")]
    StackLocked(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("内部エラー: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

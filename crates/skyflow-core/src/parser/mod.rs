//! KDLパーサー
//!
//! SkyFlowのKDL宣言ファイルをパースして `Deployment` を組み立てます。
//! 各ノードタイプのパース処理はモジュールに分離されています。

mod resource;
mod stack;

use stack::parse_stack;

// 外部クレートから再利用可能なパース関数
pub use resource::parse_resource;

use crate::error::{FlowError, Result};
use crate::model::Deployment;
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::fs;
use std::path::Path;

/// KDLファイルをパースしてDeploymentを生成
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<Deployment> {
    let content = fs::read_to_string(path.as_ref())?;
    let name = path
        .as_ref()
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    parse_kdl_string(&content, name)
}

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str, default_name: String) -> Result<Deployment> {
    let doc: KdlDocument = content.parse()?;
    let mut deployment = Deployment::new(default_name);

    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if let Some(project_name) = first_string(node) {
                    deployment.name = project_name.to_string();
                }
            }
            "stack" => {
                let (stack, parameters) = parse_stack(node)?;
                let stack_name = stack.name.clone();
                deployment.add_stack(stack)?;
                for (input, value) in parameters {
                    deployment.set_parameter(&stack_name, input, value);
                }
            }
            "variables" => {
                // テンプレート展開時に処理済み
            }
            _ => {
                // 不明なノードはスキップ
            }
        }
    }

    Ok(deployment)
}

/// プロパティ値を取得
pub(crate) fn prop<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_some_and(|n| n.value() == key))
        .map(|e| e.value())
}

/// 位置引数を列挙
pub(crate) fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

/// 最初の位置引数を文字列として取得
pub(crate) fn first_string(node: &KdlNode) -> Option<&str> {
    args(node).next().and_then(|v| v.as_string())
}

/// KDL値をJSON値に変換
///
/// 整数は i64 に収まらない場合エラーです。
pub(crate) fn kdl_value_to_json(value: &KdlValue) -> Result<serde_json::Value> {
    if let Some(s) = value.as_string() {
        Ok(serde_json::Value::String(s.to_string()))
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(|n| serde_json::Value::Number(n.into()))
            .map_err(|_| FlowError::InvalidConfig(format!("整数値が範囲外です: {}", i)))
    } else if let Some(f) = value.as_float() {
        Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null))
    } else if let Some(b) = value.as_bool() {
        Ok(serde_json::Value::Bool(b))
    } else {
        Ok(serde_json::Value::Null)
    }
}

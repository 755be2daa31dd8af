//! resource ノードのパース

use super::{args, first_string, kdl_value_to_json, prop};
use crate::error::{FlowError, Result};
use crate::model::{InputValue, NodeId, OutputRef, ResourceKind, ResourceNode};
use kdl::KdlNode;

/// resource ノードをパース
///
/// ```kdl
/// resource "WebServerSG" kind="security-group" {
///     vpc_id ref="MyVPC.vpc_id"
///     description "Security group for Web Servers"
///     ingress 80 443
///     depends-on "ALBSecurityGroup"
/// }
/// ```
pub fn parse_resource(node: &KdlNode, stack: &str) -> Result<ResourceNode> {
    let name = first_string(node)
        .ok_or_else(|| {
            FlowError::InvalidConfig(format!("stack '{}': resource requires a name", stack))
        })?
        .to_string();

    let kind = prop(node, "kind")
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            FlowError::InvalidConfig(format!(
                "resource '{}/{}' requires kind=\"...\"",
                stack, name
            ))
        })?
        .parse::<ResourceKind>()?;

    if kind.is_virtual() {
        return Err(FlowError::InvalidConfig(format!(
            "resource '{}/{}': kind '{}' は宣言できません（input を使用してください）",
            stack, name, kind
        )));
    }

    let mut resource = ResourceNode::new(NodeId::new(stack, &name), kind);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value();
            match key {
                "depends-on" | "depends_on" => {
                    for dep in args(child).filter_map(|v| v.as_string()) {
                        resource.depends_on.push(parse_node_path(dep, stack));
                    }
                }
                _ => {
                    let value = parse_input_value(child, stack).ok_or_else(|| {
                        FlowError::InvalidConfig(format!(
                            "resource '{}/{}': input '{}' has no value",
                            stack, name, key
                        ))
                    })??;
                    let value = match value {
                        InputValue::Literal(v) => InputValue::Literal(kind.coerce_input(key, v)),
                        other => other,
                    };
                    if resource.inputs.insert(key.to_string(), value).is_some() {
                        return Err(FlowError::InvalidConfig(format!(
                            "resource '{}/{}': input '{}' が重複しています",
                            stack, name, key
                        )));
                    }
                }
            }
        }
    }

    Ok(resource)
}

/// 入力値をパース
///
/// - `key ref="Node.output"` → 参照
/// - `key input="name"` → スタック入力
/// - `key "value"` → リテラル
/// - `key "a" "b"` → リスト
fn parse_input_value(node: &KdlNode, stack: &str) -> Option<Result<InputValue>> {
    if let Some(expr) = prop(node, "ref").and_then(|v| v.as_string()) {
        return Some(OutputRef::parse(expr, stack).map(InputValue::Reference));
    }
    if let Some(input) = prop(node, "input").and_then(|v| v.as_string()) {
        return Some(Ok(InputValue::StackInput(input.to_string())));
    }

    let values: Vec<serde_json::Value> = match args(node).map(kdl_value_to_json).collect() {
        Ok(values) => values,
        Err(e) => return Some(Err(e)),
    };
    match values.len() {
        0 => None,
        1 => values.into_iter().next().map(|v| Ok(InputValue::Literal(v))),
        _ => Some(Ok(InputValue::Literal(serde_json::Value::Array(values)))),
    }
}

/// `Node` または `Stack/Node` をノードIDに変換
fn parse_node_path(path: &str, stack: &str) -> NodeId {
    match path.split_once('/') {
        Some((other_stack, node)) => NodeId::new(other_stack, node),
        None => NodeId::new(stack, path),
    }
}

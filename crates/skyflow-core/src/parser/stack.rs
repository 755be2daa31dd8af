//! stack ノードのパース

use super::{args, first_string, kdl_value_to_json, prop};
use crate::error::{FlowError, Result};
use crate::model::{ImportSource, OutputRef, Stack, ValueType};
use kdl::KdlNode;
use serde_json::Value;

use super::resource::parse_resource;

/// stack ノードをパース
///
/// `input ... value=` で与えられたパラメータも合わせて返します。
pub fn parse_stack(node: &KdlNode) -> Result<(Stack, Vec<(String, Value)>)> {
    let name = first_string(node)
        .ok_or_else(|| FlowError::InvalidConfig("stack requires a name".to_string()))?
        .to_string();

    let region = prop(node, "region")
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            FlowError::InvalidConfig(format!("stack '{}' requires region=\"...\"", name))
        })?
        .to_string();

    let mut stack = Stack::new(&name, region);
    stack.account = prop(node, "account")
        .and_then(|v| v.as_string())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let mut parameters = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "description" => {
                    stack.description = first_string(child).map(|s| s.to_string());
                }
                "depends-on" | "depends_on" => {
                    for dep in args(child).filter_map(|v| v.as_string()) {
                        stack.add_dependency(dep);
                    }
                }
                "resource" => {
                    let resource = parse_resource(child, &name)?;
                    stack.add_node(resource)?;
                }
                "input" => {
                    let (input_name, value_type, from, value) = parse_input(child, &name)?;
                    stack.require_input(&input_name, value_type, from);
                    if let Some(value) = value {
                        parameters.push((input_name, value));
                    }
                }
                "export" => {
                    let export_name = first_string(child)
                        .ok_or_else(|| {
                            FlowError::InvalidConfig(format!(
                                "stack '{}': export requires a name",
                                name
                            ))
                        })?
                        .to_string();
                    let expr = prop(child, "ref").and_then(|v| v.as_string()).ok_or_else(|| {
                        FlowError::InvalidConfig(format!(
                            "stack '{}': export '{}' requires ref=\"Node.output\"",
                            name, export_name
                        ))
                    })?;
                    let reference = OutputRef::parse(expr, &name)?;
                    stack.export_output(export_name, &reference.node, reference.output)?;
                }
                other => {
                    tracing::warn!(stack = %name, node = other, "Unknown node in stack, skipping");
                }
            }
        }
    }

    Ok((stack, parameters))
}

/// input ノードをパース
///
/// ```kdl
/// input "certificate_arn" type="string" from="AcmStack" export="certificate_arn"
/// input "domain_name" type="domain" value="example.com"
/// ```
fn parse_input(
    node: &KdlNode,
    stack: &str,
) -> Result<(String, ValueType, Option<ImportSource>, Option<Value>)> {
    let name = first_string(node)
        .ok_or_else(|| FlowError::InvalidConfig(format!("stack '{}': input requires a name", stack)))?
        .to_string();

    let value_type = match prop(node, "type").and_then(|v| v.as_string()) {
        Some(t) => t.parse::<ValueType>()?,
        None => ValueType::String,
    };

    let from = prop(node, "from")
        .and_then(|v| v.as_string())
        .map(|from_stack| ImportSource {
            stack: from_stack.to_string(),
            export: prop(node, "export")
                .and_then(|v| v.as_string())
                .unwrap_or(&name)
                .to_string(),
        });

    let value = prop(node, "value").map(kdl_value_to_json).transpose()?;

    if from.is_some() && value.is_some() {
        return Err(FlowError::InvalidConfig(format!(
            "stack '{}': input '{}' cannot have both from= and value=",
            stack, name
        )));
    }

    Ok((name, value_type, from, value))
}

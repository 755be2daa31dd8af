//! リソース種別と値型
//!
//! リソース種別は閉じた列挙型で、種別ごとに入力スキーマと出力を宣言します。
//! 実際の作成処理（materialize）はプロバイダー側の責務です。

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// 入力・出力の値型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Integer,
    Bool,
    /// IPv4 CIDR（10.0.0.0/16）
    Cidr,
    /// ドメイン名（example.com, *.example.com）
    Domain,
    List,
    /// 任意の型（仮想入力ノードの出力など）
    Any,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Bool => "bool",
            ValueType::Cidr => "cidr",
            ValueType::Domain => "domain",
            ValueType::List => "list",
            ValueType::Any => "any",
        }
    }

    /// `producer` 型の値をこの型の入力に渡せるか
    ///
    /// ドメイン名は文字列として受け取れるが、逆は不可。
    /// リスト入力は文字列1つを要素1つのリストとして受け取れます。
    pub fn accepts(&self, producer: ValueType) -> bool {
        *self == producer
            || *self == ValueType::Any
            || producer == ValueType::Any
            || (*self == ValueType::String && producer == ValueType::Domain)
            || (*self == ValueType::List
                && matches!(producer, ValueType::String | ValueType::Domain))
    }

    /// リスト型に単一値が渡された場合は要素1つのリストにする
    pub fn coerce(&self, value: Value) -> Value {
        match value {
            Value::Array(_) | Value::Null => value,
            scalar if *self == ValueType::List => Value::Array(vec![scalar]),
            other => other,
        }
    }

    /// リテラル値の型と書式を検証
    ///
    /// 不正な場合は理由を返します。
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match (self, value) {
            (ValueType::Any, _) => Ok(()),
            (ValueType::String, Value::String(_)) => Ok(()),
            (ValueType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (ValueType::Bool, Value::Bool(_)) => Ok(()),
            (ValueType::List, Value::Array(_)) => Ok(()),
            (ValueType::Cidr, Value::String(s)) => validate_cidr(s),
            (ValueType::Domain, Value::String(s)) => validate_domain(s),
            (expected, actual) => Err(format!(
                "{} が必要ですが {} が指定されています",
                expected.as_str(),
                json_type_name(actual)
            )),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" | "str" => Ok(ValueType::String),
            "integer" | "int" => Ok(ValueType::Integer),
            "bool" | "boolean" => Ok(ValueType::Bool),
            "cidr" => Ok(ValueType::Cidr),
            "domain" => Ok(ValueType::Domain),
            "list" => Ok(ValueType::List),
            "any" => Ok(ValueType::Any),
            other => Err(FlowError::UnknownValueType(other.to_string())),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn validate_cidr(s: &str) -> std::result::Result<(), String> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| format!("CIDR 形式ではありません: {s}"))?;
    addr.parse::<Ipv4Addr>()
        .map_err(|_| format!("IPv4 アドレスが不正です: {addr}"))?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(format!("プレフィックス長が不正です: {prefix}")),
    }
}

fn validate_domain(s: &str) -> std::result::Result<(), String> {
    if s.is_empty() || s.len() > 253 {
        return Err(format!("ドメイン名の長さが不正です: {s:?}"));
    }
    for (i, label) in s.split('.').enumerate() {
        if i == 0 && label == "*" {
            continue;
        }
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(format!("ドメイン名のラベルが不正です: {label:?}"));
        }
    }
    Ok(())
}

/// 入力スキーマ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub name: &'static str,
    pub value_type: ValueType,
    pub required: bool,
}

/// 出力スキーマ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: &'static str,
    pub value_type: ValueType,
}

const fn req(name: &'static str, value_type: ValueType) -> InputSpec {
    InputSpec {
        name,
        value_type,
        required: true,
    }
}

const fn opt(name: &'static str, value_type: ValueType) -> InputSpec {
    InputSpec {
        name,
        value_type,
        required: false,
    }
}

const fn out(name: &'static str, value_type: ValueType) -> OutputSpec {
    OutputSpec { name, value_type }
}

use ValueType::{Any, Bool, Cidr, Domain, Integer, List, String as Str};

/// リソース種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// 既存ホストゾーンの参照
    HostedZoneLookup,
    /// DNS 検証付き証明書
    Certificate,
    Vpc,
    SecurityGroup,
    DatabaseInstance,
    LaunchTemplate,
    AutoScalingGroup,
    LoadBalancer,
    TargetGroup,
    Listener,
    /// CDN ディストリビューション
    Distribution,
    DnsRecord,
    /// スタックの必須入力を保持する仮想ノード
    StackInput,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 13] = [
        ResourceKind::HostedZoneLookup,
        ResourceKind::Certificate,
        ResourceKind::Vpc,
        ResourceKind::SecurityGroup,
        ResourceKind::DatabaseInstance,
        ResourceKind::LaunchTemplate,
        ResourceKind::AutoScalingGroup,
        ResourceKind::LoadBalancer,
        ResourceKind::TargetGroup,
        ResourceKind::Listener,
        ResourceKind::Distribution,
        ResourceKind::DnsRecord,
        ResourceKind::StackInput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::HostedZoneLookup => "hosted-zone-lookup",
            ResourceKind::Certificate => "certificate",
            ResourceKind::Vpc => "vpc",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::DatabaseInstance => "database-instance",
            ResourceKind::LaunchTemplate => "launch-template",
            ResourceKind::AutoScalingGroup => "auto-scaling-group",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::Listener => "listener",
            ResourceKind::Distribution => "distribution",
            ResourceKind::DnsRecord => "dns-record",
            ResourceKind::StackInput => "stack-input",
        }
    }

    /// プロバイダーを呼ばずにエンジン内で確定する種別か
    pub fn is_virtual(&self) -> bool {
        matches!(self, ResourceKind::StackInput)
    }

    /// 入力スキーマ
    pub fn inputs(&self) -> &'static [InputSpec] {
        match self {
            ResourceKind::HostedZoneLookup => const { &[req("domain_name", Domain)] },
            ResourceKind::Certificate => const {
                &[
                    req("domain_name", Domain),
                    req("hosted_zone_id", Str),
                    opt("validation", Str),
                ]
            },
            ResourceKind::Vpc => const {
                &[
                    req("cidr", Cidr),
                    opt("max_azs", Integer),
                    opt("subnets", List),
                ]
            },
            ResourceKind::SecurityGroup => const {
                &[
                    req("vpc_id", Str),
                    opt("description", Str),
                    opt("allow_all_outbound", Bool),
                    opt("ingress", List),
                    opt("ingress_from", Str),
                ]
            },
            ResourceKind::DatabaseInstance => const {
                &[
                    req("vpc_id", Str),
                    req("security_group_id", Str),
                    req("engine", Str),
                    opt("instance_type", Str),
                    opt("multi_az", Bool),
                    opt("allocated_storage", Integer),
                    opt("storage_type", Str),
                    opt("subnets", List),
                ]
            },
            ResourceKind::LaunchTemplate => const {
                &[
                    req("security_group_id", Str),
                    opt("instance_type", Str),
                    opt("machine_image", Str),
                ]
            },
            ResourceKind::AutoScalingGroup => const {
                &[
                    req("vpc_id", Str),
                    req("launch_template_id", Str),
                    opt("min_capacity", Integer),
                    opt("max_capacity", Integer),
                    opt("desired_capacity", Integer),
                    opt("subnets", List),
                    opt("target_cpu_percent", Integer),
                ]
            },
            ResourceKind::LoadBalancer => const {
                &[
                    req("vpc_id", Str),
                    req("security_group_id", Str),
                    opt("internet_facing", Bool),
                ]
            },
            ResourceKind::TargetGroup => const {
                &[
                    req("vpc_id", Str),
                    opt("port", Integer),
                    opt("protocol", Str),
                    opt("target_group_name", Str),
                    opt("health_check_path", Str),
                    // 登録先（Auto Scaling グループ名など）
                    opt("targets", List),
                ]
            },
            ResourceKind::Listener => const {
                &[
                    req("load_balancer_arn", Str),
                    req("target_group_arn", Str),
                    opt("port", Integer),
                    opt("certificate_arn", Str),
                ]
            },
            ResourceKind::Distribution => const {
                &[
                    req("origin_domain", Domain),
                    req("certificate_arn", Str),
                    opt("domain_names", List),
                    opt("default_root_object", Str),
                    opt("viewer_protocol_policy", Str),
                ]
            },
            ResourceKind::DnsRecord => const {
                &[
                    req("hosted_zone_id", Str),
                    req("record_name", Str),
                    req("target", Domain),
                    opt("record_type", Str),
                ]
            },
            ResourceKind::StackInput => const { &[req("value", Any)] },
        }
    }

    /// 出力スキーマ
    pub fn outputs(&self) -> &'static [OutputSpec] {
        match self {
            ResourceKind::HostedZoneLookup => const {
                &[out("hosted_zone_id", Str), out("zone_name", Domain)]
            },
            ResourceKind::Certificate => const { &[out("certificate_arn", Str)] },
            ResourceKind::Vpc => const {
                &[
                    out("vpc_id", Str),
                    out("public_subnet_ids", List),
                    out("private_subnet_ids", List),
                ]
            },
            ResourceKind::SecurityGroup => const { &[out("security_group_id", Str)] },
            ResourceKind::DatabaseInstance => const {
                &[
                    out("endpoint_address", Str),
                    out("endpoint_port", Integer),
                    out("instance_id", Str),
                ]
            },
            ResourceKind::LaunchTemplate => const { &[out("launch_template_id", Str)] },
            ResourceKind::AutoScalingGroup => const { &[out("group_name", Str)] },
            ResourceKind::LoadBalancer => const {
                &[out("load_balancer_arn", Str), out("dns_name", Domain)]
            },
            ResourceKind::TargetGroup => const { &[out("target_group_arn", Str)] },
            ResourceKind::Listener => const { &[out("listener_arn", Str)] },
            ResourceKind::Distribution => const {
                &[out("distribution_id", Str), out("domain_name", Domain)]
            },
            ResourceKind::DnsRecord => const { &[out("fqdn", Domain)] },
            ResourceKind::StackInput => const { &[out("value", Any)] },
        }
    }

    pub fn input(&self, name: &str) -> Option<&'static InputSpec> {
        self.inputs().iter().find(|spec| spec.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&'static OutputSpec> {
        self.outputs().iter().find(|spec| spec.name == name)
    }

    /// 入力スロットの型に合わせて値を整える（未知の入力はそのまま）
    pub fn coerce_input(&self, name: &str, value: Value) -> Value {
        match self.input(name) {
            Some(spec) => spec.value_type.coerce(value),
            None => value,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| FlowError::UnknownKind(s.to_string()))
    }
}

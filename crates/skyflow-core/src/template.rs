//! テンプレート展開機能
//!
//! Teraを使用して宣言ファイルを展開してからKDLとしてパースします。
//! 変数は `variables { ... }` ブロック、`.env` ファイル、許可された環境変数から供給されます。

use crate::error::{FlowError, Result};
use crate::parser::kdl_value_to_json;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tera::{Context, Tera};
use tracing::{debug, info};

/// テンプレートに公開する環境変数のプレフィックス
const ALLOWED_ENV_PREFIXES: &[&str] = &["SKY_", "AWS_", "CI_"];

/// 変数コンテキスト
pub type Variables = HashMap<String, serde_json::Value>;

/// テンプレートプロセッサ
pub struct TemplateProcessor {
    tera: Tera,
    context: Context,
}

impl TemplateProcessor {
    pub fn new() -> Self {
        Self {
            tera: Tera::default(),
            context: Context::new(),
        }
    }

    pub fn add_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), &value);
    }

    pub fn add_variables(&mut self, variables: Variables) {
        for (key, value) in variables {
            self.context.insert(key, &value);
        }
    }

    /// 許可されたプレフィックスの環境変数を追加
    ///
    /// - SKY_*: SkyFlow専用
    /// - AWS_*: アカウント・リージョン指定
    /// - CI_*: CI/CD環境
    #[tracing::instrument(skip(self))]
    pub fn add_env_variables(&mut self) {
        let mut count = 0;

        for (key, value) in std::env::vars() {
            if ALLOWED_ENV_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
            {
                debug!(key = %key, "Adding environment variable");
                self.context.insert(key, &serde_json::Value::String(value));
                count += 1;
            }
        }

        info!(env_var_count = count, "Added filtered environment variables");
    }

    /// .env ファイルの変数を追加
    ///
    /// .env の変数はプレフィックス制限なしで全て読み込まれます。
    #[tracing::instrument(skip(self))]
    pub fn add_env_file_variables(&mut self, env_file_path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(env_file_path).map_err(|e| FlowError::IoError {
            path: env_file_path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut count = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().trim_start_matches("export ").trim();
                let value = strip_quotes(value.trim());
                debug!(key = %key, "Adding variable from .env file");
                self.context
                    .insert(key, &serde_json::Value::String(value.to_string()));
                count += 1;
            }
        }

        info!(
            env_file = %env_file_path.display(),
            variable_count = count,
            "Loaded variables from .env file"
        );

        Ok(())
    }

    /// 文字列をテンプレートとして展開
    pub fn render_str(&mut self, template: &str) -> Result<String> {
        self.tera
            .render_str(template, &self.context)
            .map_err(|e| FlowError::TemplateRenderError(extract_tera_error_detail(&e)))
    }

    /// ファイルを読み込んでテンプレート展開
    pub fn render_file(&mut self, path: &Path) -> Result<String> {
        let content = std::fs::read_to_string(path).map_err(|e| FlowError::IoError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        self.render_str(&content).map_err(|e| match e {
            FlowError::TemplateRenderError(message) => FlowError::TemplateError {
                file: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// 複数のファイルを順に展開して結合
    pub fn render_files(&mut self, paths: &[impl AsRef<Path>]) -> Result<String> {
        let mut result = String::new();
        for path in paths {
            result.push_str(&self.render_file(path.as_ref())?);
            result.push('\n');
        }
        Ok(result)
    }
}

impl Default for TemplateProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// `variables { ... }` ブロックから変数定義を抽出
///
/// テンプレート展開前の内容には `{{ ... }}` が含まれ得るため、
/// 文書全体ではなくブロックの中身だけをKDLとしてパースします。
/// 同じ変数が複数回定義された場合は後勝ちです。
pub fn extract_variables(kdl_content: &str) -> Result<Variables> {
    let re = Regex::new(r"(?s)variables\s*\{(?P<content>.*?)\}")
        .map_err(|e| FlowError::InvalidConfig(format!("正規表現のコンパイルエラー: {}", e)))?;

    let mut vars = HashMap::new();

    for cap in re.captures_iter(kdl_content) {
        let Some(block) = cap.name("content") else {
            continue;
        };
        let doc: kdl::KdlDocument = block.as_str().parse().map_err(|e| {
            FlowError::InvalidConfig(format!("KDL パースエラー (variables ブロック): {}", e))
        })?;

        for var_node in doc.nodes() {
            if let Some(entry) = var_node.entries().first() {
                vars.insert(
                    var_node.name().value().to_string(),
                    kdl_value_to_json(entry.value())?,
                );
            }
        }
    }

    Ok(vars)
}

/// "value" / 'value' のクォートを除去
fn strip_quotes(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted { &s[1..s.len() - 1] } else { s }
}

/// Teraエラーから利用者向けの詳細を抽出
fn extract_tera_error_detail(e: &tera::Error) -> String {
    use std::error::Error;

    let mut details = vec![e.to_string()];
    let mut source = e.source();
    while let Some(err) = source {
        details.push(err.to_string());
        source = err.source();
    }
    let full_error = details.join(" | ");

    if full_error.contains("not found in context")
        && let Some(start) = full_error.find("Variable `")
        && let Some(end) = full_error[start..].find("` not found")
    {
        let var_name = &full_error[start + 10..start + end];
        return format!(
            "未定義の変数: `{}`\nヒント: variables ブロックで定義するか、.env ファイルに追加してください",
            var_name
        );
    }

    full_error
}

//! 統合ローダー
//!
//! ファイル発見、テンプレート展開、パースを統合

use crate::discovery::{DiscoveredFiles, discover_files, find_project_root};
use crate::error::{FlowError, Result};
use crate::model::Deployment;
use crate::parser::parse_kdl_string;
use crate::template::{TemplateProcessor, Variables, extract_variables};
use std::path::Path;
use tracing::{debug, info, instrument};

/// プロジェクト全体をロードしてDeploymentを生成
///
/// 1. プロジェクトルートの検出
/// 2. ファイルの自動発見
/// 3. 変数の収集
/// 4. テンプレート展開
/// 5. KDLパース（sky.local.kdl は最後にマージ）
#[instrument]
pub fn load_project() -> Result<Deployment> {
    info!("Starting project load");
    let project_root = find_project_root()?;
    load_project_from_root(&project_root)
}

/// 指定されたルートディレクトリからプロジェクトをロード
#[instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn load_project_from_root(project_root: &Path) -> Result<Deployment> {
    debug!("Step 1: Discovering files");
    let discovered = discover_files(project_root)?;
    if discovered.root.is_none() {
        return Err(FlowError::ProjectRootNotFound(project_root.to_path_buf()));
    }

    debug!("Step 2: Preparing template processor");
    let mut processor = prepare_template_processor(&discovered, project_root)?;

    debug!("Step 3: Expanding templates");
    let mut main_files = discovered.variables.clone();
    main_files.extend(discovered.root.iter().cloned());
    main_files.extend(discovered.stacks.iter().cloned());
    let expanded = processor.render_files(&main_files)?;
    info!(
        file_count = main_files.len(),
        content_size = expanded.len(),
        "Template expansion complete"
    );

    debug!("Step 4: Parsing KDL");
    let name = project_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let mut deployment = parse_kdl_string(&expanded, name.clone())?;

    if let Some(local_file) = &discovered.local_override {
        debug!(file = %local_file.display(), "Merging local override");
        let rendered = processor.render_file(local_file)?;
        let local = parse_kdl_string(&rendered, name)?;
        deployment.merge_override(local);
    }

    info!(
        deployment = %deployment.name,
        stacks = deployment.stacks.len(),
        resources = deployment.node_count(),
        "Project loaded successfully"
    );

    Ok(deployment)
}

/// テンプレートプロセッサを準備
///
/// 優先度（低 → 高）: .env → 環境変数 → variables ブロック
fn prepare_template_processor(
    discovered: &DiscoveredFiles,
    project_root: &Path,
) -> Result<TemplateProcessor> {
    let mut processor = TemplateProcessor::new();
    let mut all_variables = Variables::new();

    processor.add_variable(
        "PROJECT_ROOT",
        serde_json::Value::String(project_root.to_string_lossy().to_string()),
    );

    for file in discovered.variables.iter().chain(discovered.root.iter()) {
        let content = std::fs::read_to_string(file).map_err(|e| FlowError::IoError {
            path: file.clone(),
            message: e.to_string(),
        })?;
        all_variables.extend(extract_variables(&content)?);
    }

    if let Some(env_file) = &discovered.env_file {
        processor.add_env_file_variables(env_file)?;
    }

    processor.add_env_variables();

    debug!(vars = ?all_variables, "Adding collected variables to processor");
    processor.add_variables(all_variables);

    Ok(processor)
}

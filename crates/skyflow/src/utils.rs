use colored::Colorize;
use skyflow_cloud::StateManager;
use skyflow_cloud_local::LocalProvider;
use skyflow_config::Settings;
use skyflow_core::Deployment;
use skyflow_engine::{
    DependencyGraph, Engine, EngineError, NodeState, Operation, RunReport, RunStatus, StackStatus,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 失敗させるリソースID（カンマ区切り、ローカルプロバイダーのシミュレーション用）
const LOCAL_FAIL_ENV: &str = "SKYFLOW_LOCAL_FAIL";

/// 読み込んだ宣言ファイルを表示
pub fn print_loaded_config_files(project_root: &Path) {
    let Ok(discovered) = skyflow_core::discover_files(project_root) else {
        return;
    };

    println!("📄 読み込んだ宣言ファイル:");
    for file in discovered.kdl_files() {
        let display = file
            .strip_prefix(project_root)
            .unwrap_or(&file)
            .display()
            .to_string();
        if Some(&file) == discovered.local_override.as_ref() {
            println!("  • {} (ローカルオーバーライド)", display.cyan());
        } else {
            println!("  • {}", display.cyan());
        }
    }
}

/// 設定を読み込んで Engine を組み立てる
///
/// `--parallelism` は config.yaml の値より優先されます。
pub fn build_engine(project_root: &Path, parallelism: Option<usize>) -> anyhow::Result<Engine> {
    let settings = Settings::load(Some(project_root))?;
    let parallelism = parallelism.unwrap_or(settings.parallelism);
    let state = StateManager::with_state_dir(settings.state_dir_for(project_root));

    tracing::debug!(
        parallelism,
        state_dir = %state.state_dir().display(),
        "Building engine"
    );

    Ok(Engine::new(Arc::new(local_provider()), state).with_parallelism(parallelism))
}

fn local_provider() -> LocalProvider {
    let mut provider = LocalProvider::new();
    if let Ok(ids) = std::env::var(LOCAL_FAIL_ENV) {
        for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            provider = provider.with_failure(id);
        }
    }
    provider
}

/// 宣言をリンク（不整合ならエラーを表示して終了コード 2）
pub fn link_or_exit(deployment: &Deployment) -> DependencyGraph {
    match skyflow_engine::link(deployment) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("{}", "✗ 宣言に不整合があります".red().bold());
            eprintln!("  {}", e);
            std::process::exit(2);
        }
    }
}

/// エンジンのエラーを CLI のエラーに変換
///
/// 宣言の不整合は何も変更していないので終了コード 2 で終了します。
pub fn engine_error(e: EngineError) -> anyhow::Error {
    if let EngineError::Configuration(config) = &e {
        eprintln!("{}", "✗ 宣言に不整合があります".red().bold());
        eprintln!("  {}", config);
        std::process::exit(2);
    }
    e.into()
}

/// Ctrl-C でキャンセルされるトークン
///
/// 実行中のプロバイダー呼び出しは完了まで待ち、新しいノードは開始しません。
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!(
                "{}",
                "キャンセルしました。実行中の処理の完了を待っています...".yellow()
            );
            cancel.cancel();
        }
    });
    token
}

/// 実行レポートを表示
pub fn print_report(report: &RunReport) {
    println!();
    for node in report.resources() {
        let line = format!("{} ({})", node.id, node.kind);
        match node.state {
            NodeState::Applied => {
                let action = node.action.map(|a| a.to_string()).unwrap_or_default();
                println!("  {} {} {}", "✓".green(), line, action.dimmed());
            }
            NodeState::Destroyed => println!("  {} {}", "✓".green(), line),
            NodeState::Failed => {
                println!("  {} {}", "✗".red(), line.red());
                if let Some(error) = &node.error {
                    println!("      {}", error.red());
                }
            }
            NodeState::Skipped => {
                let reason = match &node.skipped_because {
                    Some(cause) => format!("{} の失敗により未実行", cause),
                    None => "キャンセルにより未実行".to_string(),
                };
                println!("  {} {} {}", "-".yellow(), line, reason.dimmed());
            }
            other => println!("  {} {} {}", "?".dimmed(), line, other),
        }
    }

    println!();
    println!("スタック:");
    for stack in &report.stacks {
        let status = match stack.status {
            StackStatus::Applied | StackStatus::Destroyed => stack.status.to_string().green(),
            StackStatus::Failed => stack.status.to_string().red(),
            StackStatus::Incomplete => stack.status.to_string().yellow(),
        };
        println!("  {} [{}] {}", stack.name.cyan(), stack.region, status);
        for (name, value) in &stack.exports {
            println!("      {} = {}", name, value);
        }
    }

    if !report.pruned.is_empty() {
        println!();
        println!("削除した孤立リソース:");
        for id in &report.pruned {
            println!("  - {}", id);
        }
    }

    println!();
    println!("{}", report.summary());

    let verb = match report.operation {
        Operation::Apply => "適用",
        Operation::Destroy => "削除",
    };
    match report.status {
        RunStatus::Success => println!("{}", format!("✓ {}が完了しました", verb).green().bold()),
        RunStatus::PartialFailure => println!(
            "{}",
            format!("⚠ 一部のリソースの{}に失敗しました", verb).yellow().bold()
        ),
        RunStatus::Cancelled => println!("{}", format!("⚠ {}をキャンセルしました", verb).yellow().bold()),
        RunStatus::Aborted => println!("{}", format!("✗ {}を中断しました", verb).red().bold()),
    }
    if let Some(error) = &report.error {
        println!("  {}", error);
    }
}

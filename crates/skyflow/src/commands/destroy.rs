use crate::utils;
use colored::Colorize;
use skyflow_core::Deployment;
use std::path::Path;

pub async fn handle(
    project_root: &Path,
    deployment: &Deployment,
    parallelism: Option<usize>,
    yes: bool,
    json: bool,
) -> anyhow::Result<()> {
    let engine = utils::build_engine(project_root, parallelism)?;

    if !json {
        println!("{}", "削除を開始します...".red().bold());
        utils::print_loaded_config_files(project_root);
    }

    // 確認（--yesが指定されていない場合）
    if !yes {
        let state = engine.state().load().await?;
        let targets: Vec<_> = state
            .by_sequence()
            .into_iter()
            .rev()
            .filter(|r| deployment.stack(&r.stack).is_some())
            .collect();

        if targets.is_empty() {
            println!("{}", "削除対象のリソースはありません。".green());
            return Ok(());
        }

        println!();
        println!(
            "{}",
            format!("削除対象のリソース ({} 個):", targets.len()).bold()
        );
        for resource in &targets {
            println!(
                "  {} {} ({})",
                "-".red(),
                resource.id.red(),
                resource.resource_type
            );
        }
        println!();
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    let cancel = utils::cancel_on_ctrl_c();
    let report = engine
        .destroy(deployment, cancel)
        .await
        .map_err(utils::engine_error)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        utils::print_report(&report);
    }

    if report.exit_code() != 0 {
        std::process::exit(report.exit_code());
    }
    Ok(())
}

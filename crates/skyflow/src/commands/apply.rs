use crate::commands::plan::print_plan;
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
        println!("{}", "適用を開始します...".blue().bold());
        utils::print_loaded_config_files(project_root);
        println!("並列度: {}", engine.parallelism().to_string().cyan());
    }

    // 確認（--yesが指定されていない場合）
    if !yes {
        let plan = engine.plan(deployment).await.map_err(utils::engine_error)?;
        print_plan(&plan);
        println!();
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    let cancel = utils::cancel_on_ctrl_c();
    let report = engine
        .apply(deployment, cancel)
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

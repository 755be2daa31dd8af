use crate::utils;
use colored::Colorize;
use skyflow_cloud::{ActionType, Plan};
use skyflow_core::Deployment;
use std::path::Path;

pub async fn handle(project_root: &Path, deployment: &Deployment) -> anyhow::Result<()> {
    println!("{}", "変更計画を作成中...".blue());

    let engine = utils::build_engine(project_root, None)?;
    let plan = engine.plan(deployment).await.map_err(utils::engine_error)?;

    print_plan(&plan);
    Ok(())
}

/// 計画を表示（apply / destroy の確認でも使用）
pub fn print_plan(plan: &Plan) {
    println!();
    for action in &plan.actions {
        let (mark, id) = match action.action_type {
            ActionType::Create => ("+".green(), action.resource_id.green()),
            ActionType::Update => ("~".yellow(), action.resource_id.yellow()),
            ActionType::Delete => ("-".red(), action.resource_id.red()),
            ActionType::NoOp => (" ".normal(), action.resource_id.dimmed()),
        };
        println!(
            "  {} {} ({}) {}",
            mark,
            id,
            action.resource_type,
            action.description.dimmed()
        );
        if action.action_type != ActionType::NoOp {
            for (input, value) in &action.changes {
                println!("        {} = {}", input, value);
            }
        }
    }

    println!();
    if plan.has_changes {
        println!("{}", plan.summary().to_string().bold());
    } else {
        println!("{}", "変更はありません。".green());
    }
}

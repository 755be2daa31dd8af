use crate::utils;
use colored::Colorize;
use skyflow_core::{Boundary, Deployment};
use std::path::Path;

pub fn handle(project_root: &Path, deployment: &Deployment) -> anyhow::Result<()> {
    println!("{}", "宣言を検証中...".blue());
    println!(
        "プロジェクトルート: {}",
        project_root.display().to_string().cyan()
    );
    utils::print_loaded_config_files(project_root);

    let graph = utils::link_or_exit(deployment);

    println!("{}", "✓ 宣言は正常です！".green().bold());
    println!();
    println!("サマリー:");
    println!("  デプロイメント: {}", deployment.name.cyan());
    println!("  スタック: {}個", deployment.stacks.len());
    for stack in &deployment.stacks {
        println!(
            "    - {} ({}, {}個のリソース)",
            stack.name.cyan(),
            stack.region,
            stack.nodes.len()
        );
        for (name, input) in &stack.inputs {
            let source = match &input.from {
                Some(from) => format!("← {}.{}", from.stack, from.export),
                None => "パラメータ".to_string(),
            };
            println!("        input  {} ({}) {}", name, input.value_type, source.dimmed());
        }
        for (name, reference) in &stack.exports {
            println!("        export {} → {}", name, reference);
        }
    }

    let cross_stack = graph
        .bindings()
        .iter()
        .filter(|b| !matches!(b.boundary, Boundary::Local))
        .count();
    let barriers = graph.bindings().iter().filter(|b| b.is_barrier()).count();
    println!(
        "  参照: {}個 (スタック間 {}個, リージョン間 {}個)",
        graph.bindings().len(),
        cross_stack,
        barriers
    );

    Ok(())
}

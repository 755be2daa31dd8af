use crate::utils;
use colored::Colorize;
use serde_json::json;
use skyflow_core::Deployment;
use skyflow_engine::EdgeKind;

pub fn handle(deployment: &Deployment, json: bool) -> anyhow::Result<()> {
    let graph = utils::link_or_exit(deployment);

    if json {
        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(|&v| graph.vertex(v).id.to_string())
            .collect();
        let edges: Vec<_> = graph
            .edges()
            .iter()
            .map(|e| {
                json!({
                    "from": graph.vertex(e.from).id.to_string(),
                    "to": graph.vertex(e.to).id.to_string(),
                    "kind": e.kind,
                })
            })
            .collect();
        let out = json!({
            "deployment": deployment.name,
            "order": order,
            "edges": edges,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{} ({}個のノード, {}本の辺)",
        "実行順".bold(),
        graph.len(),
        graph.edges().len()
    );
    for (step, &v) in graph.topological_order().iter().enumerate() {
        let vertex = graph.vertex(v);
        let label = format!("{} ({}, {})", vertex.id, vertex.kind, vertex.region);
        if vertex.is_virtual() {
            println!("{:>3}. {}", step + 1, label.dimmed());
        } else {
            println!("{:>3}. {}", step + 1, label.cyan());
        }

        for edge in graph.edges().iter().filter(|e| e.to == v) {
            let from = graph.vertex(edge.from).id.to_string();
            let note = match edge.kind {
                EdgeKind::Binding => "参照",
                EdgeKind::Explicit => "depends-on",
                EdgeKind::CrossRegionBarrier => "リージョン間バリア",
                EdgeKind::StackOrder => "スタック順序",
            };
            if edge.kind == EdgeKind::CrossRegionBarrier {
                println!("       ← {} {}", from, note.yellow());
            } else {
                println!("       ← {} {}", from, note.dimmed());
            }
        }
    }

    Ok(())
}

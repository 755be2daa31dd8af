mod commands;
mod utils;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sky")]
#[command(about = "スタックをまたいで、リージョンをまたいで、インフラを宣言する。", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 宣言を検証（参照・型・循環依存）
    Validate,
    /// 依存グラフを実行順に表示
    Graph {
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// 前回の状態と比較した変更計画を表示
    Plan,
    /// リソースを作成・更新
    Apply {
        /// 同時に実行するプロバイダー呼び出しの上限
        #[arg(short, long, env = "SKYFLOW_PARALLELISM")]
        parallelism: Option<usize>,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
        /// 実行レポートを JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// リソースを依存の逆順に削除
    Destroy {
        /// 同時に実行するプロバイダー呼び出しの上限
        #[arg(short, long, env = "SKYFLOW_PARALLELISM")]
        parallelism: Option<usize>,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
        /// 実行レポートを JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout はレポート用なのでログは stderr へ
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    // Versionコマンドは宣言ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("skyflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let project_root = match skyflow_core::find_project_root() {
        Ok(root) => root,
        Err(e @ skyflow_core::FlowError::ProjectRootNotFound(_)) => {
            eprintln!("{}", "宣言ファイルが見つかりません。".red().bold());
            eprintln!("{}", e);
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    let deployment = match skyflow_core::load_project_from_root(&project_root) {
        Ok(deployment) => deployment,
        Err(e) => {
            eprintln!("{}", "✗ 宣言の読み込みに失敗しました".red().bold());
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    match cli.command {
        Commands::Validate => {
            commands::validate::handle(&project_root, &deployment)?;
        }
        Commands::Graph { json } => {
            commands::graph::handle(&deployment, json)?;
        }
        Commands::Plan => {
            commands::plan::handle(&project_root, &deployment).await?;
        }
        Commands::Apply {
            parallelism,
            yes,
            json,
        } => {
            commands::apply::handle(&project_root, &deployment, parallelism, yes, json).await?;
        }
        Commands::Destroy {
            parallelism,
            yes,
            json,
        } => {
            commands::destroy::handle(&project_root, &deployment, parallelism, yes, json).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before project loading");
        }
    }

    Ok(())
}

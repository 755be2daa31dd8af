//! SkyFlow core
//!
//! 宣言モデル（リソース・参照バインディング・スタック・デプロイメント）と、
//! `sky.kdl` からそれを組み立てるパーサー/ローダーを提供します。

pub mod discovery;
pub mod error;
pub mod loader;
pub mod model;
pub mod parser;
pub mod template;

pub use discovery::{DiscoveredFiles, discover_files, find_project_root};
pub use error::{FlowError, Result};
pub use loader::{load_project, load_project_from_root};
pub use model::*;
pub use parser::{parse_kdl_file, parse_kdl_string};

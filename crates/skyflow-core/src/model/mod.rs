//! モデル定義
//!
//! SkyFlowで使用される宣言モデルを定義します。
//! 各モデルは機能ごとにモジュールに分離されています。

mod binding;
mod deployment;
mod kind;
mod node;
mod stack;

// Re-exports
pub use binding::*;
pub use deployment::*;
pub use kind::*;
pub use node::*;
pub use stack::*;

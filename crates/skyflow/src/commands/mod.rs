pub mod apply;
pub mod destroy;
pub mod graph;
pub mod plan;
pub mod validate;

//! Schema-aware query compilation to Cypher.

pub mod compile;
pub mod ir;
pub mod render;

pub use compile::{compile_instance_query, escape_like};
pub use ir::*;
pub use render::Statement;

pub mod data;
pub mod schema;

pub use data::*;
pub use schema::*;

pub mod dataset;
pub mod query;

pub use dataset::*;
pub use query::*;

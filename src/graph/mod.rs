//! Op graph construction, optimization and depth layering.

mod opgraph;
mod optimize;

pub use opgraph::OpGraph;
pub use optimize::optimize_model;

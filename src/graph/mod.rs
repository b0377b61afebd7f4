//! Resource dependency graph.
//!
//! The graph is built in two passes over the declarations: every logical
//! name is registered first, then edges are added from reference expressions
//! and `depends_on` hints. Unknown references and cycles are reported before
//! any provider call is made.

mod builder;
mod dag;

pub use dag::{EdgeKind, GraphNode, ResourceGraph};

//! Resource model: declarations, reference expressions and known types.

mod declaration;
pub mod reference;
pub mod registry;

pub use declaration::{Properties, PropertyReference, ResourceDeclaration, ResourceOptions};
pub use reference::{Reference, TemplateError};
pub use registry::ResourceSchema;

//! OpenAPI 3.0 document generation from the route registry, plus the
//! built-in endpoints that serve it.

mod endpoint;
mod schema;
mod spec;

pub use endpoint::*;
pub use schema::{response_schema_for, schema_for, struct_schema};
pub use spec::*;

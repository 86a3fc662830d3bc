//! Generated GraphQL surface.
//!
//! [`SchemaBuilder`] owns the per-datasource definitions; [`exec::compile`]
//! turns them into an executable schema whose resolvers share the REST query
//! path.

mod builder;
pub mod exec;

pub use builder::{
    ArgumentDefinition, FieldDefinition, GraphQlScalar, InputTypeDefinition, ObjectTypeDefinition, RootFieldDefinition,
    RootKind, SchemaBuilder, TableTypes, TypeExpr, render_sdl, table_types,
};

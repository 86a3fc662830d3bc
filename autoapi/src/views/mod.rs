//! HTTP surfaces. `manage` and `graphql` are fixed routers; `rest` is the
//! fallback that serves whatever the route registry currently holds.

pub mod graphql;
pub mod manage;
pub mod rest;

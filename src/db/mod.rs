pub mod crud;
pub mod introspect;
pub mod query;
pub mod registry;
pub mod roles;
pub mod sanitize;
pub mod tables;
pub mod value;

pub use registry::PoolRegistry;

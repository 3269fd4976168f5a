pub mod backend;
pub mod lock;
pub mod migration;
pub mod models;
pub mod schema;
pub mod sqlite;
pub mod store;

mod url;
mod schema;
pub mod db;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod statuses;

pub(crate) use schema::*;

pub use db::QueryError;
pub use pool::{ConnectionPool, PoolError, PooledConnection};
pub use url::postgres_url_from_environment;

pub use diesel::{Connection, ConnectionError, PgConnection};

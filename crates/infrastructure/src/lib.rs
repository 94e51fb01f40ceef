pub mod database;

pub use database::postgres::PostgresTaskStore;
pub use database::sqlite::SqliteTaskStore;

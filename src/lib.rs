pub mod cache;
pub mod config;
pub mod models;
pub mod providers;
pub mod services;
pub mod sync;

/// Embedded migrations; the binary and the sqlite-backed tests share them.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

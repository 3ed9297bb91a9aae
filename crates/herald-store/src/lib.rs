pub mod database;
pub mod directory;
pub mod error;
pub mod events;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use directory::SqliteDirectory;
pub use error::StoreError;
pub use events::EventLog;

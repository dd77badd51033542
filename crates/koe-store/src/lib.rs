pub mod analysis_runs;
pub mod database;
pub mod error;
pub mod messages;
pub mod opinions;
pub mod points;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod users;

pub use database::Database;
pub use error::StoreError;

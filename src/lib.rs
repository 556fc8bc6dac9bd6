pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod store;

pub use config::Config;
pub use error::{LoadError, LoadResult, Stage};
pub use extract::{read_zone_csv, ZoneRecord, ZoneTable};
pub use pipeline::{LoadMode, RunReport};
pub use store::{PgStore, TableStatus, ZoneStore};

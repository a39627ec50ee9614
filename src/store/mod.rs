mod sqlite;
mod types;

pub use sqlite::SqliteRepository;
pub use types::{RepositoryError, RssMetadata, Source, SourceRepository, RSS_METADATA_KEY};

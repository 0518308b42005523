pub mod backup;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod error;
pub mod linked_list;
pub mod migrate;
pub mod overlay;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use backup::{BackupManager, BackupManifest};
pub use config::StoreConfig;
pub use directory::{Connector, Directory, Model, Operator, Row, WhereClause};
pub use error::{StorageError, Transient};
pub use linked_list::{ListHealth, ListKind, Traversal};
pub use migrate::{
    ApplyReport, CursorMap, Migration, MigrationContext, MigrationError, MigrationRecord,
    MigrationRegistry, MigrationRunner, MigrationStatus,
};
pub use overlay::{OverlayStateRecord, OverlayStore};
pub use sqlite::{SqliteStorage, now_secs};
pub use traits::*;
pub use ulid::Ulid;

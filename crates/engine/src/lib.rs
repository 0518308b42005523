pub mod bodies;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod examples;
pub mod lists;
pub mod overlay;

pub use error::{EngineError, ErrorCode};
pub use overlay::MergedItem;

use tracing::info;

use workbench_core::{Context, EndpointId, ExampleId};
use workbench_storage::{ApplyReport, MigrationRunner, SqliteStorage, StoreConfig};

/// What a request is about to touch, for the ownership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Endpoint(EndpointId),
    Example(ExampleId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    /// Reported to the caller as missing.
    Hidden,
    Denied,
}

/// Ownership check run before any transaction opens. Implemented outside
/// this crate by whatever knows who the caller is.
pub trait OwnerCheck: Send + Sync {
    fn check(&self, ctx: &Context, resource: Resource) -> Result<Access, EngineError>;
}

/// Grants everything. For tests and single-user embedding.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl OwnerCheck for AllowAll {
    fn check(&self, _ctx: &Context, _resource: Resource) -> Result<Access, EngineError> {
        Ok(Access::Allowed)
    }
}

pub struct Workbench {
    storage: SqliteStorage,
    owner: Box<dyn OwnerCheck>,
}

impl Workbench {
    pub fn new(storage: SqliteStorage, owner: impl OwnerCheck + 'static) -> Self {
        Self {
            storage,
            owner: Box::new(owner),
        }
    }

    pub fn open(config: StoreConfig, owner: impl OwnerCheck + 'static) -> Result<Self, EngineError> {
        let storage = SqliteStorage::open(config)?;
        info!(path = ?storage.database_path(), "workbench store opened");
        Ok(Self::new(storage, owner))
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn config(&self) -> &StoreConfig {
        self.storage.config()
    }

    /// Run pending migrations against this store.
    pub fn apply_migrations(
        &mut self,
        ctx: &Context,
        runner: &MigrationRunner,
    ) -> Result<ApplyReport, EngineError> {
        Ok(runner.apply_all(ctx, &mut self.storage)?)
    }
}

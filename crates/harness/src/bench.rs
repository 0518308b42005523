use std::error::Error;
use std::path::PathBuf;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use workbench_core::{BodyFields, BodyId, BodyKind, CollectionId, Context, EndpointId, ExampleId};
use workbench_engine::{AllowAll, Workbench};
use workbench_storage::{ListHealth, ListKind, StoreConfig};

type TestResult<T> = Result<T, Box<dyn Error>>;

/// Install a test-writer subscriber filtered by `RUST_LOG`. Safe to call from
/// every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An origin example and a delta of it on a hidden twin endpoint.
#[derive(Debug, Clone)]
pub struct OverlayPair {
    pub origin_endpoint: EndpointId,
    pub delta_endpoint: EndpointId,
    pub origin: ExampleId,
    pub delta: ExampleId,
    /// Origin rows in list order.
    pub rows: Vec<BodyId>,
}

/// A workbench with one workspace and collection, granting every access.
pub struct TestWorkbench {
    pub workbench: Workbench,
    pub ctx: Context,
    pub collection: CollectionId,
    dir: Option<TempDir>,
}

impl TestWorkbench {
    pub fn new() -> TestResult<Self> {
        Self::with_config(StoreConfig::in_memory(), None)
    }

    /// File-backed store in a fresh temporary directory.
    pub fn on_disk() -> TestResult<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = StoreConfig::at_path(dir.path().join("workbench.db"));
        config.backup_dir = Some(dir.path().join("backups"));
        Self::with_config(config, Some(dir))
    }

    fn with_config(config: StoreConfig, dir: Option<TempDir>) -> TestResult<Self> {
        init_test_logging();
        let ctx = Context::background();
        let mut workbench = Workbench::open(config, AllowAll)?;
        let workspace = workbench.create_workspace(&ctx, "test")?;
        let collection = workbench.create_collection(&ctx, workspace, "requests")?;
        Ok(Self {
            workbench,
            ctx,
            collection,
            dir,
        })
    }

    pub fn dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// New visible endpoint and its default example.
    pub fn endpoint(&mut self, name: &str) -> TestResult<(EndpointId, ExampleId)> {
        Ok(self
            .workbench
            .create_endpoint(&self.ctx, self.collection, name, "GET", "https://example.test", false)?)
    }

    /// Rows with the given keys appended to an example, values empty.
    pub fn rows(&mut self, kind: BodyKind, example: ExampleId, keys: &[&str]) -> TestResult<Vec<BodyId>> {
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            ids.push(
                self.workbench
                    .create_body(&self.ctx, kind, example, BodyFields::new(*key, ""))?,
            );
        }
        Ok(ids)
    }

    /// An origin example holding `keys` and an empty delta of it.
    pub fn overlay_pair(&mut self, kind: BodyKind, keys: &[&str]) -> TestResult<OverlayPair> {
        let (origin_endpoint, origin) = self.endpoint("origin")?;
        let (delta_endpoint, _) = self.workbench.create_endpoint(
            &self.ctx,
            self.collection,
            "origin (delta)",
            "GET",
            "https://example.test",
            true,
        )?;
        let rows = self.rows(kind, origin, keys)?;
        let delta = self
            .workbench
            .create_delta_example(&self.ctx, origin, delta_endpoint, "delta")?;
        Ok(OverlayPair {
            origin_endpoint,
            delta_endpoint,
            origin,
            delta,
            rows,
        })
    }

    /// Keys of the merged list, in order.
    pub fn merged_keys(&mut self, kind: BodyKind, pair: &OverlayPair) -> TestResult<Vec<String>> {
        Ok(self
            .workbench
            .list_merged(&self.ctx, kind, pair.delta, pair.origin)?
            .into_iter()
            .map(|item| item.fields.key)
            .collect())
    }

    /// Keys of an example's plain list, in order.
    pub fn body_keys(&mut self, kind: BodyKind, example: ExampleId) -> TestResult<Vec<String>> {
        Ok(self
            .workbench
            .list_bodies(&self.ctx, kind, example)?
            .into_iter()
            .map(|b| b.fields.key)
            .collect())
    }

    pub fn health(&self, kind: ListKind, parent: Uuid) -> TestResult<ListHealth> {
        Ok(self.workbench.validate_list(&self.ctx, kind, parent)?)
    }
}

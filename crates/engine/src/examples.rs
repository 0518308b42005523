//! Workspaces, collections, endpoints, and the per-endpoint example list.

use std::collections::HashMap;

use tracing::{info, warn};

use workbench_core::{
    CollectionId, Context, EndpointId, ExampleBodyKind, ExampleId, MovePosition, WorkspaceId,
};
use workbench_storage::linked_list;
use workbench_storage::{
    CatalogStore, CollectionRecord, EndpointRecord, ExampleRecord, ListKind, WorkspaceRecord,
    now_secs,
};

use crate::{EngineError, Resource, Workbench};

pub const DEFAULT_EXAMPLE_NAME: &str = "Default";

impl Workbench {
    pub fn create_workspace(&mut self, ctx: &Context, name: &str) -> Result<WorkspaceId, EngineError> {
        let record = WorkspaceRecord {
            id: WorkspaceId::new(),
            name: name.to_string(),
            updated: now_secs(),
        };
        self.mutate(ctx, &[], |tx| Ok(tx.insert_workspace(&record)?))?;
        Ok(record.id)
    }

    pub fn create_collection(
        &mut self,
        ctx: &Context,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<CollectionId, EngineError> {
        let record = CollectionRecord {
            id: CollectionId::new(),
            workspace_id,
            name: name.to_string(),
        };
        self.mutate(ctx, &[], |tx| Ok(tx.insert_collection(&record)?))?;
        Ok(record.id)
    }

    /// Create an endpoint together with its default example.
    pub fn create_endpoint(
        &mut self,
        ctx: &Context,
        collection_id: CollectionId,
        name: &str,
        method: &str,
        url: &str,
        hidden: bool,
    ) -> Result<(EndpointId, ExampleId), EngineError> {
        let now = now_secs();
        let endpoint = EndpointRecord {
            id: EndpointId::new(),
            collection_id,
            name: name.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            hidden,
            updated: now,
        };
        let example = ExampleRecord {
            id: ExampleId::new(),
            endpoint_id: endpoint.id,
            collection_id,
            name: DEFAULT_EXAMPLE_NAME.to_string(),
            body_kind: ExampleBodyKind::None,
            version_parent: None,
            is_default: true,
            prev: None,
            next: None,
            updated: now,
        };
        let touched = [(ListKind::Examples, *endpoint.id.as_uuid())];
        self.mutate(ctx, &touched, |tx| {
            tx.insert_endpoint(&endpoint)?;
            tx.insert_example(&example)?;
            Ok(())
        })?;
        info!(endpoint_id = %endpoint.id, example_id = %example.id, hidden, "endpoint created");
        Ok((endpoint.id, example.id))
    }

    pub fn get_endpoint(&self, ctx: &Context, endpoint_id: EndpointId) -> Result<EndpointRecord, EngineError> {
        self.authorize(ctx, Resource::Endpoint(endpoint_id))?;
        self.storage
            .conn()
            .get_endpoint(endpoint_id)?
            .ok_or_else(|| EngineError::NotFound(format!("endpoint {endpoint_id}")))
    }

    /// Removes the endpoint, its examples and all their children.
    pub fn delete_endpoint(&mut self, ctx: &Context, endpoint_id: EndpointId) -> Result<(), EngineError> {
        self.authorize(ctx, Resource::Endpoint(endpoint_id))?;
        let deleted = self.mutate(ctx, &[], |tx| Ok(tx.delete_endpoint(endpoint_id)?))?;
        if !deleted {
            return Err(EngineError::NotFound(format!("endpoint {endpoint_id}")));
        }
        info!(%endpoint_id, "endpoint deleted");
        Ok(())
    }

    /// Append a new origin example to an endpoint.
    pub fn create_example(
        &mut self,
        ctx: &Context,
        endpoint_id: EndpointId,
        name: &str,
        body_kind: ExampleBodyKind,
    ) -> Result<ExampleId, EngineError> {
        let endpoint = self.get_endpoint(ctx, endpoint_id)?;
        let record = ExampleRecord {
            id: ExampleId::new(),
            endpoint_id,
            collection_id: endpoint.collection_id,
            name: name.to_string(),
            body_kind,
            version_parent: None,
            is_default: false,
            prev: None,
            next: None,
            updated: now_secs(),
        };
        self.insert_example_at_end(ctx, &record)?;
        Ok(record.id)
    }

    /// Create a delta of `origin_id` on another endpoint of the same
    /// collection, normally its hidden twin.
    pub fn create_delta_example(
        &mut self,
        ctx: &Context,
        origin_id: ExampleId,
        delta_endpoint_id: EndpointId,
        name: &str,
    ) -> Result<ExampleId, EngineError> {
        let origin = self.get_example(ctx, origin_id)?;
        if origin.is_delta() {
            return Err(EngineError::InvalidArgument(format!(
                "example {origin_id} is itself a delta; deltas of deltas are not allowed"
            )));
        }
        if origin.endpoint_id == delta_endpoint_id {
            return Err(EngineError::InvalidArgument(
                "a delta example must live on a different endpoint than its origin".into(),
            ));
        }
        let endpoint = self.get_endpoint(ctx, delta_endpoint_id)?;
        if endpoint.collection_id != origin.collection_id {
            return Err(EngineError::InvalidArgument(format!(
                "endpoint {delta_endpoint_id} is not in the origin's collection"
            )));
        }
        let record = ExampleRecord {
            id: ExampleId::new(),
            endpoint_id: delta_endpoint_id,
            collection_id: origin.collection_id,
            name: name.to_string(),
            body_kind: origin.body_kind,
            version_parent: Some(origin_id),
            is_default: false,
            prev: None,
            next: None,
            updated: now_secs(),
        };
        self.insert_example_at_end(ctx, &record)?;
        info!(example_id = %record.id, %origin_id, "delta example created");
        Ok(record.id)
    }

    fn insert_example_at_end(&mut self, ctx: &Context, record: &ExampleRecord) -> Result<(), EngineError> {
        let parent = *record.endpoint_id.as_uuid();
        let touched = [(ListKind::Examples, parent)];
        self.mutate(ctx, &touched, |tx| {
            tx.insert_example(record)?;
            linked_list::append_at_end(tx, ListKind::Examples, parent, *record.id.as_uuid())?;
            Ok(())
        })
    }

    pub fn get_example(&self, ctx: &Context, example_id: ExampleId) -> Result<ExampleRecord, EngineError> {
        self.authorize(ctx, Resource::Example(example_id))?;
        self.storage
            .conn()
            .get_example(example_id)?
            .ok_or_else(|| EngineError::NotFound(format!("example {example_id}")))
    }

    pub fn rename_example(&mut self, ctx: &Context, example_id: ExampleId, name: &str) -> Result<(), EngineError> {
        self.authorize(ctx, Resource::Example(example_id))?;
        let renamed = self.mutate(ctx, &[], |tx| Ok(tx.rename_example(example_id, name, now_secs())?))?;
        if !renamed {
            return Err(EngineError::NotFound(format!("example {example_id}")));
        }
        Ok(())
    }

    /// Every example of the endpoint in display order. Isolated or
    /// mislinked rows are repaired on the way; if the list cannot be walked
    /// the examples come back in creation order instead.
    pub fn list_examples(&mut self, ctx: &Context, endpoint_id: EndpointId) -> Result<Vec<ExampleRecord>, EngineError> {
        self.authorize(ctx, Resource::Endpoint(endpoint_id))?;
        let ordered = self.read_ordered(ctx, ListKind::Examples, *endpoint_id.as_uuid())?;
        let mut by_id: HashMap<_, _> = self
            .storage
            .conn()
            .list_examples(endpoint_id)?
            .into_iter()
            .map(|e| (*e.id.as_uuid(), e))
            .collect();
        let mut out = Vec::with_capacity(by_id.len());
        for id in ordered {
            if let Some(example) = by_id.remove(&id) {
                out.push(example);
            }
        }
        if !by_id.is_empty() {
            // rows created between the two reads
            warn!(%endpoint_id, extra = by_id.len(), "examples appeared during listing");
            let mut rest: Vec<_> = by_id.into_values().collect();
            rest.sort_by_key(|e| e.id);
            out.extend(rest);
        }
        Ok(out)
    }

    pub fn move_example(
        &mut self,
        ctx: &Context,
        endpoint_id: EndpointId,
        example_id: ExampleId,
        target_id: ExampleId,
        position: MovePosition,
    ) -> Result<(), EngineError> {
        self.authorize(ctx, Resource::Endpoint(endpoint_id))?;
        self.move_in_list(
            ctx,
            ListKind::Examples,
            *endpoint_id.as_uuid(),
            *example_id.as_uuid(),
            *target_id.as_uuid(),
            position,
            |_| Ok(()),
        )?;
        Ok(())
    }
}

use workbench_core::{
    BodyFields, BodyKind, ExampleBodyKind,
    ids::*,
};

use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct WorkspaceRecord {
    pub id: WorkspaceId,
    pub name: String,
    pub updated: i64,
}

#[derive(Debug, Clone)]
pub struct CollectionRecord {
    pub id: CollectionId,
    pub workspace_id: WorkspaceId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub collection_id: CollectionId,
    pub name: String,
    pub method: String,
    pub url: String,
    /// Hidden endpoints are the twins that hold delta examples.
    pub hidden: bool,
    pub updated: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExampleRecord {
    pub id: ExampleId,
    pub endpoint_id: EndpointId,
    pub collection_id: CollectionId,
    pub name: String,
    pub body_kind: ExampleBodyKind,
    pub version_parent: Option<ExampleId>,
    pub is_default: bool,
    pub prev: Option<ExampleId>,
    pub next: Option<ExampleId>,
    pub updated: i64,
}

impl ExampleRecord {
    pub fn is_delta(&self) -> bool {
        self.version_parent.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BodyRecord {
    pub id: BodyId,
    pub example_id: ExampleId,
    pub kind: BodyKind,
    pub delta_parent: Option<BodyId>,
    pub fields: BodyFields,
    pub prev: Option<BodyId>,
    pub next: Option<BodyId>,
}

/// Row-level access to the catalog tables. Implemented for
/// `rusqlite::Connection`, so every method is also callable on an open
/// transaction. List pointers are maintained by [`crate::linked_list`], not here.
pub trait CatalogStore {
    fn insert_workspace(&self, record: &WorkspaceRecord) -> Result<(), StorageError>;

    fn insert_collection(&self, record: &CollectionRecord) -> Result<(), StorageError>;

    fn insert_endpoint(&self, record: &EndpointRecord) -> Result<(), StorageError>;

    fn get_endpoint(&self, endpoint_id: EndpointId) -> Result<Option<EndpointRecord>, StorageError>;

    fn delete_endpoint(&self, endpoint_id: EndpointId) -> Result<bool, StorageError>;

    fn insert_example(&self, record: &ExampleRecord) -> Result<(), StorageError>;

    fn get_example(&self, example_id: ExampleId) -> Result<Option<ExampleRecord>, StorageError>;

    fn rename_example(
        &self,
        example_id: ExampleId,
        name: &str,
        updated: i64,
    ) -> Result<bool, StorageError>;

    fn touch_example(&self, example_id: ExampleId, updated: i64) -> Result<(), StorageError>;

    /// All examples of an endpoint in ascending id order, ignoring list pointers.
    fn list_examples(&self, endpoint_id: EndpointId) -> Result<Vec<ExampleRecord>, StorageError>;

    fn delta_examples_of(&self, origin_id: ExampleId) -> Result<Vec<ExampleRecord>, StorageError>;

    fn insert_body(&self, record: &BodyRecord) -> Result<(), StorageError>;

    fn get_body(&self, kind: BodyKind, body_id: BodyId) -> Result<Option<BodyRecord>, StorageError>;

    /// All rows of an example in ascending id order, ignoring list pointers.
    fn list_bodies(
        &self,
        kind: BodyKind,
        example_id: ExampleId,
    ) -> Result<Vec<BodyRecord>, StorageError>;

    fn update_body_fields(
        &self,
        kind: BodyKind,
        body_id: BodyId,
        fields: &BodyFields,
    ) -> Result<bool, StorageError>;

    fn delete_body_row(&self, kind: BodyKind, body_id: BodyId) -> Result<bool, StorageError>;

    fn bodies_with_delta_parent(
        &self,
        kind: BodyKind,
        parent_id: BodyId,
    ) -> Result<Vec<BodyRecord>, StorageError>;
}

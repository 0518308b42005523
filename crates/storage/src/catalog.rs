use rusqlite::{Connection, OptionalExtension, params};

use workbench_core::{
    BodyFields, BodyKind, ExampleBodyKind,
    ids::*,
};

use crate::error::StorageError;
use crate::sqlite::{opt_blob, required_uuid, uuid_column};
use crate::traits::*;

const EXAMPLE_COLUMNS: &str =
    "id, endpoint_id, collection_id, name, body_kind, version_parent_id, is_default, prev, next, updated";

const BODY_COLUMNS: &str =
    "id, example_id, delta_parent_id, key, value, description, enabled, prev, next";

fn read_example(row: &rusqlite::Row) -> rusqlite::Result<ExampleRecord> {
    let body_kind: i64 = row.get(4)?;
    let body_kind = ExampleBodyKind::from_i64(body_kind).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Integer, Box::new(e))
    })?;
    Ok(ExampleRecord {
        id: ExampleId::from_uuid(required_uuid(row, 0)?),
        endpoint_id: EndpointId::from_uuid(required_uuid(row, 1)?),
        collection_id: CollectionId::from_uuid(required_uuid(row, 2)?),
        name: row.get(3)?,
        body_kind,
        version_parent: uuid_column(row, 5)?.map(ExampleId::from_uuid),
        is_default: row.get(6)?,
        prev: uuid_column(row, 7)?.map(ExampleId::from_uuid),
        next: uuid_column(row, 8)?.map(ExampleId::from_uuid),
        updated: row.get(9)?,
    })
}

fn read_body(row: &rusqlite::Row, kind: BodyKind) -> rusqlite::Result<BodyRecord> {
    Ok(BodyRecord {
        id: BodyId::from_uuid(required_uuid(row, 0)?),
        example_id: ExampleId::from_uuid(required_uuid(row, 1)?),
        kind,
        delta_parent: uuid_column(row, 2)?.map(BodyId::from_uuid),
        fields: BodyFields {
            key: row.get(3)?,
            value: row.get(4)?,
            description: row.get(5)?,
            enabled: row.get(6)?,
        },
        prev: uuid_column(row, 7)?.map(BodyId::from_uuid),
        next: uuid_column(row, 8)?.map(BodyId::from_uuid),
    })
}

impl CatalogStore for Connection {
    fn insert_workspace(&self, record: &WorkspaceRecord) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO workspaces (id, name, updated) VALUES (?1, ?2, ?3)",
            params![record.id.as_bytes().as_slice(), record.name, record.updated],
        )?;
        Ok(())
    }

    fn insert_collection(&self, record: &CollectionRecord) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO collections (id, workspace_id, name) VALUES (?1, ?2, ?3)",
            params![
                record.id.as_bytes().as_slice(),
                record.workspace_id.as_bytes().as_slice(),
                record.name,
            ],
        )?;
        Ok(())
    }

    fn insert_endpoint(&self, record: &EndpointRecord) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO endpoints (id, collection_id, name, method, url, hidden, updated) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.as_bytes().as_slice(),
                record.collection_id.as_bytes().as_slice(),
                record.name,
                record.method,
                record.url,
                record.hidden,
                record.updated,
            ],
        )?;
        Ok(())
    }

    fn get_endpoint(&self, endpoint_id: EndpointId) -> Result<Option<EndpointRecord>, StorageError> {
        let record = self
            .query_row(
                "SELECT id, collection_id, name, method, url, hidden, updated FROM endpoints WHERE id = ?1",
                params![endpoint_id.as_bytes().as_slice()],
                |row| {
                    Ok(EndpointRecord {
                        id: EndpointId::from_uuid(required_uuid(row, 0)?),
                        collection_id: CollectionId::from_uuid(required_uuid(row, 1)?),
                        name: row.get(2)?,
                        method: row.get(3)?,
                        url: row.get(4)?,
                        hidden: row.get(5)?,
                        updated: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn delete_endpoint(&self, endpoint_id: EndpointId) -> Result<bool, StorageError> {
        let n = self.execute(
            "DELETE FROM endpoints WHERE id = ?1",
            params![endpoint_id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }

    fn insert_example(&self, record: &ExampleRecord) -> Result<(), StorageError> {
        self.execute(
            &format!("INSERT INTO examples ({EXAMPLE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                record.id.as_bytes().as_slice(),
                record.endpoint_id.as_bytes().as_slice(),
                record.collection_id.as_bytes().as_slice(),
                record.name,
                record.body_kind.as_i64(),
                opt_blob(record.version_parent.map(Into::into)),
                record.is_default,
                opt_blob(record.prev.map(Into::into)),
                opt_blob(record.next.map(Into::into)),
                record.updated,
            ],
        )?;
        Ok(())
    }

    fn get_example(&self, example_id: ExampleId) -> Result<Option<ExampleRecord>, StorageError> {
        let record = self
            .query_row(
                &format!("SELECT {EXAMPLE_COLUMNS} FROM examples WHERE id = ?1"),
                params![example_id.as_bytes().as_slice()],
                read_example,
            )
            .optional()?;
        Ok(record)
    }

    fn rename_example(
        &self,
        example_id: ExampleId,
        name: &str,
        updated: i64,
    ) -> Result<bool, StorageError> {
        let n = self.execute(
            "UPDATE examples SET name = ?1, updated = ?2 WHERE id = ?3",
            params![name, updated, example_id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }

    fn touch_example(&self, example_id: ExampleId, updated: i64) -> Result<(), StorageError> {
        self.execute(
            "UPDATE examples SET updated = ?1 WHERE id = ?2",
            params![updated, example_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn list_examples(&self, endpoint_id: EndpointId) -> Result<Vec<ExampleRecord>, StorageError> {
        let mut stmt = self.prepare(&format!(
            "SELECT {EXAMPLE_COLUMNS} FROM examples WHERE endpoint_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![endpoint_id.as_bytes().as_slice()], read_example)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delta_examples_of(&self, origin_id: ExampleId) -> Result<Vec<ExampleRecord>, StorageError> {
        let mut stmt = self.prepare(&format!(
            "SELECT {EXAMPLE_COLUMNS} FROM examples WHERE version_parent_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![origin_id.as_bytes().as_slice()], read_example)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_body(&self, record: &BodyRecord) -> Result<(), StorageError> {
        self.execute(
            &format!(
                "INSERT INTO {} ({BODY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                record.kind.table()
            ),
            params![
                record.id.as_bytes().as_slice(),
                record.example_id.as_bytes().as_slice(),
                opt_blob(record.delta_parent.map(Into::into)),
                record.fields.key,
                record.fields.value,
                record.fields.description,
                record.fields.enabled,
                opt_blob(record.prev.map(Into::into)),
                opt_blob(record.next.map(Into::into)),
            ],
        )?;
        Ok(())
    }

    fn get_body(&self, kind: BodyKind, body_id: BodyId) -> Result<Option<BodyRecord>, StorageError> {
        let record = self
            .query_row(
                &format!("SELECT {BODY_COLUMNS} FROM {} WHERE id = ?1", kind.table()),
                params![body_id.as_bytes().as_slice()],
                |row| read_body(row, kind),
            )
            .optional()?;
        Ok(record)
    }

    fn list_bodies(
        &self,
        kind: BodyKind,
        example_id: ExampleId,
    ) -> Result<Vec<BodyRecord>, StorageError> {
        let mut stmt = self.prepare(&format!(
            "SELECT {BODY_COLUMNS} FROM {} WHERE example_id = ?1 ORDER BY id",
            kind.table()
        ))?;
        let rows = stmt
            .query_map(params![example_id.as_bytes().as_slice()], |row| read_body(row, kind))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn update_body_fields(
        &self,
        kind: BodyKind,
        body_id: BodyId,
        fields: &BodyFields,
    ) -> Result<bool, StorageError> {
        let n = self.execute(
            &format!(
                "UPDATE {} SET key = ?1, value = ?2, description = ?3, enabled = ?4 WHERE id = ?5",
                kind.table()
            ),
            params![
                fields.key,
                fields.value,
                fields.description,
                fields.enabled,
                body_id.as_bytes().as_slice(),
            ],
        )?;
        Ok(n > 0)
    }

    fn delete_body_row(&self, kind: BodyKind, body_id: BodyId) -> Result<bool, StorageError> {
        let n = self.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![body_id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }

    fn bodies_with_delta_parent(
        &self,
        kind: BodyKind,
        parent_id: BodyId,
    ) -> Result<Vec<BodyRecord>, StorageError> {
        let mut stmt = self.prepare(&format!(
            "SELECT {BODY_COLUMNS} FROM {} WHERE delta_parent_id = ?1 ORDER BY id",
            kind.table()
        ))?;
        let rows = stmt
            .query_map(params![parent_id.as_bytes().as_slice()], |row| read_body(row, kind))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

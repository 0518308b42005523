use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, params};

use workbench_core::{BodyId, BodyKind, ExampleId, FieldPatch};

use crate::error::StorageError;
use crate::sqlite::required_uuid;

/// Per-row overlay state on a delta example. A `None` field is not
/// overridden and falls through to the origin row.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStateRecord {
    pub example_id: ExampleId,
    pub body_id: BodyId,
    pub kind: BodyKind,
    pub overrides: FieldPatch,
    pub suppressed: bool,
    pub seq: i64,
    pub updated: i64,
}

impl OverlayStateRecord {
    pub fn has_overrides(&self) -> bool {
        !self.overrides.is_empty()
    }
}

pub trait OverlayStore {
    fn get_state(
        &self,
        example_id: ExampleId,
        body_id: BodyId,
    ) -> Result<Option<OverlayStateRecord>, StorageError>;

    /// Upsert a state row. A row with no overrides that is not suppressed
    /// carries nothing, so it is deleted instead. Returns whether a row
    /// remains afterwards.
    fn write_state(
        &self,
        example_id: ExampleId,
        body_id: BodyId,
        kind: BodyKind,
        overrides: &FieldPatch,
        suppressed: bool,
        updated: i64,
    ) -> Result<bool, StorageError>;

    fn delete_state(&self, example_id: ExampleId, body_id: BodyId) -> Result<bool, StorageError>;

    fn states_for_example(
        &self,
        example_id: ExampleId,
        kind: BodyKind,
    ) -> Result<HashMap<BodyId, OverlayStateRecord>, StorageError>;

    /// Write one order row. Ranks are positions in the merged list; `None`
    /// makes the row follow origin order. Proxies are keyed by their origin
    /// row id, delta-only rows by their own id.
    fn upsert_order(
        &self,
        example_id: ExampleId,
        body_id: BodyId,
        kind: BodyKind,
        rank: Option<i64>,
    ) -> Result<(), StorageError>;

    fn delete_order(&self, example_id: ExampleId, body_id: BodyId) -> Result<bool, StorageError>;

    fn orders_for_example(
        &self,
        example_id: ExampleId,
        kind: BodyKind,
    ) -> Result<HashMap<BodyId, Option<i64>>, StorageError>;

    /// Drop every order row of `kind` and write `ranks` in their place.
    fn replace_orders(
        &self,
        example_id: ExampleId,
        kind: BodyKind,
        ranks: &[(BodyId, i64)],
    ) -> Result<(), StorageError>;
}

const STATE_COLUMNS: &str =
    "example_id, body_id, body_kind, key, value, description, enabled, suppressed, seq, updated";

fn read_state(row: &rusqlite::Row) -> rusqlite::Result<OverlayStateRecord> {
    Ok(OverlayStateRecord {
        example_id: ExampleId::from_uuid(required_uuid(row, 0)?),
        body_id: BodyId::from_uuid(required_uuid(row, 1)?),
        kind: kind_column(row, 2)?,
        overrides: FieldPatch {
            key: row.get(3)?,
            value: row.get(4)?,
            description: row.get(5)?,
            enabled: row.get(6)?,
        },
        suppressed: row.get(7)?,
        seq: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        updated: row.get(9)?,
    })
}

fn kind_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<BodyKind> {
    let raw: String = row.get(idx)?;
    BodyKind::parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl OverlayStore for Connection {
    fn get_state(
        &self,
        example_id: ExampleId,
        body_id: BodyId,
    ) -> Result<Option<OverlayStateRecord>, StorageError> {
        Ok(self
            .query_row(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM overlay_state WHERE example_id = ?1 AND body_id = ?2"
                ),
                params![example_id.as_bytes().as_slice(), body_id.as_bytes().as_slice()],
                read_state,
            )
            .optional()?)
    }

    fn write_state(
        &self,
        example_id: ExampleId,
        body_id: BodyId,
        kind: BodyKind,
        overrides: &FieldPatch,
        suppressed: bool,
        updated: i64,
    ) -> Result<bool, StorageError> {
        if overrides.is_empty() && !suppressed {
            self.delete_state(example_id, body_id)?;
            return Ok(false);
        }
        self.execute(
            "INSERT INTO overlay_state
                 (example_id, body_id, body_kind, key, value, description, enabled, suppressed, seq, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM overlay_state WHERE example_id = ?1), ?9)
             ON CONFLICT (example_id, body_id) DO UPDATE SET
                 body_kind = excluded.body_kind,
                 key = excluded.key,
                 value = excluded.value,
                 description = excluded.description,
                 enabled = excluded.enabled,
                 suppressed = excluded.suppressed,
                 seq = excluded.seq,
                 updated = excluded.updated",
            params![
                example_id.as_bytes().as_slice(),
                body_id.as_bytes().as_slice(),
                kind.as_str(),
                overrides.key,
                overrides.value,
                overrides.description,
                overrides.enabled,
                suppressed,
                updated,
            ],
        )?;
        Ok(true)
    }

    fn delete_state(&self, example_id: ExampleId, body_id: BodyId) -> Result<bool, StorageError> {
        let n = self.execute(
            "DELETE FROM overlay_state WHERE example_id = ?1 AND body_id = ?2",
            params![example_id.as_bytes().as_slice(), body_id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }

    fn states_for_example(
        &self,
        example_id: ExampleId,
        kind: BodyKind,
    ) -> Result<HashMap<BodyId, OverlayStateRecord>, StorageError> {
        let mut stmt = self.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM overlay_state WHERE example_id = ?1 AND body_kind = ?2"
        ))?;
        let states = stmt
            .query_map(params![example_id.as_bytes().as_slice(), kind.as_str()], read_state)?
            .map(|r| r.map(|s| (s.body_id, s)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(states)
    }

    fn upsert_order(
        &self,
        example_id: ExampleId,
        body_id: BodyId,
        kind: BodyKind,
        rank: Option<i64>,
    ) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO overlay_order (example_id, body_id, body_kind, rank)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (example_id, body_id) DO UPDATE SET
                 body_kind = excluded.body_kind,
                 rank = excluded.rank",
            params![
                example_id.as_bytes().as_slice(),
                body_id.as_bytes().as_slice(),
                kind.as_str(),
                rank,
            ],
        )?;
        Ok(())
    }

    fn delete_order(&self, example_id: ExampleId, body_id: BodyId) -> Result<bool, StorageError> {
        let n = self.execute(
            "DELETE FROM overlay_order WHERE example_id = ?1 AND body_id = ?2",
            params![example_id.as_bytes().as_slice(), body_id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }

    fn orders_for_example(
        &self,
        example_id: ExampleId,
        kind: BodyKind,
    ) -> Result<HashMap<BodyId, Option<i64>>, StorageError> {
        let mut stmt = self.prepare(
            "SELECT body_id, rank FROM overlay_order WHERE example_id = ?1 AND body_kind = ?2",
        )?;
        let rows = stmt
            .query_map(params![example_id.as_bytes().as_slice(), kind.as_str()], |row| {
                Ok((BodyId::from_uuid(required_uuid(row, 0)?), row.get::<_, Option<i64>>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    fn replace_orders(
        &self,
        example_id: ExampleId,
        kind: BodyKind,
        ranks: &[(BodyId, i64)],
    ) -> Result<(), StorageError> {
        self.execute(
            "DELETE FROM overlay_order WHERE example_id = ?1 AND body_kind = ?2",
            params![example_id.as_bytes().as_slice(), kind.as_str()],
        )?;
        let mut stmt = self.prepare(
            "INSERT INTO overlay_order (example_id, body_id, body_kind, rank) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (body_id, rank) in ranks {
            stmt.execute(params![
                example_id.as_bytes().as_slice(),
                body_id.as_bytes().as_slice(),
                kind.as_str(),
                rank,
            ])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStorage;
    use crate::traits::*;
    use workbench_core::{ExampleBodyKind, ids::*};

    fn example(conn: &Connection) -> ExampleId {
        let ws = WorkspaceRecord { id: WorkspaceId::new(), name: "ws".into(), updated: 0 };
        conn.insert_workspace(&ws).unwrap();
        let col = CollectionRecord { id: CollectionId::new(), workspace_id: ws.id, name: "c".into() };
        conn.insert_collection(&col).unwrap();
        let ep = EndpointRecord {
            id: EndpointId::new(),
            collection_id: col.id,
            name: "e".into(),
            method: "GET".into(),
            url: "/".into(),
            hidden: false,
            updated: 0,
        };
        conn.insert_endpoint(&ep).unwrap();
        let ex = ExampleRecord {
            id: ExampleId::new(),
            endpoint_id: ep.id,
            collection_id: col.id,
            name: "x".into(),
            body_kind: ExampleBodyKind::None,
            version_parent: None,
            is_default: true,
            prev: None,
            next: None,
            updated: 0,
        };
        conn.insert_example(&ex).unwrap();
        ex.id
    }

    #[test]
    fn empty_state_is_not_stored() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let conn = storage.conn();
        let ex = example(conn);
        let body = BodyId::new();

        let kept = conn
            .write_state(ex, body, BodyKind::Header, &FieldPatch::default().value(""), false, 1)
            .unwrap();
        assert!(kept);
        let state = conn.get_state(ex, body).unwrap().unwrap();
        assert_eq!(state.overrides.value.as_deref(), Some(""));
        assert_eq!(state.overrides.key, None);
        assert_eq!(state.kind, BodyKind::Header);

        let kept = conn
            .write_state(ex, body, BodyKind::Header, &FieldPatch::default(), false, 2)
            .unwrap();
        assert!(!kept);
        assert!(conn.get_state(ex, body).unwrap().is_none());
    }

    #[test]
    fn suppression_alone_keeps_the_row() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let conn = storage.conn();
        let ex = example(conn);
        let body = BodyId::new();
        conn.write_state(ex, body, BodyKind::Query, &FieldPatch::default(), true, 1)
            .unwrap();
        let states = conn.states_for_example(ex, BodyKind::Query).unwrap();
        assert!(states[&body].suppressed);
        assert!(!states[&body].has_overrides());
        assert!(conn.states_for_example(ex, BodyKind::Header).unwrap().is_empty());
    }

    #[test]
    fn replace_orders_scopes_by_kind() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let conn = storage.conn();
        let ex = example(conn);
        let (a, b, q) = (BodyId::new(), BodyId::new(), BodyId::new());
        conn.upsert_order(ex, q, BodyKind::Query, Some(0)).unwrap();
        conn.replace_orders(ex, BodyKind::Header, &[(a, 1), (b, 0)]).unwrap();
        conn.replace_orders(ex, BodyKind::Header, &[(b, 0)]).unwrap();

        let headers = conn.orders_for_example(ex, BodyKind::Header).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[&b], Some(0));
        assert_eq!(conn.orders_for_example(ex, BodyKind::Query).unwrap()[&q], Some(0));

        conn.upsert_order(ex, q, BodyKind::Query, None).unwrap();
        assert_eq!(conn.orders_for_example(ex, BodyKind::Query).unwrap()[&q], None);
        assert!(conn.delete_order(ex, q).unwrap());
        assert!(conn.orders_for_example(ex, BodyKind::Query).unwrap().is_empty());
    }
}

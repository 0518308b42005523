//! Delta overlay: the body rows of an origin example as seen from one of its
//! delta examples.
//!
//! A delta example carries one proxy row per origin row (`delta_parent` set)
//! plus any rows added only on the delta. Proxies are created lazily the
//! first time the merged list is read. Field overrides and tombstones live in
//! `overlay_state` keyed by the proxy id; user-chosen ranks live in
//! `overlay_order` keyed by the row's stable identity (origin id for proxies,
//! own id for delta-only rows) so they survive proxy recreation.

use std::collections::{HashMap, HashSet};

use rusqlite::Transaction;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use workbench_core::{
    BodyFields, BodyId, BodyKind, Context, DeltaSource, ExampleId, FieldPatch, MovePosition,
};
use workbench_storage::linked_list;
use workbench_storage::{
    BodyRecord, CatalogStore, ExampleRecord, ListKind, OverlayStateRecord, OverlayStore, now_secs,
};

use crate::bodies::remove_row;
use crate::{EngineError, Workbench};

/// One row of the merged list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedItem {
    /// Proxy or delta-only row id; the origin row id for `Origin` items.
    pub body_id: BodyId,
    #[serde(flatten)]
    pub fields: BodyFields,
    pub source: DeltaSource,
    /// Origin values, present on `Mixed` items only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<BodyFields>,
}

impl Workbench {
    /// The merged list of `delta_id` over `origin_id`, seeding missing
    /// proxies first.
    pub fn list_merged(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        delta_id: ExampleId,
        origin_id: ExampleId,
    ) -> Result<Vec<MergedItem>, EngineError> {
        self.overlay_pair(ctx, delta_id, origin_id)?;
        let origin_rows = self.ordered_bodies(ctx, kind, origin_id)?;
        self.seed_overlay(ctx, kind, delta_id, &origin_rows)?;
        let delta_rows = self.ordered_bodies(ctx, kind, delta_id)?;
        let conn = self.storage.conn();
        let states = conn.states_for_example(delta_id, kind)?;
        let ranks = conn.orders_for_example(delta_id, kind)?;
        Ok(merge(&origin_rows, &delta_rows, &states, &ranks))
    }

    /// Append a row that exists only on the delta example.
    pub fn create_delta(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        delta_id: ExampleId,
        origin_id: ExampleId,
        patch: &FieldPatch,
    ) -> Result<BodyId, EngineError> {
        self.overlay_pair(ctx, delta_id, origin_id)?;
        let base = BodyFields {
            enabled: true,
            ..BodyFields::default()
        };
        let record = BodyRecord {
            id: BodyId::new(),
            example_id: delta_id,
            kind,
            delta_parent: None,
            fields: patch.apply_to(&base),
            prev: None,
            next: None,
        };
        let parent = *delta_id.as_uuid();
        self.mutate(ctx, &[(ListKind::Body(kind), parent)], |tx| {
            tx.insert_body(&record)?;
            linked_list::append_at_end(tx, ListKind::Body(kind), parent, *record.id.as_uuid())?;
            tx.touch_example(delta_id, now_secs())?;
            Ok(())
        })?;
        Ok(record.id)
    }

    /// Write the fields present in `patch`. On a proxy they become overrides
    /// layered over the origin row; on a delta-only row they are written
    /// directly.
    pub fn update_delta(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        body_id: BodyId,
        patch: &FieldPatch,
    ) -> Result<(), EngineError> {
        let body = self.delta_row(ctx, kind, body_id)?;
        if patch.is_empty() {
            return Ok(());
        }
        self.mutate(ctx, &[], |tx| {
            match body.delta_parent {
                None => {
                    let fields = patch.apply_to(&body.fields);
                    tx.update_body_fields(kind, body.id, &fields)?;
                }
                Some(origin_row) => {
                    let origin = origin_fields(tx, kind, origin_row, &body)?;
                    let state = tx.get_state(body.example_id, body.id)?;
                    let (overrides, suppressed) = match state {
                        Some(s) => (s.overrides.merge(patch), s.suppressed),
                        None => (patch.clone(), false),
                    };
                    tx.write_state(body.example_id, body.id, kind, &overrides, suppressed, now_secs())?;
                    // keep the backing row readable without the overlay
                    tx.update_body_fields(kind, body.id, &overrides.apply_to(&origin))?;
                }
            }
            tx.touch_example(body.example_id, now_secs())?;
            Ok(())
        })
    }

    /// Hide a proxy behind a tombstone, or remove a delta-only row.
    pub fn delete_delta(&mut self, ctx: &Context, kind: BodyKind, body_id: BodyId) -> Result<(), EngineError> {
        let body = self.delta_row(ctx, kind, body_id)?;
        let parent = *body.example_id.as_uuid();
        match body.delta_parent {
            None => self.mutate(ctx, &[(ListKind::Body(kind), parent)], |tx| {
                remove_row(tx, &body)?;
                tx.touch_example(body.example_id, now_secs())?;
                Ok(())
            }),
            Some(_) => self.mutate(ctx, &[], |tx| {
                let overrides = tx
                    .get_state(body.example_id, body.id)?
                    .map(|s| s.overrides)
                    .unwrap_or_default();
                tx.write_state(body.example_id, body.id, kind, &overrides, true, now_secs())?;
                tx.touch_example(body.example_id, now_secs())?;
                Ok(())
            }),
        }
    }

    /// Drop every override, tombstone and rank of a proxy and mirror the
    /// origin values back into it.
    pub fn reset_delta(&mut self, ctx: &Context, kind: BodyKind, body_id: BodyId) -> Result<(), EngineError> {
        let body = self.delta_row(ctx, kind, body_id)?;
        let Some(origin_row) = body.delta_parent else {
            return Err(EngineError::InvalidArgument(format!(
                "row {body_id} exists only on the delta and has nothing to reset to"
            )));
        };
        self.mutate(ctx, &[], |tx| {
            let origin = origin_fields(tx, kind, origin_row, &body)?;
            tx.delete_state(body.example_id, body.id)?;
            tx.delete_order(body.example_id, origin_row)?;
            tx.update_body_fields(kind, body.id, &origin)?;
            tx.touch_example(body.example_id, now_secs())?;
            Ok(())
        })?;
        debug!(%body_id, kind = kind.as_str(), "overlay row reset");
        Ok(())
    }

    /// Reorder the merged list. Origin ids are accepted and resolved to
    /// their proxies. The resulting ranks are persisted so later seeding
    /// places recreated proxies where the user left them.
    #[allow(clippy::too_many_arguments)]
    pub fn move_delta(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        delta_id: ExampleId,
        origin_id: ExampleId,
        body_id: BodyId,
        target_id: BodyId,
        position: MovePosition,
    ) -> Result<(), EngineError> {
        self.overlay_pair(ctx, delta_id, origin_id)?;
        let origin_rows = self.ordered_bodies(ctx, kind, origin_id)?;
        self.seed_overlay(ctx, kind, delta_id, &origin_rows)?;

        let subject = self.resolve_overlay_row(kind, delta_id, body_id)?;
        let target = self.resolve_overlay_row(kind, delta_id, target_id)?;
        let parent = *delta_id.as_uuid();
        self.move_in_list(
            ctx,
            ListKind::Body(kind),
            parent,
            *subject.as_uuid(),
            *target.as_uuid(),
            position,
            |tx| persist_ranks(tx, kind, delta_id),
        )?;
        Ok(())
    }

    /// Both examples must be visible and `delta_id` must be a delta of
    /// `origin_id`.
    fn overlay_pair(
        &self,
        ctx: &Context,
        delta_id: ExampleId,
        origin_id: ExampleId,
    ) -> Result<(ExampleRecord, ExampleRecord), EngineError> {
        let delta = self.get_example(ctx, delta_id)?;
        let origin = self.get_example(ctx, origin_id)?;
        if delta.version_parent != Some(origin_id) {
            return Err(EngineError::InvalidArgument(format!(
                "example {delta_id} is not a delta of {origin_id}"
            )));
        }
        Ok((delta, origin))
    }

    /// A row that lives on a delta example. Origin rows are rejected.
    fn delta_row(&self, ctx: &Context, kind: BodyKind, body_id: BodyId) -> Result<BodyRecord, EngineError> {
        let body = self.body_for_write(ctx, kind, body_id)?;
        let example = self.get_example(ctx, body.example_id)?;
        if !example.is_delta() {
            return Err(EngineError::InvalidArgument(format!(
                "row {body_id} belongs to an origin example; use the proxy id from the merged list"
            )));
        }
        Ok(body)
    }

    /// Map an id from the merged list to the row on the delta example.
    fn resolve_overlay_row(&self, kind: BodyKind, delta_id: ExampleId, id: BodyId) -> Result<BodyId, EngineError> {
        let conn = self.storage.conn();
        let rows = conn.list_bodies(kind, delta_id)?;
        if let Some(row) = rows
            .iter()
            .find(|r| r.id == id)
            .or_else(|| rows.iter().find(|r| r.delta_parent == Some(id)))
        {
            return Ok(row.id);
        }
        match conn.get_body(kind, id)? {
            Some(_) => Err(EngineError::InvalidArgument(format!(
                "row {id} is not part of this overlay"
            ))),
            None => Err(EngineError::NotFound(format!("{} row {id}", kind.as_str()))),
        }
    }

    /// Create a proxy for every origin row that has none yet.
    fn seed_overlay(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        delta_id: ExampleId,
        origin_rows: &[BodyRecord],
    ) -> Result<usize, EngineError> {
        let proxied: HashSet<BodyId> = self
            .storage
            .conn()
            .list_bodies(kind, delta_id)?
            .into_iter()
            .filter_map(|b| b.delta_parent)
            .collect();
        if origin_rows.iter().all(|o| proxied.contains(&o.id)) {
            return Ok(0);
        }
        let parent = *delta_id.as_uuid();
        self.ensure_linked(ctx, ListKind::Body(kind), parent)?;
        let created = self.mutate(ctx, &[(ListKind::Body(kind), parent)], |tx| {
            seed_proxies(tx, kind, delta_id, origin_rows)
        })?;
        if created > 0 {
            info!(example_id = %delta_id, kind = kind.as_str(), created, "seeded overlay proxies");
        }
        Ok(created)
    }
}

fn key_of(row: &BodyRecord) -> BodyId {
    row.delta_parent.unwrap_or(row.id)
}

/// Origin values for a proxy; a proxy whose origin row is gone falls back
/// to its own fields.
fn origin_fields(
    tx: &Transaction<'_>,
    kind: BodyKind,
    origin_row: BodyId,
    proxy: &BodyRecord,
) -> Result<BodyFields, EngineError> {
    Ok(tx
        .get_body(kind, origin_row)?
        .map(|o| o.fields)
        .unwrap_or_else(|| proxy.fields.clone()))
}

fn seed_proxies(
    tx: &Transaction<'_>,
    kind: BodyKind,
    delta_id: ExampleId,
    origin_rows: &[BodyRecord],
) -> Result<usize, EngineError> {
    let list = ListKind::Body(kind);
    let parent = *delta_id.as_uuid();
    let ordered = linked_list::get_items_by_parent(tx, list, parent)?;
    let rows: HashMap<Uuid, BodyRecord> = tx
        .list_bodies(kind, delta_id)?
        .into_iter()
        .map(|b| (*b.id.as_uuid(), b))
        .collect();
    let existing: HashMap<BodyId, BodyId> = rows.values().map(|b| (key_of(b), b.id)).collect();
    let keys: Vec<BodyId> = ordered.iter().filter_map(|id| rows.get(id)).map(key_of).collect();

    let origin_order: Vec<BodyId> = origin_rows.iter().map(|o| o.id).collect();
    let by_origin: HashMap<BodyId, &BodyRecord> = origin_rows.iter().map(|o| (o.id, o)).collect();
    let ranks = tx.orders_for_example(delta_id, kind)?;
    let full = fill_missing(&origin_order, keys, &ranks);

    let mut placed: Vec<Option<BodyId>> = full.iter().map(|k| existing.get(k).copied()).collect();
    let mut created = 0;
    for i in 0..full.len() {
        if placed[i].is_some() {
            continue;
        }
        let Some(origin) = by_origin.get(&full[i]) else {
            continue;
        };
        let proxy = BodyRecord {
            id: BodyId::new(),
            example_id: delta_id,
            kind,
            delta_parent: Some(origin.id),
            fields: origin.fields.clone(),
            prev: None,
            next: None,
        };
        tx.insert_body(&proxy)?;
        let id = *proxy.id.as_uuid();
        let before = i.checked_sub(1).and_then(|p| placed[p]);
        let after = placed[i + 1..].iter().flatten().next().copied();
        match (before, after) {
            (Some(prev), _) => linked_list::insert_after(tx, list, parent, id, *prev.as_uuid())?,
            (None, Some(next)) => linked_list::insert_before(tx, list, parent, id, *next.as_uuid())?,
            (None, None) => linked_list::append_at_end(tx, list, parent, id)?,
        }
        if !ranks.is_empty() && !ranks.contains_key(&origin.id) {
            // user-ordered overlay: the new row follows origin order until moved
            tx.upsert_order(delta_id, origin.id, kind, None)?;
        }
        placed[i] = Some(proxy.id);
        created += 1;
    }
    Ok(created)
}

/// Splice every origin key missing from `keys` into it. Without any proxy
/// in `keys` the missing ones are appended in origin order. Otherwise keys
/// with a persisted rank go in first, lowest rank first, each at its rank;
/// the rest go in front of the nearest following origin key already
/// present, or at the end.
pub(crate) fn fill_missing(
    origin_order: &[BodyId],
    mut keys: Vec<BodyId>,
    ranks: &HashMap<BodyId, Option<i64>>,
) -> Vec<BodyId> {
    let present: HashSet<BodyId> = keys.iter().copied().collect();
    let missing: Vec<BodyId> = origin_order.iter().copied().filter(|k| !present.contains(k)).collect();
    if missing.is_empty() {
        return keys;
    }
    if !origin_order.iter().any(|k| present.contains(k)) {
        keys.extend(missing);
        return keys;
    }

    let mut ranked: Vec<(BodyId, i64)> = Vec::new();
    let mut unranked = Vec::new();
    for key in missing {
        match ranks.get(&key) {
            Some(Some(rank)) => ranked.push((key, *rank)),
            _ => unranked.push(key),
        }
    }
    // ranks are positions in the full list, so filling from the front keeps
    // every earlier insertion in place for the later ones
    ranked.sort_by_key(|&(_, rank)| rank);
    for (key, rank) in ranked {
        let at = usize::try_from(rank).unwrap_or(0).min(keys.len());
        keys.insert(at, key);
    }
    for key in unranked {
        let at = origin_order
            .iter()
            .skip_while(|k| **k != key)
            .skip(1)
            .find_map(|following| keys.iter().position(|k| k == following))
            .unwrap_or(keys.len());
        keys.insert(at, key);
    }
    keys
}

fn merge(
    origin_rows: &[BodyRecord],
    delta_rows: &[BodyRecord],
    states: &HashMap<BodyId, OverlayStateRecord>,
    ranks: &HashMap<BodyId, Option<i64>>,
) -> Vec<MergedItem> {
    let by_origin: HashMap<BodyId, &BodyRecord> = origin_rows.iter().map(|o| (o.id, o)).collect();
    let mut projected: HashMap<BodyId, Option<MergedItem>> = HashMap::with_capacity(delta_rows.len());
    let mut keys = Vec::with_capacity(delta_rows.len());
    for row in delta_rows {
        let key = key_of(row);
        if projected.contains_key(&key) {
            continue;
        }
        keys.push(key);
        let origin = by_origin.get(&key).copied();
        projected.insert(key, project(row, origin, states.get(&row.id)));
    }

    let origin_order: Vec<BodyId> = origin_rows.iter().map(|o| o.id).collect();
    fill_missing(&origin_order, keys, ranks)
        .into_iter()
        .filter_map(|key| match projected.remove(&key) {
            Some(item) => item,
            None => by_origin.get(&key).map(|o| MergedItem {
                body_id: o.id,
                fields: o.fields.clone(),
                source: DeltaSource::Origin,
                origin: None,
            }),
        })
        .collect()
}

/// `None` for a suppressed proxy.
fn project(
    row: &BodyRecord,
    origin: Option<&BodyRecord>,
    state: Option<&OverlayStateRecord>,
) -> Option<MergedItem> {
    let Some(parent) = row.delta_parent else {
        return Some(MergedItem {
            body_id: row.id,
            fields: row.fields.clone(),
            source: DeltaSource::DeltaOnly,
            origin: None,
        });
    };
    if state.is_some_and(|s| s.suppressed) {
        return None;
    }
    let base = origin.map_or_else(|| row.fields.clone(), |o| o.fields.clone());
    let overrides = state.map(|s| &s.overrides).filter(|o| !o.is_empty());
    let source = DeltaSource::classify(true, Some(parent), overrides.is_some());
    Some(match overrides {
        Some(o) => MergedItem {
            body_id: row.id,
            fields: o.apply_to(&base),
            source,
            origin: Some(base),
        },
        None => MergedItem {
            body_id: row.id,
            fields: base,
            source,
            origin: None,
        },
    })
}

/// Record the current rank of every row of the delta list.
fn persist_ranks(tx: &Transaction<'_>, kind: BodyKind, delta_id: ExampleId) -> Result<(), EngineError> {
    let ordered = linked_list::get_items_by_parent(tx, ListKind::Body(kind), *delta_id.as_uuid())?;
    let rows: HashMap<Uuid, BodyRecord> = tx
        .list_bodies(kind, delta_id)?
        .into_iter()
        .map(|b| (*b.id.as_uuid(), b))
        .collect();
    let ranks: Vec<(BodyId, i64)> = ordered
        .iter()
        .filter_map(|id| rows.get(id))
        .zip(0i64..)
        .map(|(row, rank)| (key_of(row), rank))
        .collect();
    tx.replace_orders(delta_id, kind, &ranks)?;
    Ok(())
}

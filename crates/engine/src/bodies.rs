//! Plain ordered body lists (form, url-encoded, headers, queries).
//!
//! Changes to rows of an origin example flow into the proxies that stand in
//! for them on delta examples: an update is mirrored into every proxy that
//! has no overrides, a delete removes every proxy.

use std::collections::HashMap;

use rusqlite::Transaction;
use tracing::{debug, warn};

use workbench_core::{BodyFields, BodyId, BodyKind, Context, ExampleId, FieldPatch, MovePosition};
use workbench_storage::linked_list;
use workbench_storage::{BodyRecord, CatalogStore, ListKind, OverlayStore, now_secs};

use crate::{EngineError, Resource, Workbench};

impl Workbench {
    pub fn list_bodies(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        example_id: ExampleId,
    ) -> Result<Vec<BodyRecord>, EngineError> {
        self.get_example(ctx, example_id)?;
        self.ordered_bodies(ctx, kind, example_id)
    }

    /// Rows of one example in list order, recovering the list if needed.
    pub(crate) fn ordered_bodies(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        example_id: ExampleId,
    ) -> Result<Vec<BodyRecord>, EngineError> {
        let ordered = self.read_ordered(ctx, ListKind::Body(kind), *example_id.as_uuid())?;
        let mut by_id: HashMap<_, _> = self
            .storage
            .conn()
            .list_bodies(kind, example_id)?
            .into_iter()
            .map(|b| (*b.id.as_uuid(), b))
            .collect();
        let mut out = Vec::with_capacity(by_id.len());
        for id in ordered {
            if let Some(body) = by_id.remove(&id) {
                out.push(body);
            }
        }
        if !by_id.is_empty() {
            let mut rest: Vec<_> = by_id.into_values().collect();
            rest.sort_by_key(|b| b.id);
            out.extend(rest);
        }
        Ok(out)
    }

    /// Append a row to an example's list.
    pub fn create_body(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        example_id: ExampleId,
        fields: BodyFields,
    ) -> Result<BodyId, EngineError> {
        self.get_example(ctx, example_id)?;
        let record = BodyRecord {
            id: BodyId::new(),
            example_id,
            kind,
            delta_parent: None,
            fields,
            prev: None,
            next: None,
        };
        let parent = *example_id.as_uuid();
        self.mutate(ctx, &[(ListKind::Body(kind), parent)], |tx| {
            tx.insert_body(&record)?;
            linked_list::append_at_end(tx, ListKind::Body(kind), parent, *record.id.as_uuid())?;
            tx.touch_example(example_id, now_secs())?;
            Ok(())
        })?;
        Ok(record.id)
    }

    /// Patch a row in place. Proxies on delta examples only change through
    /// the overlay API.
    pub fn update_body(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        body_id: BodyId,
        patch: &FieldPatch,
    ) -> Result<BodyRecord, EngineError> {
        let body = self.body_for_write(ctx, kind, body_id)?;
        if body.delta_parent.is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "row {body_id} stands in for an origin row; update it through the overlay"
            )));
        }
        if patch.is_empty() {
            return Ok(body);
        }
        let fields = patch.apply_to(&body.fields);
        let mirrored = self.mutate(ctx, &[], |tx| {
            tx.update_body_fields(kind, body_id, &fields)?;
            tx.touch_example(body.example_id, now_secs())?;
            propagate_update(tx, kind, body_id, &fields)
        })?;
        if mirrored > 0 {
            debug!(%body_id, kind = kind.as_str(), mirrored, "origin update propagated");
        }
        Ok(BodyRecord { fields, ..body })
    }

    /// Unlink and delete a row. Deleting an origin row also deletes every
    /// proxy of it; deleting a row on a delta example drops its overlay rows.
    pub fn delete_body(&mut self, ctx: &Context, kind: BodyKind, body_id: BodyId) -> Result<(), EngineError> {
        let body = self.body_for_write(ctx, kind, body_id)?;
        let parent = *body.example_id.as_uuid();
        let removed = self.mutate(ctx, &[(ListKind::Body(kind), parent)], |tx| {
            let removed = propagate_delete(tx, kind, body_id)?;
            remove_row(tx, &body)?;
            tx.touch_example(body.example_id, now_secs())?;
            Ok(removed)
        })?;
        if removed > 0 {
            debug!(%body_id, kind = kind.as_str(), removed, "origin delete propagated");
        }
        Ok(())
    }

    pub fn move_body(
        &mut self,
        ctx: &Context,
        kind: BodyKind,
        example_id: ExampleId,
        body_id: BodyId,
        target_id: BodyId,
        position: MovePosition,
    ) -> Result<(), EngineError> {
        self.get_example(ctx, example_id)?;
        self.move_in_list(
            ctx,
            ListKind::Body(kind),
            *example_id.as_uuid(),
            *body_id.as_uuid(),
            *target_id.as_uuid(),
            position,
            |_| Ok(()),
        )?;
        Ok(())
    }

    /// Load a row and check its owning example.
    pub(crate) fn body_for_write(
        &self,
        ctx: &Context,
        kind: BodyKind,
        body_id: BodyId,
    ) -> Result<BodyRecord, EngineError> {
        ctx.check()?;
        let body = self
            .storage
            .conn()
            .get_body(kind, body_id)?
            .ok_or_else(|| EngineError::NotFound(format!("{} row {body_id}", kind.as_str())))?;
        self.authorize(ctx, Resource::Example(body.example_id))?;
        Ok(body)
    }
}

/// Mirror new origin values into every proxy without overrides. Returns the
/// number of proxies rewritten.
pub(crate) fn propagate_update(
    tx: &Transaction<'_>,
    kind: BodyKind,
    origin_id: BodyId,
    fields: &BodyFields,
) -> Result<usize, EngineError> {
    let mut mirrored = 0;
    for proxy in tx.bodies_with_delta_parent(kind, origin_id)? {
        let overridden = tx
            .get_state(proxy.example_id, proxy.id)?
            .is_some_and(|state| state.has_overrides());
        if overridden {
            continue;
        }
        tx.update_body_fields(kind, proxy.id, fields)?;
        mirrored += 1;
    }
    Ok(mirrored)
}

/// Delete every proxy of an origin row. Returns how many were removed.
pub(crate) fn propagate_delete(
    tx: &Transaction<'_>,
    kind: BodyKind,
    origin_id: BodyId,
) -> Result<usize, EngineError> {
    let proxies = tx.bodies_with_delta_parent(kind, origin_id)?;
    for proxy in &proxies {
        // the proxy's rank is keyed by the origin row, which is going away
        tx.delete_order(proxy.example_id, origin_id)?;
        remove_row(tx, proxy)?;
    }
    Ok(proxies.len())
}

/// Unlink a row from its list, drop its overlay rows and delete it.
pub(crate) fn remove_row(tx: &Transaction<'_>, body: &BodyRecord) -> Result<(), EngineError> {
    let kind = ListKind::Body(body.kind);
    let parent = *body.example_id.as_uuid();
    if let Err(e) = linked_list::unlink(tx, kind, parent, *body.id.as_uuid()) {
        warn!(body_id = %body.id, error = %e, "unlink before delete failed");
        return Err(e.into());
    }
    tx.delete_state(body.example_id, body.id)?;
    if body.delta_parent.is_none() {
        tx.delete_order(body.example_id, body.id)?;
    }
    tx.delete_body_row(body.kind, body.id)?;
    Ok(())
}

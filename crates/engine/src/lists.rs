use rusqlite::{Connection, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use workbench_core::{Context, MovePosition};
use workbench_storage::linked_list::{self, ListNode};
use workbench_storage::ListKind;

use crate::{EngineError, ErrorCode, Workbench};

#[derive(Debug, Clone, Copy)]
struct MovePlan {
    desired: Option<usize>,
    subject: ListNode,
    target: ListNode,
}

impl Workbench {
    /// Every row id of a list in display order. An incomplete walk triggers
    /// a repair and a second walk; if that still falls short the rows come
    /// back in ascending id order so none are dropped.
    pub(crate) fn read_ordered(
        &mut self,
        ctx: &Context,
        kind: ListKind,
        parent: Uuid,
    ) -> Result<Vec<Uuid>, EngineError> {
        ctx.check()?;
        match linked_list::traverse(self.storage.conn(), kind, parent) {
            Ok(walk) if walk.is_complete() => return Ok(walk.ordered),
            Ok(walk) => warn!(
                list = kind.as_str(),
                %parent,
                isolated = walk.isolated.len(),
                reached = walk.ordered.len(),
                total = walk.total,
                "incomplete list traversal, repairing"
            ),
            Err(e) => warn!(list = kind.as_str(), %parent, error = %e, "list traversal failed, repairing"),
        }

        match self.mutate(ctx, &[], |tx| Ok(linked_list::repair(tx, kind, parent)?)) {
            Ok(rewritten) => debug!(list = kind.as_str(), %parent, rewritten, "list repaired"),
            Err(e) if e.code() == ErrorCode::Cancelled => return Err(e),
            Err(e) => warn!(list = kind.as_str(), %parent, error = %e, "list repair failed"),
        }

        match linked_list::traverse(self.storage.conn(), kind, parent) {
            Ok(walk) if walk.is_complete() => return Ok(walk.ordered),
            Ok(walk) => warn!(
                list = kind.as_str(),
                %parent,
                reached = walk.ordered.len(),
                total = walk.total,
                "list still incomplete after repair"
            ),
            Err(e) => warn!(list = kind.as_str(), %parent, error = %e, "list traversal failed after repair"),
        }

        warn!(list = kind.as_str(), %parent, "falling back to unordered scan");
        Ok(linked_list::scan_unordered(self.storage.conn(), kind, parent)?
            .into_iter()
            .map(|n| n.id)
            .collect())
    }

    /// Repair the list up front if the walk does not reach every row.
    pub(crate) fn ensure_linked(
        &mut self,
        ctx: &Context,
        kind: ListKind,
        parent: Uuid,
    ) -> Result<(), EngineError> {
        let intact = linked_list::traverse(self.storage.conn(), kind, parent)
            .map(|walk| walk.is_complete())
            .unwrap_or(false);
        if intact {
            return Ok(());
        }
        let rewritten = self.mutate(ctx, &[(kind, parent)], |tx| {
            Ok(linked_list::repair(tx, kind, parent)?)
        })?;
        warn!(list = kind.as_str(), %parent, rewritten, "repaired list before mutation");
        Ok(())
    }

    /// Move `id` before or after `target`, then run `after` in the same
    /// transaction. Returns whether the row changed position.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn move_in_list<AF>(
        &mut self,
        ctx: &Context,
        kind: ListKind,
        parent: Uuid,
        id: Uuid,
        target: Uuid,
        position: MovePosition,
        after: AF,
    ) -> Result<bool, EngineError>
    where
        AF: Fn(&Transaction<'_>) -> Result<(), EngineError>,
    {
        ctx.check()?;
        // an empty list or a missing row is reported before the self-move
        linked_list::get_node(self.storage.conn(), kind, parent, id)?;
        if id == target {
            return Err(EngineError::InvalidArgument(
                "cannot move a row relative to itself".into(),
            ));
        }
        self.ensure_linked(ctx, kind, parent)?;
        self.run_planned(
            ctx,
            &[(kind, parent)],
            |conn| plan_move(conn, kind, parent, id, target, position),
            |tx, plan| {
                verify_plan(tx, kind, parent, plan)?;
                let moved = match plan.desired {
                    Some(index) => linked_list::update_position(tx, kind, parent, id, index)?,
                    None => false,
                };
                after(tx)?;
                Ok(moved)
            },
        )
    }
}

fn plan_move(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    id: Uuid,
    target: Uuid,
    position: MovePosition,
) -> Result<MovePlan, EngineError> {
    let ordered = linked_list::get_items_by_parent(conn, kind, parent)?;
    let desired = linked_list::desired_index(&ordered, id, target, position)?;
    Ok(MovePlan {
        desired,
        subject: linked_list::get_node(conn, kind, parent, id)?,
        target: linked_list::get_node(conn, kind, parent, target)?,
    })
}

/// Both rows must still have the neighbours the plan was computed from.
fn verify_plan(
    tx: &Transaction<'_>,
    kind: ListKind,
    parent: Uuid,
    plan: &MovePlan,
) -> Result<(), EngineError> {
    for planned in [plan.subject, plan.target] {
        let current = linked_list::get_node(tx, kind, parent, planned.id)?;
        if current != planned {
            return Err(EngineError::Conflict(format!(
                "neighbours of {} changed since the move was planned",
                planned.id
            )));
        }
    }
    Ok(())
}

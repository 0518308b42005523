//! Per-parent doubly linked lists stored as `prev`/`next` columns.
//!
//! Every function takes a plain `&Connection`; callers that mutate are
//! expected to pass an open transaction so partial pointer updates roll back
//! together.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};
use uuid::Uuid;

use workbench_core::{BodyKind, MovePosition};

use crate::error::StorageError;
use crate::sqlite::{opt_blob, required_uuid, uuid_column};

/// Which table a list lives in, and which column scopes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Examples under an endpoint.
    Examples,
    /// Body children under an example.
    Body(BodyKind),
}

impl ListKind {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Examples => "examples",
            Self::Body(kind) => kind.table(),
        }
    }

    pub fn parent_column(&self) -> &'static str {
        match self {
            Self::Examples => "endpoint_id",
            Self::Body(_) => "example_id",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Examples => "examples",
            Self::Body(kind) => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListNode {
    pub id: Uuid,
    pub prev: Option<Uuid>,
    pub next: Option<Uuid>,
}

/// Result of walking a list from its head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traversal {
    pub ordered: Vec<Uuid>,
    /// Rows with neither neighbour while the parent has more than one row.
    pub isolated: Vec<Uuid>,
    pub total: usize,
}

impl Traversal {
    pub fn is_complete(&self) -> bool {
        self.isolated.is_empty() && self.ordered.len() == self.total
    }
}

/// Pointer-level health of one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListHealth {
    pub count: usize,
    pub heads: usize,
    pub tails: usize,
    pub isolated: Vec<Uuid>,
    pub asymmetric: usize,
    pub self_loops: usize,
    /// Length reached by the ordered walk, `None` when the walk failed.
    pub ordered_len: Option<usize>,
}

impl ListHealth {
    pub fn is_healthy(&self) -> bool {
        if self.count == 0 {
            return self.heads == 0 && self.tails == 0;
        }
        self.heads == 1
            && self.tails == 1
            && self.isolated.is_empty()
            && self.asymmetric == 0
            && self.self_loops == 0
            && self.ordered_len == Some(self.count)
    }
}

pub fn count(conn: &Connection, kind: ListKind, parent: Uuid) -> Result<usize, StorageError> {
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            kind.table(),
            kind.parent_column()
        ),
        params![parent.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

/// Every row of the parent in ascending id order, pointers as stored.
pub fn scan_unordered(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
) -> Result<Vec<ListNode>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, prev, next FROM {} WHERE {} = ?1 ORDER BY id",
        kind.table(),
        kind.parent_column()
    ))?;
    let nodes = stmt
        .query_map(params![parent.as_bytes().as_slice()], read_node)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(nodes)
}

fn read_node(row: &rusqlite::Row) -> rusqlite::Result<ListNode> {
    Ok(ListNode {
        id: required_uuid(row, 0)?,
        prev: uuid_column(row, 1)?,
        next: uuid_column(row, 2)?,
    })
}

/// Look up a row's pointers, checking it belongs to `parent`.
pub fn get_node(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    id: Uuid,
) -> Result<ListNode, StorageError> {
    let found = conn
        .query_row(
            &format!(
                "SELECT id, prev, next, {} FROM {} WHERE id = ?1",
                kind.parent_column(),
                kind.table()
            ),
            params![id.as_bytes().as_slice()],
            |row| Ok((read_node(row)?, required_uuid(row, 3)?)),
        )
        .optional()?;
    match found {
        None => Err(StorageError::NotFound(format!("{} row {id}", kind.as_str()))),
        Some((_, owner)) if owner != parent => Err(StorageError::InvalidArgument(format!(
            "{} row {id} does not belong to parent {parent}",
            kind.as_str()
        ))),
        Some((node, _)) => Ok(node),
    }
}

pub fn detect_isolated(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
) -> Result<Vec<Uuid>, StorageError> {
    let (table, col) = (kind.table(), kind.parent_column());
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {table}
         WHERE {col} = ?1 AND prev IS NULL AND next IS NULL
           AND (SELECT COUNT(*) FROM {table} WHERE {col} = ?1) > 1
         ORDER BY id"
    ))?;
    let ids = stmt
        .query_map(params![parent.as_bytes().as_slice()], |row| required_uuid(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Walk the list from its unique head with a recursive query bounded by the
/// row count, so a cycle surfaces as an overlong walk instead of a hang.
/// Isolated rows are reported rather than treated as corruption.
pub fn traverse(conn: &Connection, kind: ListKind, parent: Uuid) -> Result<Traversal, StorageError> {
    let total = count(conn, kind, parent)?;
    if total == 0 {
        return Ok(Traversal::default());
    }
    let isolated = detect_isolated(conn, kind, parent)?;
    let (table, col) = (kind.table(), kind.parent_column());

    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {table}
         WHERE {col} = ?1 AND prev IS NULL AND (next IS NOT NULL OR ?2 = 1)
         ORDER BY id"
    ))?;
    let heads = stmt
        .query_map(params![parent.as_bytes().as_slice(), total as i64], |row| {
            required_uuid(row, 0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let head = match heads.as_slice() {
        [] if isolated.len() == total => {
            return Ok(Traversal {
                ordered: Vec::new(),
                isolated,
                total,
            });
        }
        [] => {
            return Err(StorageError::Corrupt(format!(
                "{} list under {parent} has no head",
                kind.as_str()
            )));
        }
        [head] => *head,
        _ => {
            return Err(StorageError::Corrupt(format!(
                "{} list under {parent} has {} heads",
                kind.as_str(),
                heads.len()
            )));
        }
    };

    let mut stmt = conn.prepare(&format!(
        "WITH RECURSIVE chain(id, prev, next, depth) AS (
             SELECT id, prev, next, 0 FROM {table} WHERE id = ?1 AND {col} = ?2
             UNION ALL
             SELECT t.id, t.prev, t.next, chain.depth + 1
             FROM {table} t JOIN chain ON t.id = chain.next
             WHERE t.{col} = ?2 AND chain.depth < ?3
         )
         SELECT id, prev, next FROM chain ORDER BY depth"
    ))?;
    let walked = stmt
        .query_map(
            params![head.as_bytes().as_slice(), parent.as_bytes().as_slice(), total as i64],
            read_node,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    if walked.len() > total {
        return Err(StorageError::Corrupt(format!(
            "cycle in {} list under {parent}",
            kind.as_str()
        )));
    }
    for pair in walked.windows(2) {
        if pair[1].prev != Some(pair[0].id) {
            return Err(StorageError::Corrupt(format!(
                "asymmetric pointers between {} and {}",
                pair[0].id, pair[1].id
            )));
        }
    }
    if let Some(last) = walked.last()
        && let Some(next) = last.next
    {
        return Err(StorageError::Corrupt(format!(
            "{} row {} points at missing row {next}",
            kind.as_str(),
            last.id
        )));
    }

    Ok(Traversal {
        ordered: walked.into_iter().map(|n| n.id).collect(),
        isolated,
        total,
    })
}

/// Strict ordered read: any isolated row or short walk is an error.
pub fn get_items_by_parent(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
) -> Result<Vec<Uuid>, StorageError> {
    let walk = traverse(conn, kind, parent)?;
    if !walk.is_complete() {
        return Err(StorageError::Corrupt(format!(
            "{} list under {parent}: walk reached {} of {} rows ({} isolated)",
            kind.as_str(),
            walk.ordered.len(),
            walk.total,
            walk.isolated.len()
        )));
    }
    Ok(walk.ordered)
}

fn set_links(
    conn: &Connection,
    kind: ListKind,
    id: Uuid,
    prev: Option<Uuid>,
    next: Option<Uuid>,
) -> Result<(), StorageError> {
    conn.execute(
        &format!("UPDATE {} SET prev = ?1, next = ?2 WHERE id = ?3", kind.table()),
        params![opt_blob(prev), opt_blob(next), id.as_bytes().as_slice()],
    )?;
    Ok(())
}

fn set_prev(conn: &Connection, kind: ListKind, id: Uuid, prev: Option<Uuid>) -> Result<(), StorageError> {
    conn.execute(
        &format!("UPDATE {} SET prev = ?1 WHERE id = ?2", kind.table()),
        params![opt_blob(prev), id.as_bytes().as_slice()],
    )?;
    Ok(())
}

fn set_next(conn: &Connection, kind: ListKind, id: Uuid, next: Option<Uuid>) -> Result<(), StorageError> {
    conn.execute(
        &format!("UPDATE {} SET next = ?1 WHERE id = ?2", kind.table()),
        params![opt_blob(next), id.as_bytes().as_slice()],
    )?;
    Ok(())
}

/// Detach a row, stitching its neighbours together. Neighbours are only
/// patched when they point back at the row.
pub fn unlink(conn: &Connection, kind: ListKind, parent: Uuid, id: Uuid) -> Result<(), StorageError> {
    let node = get_node(conn, kind, parent, id)?;
    let table = kind.table();
    if let Some(prev) = node.prev {
        conn.execute(
            &format!("UPDATE {table} SET next = ?1 WHERE id = ?2 AND next = ?3"),
            params![
                opt_blob(node.next),
                prev.as_bytes().as_slice(),
                id.as_bytes().as_slice()
            ],
        )?;
    }
    if let Some(next) = node.next {
        conn.execute(
            &format!("UPDATE {table} SET prev = ?1 WHERE id = ?2 AND prev = ?3"),
            params![
                opt_blob(node.prev),
                next.as_bytes().as_slice(),
                id.as_bytes().as_slice()
            ],
        )?;
    }
    set_links(conn, kind, id, None, None)
}

fn ensure_detached(conn: &Connection, kind: ListKind, parent: Uuid, id: Uuid) -> Result<(), StorageError> {
    let node = get_node(conn, kind, parent, id)?;
    if node.prev.is_some() || node.next.is_some() {
        unlink(conn, kind, parent, id)?;
    }
    Ok(())
}

/// Link `id` after the current tail. An empty list leaves it as the sole row.
pub fn append_at_end(conn: &Connection, kind: ListKind, parent: Uuid, id: Uuid) -> Result<(), StorageError> {
    ensure_detached(conn, kind, parent, id)?;
    let mut tail = tail_candidates(conn, kind, parent, id)?;
    if tail.len() > 1 {
        warn!(list = kind.as_str(), %parent, tails = tail.len(), "multiple tails before append, repairing");
        repair_inner(conn, kind, parent, Some(id))?;
        tail = tail_candidates(conn, kind, parent, id)?;
    }
    match tail.as_slice() {
        [] => set_links(conn, kind, id, None, None),
        [tail] => {
            set_next(conn, kind, *tail, Some(id))?;
            set_links(conn, kind, id, Some(*tail), None)
        }
        _ => Err(StorageError::Corrupt(format!(
            "{} list under {parent} still has {} tails after repair",
            kind.as_str(),
            tail.len()
        ))),
    }
}

fn tail_candidates(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    exclude: Uuid,
) -> Result<Vec<Uuid>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE {} = ?1 AND next IS NULL AND id <> ?2 ORDER BY id",
        kind.table(),
        kind.parent_column()
    ))?;
    let ids = stmt
        .query_map(
            params![parent.as_bytes().as_slice(), exclude.as_bytes().as_slice()],
            |row| required_uuid(row, 0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Splice a detached row in front of `anchor`.
pub fn insert_before(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    id: Uuid,
    anchor: Uuid,
) -> Result<(), StorageError> {
    if id == anchor {
        return Err(StorageError::InvalidArgument("cannot link a row to itself".into()));
    }
    ensure_detached(conn, kind, parent, id)?;
    let anchor_node = get_node(conn, kind, parent, anchor)?;
    if let Some(prev) = anchor_node.prev {
        set_next(conn, kind, prev, Some(id))?;
    }
    set_links(conn, kind, id, anchor_node.prev, Some(anchor))?;
    set_prev(conn, kind, anchor, Some(id))
}

/// Splice a detached row behind `anchor`.
pub fn insert_after(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    id: Uuid,
    anchor: Uuid,
) -> Result<(), StorageError> {
    if id == anchor {
        return Err(StorageError::InvalidArgument("cannot link a row to itself".into()));
    }
    ensure_detached(conn, kind, parent, id)?;
    let anchor_node = get_node(conn, kind, parent, anchor)?;
    if let Some(next) = anchor_node.next {
        set_prev(conn, kind, next, Some(id))?;
    }
    set_links(conn, kind, id, Some(anchor), anchor_node.next)?;
    set_next(conn, kind, anchor, Some(id))
}

/// Final index of `id` after moving it next to `target`. `None` means the
/// move is a no-op (moving relative to itself).
pub fn desired_index(
    ordered: &[Uuid],
    id: Uuid,
    target: Uuid,
    position: MovePosition,
) -> Result<Option<usize>, StorageError> {
    if ordered.is_empty() {
        return Err(StorageError::NotFound("list is empty".into()));
    }
    if id == target {
        return Ok(None);
    }
    if !ordered.contains(&target) {
        return Err(StorageError::NotFound(format!("move target {target}")));
    }
    if !ordered.contains(&id) {
        return Err(StorageError::InvalidArgument(format!("row {id} is not in this list")));
    }
    let rest: Vec<Uuid> = ordered.iter().copied().filter(|x| *x != id).collect();
    let t = rest
        .iter()
        .position(|x| *x == target)
        .ok_or_else(|| StorageError::NotFound(format!("move target {target}")))?;
    Ok(Some(match position {
        MovePosition::Before => t,
        MovePosition::After => t + 1,
    }))
}

fn apply_position(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    ordered: &[Uuid],
    id: Uuid,
    desired: usize,
) -> Result<bool, StorageError> {
    let current = ordered
        .iter()
        .position(|x| *x == id)
        .ok_or_else(|| StorageError::InvalidArgument(format!("row {id} is not in this list")))?;
    let rest: Vec<Uuid> = ordered.iter().copied().filter(|x| *x != id).collect();
    let desired = desired.min(rest.len());
    if desired == current {
        return Ok(false);
    }
    unlink(conn, kind, parent, id)?;
    if desired == rest.len() {
        // rest is non-empty: desired != current implies at least two rows
        insert_after(conn, kind, parent, id, rest[rest.len() - 1])?;
    } else {
        insert_before(conn, kind, parent, id, rest[desired])?;
    }
    debug!(list = kind.as_str(), %parent, %id, from = current, to = desired, "moved row");
    Ok(true)
}

/// Move `id` to final position `desired_index`; indexes past the end mean
/// tail. Returns whether any pointer changed.
pub fn update_position(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    id: Uuid,
    desired_index: usize,
) -> Result<bool, StorageError> {
    let ordered = get_items_by_parent(conn, kind, parent)?;
    apply_position(conn, kind, parent, &ordered, id, desired_index)
}

/// Move `id` before or after `target`. Moving relative to itself is a no-op.
pub fn move_relative(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    id: Uuid,
    target: Uuid,
    position: MovePosition,
) -> Result<bool, StorageError> {
    let ordered = get_items_by_parent(conn, kind, parent)?;
    match desired_index(&ordered, id, target, position)? {
        None => Ok(false),
        Some(idx) => apply_position(conn, kind, parent, &ordered, id, idx),
    }
}

/// Relink every row of the parent into a single chain. The longest intact
/// segment stays first; other segments (isolated rows included) follow in
/// ascending id order of their first row. Returns the number of rows whose
/// pointers were rewritten; a healthy list rewrites nothing.
pub fn repair(conn: &Connection, kind: ListKind, parent: Uuid) -> Result<usize, StorageError> {
    repair_inner(conn, kind, parent, None)
}

fn repair_inner(
    conn: &Connection,
    kind: ListKind,
    parent: Uuid,
    exclude: Option<Uuid>,
) -> Result<usize, StorageError> {
    let nodes: Vec<ListNode> = scan_unordered(conn, kind, parent)?
        .into_iter()
        .filter(|n| Some(n.id) != exclude)
        .collect();
    if nodes.is_empty() {
        return Ok(0);
    }
    let by_id: HashMap<Uuid, ListNode> = nodes.iter().map(|n| (n.id, *n)).collect();
    let pointed_at: HashSet<Uuid> = nodes
        .iter()
        .filter_map(|n| n.next.filter(|next| *next != n.id && by_id.contains_key(next)))
        .collect();

    let mut visited: HashSet<Uuid> = HashSet::with_capacity(nodes.len());
    let mut segments: Vec<Vec<Uuid>> = Vec::new();
    let walk = |start: Uuid, visited: &mut HashSet<Uuid>| -> Vec<Uuid> {
        let mut segment = Vec::new();
        let mut cur = start;
        while visited.insert(cur) {
            segment.push(cur);
            match by_id.get(&cur).and_then(|n| n.next) {
                Some(next) if by_id.contains_key(&next) => cur = next,
                _ => break,
            }
        }
        segment
    };

    for node in &nodes {
        if !pointed_at.contains(&node.id) && !visited.contains(&node.id) {
            segments.push(walk(node.id, &mut visited));
        }
    }
    // whatever is left sits on a cycle; break it at its smallest id
    for node in &nodes {
        if !visited.contains(&node.id) {
            segments.push(walk(node.id, &mut visited));
        }
    }

    let mut main = 0;
    for (i, segment) in segments.iter().enumerate() {
        if segment.len() > segments[main].len() {
            main = i;
        }
    }
    let mut order: Vec<Uuid> = segments[main].clone();
    for (i, segment) in segments.iter().enumerate() {
        if i != main {
            order.extend(segment.iter().copied());
        }
    }

    let mut rewritten = 0;
    for (i, id) in order.iter().enumerate() {
        let prev = if i == 0 { None } else { Some(order[i - 1]) };
        let next = order.get(i + 1).copied();
        let stored = by_id[id];
        if stored.prev != prev || stored.next != next {
            set_links(conn, kind, *id, prev, next)?;
            rewritten += 1;
        }
    }
    if rewritten > 0 {
        warn!(
            list = kind.as_str(),
            %parent,
            segments = segments.len(),
            rewritten,
            "repaired ordered list"
        );
    }
    Ok(rewritten)
}

pub fn validate(conn: &Connection, kind: ListKind, parent: Uuid) -> Result<ListHealth, StorageError> {
    let nodes = scan_unordered(conn, kind, parent)?;
    let by_id: HashMap<Uuid, &ListNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut health = ListHealth {
        count: nodes.len(),
        ..ListHealth::default()
    };
    for node in &nodes {
        if node.prev.is_none() {
            health.heads += 1;
        }
        if node.next.is_none() {
            health.tails += 1;
        }
        if nodes.len() > 1 && node.prev.is_none() && node.next.is_none() {
            health.isolated.push(node.id);
        }
        if node.prev == Some(node.id) || node.next == Some(node.id) {
            health.self_loops += 1;
        }
        if let Some(next) = node.next
            && by_id.get(&next).and_then(|n| n.prev) != Some(node.id)
        {
            health.asymmetric += 1;
        }
        if let Some(prev) = node.prev
            && by_id.get(&prev).and_then(|n| n.next) != Some(node.id)
        {
            health.asymmetric += 1;
        }
    }
    health.ordered_len = traverse(conn, kind, parent).ok().map(|t| t.ordered.len());
    Ok(health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStorage;
    use crate::traits::*;
    use workbench_core::{BodyFields, ExampleBodyKind, ids::*};

    const KIND: ListKind = ListKind::Body(BodyKind::Header);

    fn setup() -> (SqliteStorage, Uuid) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let conn = storage.conn();
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
        (storage, *ex.id.as_uuid())
    }

    fn push(conn: &Connection, parent: Uuid, key: &str) -> Uuid {
        let id = BodyId::new();
        conn.insert_body(&BodyRecord {
            id,
            example_id: ExampleId::from_uuid(parent),
            kind: BodyKind::Header,
            delta_parent: None,
            fields: BodyFields::new(key, ""),
            prev: None,
            next: None,
        })
        .unwrap();
        append_at_end(conn, KIND, parent, *id.as_uuid()).unwrap();
        *id.as_uuid()
    }

    #[test]
    fn append_builds_ordered_chain() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..5).map(|i| push(conn, parent, &format!("h{i}"))).collect();
        assert_eq!(get_items_by_parent(conn, KIND, parent).unwrap(), ids);
        assert!(validate(conn, KIND, parent).unwrap().is_healthy());
    }

    #[test]
    fn empty_list_reads_empty_and_rejects_moves() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        assert!(get_items_by_parent(conn, KIND, parent).unwrap().is_empty());
        let err = move_relative(conn, KIND, parent, Uuid::now_v7(), Uuid::now_v7(), MovePosition::After)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(validate(conn, KIND, parent).unwrap().is_healthy());
    }

    #[test]
    fn update_position_moves_to_final_index() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..4).map(|i| push(conn, parent, &format!("h{i}"))).collect();

        assert!(update_position(conn, KIND, parent, ids[3], 0).unwrap());
        assert_eq!(
            get_items_by_parent(conn, KIND, parent).unwrap(),
            vec![ids[3], ids[0], ids[1], ids[2]]
        );

        assert!(update_position(conn, KIND, parent, ids[3], 99).unwrap());
        assert_eq!(get_items_by_parent(conn, KIND, parent).unwrap(), ids);

        assert!(!update_position(conn, KIND, parent, ids[1], 1).unwrap());
        assert!(validate(conn, KIND, parent).unwrap().is_healthy());
    }

    #[test]
    fn move_relative_before_and_after() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..3).map(|i| push(conn, parent, &format!("h{i}"))).collect();

        move_relative(conn, KIND, parent, ids[0], ids[2], MovePosition::After).unwrap();
        assert_eq!(
            get_items_by_parent(conn, KIND, parent).unwrap(),
            vec![ids[1], ids[2], ids[0]]
        );
        move_relative(conn, KIND, parent, ids[0], ids[1], MovePosition::Before).unwrap();
        assert_eq!(get_items_by_parent(conn, KIND, parent).unwrap(), ids);
        // second identical move changes nothing
        assert!(!move_relative(conn, KIND, parent, ids[0], ids[1], MovePosition::Before).unwrap());
        assert!(!move_relative(conn, KIND, parent, ids[0], ids[0], MovePosition::After).unwrap());
    }

    #[test]
    fn move_errors_distinguish_target_and_subject() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..2).map(|i| push(conn, parent, &format!("h{i}"))).collect();
        let missing = Uuid::now_v7();
        assert!(matches!(
            move_relative(conn, KIND, parent, ids[0], missing, MovePosition::After),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            move_relative(conn, KIND, parent, missing, ids[0], MovePosition::After),
            Err(StorageError::InvalidArgument(_))
        ));
        assert_eq!(get_items_by_parent(conn, KIND, parent).unwrap(), ids);
    }

    #[test]
    fn unlink_stitches_neighbours() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..3).map(|i| push(conn, parent, &format!("h{i}"))).collect();
        unlink(conn, KIND, parent, ids[1]).unwrap();
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", KIND.table()),
            params![ids[1].as_bytes().as_slice()],
        )
        .unwrap();
        assert_eq!(get_items_by_parent(conn, KIND, parent).unwrap(), vec![ids[0], ids[2]]);
    }

    #[test]
    fn isolated_rows_are_detected_and_repaired_in_id_order() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..5).map(|i| push(conn, parent, &format!("h{i}"))).collect();
        // cut ids[1] and ids[3] out without patching anything else properly
        for id in [ids[3], ids[1]] {
            unlink(conn, KIND, parent, id).unwrap();
        }
        let walk = traverse(conn, KIND, parent).unwrap();
        assert_eq!(walk.ordered, vec![ids[0], ids[2], ids[4]]);
        assert_eq!(walk.isolated, vec![ids[1], ids[3]]);
        assert!(get_items_by_parent(conn, KIND, parent).is_err());

        assert!(repair(conn, KIND, parent).unwrap() > 0);
        assert_eq!(
            get_items_by_parent(conn, KIND, parent).unwrap(),
            vec![ids[0], ids[2], ids[4], ids[1], ids[3]]
        );
        assert_eq!(repair(conn, KIND, parent).unwrap(), 0);
        assert!(validate(conn, KIND, parent).unwrap().is_healthy());
    }

    #[test]
    fn cycle_is_reported_and_broken_by_repair() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..3).map(|i| push(conn, parent, &format!("h{i}"))).collect();
        // close the loop: tail -> head, head.prev -> tail
        set_links(conn, KIND, ids[2], Some(ids[1]), Some(ids[0])).unwrap();
        set_links(conn, KIND, ids[0], Some(ids[2]), Some(ids[1])).unwrap();
        assert!(matches!(traverse(conn, KIND, parent), Err(StorageError::Corrupt(_))));
        assert!(!validate(conn, KIND, parent).unwrap().is_healthy());

        repair(conn, KIND, parent).unwrap();
        assert_eq!(get_items_by_parent(conn, KIND, parent).unwrap(), ids);
    }

    #[test]
    fn append_with_isolated_rows_repairs_first() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let ids: Vec<Uuid> = (0..3).map(|i| push(conn, parent, &format!("h{i}"))).collect();
        unlink(conn, KIND, parent, ids[0]).unwrap();
        let last = push(conn, parent, "late");
        assert_eq!(
            get_items_by_parent(conn, KIND, parent).unwrap(),
            vec![ids[1], ids[2], ids[0], last]
        );
    }

    #[test]
    fn get_node_checks_parent() {
        let (storage, parent) = setup();
        let conn = storage.conn();
        let id = push(conn, parent, "h");
        assert!(matches!(
            get_node(conn, KIND, Uuid::now_v7(), id),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            get_node(conn, KIND, parent, Uuid::now_v7()),
            Err(StorageError::NotFound(_))
        ));
    }
}

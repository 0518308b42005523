use workbench_core::{BodyId, BodyKind, DeltaSource, FieldPatch, MovePosition};
use workbench_engine::ErrorCode;
use workbench_harness::{OverlayPair, TestWorkbench};
use workbench_storage::{ListKind, OverlayStore};

const KIND: BodyKind = BodyKind::UrlEncoded;

// ============================================================================
// Seeding and listing
// ============================================================================

#[test]
fn first_list_seeds_proxies_in_origin_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;

    let items = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    assert_eq!(items.len(), 3);
    let keys: Vec<_> = items.iter().map(|i| i.fields.key.as_str()).collect();
    assert_eq!(keys, ["a", "b", "c"]);
    assert!(items.iter().all(|i| i.source == DeltaSource::Delta));
    assert!(items.iter().all(|i| i.fields.value.is_empty()));

    // three proxies persisted on the delta, in the same order
    let proxies = bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?;
    let parents: Vec<_> = proxies.iter().map(|p| p.delta_parent).collect();
    assert_eq!(parents, pair.rows.iter().copied().map(Some).collect::<Vec<_>>());
    assert!(bench.health(ListKind::Body(KIND), *pair.delta.as_uuid())?.is_healthy());

    // a second read creates nothing new
    bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    assert_eq!(bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?.len(), 3);
    Ok(())
}

#[test]
fn empty_origin_lists_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &[])?;
    assert!(bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?.is_empty());
    Ok(())
}

#[test]
fn list_rejects_unrelated_examples() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a"])?;
    let (_, other) = bench.endpoint("other")?;

    let err = bench
        .workbench
        .list_merged(&bench.ctx, KIND, pair.delta, other)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    Ok(())
}

#[test]
fn delta_only_row_appends_and_moves_first() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;
    bench.merged_keys(KIND, &pair)?;

    let d = bench
        .workbench
        .create_delta(&bench.ctx, KIND, pair.delta, pair.origin, &FieldPatch::default().key("d"))?;
    let items = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    assert_eq!(items.len(), 4);
    let last = items.last().ok_or("empty list")?;
    assert_eq!(last.body_id, d);
    assert_eq!(last.source, DeltaSource::DeltaOnly);
    assert!(last.fields.enabled);

    // the target is given by its origin id
    bench.workbench.move_delta(
        &bench.ctx,
        KIND,
        pair.delta,
        pair.origin,
        d,
        pair.rows[0],
        MovePosition::Before,
    )?;
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["d", "a", "b", "c"]);
    Ok(())
}

#[test]
fn missing_proxies_return_between_anchors() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c", "d"])?;
    bench
        .workbench
        .create_delta(&bench.ctx, KIND, pair.delta, pair.origin, &FieldPatch::default().key("x"))?;
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["x", "a", "b", "c", "d"]);

    // hard-delete the proxies of b and c
    let proxies = bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?;
    for proxy in proxies
        .iter()
        .filter(|p| p.delta_parent == Some(pair.rows[1]) || p.delta_parent == Some(pair.rows[2]))
    {
        bench.workbench.delete_body(&bench.ctx, KIND, proxy.id)?;
    }
    assert_eq!(bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?.len(), 3);

    assert_eq!(bench.merged_keys(KIND, &pair)?, ["x", "a", "b", "c", "d"]);
    assert!(bench.health(ListKind::Body(KIND), *pair.delta.as_uuid())?.is_healthy());
    Ok(())
}

#[test]
fn recreated_proxy_keeps_user_rank() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;
    bench.merged_keys(KIND, &pair)?;
    bench.workbench.move_delta(
        &bench.ctx,
        KIND,
        pair.delta,
        pair.origin,
        pair.rows[2],
        pair.rows[0],
        MovePosition::Before,
    )?;
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["c", "a", "b"]);

    let proxy_c = bench
        .workbench
        .list_bodies(&bench.ctx, KIND, pair.delta)?
        .into_iter()
        .find(|p| p.delta_parent == Some(pair.rows[2]))
        .ok_or("proxy of c")?;
    bench.workbench.delete_body(&bench.ctx, KIND, proxy_c.id)?;

    assert_eq!(bench.merged_keys(KIND, &pair)?, ["c", "a", "b"]);
    Ok(())
}

fn proxy_of(
    bench: &mut TestWorkbench,
    pair: &OverlayPair,
    origin_row: BodyId,
) -> Result<BodyId, Box<dyn std::error::Error>> {
    Ok(bench
        .workbench
        .list_bodies(&bench.ctx, KIND, pair.delta)?
        .into_iter()
        .find(|p| p.delta_parent == Some(origin_row))
        .ok_or("no proxy for origin row")?
        .id)
}

#[test]
fn several_recreated_proxies_keep_user_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c", "d"])?;
    bench.merged_keys(KIND, &pair)?;
    for moved in [3, 2, 1] {
        bench.workbench.move_delta(
            &bench.ctx,
            KIND,
            pair.delta,
            pair.origin,
            pair.rows[moved],
            pair.rows[0],
            MovePosition::Before,
        )?;
    }
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["d", "c", "b", "a"]);

    for origin_row in [pair.rows[2], pair.rows[3]] {
        let proxy = proxy_of(&mut bench, &pair, origin_row)?;
        bench.workbench.delete_body(&bench.ctx, KIND, proxy)?;
    }
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["d", "c", "b", "a"]);
    assert!(bench.health(ListKind::Body(KIND), *pair.delta.as_uuid())?.is_healthy());
    Ok(())
}

#[test]
fn reset_proxy_is_recreated_in_origin_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;
    bench.merged_keys(KIND, &pair)?;
    bench.workbench.move_delta(
        &bench.ctx,
        KIND,
        pair.delta,
        pair.origin,
        pair.rows[2],
        pair.rows[0],
        MovePosition::Before,
    )?;
    let proxy_c = proxy_of(&mut bench, &pair, pair.rows[2])?;
    bench.workbench.reset_delta(&bench.ctx, KIND, proxy_c)?;

    // the rank is gone but the proxy stays where it is
    let ranks = bench.workbench.storage().conn().orders_for_example(pair.delta, KIND)?;
    assert!(!ranks.contains_key(&pair.rows[2]));
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["c", "a", "b"]);

    bench.workbench.delete_body(&bench.ctx, KIND, proxy_c)?;
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["a", "b", "c"]);
    Ok(())
}

// ============================================================================
// Update, delete, reset
// ============================================================================

#[test]
fn update_promotes_to_mixed_and_reset_restores() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;
    let before = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    let proxy_a = before[0].body_id;

    bench
        .workbench
        .update_delta(&bench.ctx, KIND, proxy_a, &FieldPatch::default().value("X"))?;
    let items = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    assert_eq!(items[0].fields.key, "a");
    assert_eq!(items[0].fields.value, "X");
    assert_eq!(items[0].source, DeltaSource::Mixed);
    assert_eq!(items[0].origin.as_ref().map(|o| o.value.as_str()), Some(""));

    bench.workbench.reset_delta(&bench.ctx, KIND, proxy_a)?;
    let items = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    assert_eq!(items[0].source, DeltaSource::Delta);
    assert_eq!(items[0].fields.value, "");
    assert_eq!(items, before);

    assert!(bench.workbench.storage().conn().get_state(pair.delta, proxy_a)?.is_none());
    let backing = bench
        .workbench
        .list_bodies(&bench.ctx, KIND, pair.delta)?
        .into_iter()
        .find(|p| p.id == proxy_a)
        .ok_or("backing row")?;
    assert_eq!(backing.fields.value, "");
    Ok(())
}

#[test]
fn zero_values_are_written() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a"])?;
    bench.workbench.update_body(
        &bench.ctx,
        KIND,
        pair.rows[0],
        &FieldPatch::default().value("v").description("d"),
    )?;
    let proxy = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?[0].body_id;

    let patch = FieldPatch::default().value("").description("").enabled(false);
    bench.workbench.update_delta(&bench.ctx, KIND, proxy, &patch)?;
    let item = &bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?[0];
    assert_eq!(item.source, DeltaSource::Mixed);
    assert_eq!(item.fields.value, "");
    assert_eq!(item.fields.description, "");
    assert!(!item.fields.enabled);
    assert_eq!(item.origin.as_ref().map(|o| o.value.as_str()), Some("v"));
    Ok(())
}

#[test]
fn update_through_origin_id_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a"])?;
    bench.merged_keys(KIND, &pair)?;

    let err = bench
        .workbench
        .update_delta(&bench.ctx, KIND, pair.rows[0], &FieldPatch::default().value("X"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = bench
        .workbench
        .update_delta(&bench.ctx, KIND, BodyId::new(), &FieldPatch::default().value("X"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    Ok(())
}

#[test]
fn delete_hides_proxy_and_removes_delta_only() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b"])?;
    let before = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;

    // delta-only: create then delete leaves the list as it was
    let x = bench
        .workbench
        .create_delta(&bench.ctx, KIND, pair.delta, pair.origin, &FieldPatch::default().key("x"))?;
    bench.workbench.delete_delta(&bench.ctx, KIND, x)?;
    assert_eq!(bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?, before);
    assert_eq!(bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?.len(), 2);

    // proxy: tombstoned, row kept, not recreated
    let proxy_a = before[0].body_id;
    bench.workbench.delete_delta(&bench.ctx, KIND, proxy_a)?;
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["b"]);
    assert_eq!(bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?.len(), 2);
    let state = bench
        .workbench
        .storage()
        .conn()
        .get_state(pair.delta, proxy_a)?
        .ok_or("tombstone")?;
    assert!(state.suppressed);

    // reset lifts the tombstone
    bench.workbench.reset_delta(&bench.ctx, KIND, proxy_a)?;
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["a", "b"]);

    let err = bench.workbench.reset_delta(&bench.ctx, KIND, BodyId::new()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    Ok(())
}

#[test]
fn reset_of_delta_only_row_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a"])?;
    let x = bench
        .workbench
        .create_delta(&bench.ctx, KIND, pair.delta, pair.origin, &FieldPatch::default().key("x"))?;
    let err = bench.workbench.reset_delta(&bench.ctx, KIND, x).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    Ok(())
}

// ============================================================================
// Moves
// ============================================================================

#[test]
fn repeated_move_is_a_noop() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;
    for _ in 0..2 {
        bench.workbench.move_delta(
            &bench.ctx,
            KIND,
            pair.delta,
            pair.origin,
            pair.rows[2],
            pair.rows[1],
            MovePosition::Before,
        )?;
        assert_eq!(bench.merged_keys(KIND, &pair)?, ["a", "c", "b"]);
    }
    assert!(bench.health(ListKind::Body(KIND), *pair.delta.as_uuid())?.is_healthy());
    Ok(())
}

#[test]
fn move_errors() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b"])?;

    let err = bench
        .workbench
        .move_delta(&bench.ctx, KIND, pair.delta, pair.origin, pair.rows[0], BodyId::new(), MovePosition::After)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let err = bench
        .workbench
        .move_delta(&bench.ctx, KIND, pair.delta, pair.origin, pair.rows[0], pair.rows[0], MovePosition::After)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    // a row from some other example
    let (_, other) = bench.endpoint("other")?;
    let stranger = bench.rows(KIND, other, &["z"])?[0];
    let err = bench
        .workbench
        .move_delta(&bench.ctx, KIND, pair.delta, pair.origin, stranger, pair.rows[0], MovePosition::After)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    assert_eq!(bench.merged_keys(KIND, &pair)?, ["a", "b"]);
    Ok(())
}

// ============================================================================
// Propagation from the origin
// ============================================================================

#[test]
fn origin_update_reaches_plain_proxies_only() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b"])?;
    let items = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    bench
        .workbench
        .update_delta(&bench.ctx, KIND, items[0].body_id, &FieldPatch::default().value("X"))?;

    for origin_row in &pair.rows {
        bench
            .workbench
            .update_body(&bench.ctx, KIND, *origin_row, &FieldPatch::default().value("Y"))?;
    }

    let items = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?;
    assert_eq!(items[0].source, DeltaSource::Mixed);
    assert_eq!(items[0].fields.value, "X");
    assert_eq!(items[0].origin.as_ref().map(|o| o.value.as_str()), Some("Y"));
    assert_eq!(items[1].source, DeltaSource::Delta);
    assert_eq!(items[1].fields.value, "Y");

    // the backing row of the plain proxy mirrors the origin as well
    let backing = bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?;
    assert_eq!(backing[1].fields.value, "Y");
    Ok(())
}

#[test]
fn origin_delete_removes_proxies() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b", "c"])?;
    bench.merged_keys(KIND, &pair)?;

    bench.workbench.delete_body(&bench.ctx, KIND, pair.rows[1])?;
    let proxies = bench.workbench.list_bodies(&bench.ctx, KIND, pair.delta)?;
    assert_eq!(proxies.len(), 2);
    assert!(proxies.iter().all(|p| p.delta_parent != Some(pair.rows[1])));
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["a", "c"]);
    assert!(bench.health(ListKind::Body(KIND), *pair.delta.as_uuid())?.is_healthy());
    assert!(bench.health(ListKind::Body(KIND), *pair.origin.as_uuid())?.is_healthy());
    Ok(())
}

#[test]
fn plain_update_of_proxy_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a"])?;
    let proxy = bench.workbench.list_merged(&bench.ctx, KIND, pair.delta, pair.origin)?[0].body_id;
    let err = bench
        .workbench
        .update_body(&bench.ctx, KIND, proxy, &FieldPatch::default().value("X"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    Ok(())
}

#[test]
fn origin_rows_added_later_are_seeded_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b"])?;
    bench.merged_keys(KIND, &pair)?;

    let c = bench.rows(KIND, pair.origin, &["c"])?[0];
    bench
        .workbench
        .move_body(&bench.ctx, KIND, pair.origin, c, pair.rows[1], MovePosition::Before)?;
    assert_eq!(bench.body_keys(KIND, pair.origin)?, ["a", "c", "b"]);

    assert_eq!(bench.merged_keys(KIND, &pair)?, ["a", "c", "b"]);
    Ok(())
}

#[test]
fn new_origin_row_follows_origin_order_in_a_reordered_overlay() -> Result<(), Box<dyn std::error::Error>> {
    let mut bench = TestWorkbench::new()?;
    let pair = bench.overlay_pair(KIND, &["a", "b"])?;
    bench.merged_keys(KIND, &pair)?;
    bench.workbench.move_delta(
        &bench.ctx,
        KIND,
        pair.delta,
        pair.origin,
        pair.rows[1],
        pair.rows[0],
        MovePosition::Before,
    )?;

    let c = bench.rows(KIND, pair.origin, &["c"])?[0];
    assert_eq!(bench.merged_keys(KIND, &pair)?, ["b", "a", "c"]);

    let ranks = bench.workbench.storage().conn().orders_for_example(pair.delta, KIND)?;
    assert_eq!(ranks.get(&pair.rows[1]), Some(&Some(0)));
    assert_eq!(ranks.get(&pair.rows[0]), Some(&Some(1)));
    assert_eq!(ranks.get(&c), Some(&None));
    Ok(())
}

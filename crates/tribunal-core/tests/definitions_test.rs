mod common;

use common::{admin_ctx, other_tenant_ctx};
use tribunal_core::context::{Context, Role};
use tribunal_core::model::SuitePatch;
use tribunal_core::storage::filter::{Filter, FilterOp, ListQuery, Sort};
use tribunal_core::storage::{Db, DefinitionStore};

fn store() -> DefinitionStore {
    let db = Db::open_in_memory().unwrap();
    db.init_schema().unwrap();
    DefinitionStore::new(db)
}

#[test]
fn create_assigns_version_one_and_rejects_duplicate_names() {
    let store = store();
    let ctx = admin_ctx();

    let suite = store
        .create_suite(&ctx, "smoke", serde_json::json!({"judge_model": "m"}))
        .unwrap();
    assert_eq!(suite.suite_id, 1);
    assert_eq!(suite.version, 1);

    let err = store
        .create_suite(&ctx, "smoke", serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // same name is free for a different tenant
    let other = other_tenant_ctx();
    assert!(store.create_suite(&other, "smoke", serde_json::json!({})).is_ok());
}

#[test]
fn versions_are_dense_and_stale_updates_lose() {
    let store = store();
    let ctx = admin_ctx();
    let suite = store.create_suite(&ctx, "s", serde_json::json!({})).unwrap();

    for i in 0..4 {
        store
            .update_suite(
                &ctx,
                suite.suite_id,
                &SuitePatch {
                    evaluator_config: Some(serde_json::json!({ "rev": i })),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let versions = store.list_suite_versions(&ctx, suite.suite_id).unwrap();
    let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

    // optimistic-concurrency loser
    let err = store
        .update_suite(
            &ctx,
            suite.suite_id,
            &SuitePatch {
                name: Some("renamed".into()),
                expected_version: Some(3),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), "stale_version");
}

#[test]
fn diff_of_a_version_with_itself_is_empty() {
    let store = store();
    let ctx = admin_ctx();
    let suite = store
        .create_suite(&ctx, "s", serde_json::json!({"a": 1}))
        .unwrap();
    store
        .update_suite(
            &ctx,
            suite.suite_id,
            &SuitePatch {
                evaluator_config: Some(serde_json::json!({"a": 2})),
                ..Default::default()
            },
        )
        .unwrap();

    let same = store
        .compare_suite_versions(&ctx, suite.suite_id, 2, 2)
        .unwrap();
    assert!(same.is_empty());

    let diff = store
        .compare_suite_versions(&ctx, suite.suite_id, 1, 2)
        .unwrap();
    assert!(!diff.is_empty());
    assert!(diff.changed.contains_key("evaluator_config"));
}

#[test]
fn restore_republishes_as_a_new_version() {
    let store = store();
    let ctx = admin_ctx();
    let suite = store
        .create_suite(&ctx, "s", serde_json::json!({"model": "v1-config"}))
        .unwrap();
    store
        .update_suite(
            &ctx,
            suite.suite_id,
            &SuitePatch {
                evaluator_config: Some(serde_json::json!({"model": "v2-config"})),
                ..Default::default()
            },
        )
        .unwrap();

    let restored = store.restore_suite(&ctx, suite.suite_id, 1).unwrap();
    assert_eq!(restored.version, 3);
    assert_eq!(restored.evaluator_config, serde_json::json!({"model": "v1-config"}));

    let (snapshot, _) = store
        .get_suite_for_execution(&ctx, suite.suite_id, Some(3))
        .unwrap();
    assert_eq!(snapshot.evaluator_config, serde_json::json!({"model": "v1-config"}));
}

#[test]
fn historical_snapshot_is_immutable() {
    let store = store();
    let ctx = admin_ctx();
    let suite = store
        .create_suite(&ctx, "s", serde_json::json!({"gen": 1}))
        .unwrap();
    store
        .update_suite(
            &ctx,
            suite.suite_id,
            &SuitePatch {
                evaluator_config: Some(serde_json::json!({"gen": 2})),
                ..Default::default()
            },
        )
        .unwrap();

    let (v1, _) = store
        .get_suite_for_execution(&ctx, suite.suite_id, Some(1))
        .unwrap();
    assert_eq!(v1.evaluator_config, serde_json::json!({"gen": 1}));
    let (current, _) = store
        .get_suite_for_execution(&ctx, suite.suite_id, None)
        .unwrap();
    assert_eq!(current.evaluator_config, serde_json::json!({"gen": 2}));
}

#[test]
fn definitions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tribunal.db");
    let ctx = admin_ctx();

    {
        let db = Db::open(&path).unwrap();
        db.init_schema().unwrap();
        let store = DefinitionStore::new(db);
        let suite = store
            .create_suite(&ctx, "durable", serde_json::json!({"keep": true}))
            .unwrap();
        store
            .add_case(
                &ctx,
                suite.suite_id,
                &common::case_payload(&["answer_relevancy"], None),
            )
            .unwrap();
    }

    let db = Db::open(&path).unwrap();
    db.init_schema().unwrap();
    let store = DefinitionStore::new(db);
    let (suite, cases) = store.get_suite_for_execution(&ctx, 1, None).unwrap();
    assert_eq!(suite.name, "durable");
    assert_eq!(cases.len(), 1);
}

#[test]
fn reads_never_cross_tenants() {
    let store = store();
    let ctx = admin_ctx();
    let suite = store.create_suite(&ctx, "s", serde_json::json!({})).unwrap();

    let other = other_tenant_ctx();
    assert_eq!(
        store.get_suite(&other, suite.suite_id).unwrap_err().kind(),
        "not_found"
    );
    assert_eq!(
        store
            .list_suite_versions(&other, suite.suite_id)
            .unwrap_err()
            .kind(),
        "not_found"
    );
    let page = store.list_suites(&other, &ListQuery::default()).unwrap();
    assert!(page.items.is_empty());
}

#[test]
fn viewer_role_cannot_write() {
    let store = store();
    let viewer = Context::new("t1", Role::Viewer, "ro");
    let err = store
        .create_suite(&viewer, "s", serde_json::json!({}))
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
}

fn seed_for_listing(store: &DefinitionStore) {
    let alice = Context::new("t1", Role::Admin, "alice");
    let bob = Context::new("t1", Role::Admin, "bob");
    for (name, ctx) in [
        ("alpha-smoke", &alice),
        ("beta-smoke", &alice),
        ("gamma-full", &bob),
        ("delta-full", &bob),
        ("epsilon-perf", &alice),
    ] {
        store.create_suite(ctx, name, serde_json::json!({})).unwrap();
    }
    // bob edits one of alice's suites so updated_by != created_by there
    store
        .update_suite(
            &bob,
            1,
            &SuitePatch {
                evaluator_config: Some(serde_json::json!({"edited": true})),
                ..Default::default()
            },
        )
        .unwrap();
}

#[test]
fn list_supports_substring_set_range_and_field_inequality() {
    let store = store();
    let ctx = admin_ctx();
    seed_for_listing(&store);

    let contains = store
        .list_suites(
            &ctx,
            &ListQuery {
                filters: vec![Filter {
                    field: "name".into(),
                    op: FilterOp::Contains("SMOKE".into()),
                }],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(contains.items.len(), 2);

    let in_set = store
        .list_suites(
            &ctx,
            &ListQuery {
                filters: vec![Filter {
                    field: "created_by".into(),
                    op: FilterOp::In(vec![serde_json::json!("bob")]),
                }],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(in_set.items.len(), 2);

    let range = store
        .list_suites(
            &ctx,
            &ListQuery {
                filters: vec![Filter {
                    field: "version".into(),
                    op: FilterOp::Gte(serde_json::json!(2)),
                }],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(range.items.len(), 1);
    assert_eq!(range.items[0].suite_id, 1);

    let edited_by_someone_else = store
        .list_suites(
            &ctx,
            &ListQuery {
                filters: vec![Filter {
                    field: "updated_by".into(),
                    op: FilterOp::NeField("created_by".into()),
                }],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(edited_by_someone_else.items.len(), 1);
    assert_eq!(edited_by_someone_else.items[0].suite_id, 1);
}

#[test]
fn cursor_pagination_is_stable_and_complete() {
    let store = store();
    let ctx = admin_ctx();
    seed_for_listing(&store);

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .list_suites(
                &ctx,
                &ListQuery {
                    sort: Some(Sort {
                        field: "name".into(),
                        descending: false,
                    }),
                    limit: 2,
                    cursor: cursor.clone(),
                    ..Default::default()
                },
            )
            .unwrap();
        seen.extend(page.items.iter().map(|s| s.name.clone()));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let mut expected = vec![
        "alpha-smoke",
        "beta-smoke",
        "delta-full",
        "epsilon-perf",
        "gamma-full",
    ];
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[test]
fn add_case_requires_owned_suite_and_valid_payload() {
    let store = store();
    let ctx = admin_ctx();
    let suite = store.create_suite(&ctx, "s", serde_json::json!({})).unwrap();

    let err = store
        .add_case(&ctx, 999, &common::case_payload(&["answer_relevancy"], None))
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    let mut empty = common::case_payload(&["answer_relevancy"], None);
    empty.evaluator_kinds.clear();
    assert_eq!(
        store.add_case(&ctx, suite.suite_id, &empty).unwrap_err().kind(),
        "invalid"
    );

    let bad_threshold = common::case_payload(&["answer_relevancy"], Some(1.5));
    assert_eq!(
        store
            .add_case(&ctx, suite.suite_id, &bad_threshold)
            .unwrap_err()
            .kind(),
        "invalid"
    );

    let case = store
        .add_case(
            &ctx,
            suite.suite_id,
            &common::case_payload(&["answer_relevancy"], Some(0.5)),
        )
        .unwrap();
    assert_eq!(case.version, 1);

    let updated = store
        .update_case(
            &ctx,
            case.case_id,
            &common::case_payload(&["answer_relevancy", "faithfulness"], None),
            Some(1),
        )
        .unwrap();
    assert_eq!(updated.version, 2);
}

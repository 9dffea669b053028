//! Upsert flows: constant store round-trips per batch, duplicate-key
//! resolution, and update-field scoping.

mod common;

use common::{start_engine, test_config, wait_for_terminal};
use hopper_protocol::api::{SubmitOutcome, UpsertOptions};
use hopper_protocol::types::{JobState, JobType, Record};
use hopper_test_utils::record;
use serde_json::json;

fn sku_record(sku: &str, qty: i64) -> Record {
    record(&[("sku", json!(sku)), ("qty", json!(qty))])
}

#[tokio::test]
async fn test_upsert_batch_costs_three_store_calls() {
    let t = start_engine(test_config()).await;
    let first = t.store.seed(sku_record("a", 1));
    let second = t.store.seed(sku_record("b", 2));

    // ten records in one batch: two match, eight are new
    let mut records: Vec<Record> = vec![sku_record("a", 10), sku_record("b", 20)];
    for i in 0..8 {
        records.push(sku_record(&format!("new-{i}"), i));
    }
    let outcome = t
        .engine
        .submit(JobType::Upsert, records, Some(UpsertOptions::new(["sku"])))
        .await
        .unwrap();
    let job_id = outcome.job_id().expect("10 records run asynchronously");

    let status = wait_for_terminal(&t.engine, &job_id).await;
    assert_eq!(status.state, JobState::JobComplete);
    assert_eq!(status.success_count, 10);
    assert_eq!(status.result_ids.created_count(), 8);
    assert_eq!(status.result_ids.updated_count(), 2);

    let counts = t.store.counts();
    assert_eq!(counts.lookup_calls, 1, "one lookup per batch");
    assert_eq!(counts.insert_calls, 1, "one bulk create per batch");
    assert_eq!(counts.update_calls, 1, "one bulk update per batch");

    assert_eq!(t.store.get(&first).unwrap()["qty"], json!(10));
    assert_eq!(t.store.get(&second).unwrap()["qty"], json!(20));
    assert_eq!(t.store.len(), 10);
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_keys_collapse_to_one_record() {
    let t = start_engine(test_config()).await;

    let records = vec![
        record(&[("sku", json!("x")), ("qty", json!(1)), ("note", json!("first"))]),
        record(&[("sku", json!("x")), ("qty", json!(2)), ("note", json!("last"))]),
        sku_record("y", 7),
    ];
    let outcome = t
        .engine
        .submit(JobType::Upsert, records, Some(UpsertOptions::new(["sku"])))
        .await
        .unwrap();
    let report = match outcome {
        SubmitOutcome::Completed(report) => report,
        SubmitOutcome::Accepted(_) => panic!("3 records run inline"),
    };

    assert_eq!(report.success_count, 3, "every submitted record counts");
    assert_eq!(report.created_count(), 2, "one stored record per key");
    assert_eq!(t.store.len(), 2);
    let x = t.store.all().into_iter().find(|r| r.fields["sku"] == json!("x")).unwrap();
    assert_eq!(x.fields["note"], json!("last"), "last write for a duplicate key wins");
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_numeric_keys_match_across_json_shapes() {
    let t = start_engine(test_config()).await;
    let seeded = t.store.seed(record(&[("code", json!(2)), ("qty", json!(1))]));

    // 2.0 must find the record keyed 2
    let records = vec![record(&[("code", json!(2.0)), ("qty", json!(99))])];
    let outcome = t
        .engine
        .submit(JobType::Upsert, records, Some(UpsertOptions::new(["code"])))
        .await
        .unwrap();
    let report = match outcome {
        SubmitOutcome::Completed(report) => report,
        SubmitOutcome::Accepted(_) => panic!("1 record runs inline"),
    };
    assert_eq!(report.updated_count(), 1);
    assert_eq!(t.store.get(&seeded).unwrap()["qty"], json!(99));
    assert_eq!(t.store.len(), 1);
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_explicit_update_fields_scope_the_write() {
    let t = start_engine(test_config()).await;
    let seeded = t.store.seed(record(&[
        ("sku", json!("a")),
        ("name", json!("keep me")),
        ("qty", json!(1)),
    ]));

    let options = UpsertOptions::new(["sku"]).with_update_fields(["qty"]);
    let records = vec![record(&[
        ("sku", json!("a")),
        ("name", json!("overwrite attempt")),
        ("qty", json!(9)),
    ])];
    t.engine.submit(JobType::Upsert, records, Some(options)).await.unwrap();

    let stored = t.store.get(&seeded).unwrap();
    assert_eq!(stored["qty"], json!(9));
    assert_eq!(stored["name"], json!("keep me"), "fields outside update_fields stay put");
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_inferred_update_fields_skip_unique_and_identifier() {
    let t = start_engine(test_config()).await;
    let seeded = t.store.seed(record(&[("sku", json!("a")), ("qty", json!(1))]));

    // no explicit update_fields: inferred from the first record, minus the
    // unique fields, minus the identifier field
    let records = vec![record(&[
        ("id", json!("should-not-be-written")),
        ("sku", json!("a")),
        ("qty", json!(42)),
    ])];
    t.engine
        .submit(JobType::Upsert, records, Some(UpsertOptions::new(["sku"])))
        .await
        .unwrap();

    let stored = t.store.get(&seeded).unwrap();
    assert_eq!(stored["qty"], json!(42));
    assert!(stored.get("id").is_none(), "the identifier field never rides along");
    assert_eq!(stored["sku"], json!("a"));
    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_keyless_records_always_create() {
    let t = start_engine(test_config()).await;
    t.store.seed(sku_record("a", 1));

    let records = vec![
        record(&[("qty", json!(5))]),
        record(&[("sku", json!(null)), ("qty", json!(6))]),
        record(&[("sku", json!("")), ("qty", json!(7))]),
    ];
    let outcome = t
        .engine
        .submit(JobType::Upsert, records, Some(UpsertOptions::new(["sku"])))
        .await
        .unwrap();
    let report = match outcome {
        SubmitOutcome::Completed(report) => report,
        SubmitOutcome::Accepted(_) => panic!("3 records run inline"),
    };

    assert_eq!(report.created_count(), 3, "unusable keys can never match; always create");
    assert_eq!(report.updated_count(), 0);
    assert_eq!(t.store.counts().lookup_calls, 0, "nothing to look up");
    assert_eq!(t.store.len(), 4);
    t.engine.shutdown().await;
}

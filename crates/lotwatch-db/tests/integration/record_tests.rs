use lotwatch_core::error::AppError;
use lotwatch_core::models::{NormalizedRecord, RecordKind, TargetKey};
use lotwatch_core::traits::RecordStore;
use lotwatch_db::RecordFilter;

use crate::integration::common::setup_test_db;

fn parcel(external_id: &str, key: &str, price: i64) -> NormalizedRecord {
    NormalizedRecord::new(
        "county-api",
        RecordKind::Parcel,
        TargetKey::new(key),
        external_id,
        Some("1 Main St".into()),
        Some(price),
        Some(5000.0),
        serde_json::json!({"zoning": "R5"}),
    )
}

#[tokio::test]
async fn store_and_list_round_trip() {
    let (db, _container) = setup_test_db().await;
    let repo = db.record_repo();

    let record = parcel("R1", "97201", 450_000);
    let id = repo.store(&record).await.unwrap();
    assert!(!id.is_nil());

    let stored = repo.list(&RecordFilter::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id);
    assert_eq!(stored[0].record.external_id, "R1");
    assert_eq!(stored[0].record.kind, RecordKind::Parcel);
    assert_eq!(stored[0].record.content_hash, record.content_hash);
    assert_eq!(stored[0].record.attributes, serde_json::json!({"zoning": "R5"}));
}

#[tokio::test]
async fn unchanged_record_is_duplicate() {
    let (db, _container) = setup_test_db().await;
    let repo = db.record_repo();

    let record = parcel("R1", "97201", 450_000);
    repo.store(&record).await.unwrap();
    let again = repo.store(&record).await;
    assert!(matches!(again, Err(AppError::Duplicate(_))));

    // A price change is new information, not a duplicate.
    repo.store(&parcel("R1", "97201", 460_000)).await.unwrap();

    let counts = repo.count_by_source().await.unwrap();
    assert_eq!(counts, vec![("county-api".to_string(), 2)]);
}

#[tokio::test]
async fn list_filters_by_key_and_limit() {
    let (db, _container) = setup_test_db().await;
    let repo = db.record_repo();

    for (i, key) in ["97201", "97201", "97202"].iter().enumerate() {
        repo.store(&parcel(&format!("R{i}"), key, 100_000)).await.unwrap();
    }

    let filter = RecordFilter {
        target_key: Some(TargetKey::new("97201")),
        ..Default::default()
    };
    assert_eq!(repo.list(&filter).await.unwrap().len(), 2);

    let limited = RecordFilter {
        limit: Some(1),
        ..Default::default()
    };
    assert_eq!(repo.list(&limited).await.unwrap().len(), 1);

    let other_source = RecordFilter {
        source: Some("homes".into()),
        ..Default::default()
    };
    assert!(repo.list(&other_source).await.unwrap().is_empty());
}

#[tokio::test]
async fn health_check_succeeds() {
    let (db, _container) = setup_test_db().await;
    db.health_check().await.unwrap();
}

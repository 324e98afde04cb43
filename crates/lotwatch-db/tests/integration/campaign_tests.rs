use chrono::Utc;
use lotwatch_core::campaign::{
    CampaignMeta, CampaignOutcome, CampaignResult, CampaignTally, UnitOutcome, UnitReport,
};
use lotwatch_core::models::{CollectorIdentity, SourceKind, TargetKey};
use lotwatch_core::strategy::StrategyKind;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn finished(items: u64) -> CampaignResult {
    let identity = CollectorIdentity::new("county", SourceKind::Api);
    let mut tally = CampaignTally::new();
    tally.register(&identity, 1);
    tally.record(&UnitReport {
        collector: "county".into(),
        key: TargetKey::new("97201"),
        attempts: 1,
        items,
        duplicates: 0,
        invalid_records: 0,
        persist_errors: 0,
        outcome: UnitOutcome::Succeeded,
    });
    tally.finish(CampaignMeta {
        campaign_id: Uuid::new_v4(),
        strategy: StrategyKind::Sequential,
        started_at: Utc::now(),
        budget_expired: false,
        cancelled: false,
    })
}

#[tokio::test]
async fn save_and_get_campaign() {
    let (db, _container) = setup_test_db().await;
    let repo = db.campaign_repo();

    let result = finished(12);
    assert_eq!(result.outcome, CampaignOutcome::Completed);
    repo.save(&result).await.unwrap();
    // Saving again is idempotent.
    repo.save(&result).await.unwrap();

    let loaded = repo
        .get(result.campaign_id)
        .await
        .unwrap()
        .expect("campaign should exist");
    assert_eq!(loaded.campaign_id, result.campaign_id);
    assert_eq!(loaded.total_items, 12);
    assert_eq!(loaded.collectors, result.collectors);

    assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn list_recent_newest_first() {
    let (db, _container) = setup_test_db().await;
    let repo = db.campaign_repo();

    let first = finished(5);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = finished(0);
    repo.save(&first).await.unwrap();
    repo.save(&second).await.unwrap();

    let rows = repo.list_recent(10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, second.campaign_id);
    assert_eq!(rows[0].outcome, CampaignOutcome::Failed);
    assert_eq!(rows[1].id, first.campaign_id);
    assert_eq!(rows[1].total_items, 5);
    assert_eq!(rows[1].strategy, "sequential");

    assert_eq!(repo.list_recent(1).await.unwrap().len(), 1);
}

// End-to-end archive backfill against the week documents under fixtures/archive.

use std::path::{Path, PathBuf};

use schedsync_adapters::ArchiveSource;
use schedsync_core::{Coordinate, Phase};
use schedsync_storage::Snapshot;
use schedsync_sync::{sync_coordinates, RunMode, SyncConfig, Synchronizer};
use tempfile::tempdir;

fn archive_fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/archive")
        .canonicalize()
        .expect("archive fixtures")
}

#[tokio::test]
async fn backfill_builds_snapshot_from_archived_weeks() {
    let out = tempdir().expect("tempdir");
    let path = out.path().join("schedule.json");
    let synchronizer = Synchronizer::new(SyncConfig {
        schedule_path: path.clone(),
        ..Default::default()
    })
    .expect("synchronizer");

    let summary = synchronizer
        .run(&RunMode::Backfill {
            directory: archive_fixture_dir(),
        })
        .await
        .expect("backfill run");

    assert_eq!(summary.mode, "backfill");
    assert_eq!(summary.stats.coordinates, 1);
    assert_eq!(summary.total_records, 2);
    assert!(summary.stats.unavailable.is_empty());

    let snapshot = Snapshot::load(&path).await.expect("load saved snapshot");
    let ids: Vec<&str> = snapshot.records().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["2005092500", "2005092501"]);
    let first = snapshot.get("2005092500").unwrap();
    assert_eq!((first.year, first.phase, first.week), (2005, Phase::Regular, 3));
    assert_eq!((first.month, first.day), (9, 25));
}

#[tokio::test]
async fn missing_archive_week_is_reported_without_failing() {
    let archive = ArchiveSource::new(archive_fixture_dir());
    let week3 = Coordinate::new(2005, Phase::Regular, 3);
    let week4 = Coordinate::new(2005, Phase::Regular, 4);

    let mut snapshot = Snapshot::new();
    let stats = sync_coordinates(&mut snapshot, [week4, week3], &archive).await;

    assert_eq!(stats.unavailable, vec![week4]);
    assert!(stats.malformed.is_empty());
    assert_eq!(snapshot.len(), 2);
}

#[tokio::test]
async fn backfill_ignores_detailed_stats_seasons() {
    let archive = tempdir().expect("tempdir");
    std::fs::copy(
        archive_fixture_dir().join("2005-3-REG.xml"),
        archive.path().join("2005-3-REG.xml"),
    )
    .unwrap();
    std::fs::write(
        archive.path().join("2010-1-REG.xml"),
        r#"<ss><gms><g eid="2010091200" h="NE" v="CIN" hs="38" vs="24"/></gms></ss>"#,
    )
    .unwrap();

    let out = tempdir().expect("tempdir");
    let path = out.path().join("schedule.json");
    let summary = Synchronizer::new(SyncConfig::default())
        .expect("synchronizer")
        .run_at(
            &RunMode::Backfill {
                directory: archive.path().to_path_buf(),
            },
            &path,
        )
        .await
        .expect("backfill run");

    assert_eq!(summary.total_records, 2);
    assert!(Snapshot::load(&path).await.unwrap().get("2010091200").is_none());
}

#[tokio::test]
async fn backfill_walks_seasons_latest_first_and_totals_their_weeks() {
    let archive = tempdir().expect("tempdir");
    std::fs::copy(
        archive_fixture_dir().join("2005-3-REG.xml"),
        archive.path().join("2005-3-REG.xml"),
    )
    .unwrap();
    std::fs::write(archive.path().join("2005-4-REG.xml"), "<html>gateway timeout").unwrap();
    std::fs::write(
        archive.path().join("1999-2-REG.xml"),
        r#"<ss><gms w="2" y="1999"><g eid="1999091900" h="NYJ" v="BUF" hs="3" vs="17"/></gms></ss>"#,
    )
    .unwrap();

    let out = tempdir().expect("tempdir");
    let path = out.path().join("schedule.json");
    let summary = Synchronizer::new(SyncConfig::default())
        .expect("synchronizer")
        .run_at(
            &RunMode::Backfill {
                directory: archive.path().to_path_buf(),
            },
            &path,
        )
        .await
        .expect("backfill run");

    assert_eq!(summary.stats.coordinates, 3);
    assert_eq!(summary.stats.inserted, 3);
    assert_eq!(
        summary.stats.malformed,
        vec![Coordinate::new(2005, Phase::Regular, 4)]
    );
    let snapshot = Snapshot::load(&path).await.unwrap();
    let old = snapshot.get("1999091900").expect("1999 game");
    assert_eq!((old.year, old.month, old.day), (1999, 9, 19));
}

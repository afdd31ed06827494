//! End-to-end tests of the key lifecycle through the public `Keeper` API,
//! backed by real JSON and SQLite stores.

use futures::future::join_all;
use realmkeeper::keys::{AddCounts, AddOutcome, ClaimantId, KeyFormat, KeyPolicy, RemoveOutcome};
use realmkeeper::storage::{JsonFileStore, RegistrySnapshot, SqliteStore, StateStore};
use realmkeeper::{CommunityId, Keeper, RejectReason, RoleId, Verdict};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

const GUILD: CommunityId = CommunityId(1_000);
const ROLE: RoleId = RoleId(2_000);

/// A file path inside a fresh directory; the directory lives as long as the guard
fn scratch_file(name: &str) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

async fn json_keeper(path: &Path) -> Keeper {
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(path, true));
    Keeper::open(store, KeyPolicy::default(), false).await.unwrap()
}

async fn sqlite_keeper(path: &Path) -> Keeper {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::connect(path, 2).await.unwrap());
    Keeper::open(store, KeyPolicy::new(KeyFormat::Uuid, 64), false)
        .await
        .unwrap()
}

struct Configured {
    keeper: Keeper,
    path: PathBuf,
    _dir: TempDir,
}

async fn configured_keeper() -> Configured {
    let (dir, path) = scratch_file("state.json");
    let keeper = json_keeper(&path).await;
    keeper.setup(GUILD, ROLE, "claim", None).await.unwrap();
    Configured {
        keeper,
        path,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_admin_and_member_scenario() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;

    let counts = keeper.add_keys(GUILD, &["alpha", "beta", "alpha"]).await.unwrap();
    assert_eq!(
        counts,
        AddCounts {
            created: 2,
            duplicate: 1,
            invalid: 0
        }
    );

    match keeper.redeem(GUILD, ClaimantId(1), "alpha").await {
        Verdict::Committed(redemption) => {
            assert_eq!(redemption.role_id, ROLE);
            assert_eq!(redemption.record.claimant_id, ClaimantId(1));
        }
        other => panic!("expected commit, got {:?}", other),
    }

    assert_eq!(
        keeper.redeem(GUILD, ClaimantId(2), "alpha").await,
        Verdict::Rejected(RejectReason::InvalidOrUsedKey)
    );
    assert_eq!(keeper.count(GUILD).await.unwrap(), 1);
}

#[tokio::test]
async fn test_key_redeems_exactly_once() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    keeper.add_key(GUILD, "one-shot", None).await.unwrap();

    assert!(keeper.redeem(GUILD, ClaimantId(1), "one-shot").await.is_committed());
    for claimant in [1, 2, 3] {
        assert_eq!(
            keeper
                .redeem(GUILD, ClaimantId(claimant), "one-shot")
                .await
                .reject_reason(),
            Some(RejectReason::InvalidOrUsedKey)
        );
    }
    // Adding it again cannot resurrect it
    assert_eq!(
        keeper.add_key(GUILD, "one-shot", None).await.unwrap(),
        AddOutcome::Duplicate
    );
    assert!(!keeper.redeem(GUILD, ClaimantId(4), "one-shot").await.is_committed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemptions_commit_once() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    let keeper = Arc::new(keeper);

    for round in 0..10 {
        let key = format!("shared-key-{}", round);
        keeper.add_key(GUILD, &key, None).await.unwrap();

        let attempts = (0..32u64).map(|claimant| {
            let keeper = keeper.clone();
            let key = key.clone();
            tokio::spawn(async move { keeper.redeem(GUILD, ClaimantId(claimant), &key).await })
        });
        let verdicts: Vec<Verdict> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let committed = verdicts.iter().filter(|v| v.is_committed()).count();
        assert_eq!(committed, 1, "round {}", round);
        assert!(verdicts
            .iter()
            .filter_map(Verdict::reject_reason)
            .all(|r| r == RejectReason::InvalidOrUsedKey));
    }
    assert_eq!(keeper.count(GUILD).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_racing_redemptions_stays_consistent() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    let keeper = Arc::new(keeper);
    let keys: Vec<String> = (0..200).map(|i| format!("k{}", i)).collect();
    keeper.add_keys(GUILD, &keys).await.unwrap();

    let redeemers = keys.iter().cloned().enumerate().map(|(i, key)| {
        let keeper = keeper.clone();
        tokio::spawn(async move { keeper.redeem(GUILD, ClaimantId(i as u64), &key).await })
    });
    let clearer = {
        let keeper = keeper.clone();
        tokio::spawn(async move { keeper.clear_keys(GUILD).await.unwrap() })
    };

    let committed = join_all(redeemers)
        .await
        .into_iter()
        .filter(|v| v.as_ref().unwrap().is_committed())
        .count();
    let cleared = clearer.await.unwrap();

    // Every key ended up either redeemed or cleared, never both
    assert_eq!(committed + cleared, keys.len());
    assert_eq!(keeper.count(GUILD).await.unwrap(), 0);
    let mut redeemed = 0;
    for key in &keys {
        if keeper.has_claimed(GUILD, key).await.unwrap() {
            redeemed += 1;
        }
    }
    assert_eq!(redeemed, committed);
}

#[tokio::test]
async fn test_bulk_remove_then_redeem() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    keeper.add_keys(GUILD, &["a", "b", "c"]).await.unwrap();
    let removed = keeper.remove_keys(GUILD, &["b"]).await.unwrap();
    assert_eq!(removed.removed, 1);
    assert_eq!(keeper.count(GUILD).await.unwrap(), 2);

    assert!(keeper.redeem(GUILD, ClaimantId(1), "a").await.is_committed());
    assert!(keeper.redeem(GUILD, ClaimantId(2), "c").await.is_committed());
    assert_eq!(
        keeper.redeem(GUILD, ClaimantId(3), "b").await.reject_reason(),
        Some(RejectReason::InvalidOrUsedKey)
    );
}

#[tokio::test]
async fn test_clear_keeps_history() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    keeper.add_keys(GUILD, &["old", "unused"]).await.unwrap();
    assert!(keeper.redeem(GUILD, ClaimantId(1), "old").await.is_committed());

    assert_eq!(keeper.clear_keys(GUILD).await.unwrap(), 1);
    assert_eq!(keeper.count(GUILD).await.unwrap(), 0);
    assert!(keeper.has_claimed(GUILD, "old").await.unwrap());
    assert!(!keeper.has_claimed(GUILD, "unused").await.unwrap());
}

#[tokio::test]
async fn test_remove_unknown_key_is_not_found() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    keeper.add_keys(GUILD, &["alpha"]).await.unwrap();
    assert_eq!(
        keeper.remove_key(GUILD, "gamma").await.unwrap(),
        RemoveOutcome::NotFound
    );
    assert_eq!(keeper.count(GUILD).await.unwrap(), 1);
}

#[tokio::test]
async fn test_one_per_member_policy() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    keeper.setup(GUILD, ROLE, "claim", Some(true)).await.unwrap();
    keeper.add_keys(GUILD, &["first", "second"]).await.unwrap();

    assert!(keeper.redeem(GUILD, ClaimantId(7), "first").await.is_committed());
    assert_eq!(
        keeper.redeem(GUILD, ClaimantId(7), "second").await.reject_reason(),
        Some(RejectReason::AlreadyRewarded)
    );
    // The refused attempt did not consume the key
    assert_eq!(keeper.count(GUILD).await.unwrap(), 1);
    assert!(keeper.redeem(GUILD, ClaimantId(8), "second").await.is_committed());
}

#[tokio::test]
async fn test_communities_are_isolated() {
    let Configured { keeper, _dir, .. } = configured_keeper().await;
    let other = CommunityId(1_001);
    keeper.setup(other, RoleId(3_000), "redeem", None).await.unwrap();
    keeper.add_keys(GUILD, &["shared"]).await.unwrap();
    keeper.add_keys(other, &["shared"]).await.unwrap();

    assert!(keeper.redeem(GUILD, ClaimantId(1), "shared").await.is_committed());
    assert!(keeper.redeem(other, ClaimantId(1), "shared").await.is_committed());
    assert_eq!(
        keeper.redeem(CommunityId(9), ClaimantId(1), "shared").await.reject_reason(),
        Some(RejectReason::UnknownCommunity)
    );
}

#[tokio::test]
async fn test_state_survives_restart() {
    let Configured { keeper, path, _dir } = configured_keeper().await;
    keeper.add_keys(GUILD, &["alpha", "beta", "gamma"]).await.unwrap();
    assert!(keeper.redeem(GUILD, ClaimantId(5), "beta").await.is_committed());
    let before = RegistrySnapshot::capture(keeper.registry()).await;
    drop(keeper);

    // The file never contains plaintext
    let raw = std::fs::read_to_string(&path).unwrap();
    for key in ["alpha", "beta", "gamma"] {
        assert!(!raw.contains(key));
    }

    let reopened = json_keeper(&path).await;
    let after = RegistrySnapshot::capture(reopened.registry()).await;
    assert_eq!(before, after);
    assert_eq!(reopened.count(GUILD).await.unwrap(), 2);
    assert!(reopened.has_claimed(GUILD, "beta").await.unwrap());
    assert_eq!(
        reopened.redeem(GUILD, ClaimantId(6), "beta").await.reject_reason(),
        Some(RejectReason::InvalidOrUsedKey)
    );
    assert!(reopened.redeem(GUILD, ClaimantId(6), "gamma").await.is_committed());
}

#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let (_dir, path) = scratch_file("state.db");

    let key = uuid::Uuid::new_v4().to_string();
    let other = uuid::Uuid::new_v4().to_string();
    let keeper = sqlite_keeper(&path).await;
    keeper.setup(GUILD, ROLE, "claim", None).await.unwrap();
    let counts = keeper
        .add_keys(GUILD, &[key.as_str(), other.as_str(), "not-a-uuid"])
        .await
        .unwrap();
    assert_eq!((counts.created, counts.invalid), (2, 1));
    // Case differences normalise to the same key
    assert!(keeper
        .redeem(GUILD, ClaimantId(1), &key.to_uppercase())
        .await
        .is_committed());
    drop(keeper);

    let reopened = sqlite_keeper(&path).await;
    assert_eq!(reopened.count(GUILD).await.unwrap(), 1);
    assert!(reopened.has_claimed(GUILD, &key).await.unwrap());
    let fingerprints: HashSet<String> = RegistrySnapshot::capture(reopened.registry())
        .await
        .communities[0]
        .keys
        .iter()
        .map(|k| k.fingerprint.to_hex())
        .collect();
    assert_eq!(fingerprints.len(), 1);
}

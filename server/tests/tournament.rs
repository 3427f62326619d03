use chrono::{NaiveDate, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tourney_server::{
    Clock, DurableStore, FastStore, MemoryFastStore, Rejection, SqliteStore, Tournament,
    TournamentConfig, TournamentError,
};
use tourney_types::{Country, GroupLeaderboard, Player, PlayerId, MIN_LEVEL};

type Service = Tournament<MemoryFastStore, SqliteStore>;

struct Harness {
    fast: Arc<MemoryFastStore>,
    durable: Arc<SqliteStore>,
    tournament: Arc<Service>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

async fn harness() -> Harness {
    let fast = Arc::new(MemoryFastStore::new());
    let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    let config = TournamentConfig {
        matchmaking_interval: Duration::from_millis(10),
        join_timeout: Duration::from_secs(5),
        ..TournamentConfig::default()
    };
    let tournament = Arc::new(Tournament::new(config, fast.clone(), durable.clone(), clock).unwrap());
    tournament.rebuild().await.unwrap();
    let cancel = CancellationToken::new();
    tournament.spawn_background(cancel.clone());
    Harness {
        fast,
        durable,
        tournament,
        cancel,
    }
}

/// One eligible player per country.
async fn veterans(durable: &SqliteStore, tag: &str) -> Vec<Player> {
    let created = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    let mut players = Vec::new();
    for country in Country::ALL {
        let player = Player::new(format!("{tag}-{}", country.code()), country, created).unwrap();
        durable.create_player(player.clone()).await.unwrap();
        for _ in 1..MIN_LEVEL {
            durable.level_up(player.id).await.unwrap();
        }
        players.push(durable.player(player.id).await.unwrap().unwrap());
    }
    players
}

async fn join_all(tournament: &Arc<Service>, players: &[Player]) -> Vec<GroupLeaderboard> {
    let tasks = players
        .iter()
        .map(|player| {
            let tournament = tournament.clone();
            let id = player.id;
            tokio::spawn(async move { tournament.enter(id, CancellationToken::new()).await })
        })
        .collect::<Vec<_>>();
    let mut leaderboards = Vec::new();
    for task in tasks {
        leaderboards.push(task.await.unwrap().unwrap());
    }
    leaderboards
}

async fn eventually<Fut: std::future::Future<Output = bool>>(mut check: impl FnMut() -> Fut) {
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_concurrent_joiners_share_one_group() {
    let h = harness().await;
    let players = veterans(&h.durable, "join").await;
    let leaderboards = join_all(&h.tournament, &players).await;

    let group = leaderboards[0].group_id;
    assert!(leaderboards.iter().all(|board| board.group_id == group));
    let members = leaderboards[0]
        .entries
        .iter()
        .map(|entry| entry.player_id)
        .collect::<HashSet<_>>();
    assert_eq!(members, players.iter().map(|p| p.id).collect());
    for country in Country::ALL {
        assert_eq!(h.fast.queue_len(country).await.unwrap(), 0);
    }

    // Memberships and fees land after the pointers.
    let durable = h.durable.clone();
    eventually(|| {
        let durable = durable.clone();
        let ids = players.iter().map(|p| p.id).collect::<Vec<_>>();
        async move {
            let mut debited = 0;
            for id in ids {
                if durable.player(id).await.unwrap().unwrap().coins == 4_475 {
                    debited += 1;
                }
            }
            debited == 5
        }
    })
    .await;
    assert_eq!(h.durable.group_members(group).await.unwrap().len(), 5);

    let err = h
        .tournament
        .enter(players[0].id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TournamentError::Rejected(Rejection::AlreadyInTournament)
    ));
    assert_eq!(h.tournament.metrics().groups_formed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pointer_is_never_visible_before_entry() {
    let h = harness().await;
    let players = veterans(&h.durable, "ptr").await;
    let ids = players.iter().map(|p| p.id).collect::<Vec<PlayerId>>();

    let done = Arc::new(AtomicBool::new(false));
    let readers = (0..3)
        .map(|_| {
            let fast = h.fast.clone();
            let ids = ids.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut observed = 0u64;
                while !done.load(Ordering::Acquire) {
                    for id in &ids {
                        if let Some(group) =
                            fast.player_group(*id, Duration::from_secs(60)).await.unwrap()
                        {
                            assert!(
                                fast.group_entry(group, *id).await.unwrap().is_some(),
                                "pointer for {id} resolved before its entry"
                            );
                            observed += 1;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                observed
            })
        })
        .collect::<Vec<_>>();

    let leaderboards = join_all(&h.tournament, &players).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    done.store(true, Ordering::Release);
    let mut observed = 0;
    for reader in readers {
        observed += reader.await.unwrap();
    }
    assert!(observed > 0);
    assert!(leaderboards.iter().all(|board| board.entries.len() == 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn country_totals_match_durable_scores() {
    let h = harness().await;
    let first = veterans(&h.durable, "a").await;
    let second = veterans(&h.durable, "b").await;
    join_all(&h.tournament, &first).await;
    join_all(&h.tournament, &second).await;

    let mut events = 0;
    for (i, player) in first.iter().chain(second.iter()).enumerate() {
        for _ in 0..(i % 4) {
            h.tournament.level_up(player.id).await.unwrap();
            events += 1;
        }
    }
    let tournament = h.tournament.clone();
    eventually(|| {
        let tournament = tournament.clone();
        async move { tournament.metrics().score_events_applied == events }
    })
    .await;

    let live = h.tournament.country_leaderboard().await.unwrap();
    let durable = h.durable.country_scores_on(day()).await.unwrap();
    for (country, score) in durable {
        assert_eq!(live.score(country), Some(score), "{country} drifted");
    }

    let board = h.tournament.group_leaderboard_for(first[3].id).await.unwrap();
    assert_eq!(board.entries[0].player_id, first[3].id);
    assert_eq!(board.entries[0].score, 3);
    assert_eq!(h.tournament.rank_on(first[3].id, day()).await.unwrap(), 1);
    assert_eq!(h.tournament.rank_on(first[0].id, day()).await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settlement_rewards_and_flushes() {
    let h = harness().await;
    let players = veterans(&h.durable, "settle").await;
    join_all(&h.tournament, &players).await;

    // Scores [2, 2, 1, 0, 0].
    for (player, points) in players.iter().zip([2, 2, 1, 0, 0]) {
        for _ in 0..points {
            h.tournament.level_up(player.id).await.unwrap();
        }
    }
    let tournament = h.tournament.clone();
    eventually(|| {
        let tournament = tournament.clone();
        async move { tournament.metrics().score_events_applied == 5 }
    })
    .await;
    let first_before = h.durable.player(players[0].id).await.unwrap().unwrap().coins;
    let second_before = h.durable.player(players[2].id).await.unwrap().unwrap().coins;

    let settlement = h.tournament.settle(day()).await.unwrap();
    assert_eq!(settlement.first_place, 2);
    assert_eq!(settlement.second_place, 1);

    let snapshot = h.fast.snapshot();
    assert!(snapshot.queues.iter().all(|queue| queue.is_empty()));
    assert!(snapshot.groups.is_empty());
    assert!(snapshot.pointers.is_empty());
    let countries = snapshot.countries.expect("new day starts seeded");
    assert_eq!(countries.len(), 5);
    assert!(countries.values().all(|score| *score == 0));
    let board = h.tournament.country_leaderboard().await.unwrap();
    assert!(board.standings.iter().all(|standing| standing.score == 0));

    let claimed = h.tournament.claim_reward(players[0].id).await.unwrap();
    assert_eq!(claimed.coins, first_before + 10_000);
    let claimed = h.tournament.claim_reward(players[2].id).await.unwrap();
    assert_eq!(claimed.coins, second_before + 5_000);
    assert!(matches!(
        h.tournament.claim_reward(players[4].id).await,
        Err(TournamentError::Rejected(Rejection::NoRewardsToClaim))
    ));
    assert!(matches!(
        h.tournament.claim_reward(players[0].id).await,
        Err(TournamentError::Rejected(Rejection::NoRewardsToClaim))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rebuild_twice_matches_rebuild_once() {
    let h = harness().await;
    let players = veterans(&h.durable, "rb").await;
    join_all(&h.tournament, &players).await;
    h.tournament.level_up(players[1].id).await.unwrap();
    let tournament = h.tournament.clone();
    eventually(|| {
        let tournament = tournament.clone();
        async move { tournament.metrics().score_events_applied == 1 }
    })
    .await;
    // Stop the matchmaker so nothing moves between snapshots.
    h.cancel.cancel();

    let once = h.tournament.rebuild().await.unwrap();
    let snapshot = h.fast.snapshot();
    let twice = h.tournament.rebuild().await.unwrap();
    assert_eq!(once, twice);
    assert_eq!(h.fast.snapshot(), snapshot);
    assert_eq!(snapshot.pointers.len(), 5);
    assert_eq!(
        snapshot.countries.unwrap()[&players[1].country],
        1
    );
}

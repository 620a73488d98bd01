//! Concurrent writers, readers and pruning against one hub.

use contenthub::{
    BulkContent, ChannelConfig, Content, ContentKey, Group, Hub, HubConfig, HubError, TimeQuery,
};
use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

const WRITERS: usize = 8;
const PER_WRITER: usize = 200;

fn hub_with(channels: &[&str]) -> Hub {
    let hub = Hub::in_memory(HubConfig::default());
    for name in channels {
        hub.channels()
            .create_channel(ChannelConfig::new(*name))
            .unwrap();
    }
    hub
}

fn all_keys(hub: &Hub, channel: &str) -> Vec<ContentKey> {
    hub.channels()
        .query_by_time(&TimeQuery::all(channel))
        .unwrap()
        .collect::<contenthub::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn test_concurrent_inserts_get_unique_increasing_keys() {
    let hub = hub_with(&["busy"]);
    let barrier = Barrier::new(WRITERS);

    let per_thread: Vec<Vec<ContentKey>> = thread::scope(|s| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let hub = &hub;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    (0..PER_WRITER)
                        .map(|i| {
                            hub.channels()
                                .insert("busy", &Content::new(format!("{w}-{i}")))
                                .unwrap()
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Each writer sees its own inserts strictly increase.
    for keys in &per_thread {
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    let unique: HashSet<_> = per_thread.iter().flatten().copied().collect();
    assert_eq!(unique.len(), WRITERS * PER_WRITER);

    let stored = all_keys(&hub, "busy");
    assert_eq!(stored.len(), WRITERS * PER_WRITER);
    assert!(stored.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_bulk_batches_stay_contiguous_under_contention() {
    let hub = hub_with(&["bulk"]);

    let batches: Vec<Vec<ContentKey>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let hub = &hub;
                s.spawn(move || {
                    (0..20)
                        .map(|b| {
                            let items = (0..5)
                                .map(|i| Content::new(format!("{w}-{b}-{i}")))
                                .collect();
                            hub.channels()
                                .insert_bulk(&BulkContent::new("bulk", items))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let stored = all_keys(&hub, "bulk");
    assert_eq!(stored.len(), 4 * 20 * 5);

    // No other write lands between the keys of one batch.
    for batch in &batches {
        let start = stored.iter().position(|k| *k == batch[0]).unwrap();
        assert_eq!(&stored[start..start + batch.len()], batch.as_slice());
    }
}

#[test]
fn test_channels_proceed_independently() {
    let names: Vec<String> = (0..6).map(|i| format!("chan-{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let hub = hub_with(&refs);

    thread::scope(|s| {
        for name in &names {
            let hub = &hub;
            s.spawn(move || {
                for i in 0..100 {
                    hub.channels()
                        .insert(name, &Content::new(i.to_string()))
                        .unwrap();
                }
            });
        }
    });

    for name in &names {
        assert_eq!(all_keys(&hub, name).len(), 100);
    }
}

#[test]
fn test_prune_races_with_inserts() {
    let hub = hub_with(&["race"]);
    let seed: Vec<_> = (0..50)
        .map(|i| hub.channels().insert("race", &Content::new(i.to_string())).unwrap())
        .collect();
    let cut = seed[24];

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..200 {
                hub.channels()
                    .insert("race", &Content::new(format!("late-{i}")))
                    .unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..10 {
                assert_eq!(hub.channels().delete_before("race", cut).unwrap(), Some(cut));
            }
        });
    });

    let stored = all_keys(&hub, "race");
    assert_eq!(stored.len(), 25 + 200);
    assert!(stored.iter().all(|k| *k > cut));
}

#[test]
fn test_racing_group_rebinds_keep_one_binding() {
    let hub = Hub::in_memory(HubConfig::default());

    let outcomes: Vec<Result<Option<Group>, HubError>> = thread::scope(|s| {
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|channel| {
                let hub = &hub;
                s.spawn(move || {
                    hub.groups().upsert(Group::new(
                        "shared",
                        format!("http://hub/channel/{channel}"),
                        "http://cb/",
                    ))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let created = outcomes.iter().filter(|r| matches!(r, Ok(None))).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(HubError::Conflict(_))))
        .count();
    assert_eq!(created, 1);
    assert_eq!(conflicts, 3);
}

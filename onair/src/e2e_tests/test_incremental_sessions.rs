//! Later sessions layer their writes over published baselines without
//! disturbing them, and chains of baselines keep every earlier write.

use crate::e2e_tests::helpers::{TestCluster, groups, ids, words};

#[test]
fn test_second_session_overlays_baseline() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    let index = words(&first);
    index.add_value(&"shared".to_string(), 1, 10).expect("add");
    index.add_value(&"shared".to_string(), 2, 20).expect("add");
    index.add_value(&"stale".to_string(), 3, 30).expect("add");
    cluster.publish(&first, "r1");

    let second = cluster.open(Some("r1"));
    let overlay = words(&second);
    overlay.remove_all_values(&"shared".to_string(), 1).expect("remove");
    overlay.add_value(&"shared".to_string(), 4, 40).expect("add");
    overlay.remove_all_values(&"stale".to_string(), 3).expect("remove");
    overlay.add_value(&"fresh".to_string(), 5, 50).expect("add");

    assert_eq!(
        groups(&overlay.read(&"shared".to_string()).expect("read")),
        vec![(20, vec![2]), (40, vec![4])]
    );
    assert!(overlay.read(&"stale".to_string()).expect("read").is_empty());

    // Eviction and reload go through the tree at the new revision.
    overlay.clear_caches().expect("clear caches");
    assert_eq!(
        groups(&overlay.read(&"shared".to_string()).expect("read")),
        vec![(20, vec![2]), (40, vec![4])]
    );
    assert_eq!(
        groups(&overlay.read(&"fresh".to_string()).expect("read")),
        vec![(50, vec![5])]
    );

    // A session reopened on the same baseline still sees the original.
    let third = cluster.open(Some("r1"));
    assert_eq!(
        groups(&words(&third).read(&"shared".to_string()).expect("read")),
        vec![(10, vec![1]), (20, vec![2])]
    );
}

#[test]
fn test_republish_keeps_baseline_pages() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    let index = words(&first);
    for i in 0..500 {
        index.add_value(&format!("word-{i}"), 1, i).expect("add");
    }
    cluster.publish(&first, "r1");
    let pages_after_first = cluster.storage.len();

    let second = cluster.open(Some("r1"));
    words(&second)
        .add_value(&"word-7".to_string(), 2, 700)
        .expect("add");
    let manifest = cluster.publish(&second, "r2");
    assert_eq!(manifest.revision().expect("revision"), second.new_revision());

    // Only the modified paths are new; untouched subtrees are shared.
    let added = cluster.storage.len() - pages_after_first;
    assert!(added > 0);
    assert!(added < pages_after_first, "republish copied {added} pages");
}

#[test]
fn test_three_chained_sessions_keep_old_keys() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    let index = words(&first);
    index.add_value(&"kept".to_string(), 1, 10).expect("add");
    index.add_value(&"edited".to_string(), 1, 11).expect("add");
    cluster.publish(&first, "r1");

    let second = cluster.open(Some("r1"));
    let index = words(&second);
    index.add_value(&"other".to_string(), 2, 20).expect("add");
    index.add_value(&"edited".to_string(), 2, 21).expect("add");
    cluster.publish(&second, "r2");

    let third = cluster.open(Some("r2"));
    let index = words(&third);
    index.remove_all_values(&"edited".to_string(), 1).expect("remove");
    cluster.publish(&third, "r3");

    let fourth = cluster.open(Some("r3"));
    let index = words(&fourth);
    let mut keys = Vec::new();
    index
        .process_keys(|key| {
            keys.push(key.clone());
            true
        })
        .expect("process keys");
    keys.sort();
    assert_eq!(keys, vec!["edited", "kept", "other"]);

    // Every listed key reads back its folded history.
    assert_eq!(
        groups(&index.read(&"kept".to_string()).expect("read")),
        vec![(10, vec![1])]
    );
    assert_eq!(
        groups(&index.read(&"other".to_string()).expect("read")),
        vec![(20, vec![2])]
    );
    assert_eq!(
        groups(&index.read(&"edited".to_string()).expect("read")),
        vec![(21, vec![2])]
    );
}

#[test]
fn test_unopened_index_survives_republish() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    words(&first).add_value(&"w".to_string(), 1, 1).expect("add");
    ids(&first).add_value(&5, 1, vec![5]).expect("add");
    cluster.publish(&first, "r1");

    let second = cluster.open(Some("r1"));
    words(&second).add_value(&"x".to_string(), 2, 2).expect("add");
    let manifest = cluster.publish(&second, "r2");
    assert!(manifest.heads("ids").expect("heads").is_some());

    let third = cluster.open(Some("r2"));
    assert_eq!(
        groups(&ids(&third).read(&5).expect("read")),
        vec![(vec![5], vec![1])]
    );
}

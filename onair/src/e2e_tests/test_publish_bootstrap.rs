//! Publish a session and read everything back from a fresh one.

use crate::e2e_tests::helpers::{TestCluster, groups, ids, words};
use crate::index::INITIAL_REVISION;

#[test]
fn test_publish_then_bootstrap() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    let first_words = words(&first);
    first_words.add_value(&"alpha".to_string(), 1, 3).expect("add");
    first_words.add_value(&"alpha".to_string(), 2, 1).expect("add");
    first_words.add_value(&"beta".to_string(), 2, 7).expect("add");
    let first_ids = ids(&first);
    for id in 1..200 {
        first_ids.add_value(&id, id, vec![id, id * 2]).expect("add");
    }
    let manifest = cluster.publish(&first, "r1");
    assert_eq!(manifest.revision().expect("revision"), INITIAL_REVISION);
    drop(first);

    let second = cluster.open(Some("r1"));
    assert_eq!(second.base_revision(), INITIAL_REVISION);
    assert_eq!(second.new_revision(), INITIAL_REVISION + 1);

    let second_words = words(&second);
    assert_eq!(
        groups(&second_words.read(&"alpha".to_string()).expect("read")),
        vec![(3, vec![1]), (1, vec![2])]
    );
    assert_eq!(
        groups(&second_words.read(&"beta".to_string()).expect("read")),
        vec![(7, vec![2])]
    );
    assert!(second_words.read(&"gamma".to_string()).expect("read").is_empty());

    let second_ids = ids(&second);
    for id in 1..200 {
        assert_eq!(
            groups(&second_ids.read(&id).expect("read")),
            vec![(vec![id, id * 2], vec![id])]
        );
    }
}

#[test]
fn test_bootstrap_lists_keys_of_baseline() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    let index = words(&first);
    for word in ["one", "two", "three"] {
        index.add_value(&word.to_string(), 1, 1).expect("add");
    }
    cluster.publish(&first, "base");

    let second = cluster.open(Some("base"));
    let mut keys = Vec::new();
    assert!(
        words(&second)
            .process_keys(|key| {
                keys.push(key.clone());
                true
            })
            .expect("process keys")
    );
    keys.sort();
    assert_eq!(keys, vec!["one", "three", "two"]);
}

#[test]
fn test_index_missing_from_baseline_starts_empty() {
    let cluster = TestCluster::new();
    let first = cluster.open(None);
    words(&first)
        .add_value(&"only-words".to_string(), 1, 1)
        .expect("add");
    cluster.publish(&first, "r1");

    let second = cluster.open(Some("r1"));
    let manifest = second.manifest().expect("baseline manifest");
    assert!(manifest.heads("ids").expect("heads").is_none());
    assert!(ids(&second).read(&1).expect("read").is_empty());
}

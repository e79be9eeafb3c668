//! Forward indices share one tree and survive publication.

use std::sync::Arc;

use crate::e2e_tests::helpers::TestCluster;
use crate::index::{IdListExternalizer, StringExternalizer};

#[test]
fn test_forward_indices_round_trip() {
    let cluster = TestCluster::new();

    let first = cluster.open(None);
    let names = first.create_forward_index_storage::<String>(1, Arc::new(StringExternalizer));
    let links = first.create_forward_index_storage::<Vec<i32>>(2, Arc::new(IdListExternalizer));
    for id in 1..100 {
        names.put(id, &format!("file-{id}.rs")).expect("put");
        links.put(id, &vec![id + 1]).expect("put");
    }
    assert!(names.remove(42).expect("remove"));
    cluster.publish(&first, "r1");

    let second = cluster.open(Some("r1"));
    let names = second.create_forward_index_storage::<String>(1, Arc::new(StringExternalizer));
    let links = second.create_forward_index_storage::<Vec<i32>>(2, Arc::new(IdListExternalizer));
    assert_eq!(names.get(7).expect("get"), Some("file-7.rs".to_string()));
    assert_eq!(names.get(42).expect("get"), None);
    assert_eq!(links.get(42).expect("get"), Some(vec![43]));
    assert_eq!(names.input_ids().expect("ids").len(), 98);
    assert_eq!(links.input_ids().expect("ids").len(), 99);

    // Writes in the new session go to novelty on top of the baseline.
    names.put(42, &"restored.rs".to_string()).expect("put");
    assert_eq!(names.get(42).expect("get"), Some("restored.rs".to_string()));
}

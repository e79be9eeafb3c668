//! Several threads write to the same index through a small cache.

use std::sync::Arc;
use std::thread;

use crate::e2e_tests::helpers::{TestCluster, groups};
use crate::index::{IntExternalizer, IntKeyDescriptor};

#[test]
fn test_threads_share_one_index() {
    const THREADS: i32 = 4;
    const KEYS: i32 = 300;

    let cluster = TestCluster::new();
    let manager = cluster.open(None);
    // Capacity 10, so most writes evict.
    let index = manager
        .create_index_storage::<i32, i32>(
            "counts",
            Arc::new(IntKeyDescriptor),
            Arc::new(IntExternalizer),
            1,
        )
        .expect("index");

    let handles: Vec<_> = (1..=THREADS)
        .map(|input| {
            let index = index.clone();
            thread::spawn(move || {
                for key in 0..KEYS {
                    index.add_value(&key, input, key * input).expect("add");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    for key in 0..KEYS {
        let expected: Vec<(i32, Vec<i32>)> = if key == 0 {
            vec![(0, (1..=THREADS).collect())]
        } else {
            (1..=THREADS).map(|input| (key * input, vec![input])).collect()
        };
        assert_eq!(groups(&index.read(&key).expect("read")), expected);
    }

    let manifest = cluster.publish(&manager, "r1");
    assert!(manifest.heads("counts").expect("heads").is_some());
}

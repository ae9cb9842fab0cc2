// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Parameter-grid correctness tests shared by the containers.

use std::collections::HashMap;

use crate::{OMap, OQueue, StashPolicy};

/// Runs a mirrored insert/lookup workload and checks every answer.
fn exercise_map(height: u8, stash_limit: usize, bucket_capacity: usize, operations: u32) {
    let map: OMap<String, u32> =
        OMap::with_policy(height, stash_limit, bucket_capacity, StashPolicy::Grow);
    let mut mirror: HashMap<String, u32> = HashMap::new();

    for i in 0..operations {
        let key = format!("/name/{}", i % 17);
        if i % 2 == 0 {
            map.insert(key.clone(), i).unwrap();
            mirror.insert(key, i);
        } else {
            assert_eq!(map.lookup(&key).unwrap(), mirror.get(&key).copied());
        }
    }
    for (key, value) in &mirror {
        assert_eq!(map.lookup(key).unwrap(), Some(*value));
    }
}

/// Runs cycles of pushes and pops, each cycle small enough that the pop
/// order is exact.
fn exercise_queue(height: u8, stash_limit: usize, bucket_capacity: usize, cycles: u32) {
    let queue: OQueue<u32> =
        OQueue::with_policy(height, stash_limit, bucket_capacity, StashPolicy::Grow);
    let batch = bucket_capacity.min(4) as u32;

    for cycle in 0..cycles {
        for i in 0..batch {
            queue.push(cycle * batch + i).unwrap();
        }
        for i in 0..batch {
            assert_eq!(queue.pop().unwrap(), Some(cycle * batch + i));
        }
        assert_eq!(queue.pop().unwrap(), None);
    }
}

macro_rules! create_map_grid_test {
    ($height:expr, $stash:expr, $bucket:expr, $operations:expr) => {
        paste::paste! {
            #[test]
            fn [<map_grid_h $height _s $stash _z $bucket _n $operations>]() {
                exercise_map($height, $stash, $bucket, $operations);
            }
        }
    };
}

macro_rules! create_queue_grid_test {
    ($height:expr, $stash:expr, $bucket:expr, $cycles:expr) => {
        paste::paste! {
            #[test]
            fn [<queue_grid_h $height _s $stash _z $bucket _n $cycles>]() {
                exercise_queue($height, $stash, $bucket, $cycles);
            }
        }
    };
}

create_map_grid_test!(3, 50, 4, 100);
create_map_grid_test!(5, 100, 4, 200);
create_map_grid_test!(5, 100, 8, 200);
create_map_grid_test!(7, 100, 4, 200);
create_map_grid_test!(8, 100, 12, 300);
create_map_grid_test!(5, 20, 4, 200);

create_queue_grid_test!(3, 50, 4, 30);
create_queue_grid_test!(4, 100, 8, 30);
create_queue_grid_test!(6, 100, 8, 50);
create_queue_grid_test!(8, 100, 20, 20);

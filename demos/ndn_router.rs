// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A miniature NDN-router client of the oblivious containers: the FIB and
//! PIT are oblivious maps, the content store is an oblivious queue.

extern crate oblivious_store;

use oblivious_store::{OMap, OQueue, OramError};

struct NdnRouter {
    fib: OMap<String, String>,
    pit: OMap<String, String>,
    content_store: OQueue<String>,
}

impl NdnRouter {
    fn new() -> Result<Self, OramError> {
        let fib: OMap<String, String> = OMap::new(7, 500, 8);
        // Routing entries must survive stash pressure; name prefixes start
        // with '/'.
        fib.set_priority_classifier(|name: &String| name.starts_with('/'));
        fib.insert("/example".into(), "eth0".into())?;

        Ok(Self {
            fib,
            pit: OMap::new(7, 500, 8),
            content_store: OQueue::new(4, 100, 8),
        })
    }

    fn handle_interest(&self, name: &str, consumer: &str) -> Result<(), OramError> {
        match self.fib.lookup(&name.to_string())? {
            Some(face) => println!("interest for {name} routed via {face}"),
            None => println!("no route for {name}; dropping interest"),
        }
        self.pit.insert(name.to_string(), consumer.to_string())
    }

    fn handle_data(&self, name: &str, data: &str) -> Result<(), OramError> {
        self.content_store.push(format!("{name}:{data}"))?;
        if let Some(consumer) = self.pit.lookup(&name.to_string())? {
            println!("satisfying pending interest of {consumer}");
        }
        Ok(())
    }

    fn serve_content(&self) -> Result<Option<(String, String)>, OramError> {
        Ok(self.content_store.pop()?.and_then(|entry| {
            entry
                .split_once(':')
                .map(|(name, data)| (name.to_string(), data.to_string()))
        }))
    }
}

fn main() -> Result<(), OramError> {
    let router = NdnRouter::new()?;

    router.handle_interest("/example", "consumer-1")?;
    router.handle_data("/example", "segment-0")?;

    match router.serve_content()? {
        Some((name, data)) => println!("served {name} -> {data}"),
        None => println!("no content to serve"),
    }
    Ok(())
}

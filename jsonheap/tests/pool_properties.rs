// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

use jsonheap::{HeapAlloc, PooledStr, StringPool};
use proptest::prelude::*;

fn fresh_pool() -> StringPool {
    StringPool::new(Rc::new(HeapAlloc::new()))
}

proptest! {
    /// provide() and get() agree: the first provide of a string wins, every
    /// later provide and every get returns that same record, and the pool
    /// holds each distinct string exactly once.
    #[test]
    fn provide_and_get_agree(strings in proptest::collection::vec("[a-zA-Z0-9 ]{0,40}", 1..60)) {
        let mut pool = fresh_pool();
        let mut seen: HashMap<String, NonNull<PooledStr>> = HashMap::new();

        for s in &strings {
            let (record, found) = pool.provide(s, false);
            match seen.get(s.as_str()) {
                Some(&first) => {
                    prop_assert!(found);
                    prop_assert_eq!(first, record);
                }
                None => {
                    prop_assert!(!found);
                    seen.insert(s.clone(), record);
                }
            }
        }

        prop_assert_eq!(pool.len() as usize, seen.len());
        for (s, &record) in &seen {
            prop_assert_eq!(pool.get(s), Some(record));
        }
        let never_generated = "\u{1}never generated\u{1}";
        prop_assert!(pool.get(never_generated).is_none());
        pool.sanity_check();
    }

    /// The key flag only ever turns on, regardless of provide order.
    #[test]
    fn key_flag_is_sticky(
        uses in proptest::collection::vec(("[a-z]{0,24}", any::<bool>()), 1..50)
    ) {
        let mut pool = fresh_pool();
        let mut expected: HashMap<String, bool> = HashMap::new();

        for (s, key) in &uses {
            pool.provide(s, *key);
            *expected.entry(s.clone()).or_insert(false) |= *key;
        }
        for (s, key) in &expected {
            let record = pool.get(s).unwrap();
            // SAFETY: the record is alive for the lifetime of the pool.
            prop_assert_eq!(unsafe { record.as_ref() }.is_key(), *key);
        }
    }
}

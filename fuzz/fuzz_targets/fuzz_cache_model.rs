#![no_main]

use std::collections::HashSet;

use libfuzzer_sys::fuzz_target;

use lsm_cache::lsm::set_associative_cache::{
    Options, SetAssociativeCache, SetAssociativeCacheContext,
};

struct FuzzContext;

impl SetAssociativeCacheContext for FuzzContext {
    type Key = u64;
    type Value = u64;

    fn key_from_value(value: &Self::Value) -> Self::Key {
        *value
    }

    fn hash(key: Self::Key) -> u64 {
        key.wrapping_mul(0x9E3779B97F4A7C15)
    }
}

type FuzzCache = SetAssociativeCache<'static, FuzzContext, u8, 4, 2, 64, 0, 2>;

// Interprets a byte stream as an operation sequence against the cache,
// checking every observable result against a `HashSet` ground-truth model.
// The cache may evict behind the model's back, so the checks are one-sided:
// a hit must be a model member with the right value, and a freshly-inserted
// or removed key must be immediately visible/absent.
//
// Byte layout: `(opcode, operand)` pairs:
// - 0 → `get(key)`
// - 1 → insert `key` if absent (`put_no_clobber` + write)
// - 2 → `remove(key)`
// - 3 → `reset()`
//
// Keys are folded into a small range so sets see heavy reuse and the CLOCK
// sweep, pin-free path, and tag collisions all get exercised.
fuzz_target!(|data: &[u8]| {
    let mut cache = FuzzCache::init(256, Options { name: "fuzz" });
    let mut model: HashSet<u64> = HashSet::new();

    let mut i = 0;
    while i + 1 < data.len() {
        let opcode = data[i];
        let key = (data[i + 1] % 96) as u64;
        i += 2;

        match opcode % 4 {
            // get
            0 => {
                if let Some(&value) = cache.get(key) {
                    assert_eq!(key, value, "get({key}) returned wrong value");
                    assert!(model.contains(&key), "get({key}) hit a key the model lacks");
                }
            }
            // insert if absent
            1 => {
                if cache.get(key).is_none() {
                    cache.put_no_clobber(key).write(key);
                    model.insert(key);
                    let value = cache.get(key).copied();
                    assert_eq!(Some(key), value, "inserted key {key} not found");
                }
            }
            // remove
            2 => {
                if let Some(removed) = cache.remove(key) {
                    assert_eq!(key, removed, "remove({key}) returned wrong value");
                }
                model.remove(&key);
                assert!(cache.get(key).is_none(), "removed key {key} still present");
            }
            // reset
            _ => {
                cache.reset();
                model.clear();
            }
        }
    }
});

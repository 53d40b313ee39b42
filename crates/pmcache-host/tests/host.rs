//! End-to-end use of the engine API as a cache server drives it.

use std::collections::HashMap;
use std::path::Path;

use pmcache_host::{CacheEngine, EngineStatus, PmemHost, StoreOperation};
use tempfile::TempDir;

fn config_str(path: &Path) -> String {
    format!(
        "pool_path={};pool_size=8m;log_size=128k;hash_power=8;cache_size=4m;sticky_limit=2k",
        path.display()
    )
}

fn open(dir: &TempDir) -> PmemHost {
    PmemHost::initialize(&config_str(&dir.path().join("host.pool"))).unwrap()
}

fn set(
    host: &PmemHost,
    key: &[u8],
    value: &[u8],
    op: StoreOperation,
    cas: u64,
) -> Result<u64, EngineStatus> {
    let item = host.allocate(key, value.len(), 0, 0, cas)?;
    let result = host.write_value(&item, 0, value).and_then(|()| host.store(&item, op));
    host.release(item);
    result
}

fn value_of(host: &PmemHost, key: &[u8]) -> Option<Vec<u8>> {
    let item = host.get(key).ok()?;
    let info = host.get_item_info(&item).unwrap();
    host.release(item);
    Some(info.value)
}

fn stats(host: &PmemHost) -> Vec<(String, String)> {
    let mut out = Vec::new();
    host.get_stats(None, &mut |name, value| out.push((name.to_string(), value.to_string())))
        .unwrap();
    out
}

#[test]
fn test_allocate_store_get() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);

    let item = host.allocate(b"user:1", 5, 0xAB, 0, 0).unwrap();
    host.write_value(&item, 0, b"alice").unwrap();
    let cas = host.store(&item, StoreOperation::Set).unwrap();
    host.release(item);
    assert!(cas > 0);

    let item = host.get(b"user:1").unwrap();
    let info = host.get_item_info(&item).unwrap();
    host.release(item);
    assert_eq!(info.key, b"user:1");
    assert_eq!(info.value, b"alice");
    assert_eq!(info.flags, 0xAB);
    assert_eq!(info.cas, cas);

    assert_eq!(host.get(b"user:2").unwrap_err(), EngineStatus::KeyNotFound);
}

#[test]
fn test_store_operation_statuses() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);

    assert_eq!(set(&host, b"k", b"v", StoreOperation::Replace, 0), Err(EngineStatus::NotStored));
    assert_eq!(set(&host, b"k", b"v", StoreOperation::Append, 0), Err(EngineStatus::NotStored));
    assert_eq!(set(&host, b"k", b"v", StoreOperation::Cas, 1), Err(EngineStatus::KeyNotFound));

    let cas = set(&host, b"k", b"mid", StoreOperation::Add, 0).unwrap();
    assert_eq!(set(&host, b"k", b"v", StoreOperation::Add, 0), Err(EngineStatus::NotStored));
    assert_eq!(
        set(&host, b"k", b"v", StoreOperation::Cas, cas + 100),
        Err(EngineStatus::KeyExists)
    );

    set(&host, b"k", b"-end", StoreOperation::Append, 0).unwrap();
    set(&host, b"k", b"start-", StoreOperation::Prepend, 0).unwrap();
    assert_eq!(value_of(&host, b"k"), Some(b"start-mid-end".to_vec()));

    let item = host.get(b"k").unwrap();
    let current = host.get_item_info(&item).unwrap().cas;
    host.release(item);
    let next = set(&host, b"k", b"swapped", StoreOperation::Cas, current).unwrap();
    assert!(next > current);
    assert_eq!(value_of(&host, b"k"), Some(b"swapped".to_vec()));
}

#[test]
fn test_remove_with_cas() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);
    let cas = set(&host, b"gone", b"soon", StoreOperation::Set, 0).unwrap();

    assert_eq!(host.remove(b"gone", cas + 1), Err(EngineStatus::KeyExists));
    assert_eq!(host.remove(b"gone", cas), Ok(()));
    assert_eq!(host.remove(b"gone", 0), Err(EngineStatus::KeyNotFound));
    assert_eq!(value_of(&host, b"gone"), None);
}

#[test]
fn test_invalid_requests() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);
    assert_eq!(host.allocate(b"", 1, 0, 0, 0).unwrap_err(), EngineStatus::Invalid);
    assert_eq!(host.allocate(b"huge", 2 << 20, 0, 0, 0).unwrap_err(), EngineStatus::Invalid);
    assert_eq!(
        host.arithmetic(b"counter", true, true, 1, 0, 0, 0),
        Err(EngineStatus::NotSupported)
    );

    let item = host.allocate(b"short", 3, 0, 0, 0).unwrap();
    assert_eq!(host.write_value(&item, 2, b"xyz"), Err(EngineStatus::Invalid));
    host.release(item);
}

#[test]
fn test_pool_exhaustion_reports_out_of_memory() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);
    let mut held = Vec::new();
    let status = loop {
        match host.allocate(format!("big{}", held.len()).as_bytes(), 900 * 1024, 0, 0, 0) {
            Ok(item) => held.push(item),
            Err(status) => break status,
        }
        assert!(held.len() < 16, "8 MiB pool never filled");
    };
    assert_eq!(status, EngineStatus::OutOfMemory);
    for item in held {
        host.release(item);
    }
    host.release(host.allocate(b"big-again", 900 * 1024, 0, 0, 0).unwrap());
}

#[test]
fn test_flush_hides_existing_items() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);
    set(&host, b"a", b"1", StoreOperation::Set, 0).unwrap();
    set(&host, b"b", b"2", StoreOperation::Set, 0).unwrap();

    // Flush covers items stored strictly before the current second.
    std::thread::sleep(std::time::Duration::from_secs(2));
    host.flush(None, 0).unwrap();
    assert_eq!(value_of(&host, b"a"), None);
    assert_eq!(value_of(&host, b"b"), None);
}

#[test]
fn test_stats_callback() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);
    set(&host, b"a", b"12345", StoreOperation::Set, 0).unwrap();
    set(&host, b"b", b"678", StoreOperation::Set, 0).unwrap();
    set(&host, b"a", b"replaced", StoreOperation::Set, 0).unwrap();

    let reported = stats(&host);
    let names: Vec<&str> = reported.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        [
            "evictions",
            "sticky_items",
            "curr_items",
            "total_items",
            "sticky_bytes",
            "bytes",
            "reclaimed",
            "sticky_limit",
            "engine_maxbytes",
        ]
    );

    let map: HashMap<_, _> = reported.into_iter().collect();
    assert_eq!(map["curr_items"], "2");
    assert_eq!(map["total_items"], "3");
    assert_eq!(map["evictions"], "0");
    assert_eq!(map["sticky_limit"], "2048");
    assert_eq!(map["engine_maxbytes"], (4u64 << 20).to_string());
    assert_ne!(map["bytes"], "0");

    host.reset_stats();
    let map: HashMap<_, _> = stats(&host).into_iter().collect();
    assert_eq!(map["total_items"], "0");
    assert_eq!(map["curr_items"], "2");
}

#[test]
fn test_items_survive_reinitialize() {
    let dir = TempDir::new().unwrap();
    let cas = {
        let host = open(&dir);
        set(&host, b"durable", b"value", StoreOperation::Set, 0).unwrap()
    };

    let host = open(&dir);
    let item = host.get(b"durable").unwrap();
    let info = host.get_item_info(&item).unwrap();
    host.release(item);
    assert_eq!(info.value, b"value");
    assert_eq!(info.cas, cas);

    let next = set(&host, b"other", b"x", StoreOperation::Set, 0).unwrap();
    assert!(next > cas);
    let map: HashMap<_, _> = stats(&host).into_iter().collect();
    assert_eq!(map["curr_items"], "2");
}

#[test]
fn test_engine_shared_across_threads() {
    let dir = TempDir::new().unwrap();
    let host = open(&dir);

    std::thread::scope(|scope| {
        for t in 0..4 {
            let host = &host;
            scope.spawn(move || {
                for i in 0..50 {
                    let key = format!("t{}-{}", t, i);
                    set(host, key.as_bytes(), key.as_bytes(), StoreOperation::Set, 0).unwrap();
                }
            });
        }
    });

    for t in 0..4 {
        for i in 0..50 {
            let key = format!("t{}-{}", t, i);
            assert_eq!(value_of(&host, key.as_bytes()), Some(key.clone().into_bytes()));
        }
    }
}

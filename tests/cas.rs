use ebb::{Config, Error, Item, ManualClock, MemoryKvStore, LOCKED_CAS};
use std::sync::Arc;
use test_log::test;

fn item(key: &[u8], value: &[u8]) -> Item {
    Item::new(key.to_vec(), value.to_vec(), 0, 0, 0)
}

#[test]
fn cas_conflict() -> ebb::Result<()> {
    let store = Config::new()
        .flush_interval(None)
        .open(Arc::new(MemoryKvStore::default()));

    store.set(item(b"b", b"x"), 0, false)?;
    let cas = store.get(b"b", 0, 0)?.cas;

    assert_eq!(
        store.set(item(b"b", b"y").with_cas(cas + 1), 0, false),
        Err(Error::Exists)
    );
    assert_eq!(&*store.get(b"b", 0, 0)?.value, b"x");

    store.set(item(b"b", b"y").with_cas(cas), 0, false)?;
    let after = store.get(b"b", 0, 0)?;
    assert_eq!(&*after.value, b"y");
    assert_ne!(after.cas, cas, "every mutation stamps a fresh token");

    store.stop();
    Ok(())
}

#[test]
fn cas_against_missing_key() {
    let store = Config::new()
        .flush_interval(None)
        .open(Arc::new(MemoryKvStore::default()));

    assert_eq!(
        store.set(item(b"nope", b"x").with_cas(123), 0, false),
        Err(Error::NotFound)
    );
    assert_eq!(store.get(b"nope", 0, 0), Err(Error::NotFound));

    store.stop();
}

#[test]
fn get_locked_lease() -> ebb::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let store = Config::new()
        .flush_interval(None)
        .clock(clock.clone())
        .open(Arc::new(MemoryKvStore::default()));

    store.set(item(b"k", b"v"), 0, false)?;

    let leased = store
        .get_locked(b"k", 0, 15)?
        .expect("lease granted");

    // Plain reads see the sentinel, not a forgeable token
    assert_eq!(store.get(b"k", 0, 0)?.cas, LOCKED_CAS);

    // A second lease is refused while the first is live
    assert_eq!(store.get_locked(b"k", 0, 15)?, None);

    // Writes without the lease token bounce
    assert_eq!(store.set(item(b"k", b"w"), 0, false), Err(Error::Exists));

    // The lease holder writes through and releases the lock
    store.set(item(b"k", b"w").with_cas(leased.cas), 0, false)?;
    assert_ne!(store.get(b"k", 0, 0)?.cas, LOCKED_CAS);

    store.stop();
    Ok(())
}

#[test]
fn lease_expires_on_its_own() -> ebb::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let store = Config::new()
        .flush_interval(None)
        .clock(clock.clone())
        .open(Arc::new(MemoryKvStore::default()));

    store.set(item(b"k", b"v"), 0, false)?;

    store.get_locked(b"k", 0, 10)?.expect("lease granted");
    assert_eq!(store.get_locked(b"k", 0, 10)?, None);

    clock.advance(10);

    // t' >= t + T: anyone may lock or write again
    store.get_locked(b"k", 0, 10)?.expect("lease expired");

    store.stop();
    Ok(())
}

#[test]
fn get_locked_status_codes() -> ebb::Result<()> {
    let store = Config::new()
        .flush_interval(None)
        .open(Arc::new(MemoryKvStore::default()));

    assert_eq!(store.get_locked(b"missing", 0, 5), Err(Error::NotFound));
    assert_eq!(store.get_locked(b"k", 9, 5), Err(Error::NotMyPartition));

    store.stop();
    Ok(())
}

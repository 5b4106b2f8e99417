use ebb::{
    Config, Cookie, Error, Item, MemoryKvStore, PartitionState, ServerCallbacks,
};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_log::test;

struct ChannelCallbacks(Mutex<Sender<(Cookie, ebb::Result<()>)>>);

impl ServerCallbacks for ChannelCallbacks {
    fn notify_io_complete(&self, cookie: Cookie, status: ebb::Result<()>) {
        let _ = self
            .0
            .lock()
            .expect("lock is poisoned")
            .send((cookie, status));
    }
}

fn item(key: &[u8], value: &[u8], partition: u16) -> Item {
    Item::new(key.to_vec(), value.to_vec(), 0, 0, partition)
}

#[test]
fn pending_partition_parks_the_cookie() -> ebb::Result<()> {
    let (tx, rx) = channel();
    let store = Config::new().flush_interval(None).open_with_callbacks(
        Arc::new(MemoryKvStore::default()),
        Arc::new(ChannelCallbacks(Mutex::new(tx))),
    );

    store.set_partition_state(1, PartitionState::Pending);
    assert_eq!(
        store.set(item(b"k", b"v", 1), 42, false),
        Err(Error::WouldBlock)
    );
    assert_eq!(store.get(b"k", 1, 42), Err(Error::WouldBlock));

    // Going active fires the parked notification from the non-I/O worker
    store.set_partition_state(1, PartitionState::Active);
    let (cookie, status) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("parked cookie was notified");
    assert_eq!(cookie, 42);
    assert_eq!(status, Ok(()));

    // The retry goes through
    store.set(item(b"k", b"v", 1), 42, false)?;
    assert_eq!(&*store.get(b"k", 1, 42)?.value, b"v");

    store.stop();
    Ok(())
}

#[test]
fn settling_dead_resolves_cookies_with_an_error() {
    let (tx, rx) = channel();
    let store = Config::new().flush_interval(None).open_with_callbacks(
        Arc::new(MemoryKvStore::default()),
        Arc::new(ChannelCallbacks(Mutex::new(tx))),
    );

    store.set_partition_state(1, PartitionState::Pending);
    assert_eq!(
        store.set(item(b"k", b"v", 1), 7, false),
        Err(Error::WouldBlock)
    );

    store.set_partition_state(1, PartitionState::Dead);
    let (cookie, status) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("parked cookie was notified");
    assert_eq!(cookie, 7);
    assert_eq!(status, Err(Error::NotMyPartition));

    store.stop();
}

#[test]
fn force_writes_through_replica_and_pending() -> ebb::Result<()> {
    let store = Config::new()
        .flush_interval(None)
        .open(Arc::new(MemoryKvStore::default()));

    store.set_partition_state(1, PartitionState::Replica);
    assert_eq!(
        store.set(item(b"r", b"1", 1), 0, false),
        Err(Error::NotMyPartition)
    );
    store.set(item(b"r", b"1", 1), 0, true)?;

    store.set_partition_state(2, PartitionState::Pending);
    store.set(item(b"p", b"1", 2), 0, true)?;

    // Reads still honor the role unless told otherwise
    assert_eq!(store.get(b"r", 1, 0), Err(Error::NotMyPartition));
    assert_eq!(&*store.get_with(b"r", 1, 0, true, false)?.value, b"1");

    store.stop();
    Ok(())
}

#[test]
fn unknown_and_dead_partitions_refuse_everything() {
    let store = Config::new()
        .flush_interval(None)
        .open(Arc::new(MemoryKvStore::default()));

    assert_eq!(store.get(b"k", 9, 0), Err(Error::NotMyPartition));
    assert_eq!(
        store.set(item(b"k", b"v", 9), 0, false),
        Err(Error::NotMyPartition)
    );

    store.set_partition_state(3, PartitionState::Dead);
    assert_eq!(store.get(b"k", 3, 0), Err(Error::NotMyPartition));
    assert_eq!(store.del(b"k", 3, 0), Err(Error::NotMyPartition));
    assert!(store.stats().snapshot().num_not_my_partitions >= 4);

    store.stop();
}

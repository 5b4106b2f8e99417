use ebb::{Config, Error, Item, MemoryKvStore, PartitionState};
use std::sync::Arc;
use test_log::test;

fn row(key: &[u8], value: &[u8], partition: u16) -> Item {
    Item::new(key.to_vec(), value.to_vec(), 0, 0, partition)
}

#[test]
fn warmup_restores_partitions_and_rows() -> ebb::Result<()> {
    let kvstore = Arc::new(MemoryKvStore::default());
    kvstore.seed_partition_state(1, PartitionState::Active);
    kvstore.seed_partition_state(2, PartitionState::Replica);
    kvstore.seed_row(row(b"a", b"1", 1));
    kvstore.seed_row(row(b"b", b"2", 1));
    kvstore.seed_row(row(b"c", b"3", 2));

    let store = Config::new()
        .flush_interval(None)
        .open(kvstore.clone());

    assert_eq!(store.partition_state(1), Some(PartitionState::Active));
    assert_eq!(store.partition_state(2), Some(PartitionState::Replica));

    let got = store.get(b"a", 1, 0)?;
    assert_eq!(&*got.value, b"1");
    assert_ne!(got.cas, 0);

    // The replica's data is there, behind the role check
    assert_eq!(store.get(b"c", 2, 0), Err(Error::NotMyPartition));
    assert_eq!(&*store.get_with(b"c", 2, 0, true, false)?.value, b"3");

    // Everything came in clean; nothing to flush
    assert!(store.pending_writes().is_empty());
    store.flush();
    assert_eq!(kvstore.row_count(), 3);
    assert_eq!(store.stats().snapshot().warmed_up, 3);

    store.stop();
    Ok(())
}

#[test]
fn orphan_rows_get_a_pending_partition() {
    let kvstore = Arc::new(MemoryKvStore::default());
    kvstore.seed_row(row(b"x", b"1", 5));

    let store = Config::new()
        .flush_interval(None)
        .open(kvstore);

    assert_eq!(store.partition_state(5), Some(PartitionState::Pending));
    assert_eq!(store.get(b"x", 5, 0), Err(Error::WouldBlock));

    store.stop();
}

#[test]
fn warmed_rows_keep_their_identity() -> ebb::Result<()> {
    let kvstore = Arc::new(MemoryKvStore::default());
    kvstore.seed_partition_state(0, PartitionState::Active);
    let row_id = kvstore.seed_row(row(b"a", b"1", 0));

    let store = Config::new()
        .flush_interval(None)
        .open(kvstore.clone());

    // A rewrite flushes as an update of the original row
    store.set(row(b"a", b"2", 0), 0, false)?;
    store.flush();

    let persisted = kvstore.row_for_key(0, b"a").expect("row exists");
    assert_eq!(persisted.row_id, row_id);
    assert_eq!(&*persisted.value, b"2");
    assert_eq!(kvstore.row_count(), 1);

    store.stop();
    Ok(())
}

#[test]
fn duplicate_rows_are_counted_not_fatal() {
    let kvstore = Arc::new(MemoryKvStore::default());
    kvstore.seed_partition_state(0, PartitionState::Active);
    kvstore.seed_row(row(b"a", b"1", 0));
    kvstore.seed_row(row(b"a", b"2", 0));

    let store = Config::new()
        .flush_interval(None)
        .open(kvstore);

    let snapshot = store.stats().snapshot();
    assert_eq!(snapshot.warmed_up, 2);
    assert_eq!(snapshot.warm_dups, 1);

    store.stop();
}

#[test]
fn emergency_purge_makes_room_once() {
    let kvstore = Arc::new(MemoryKvStore::default());
    kvstore.seed_partition_state(0, PartitionState::Active);
    for key in [b"a".as_slice(), b"b", b"c"] {
        kvstore.seed_row(row(key, &vec![9u8; 2048], 0));
    }

    let store = Config::new()
        .max_memory(4096)
        .flush_interval(None)
        .open(kvstore);

    let snapshot = store.stats().snapshot();
    assert_eq!(snapshot.warmed_up, 3);
    assert!(snapshot.num_value_ejects >= 1, "the purge ejected something");
    assert!(snapshot.warm_oom >= 1, "the purge only happens once");

    store.stop();
}

use ebb::{Config, Item, MemoryKvStore, PartitionState};
use std::sync::Arc;

fn main() -> ebb::Result<()> {
    let kvstore = Arc::new(MemoryKvStore::default());
    let store = Config::new().open(kvstore.clone());

    store.set(
        Item::new(b"greeting".to_vec(), b"hello world".to_vec(), 0, 0, 0),
        0,
        false,
    )?;

    let item = store.get(b"greeting", 0, 0)?;
    println!(
        "got {:?} (cas {})",
        String::from_utf8_lossy(&item.value),
        item.cas
    );

    // Make the write durable right now instead of waiting for the flusher
    store.flush();
    println!("backing store now holds {} rows", kvstore.row_count());

    // Partitions have a lifecycle of their own
    store.set_partition_state(1, PartitionState::Pending);
    store.set_partition_state(1, PartitionState::Active);
    store.set(
        Item::new(b"other".to_vec(), b"partitioned".to_vec(), 0, 0, 1),
        0,
        false,
    )?;

    let snapshot = store.stats().snapshot();
    println!(
        "{} enqueued, {} resident bytes",
        snapshot.tot_enqueued, snapshot.cur_size
    );

    store.stop();
    Ok(())
}

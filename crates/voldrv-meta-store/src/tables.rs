//! Redb table definitions for the metadata store.

use redb::TableDefinition;

/// Bookkeeping of the replay position. Keys: [`LAST_CORK_KEY`], [`SCRUB_ID_KEY`].
pub const CONTROL: TableDefinition<&str, &[u8]> = TableDefinition::new("control");

// Key: zero-padded hex replay sequence number, Value: bincode-encoded ReplayedTLog
pub const REPLAYED_TLOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("replayed_tlogs");

pub const LAST_CORK_KEY: &str = "last_cork";
pub const SCRUB_ID_KEY: &str = "scrub_id";

/// Key under which replay step `seq` is stored; sorts in replay order
#[must_use]
pub fn replay_key(seq: u64) -> String {
    format!("{seq:016x}")
}

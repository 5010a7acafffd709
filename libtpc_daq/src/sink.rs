//! Batched insertion into the sharded buffer store.
//!
//! Processors push whole batches through a numeric ticket; the sink never
//! calls back into a processor. One cached connection is kept per sink; a
//! failed insert drops it and the next insert makes exactly one reconnect
//! attempt, so a dead store costs one error per insert instead of a retry
//! storm.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::error::SinkError;
use super::store::{BufferStore, Oid, StoreConnector};

/// Extra fields attached to records when `debug_output` is set, for chasing
/// clock problems offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugFields {
    pub header_time: u32,
    pub raw_time: u32,
    /// Reader's reset epoch when the BLT was acquired.
    pub header_batch_id: u32,
    /// Per-channel reset counters at the moment this record was built.
    pub channel_batch_ids: Vec<u32>,
}

/// One record of the buffer store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccurrenceDoc {
    #[serde(rename = "_id")]
    pub id: Oid,
    pub module: i32,
    pub channel: u8,
    pub time: u64,
    pub endtime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integral: Option<f32>,
    #[serde(flatten)]
    pub debug: Option<DebugFields>,
    /// Waveform payload; omitted entirely in lite mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// Destination addressing for one sink.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    pub address: String,
    pub database: String,
    pub collection: String,
}

impl SinkTarget {
    /// Namespace for a given rotation tag. Negative tags address the base
    /// collection; non-negative ones address the numbered cycle.
    fn namespace(&self, epoch_tag: i64) -> String {
        if epoch_tag < 0 {
            format!("{}.{}", self.database, self.collection)
        } else {
            format!("{}.{}_{}", self.database, self.collection, epoch_tag)
        }
    }
}

/// The document sink shared by the processors of one reader.
pub struct DocumentSink {
    connector: Arc<dyn StoreConnector>,
    target: SinkTarget,
    connection: Mutex<Option<Arc<dyn BufferStore>>>,
}

impl DocumentSink {
    pub fn new(connector: Arc<dyn StoreConnector>, target: SinkTarget) -> Self {
        Self {
            connector,
            target,
            connection: Mutex::new(None),
        }
    }

    /// Register one processor, connecting on first use.
    ///
    /// The returned ticket tags every insert from that processor.
    pub fn register_processor(&self) -> Result<i32, SinkError> {
        let conn = self.connection()?;
        let ticket = conn.register_processor();
        if ticket < 0 {
            // The store refused the registration outright.
            return Err(SinkError::InsertFailed(format!(
                "store refused processor registration with ticket {ticket}"
            )));
        }
        Ok(ticket)
    }

    /// Insert one batch. At-most-once within this call.
    ///
    /// `epoch_tag` selects the rotation cycle; pass -1 when rotation is off.
    /// On failure the cached connection is released so the next call starts
    /// with a fresh reconnect attempt.
    pub fn insert(
        &self,
        batch: Vec<OccurrenceDoc>,
        processor_id: i32,
        epoch_tag: i64,
    ) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let ns = self.target.namespace(epoch_tag);
        let conn = self.connection()?;
        if let Err(e) = conn.insert_batch(&ns, batch, processor_id) {
            self.drop_connection();
            return Err(SinkError::InsertFailed(e.to_string()));
        }
        Ok(())
    }

    /// The cached connection, reconnecting once if it was dropped.
    fn connection(&self) -> Result<Arc<dyn BufferStore>, SinkError> {
        let mut slot = self.connection.lock().expect("sink connection poisoned");
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        match self.connector.connect_buffer(&self.target.address) {
            Ok(conn) => {
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => Err(SinkError::Unavailable(e)),
        }
    }

    fn drop_connection(&self) {
        if let Ok(mut slot) = self.connection.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryStore};

    fn sink_over(store: Arc<MemoryStore>) -> DocumentSink {
        DocumentSink::new(
            Arc::new(MemoryConnector::new(store)),
            SinkTarget {
                address: "mongodb://daq0:27017/".into(),
                database: "data".into(),
                collection: "run_0001".into(),
            },
        )
    }

    fn doc(channel: u8, time: u64) -> OccurrenceDoc {
        OccurrenceDoc {
            id: Oid::new(),
            module: 1,
            channel,
            time,
            endtime: time + 8,
            integral: None,
            debug: None,
            data: Some(vec![0u8; 8]),
        }
    }

    #[test]
    fn inserts_land_in_the_base_collection_without_rotation() {
        let store = MemoryStore::new();
        let sink = sink_over(store.clone());
        let id = sink.register_processor().unwrap();
        sink.insert(vec![doc(0, 10), doc(1, 11)], id, -1).unwrap();
        assert_eq!(store.data_batches("data.run_0001").len(), 2);
    }

    #[test]
    fn rotation_tag_selects_the_cycle_collection() {
        let store = MemoryStore::new();
        let sink = sink_over(store.clone());
        let id = sink.register_processor().unwrap();
        sink.insert(vec![doc(0, 10)], id, 0).unwrap();
        sink.insert(vec![doc(0, 20)], id, 3).unwrap();
        assert_eq!(store.data_batches("data.run_0001_0").len(), 1);
        assert_eq!(store.data_batches("data.run_0001_3").len(), 1);
    }

    #[test]
    fn failed_insert_drops_the_connection_and_reconnects_once() {
        let store = MemoryStore::new();
        let sink = sink_over(store.clone());
        let id = sink.register_processor().unwrap();

        store.set_failing(true);
        assert!(matches!(
            sink.insert(vec![doc(0, 1)], id, -1),
            Err(SinkError::InsertFailed(_))
        ));
        // Still down: the reconnect attempt itself fails.
        assert!(matches!(
            sink.insert(vec![doc(0, 2)], id, -1),
            Err(SinkError::Unavailable(_))
        ));

        // Store comes back; next insert reconnects and succeeds.
        store.set_failing(false);
        sink.insert(vec![doc(0, 3)], id, -1).unwrap();
        assert_eq!(store.data_batches("data.run_0001").len(), 1);
    }

    #[test]
    fn empty_batches_are_not_sent() {
        let store = MemoryStore::new();
        let sink = sink_over(store.clone());
        sink.insert(Vec::new(), 0, -1).unwrap();
        assert!(store.data_namespaces().is_empty());
    }
}

//! The parse -> encode -> batch -> insert pipeline of one reader worker.
//!
//! Every worker shares the digitizer pool with its peers and claims one
//! module at a time through the non-blocking data lock. A claimed BLT is
//! split by the configured parser, lifted onto the 64-bit timeline, then
//! batched into the configured sink. The loop ends when every digitizer
//! reports inactive, or on the first failed insert.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::blt::{self, Occurrence, RawBlt};
use super::compression::compress_payload;
use super::constants::NUM_CHANNELS;
use super::digitizer::Digitizer;
use super::error::{ParseError, ProcessorError};
use super::file_sink::FileSink;
use super::options::{Compression, ProcessingMode, RunOptions};
use super::sink::{DebugFields, DocumentSink, OccurrenceDoc};
use super::store::Oid;
use super::timeline::ModuleClock;
use super::waveform;
use super::worker_status::WorkerStatus;

/// Where a processor's life currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorState {
    #[default]
    Idle,
    /// Parsing and transforming a claimed BLT.
    Draining,
    /// Batching records and flushing to the sink.
    Inserting,
    /// A primary-sink insert failed; no further BLTs are drained.
    Errored,
    Finished,
}

/// The sink a processor writes into.
#[derive(Clone)]
pub enum ProcessorSink {
    Store(Arc<DocumentSink>),
    /// Shared between the workers of one reader; events interleave.
    File(Arc<Mutex<FileSink>>),
    /// Parse and drop, for baseline runs.
    Discard,
}

/// One worker of the readout pipeline.
pub struct DataProcessor {
    options: Arc<RunOptions>,
    digitizers: Arc<Vec<Arc<dyn Digitizer>>>,
    sink: ProcessorSink,
    worker_id: usize,
    status_tx: Option<Sender<WorkerStatus>>,
    state: ProcessorState,
}

impl DataProcessor {
    pub fn new(
        options: Arc<RunOptions>,
        digitizers: Arc<Vec<Arc<dyn Digitizer>>>,
        sink: ProcessorSink,
        worker_id: usize,
    ) -> Self {
        Self {
            options,
            digitizers,
            sink,
            worker_id,
            status_tx: None,
            state: ProcessorState::Idle,
        }
    }

    /// Report progress after every BLT on the given channel.
    pub fn with_status(mut self, tx: Sender<WorkerStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Run until every digitizer is inactive or an insert fails.
    pub fn run(&mut self) -> Result<(), ProcessorError> {
        let result = self.run_inner();
        if result.is_err() {
            self.state = ProcessorState::Errored;
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), ProcessorError> {
        let processor_id = match &self.sink {
            ProcessorSink::Store(sink) => match sink.register_processor() {
                Ok(id) => id,
                Err(e) => {
                    spdlog::error!(
                        "Worker {} failed to register with the buffer store: {}",
                        self.worker_id,
                        e
                    );
                    self.state = ProcessorState::Errored;
                    return Err(e.into());
                }
            },
            _ => -1,
        };

        let rotating = self.options.rotating_collections();
        let mut batch: Vec<OccurrenceDoc> = Vec::new();
        let mut last_reset_count: i64 = 0;
        let mut open_handle: Option<i32> = None;
        let mut blts_read = 0u64;
        let mut bytes_read = 0u64;

        let digitizers = Arc::clone(&self.digitizers);
        let mut exit = false;
        while !exit {
            exit = true;
            for digi in digitizers.iter() {
                if digi.active() {
                    exit = false;
                } else {
                    continue;
                }
                // Spin gently instead of hammering the lock.
                thread::sleep(Duration::from_micros(10));
                if !digi.request_data_lock() {
                    continue;
                }
                self.state = ProcessorState::Draining;
                let read = digi.read_blt();
                let module = digi.id();
                blts_read += 1;
                bytes_read += read
                    .buffers
                    .iter()
                    .map(|b| u64::from(b.size_bytes()))
                    .sum::<u64>();

                let mut event_indices: Option<Vec<usize>> = None;
                let occurrences = self.parse(module, read.buffers, &mut event_indices);
                let mut clock = ModuleClock::new(read.reset_epoch, read.header_time);
                self.state = ProcessorState::Inserting;

                let total = occurrences.len();
                let mut next_event = 0usize;
                for (b, occ) in occurrences.into_iter().enumerate() {
                    let channel = occ.channel as usize;
                    if channel >= NUM_CHANNELS {
                        spdlog::error!(
                            "Occurrence with channel {} from module {}",
                            occ.channel,
                            module
                        );
                        self.state = ProcessorState::Errored;
                        return Err(ParseError::BadChannel(occ.channel).into());
                    }
                    let time64 = clock.lift(channel, occ.time);

                    // Integral is expensive, only computed when asked for.
                    let integral = (self.options.occurrence_integral > 0).then(|| {
                        waveform::occurrence_integral(
                            &occ.payload,
                            self.options.occurrence_integral as u32,
                        )
                    });

                    let mut payload = occ.payload_bytes();
                    if self.options.compression() == Compression::Snappy {
                        payload = match compress_payload(&payload) {
                            Ok(zipped) => zipped,
                            Err(e) => {
                                self.state = ProcessorState::Errored;
                                return Err(e.into());
                            }
                        };
                    }
                    let event_size = payload.len() as u64;

                    match &self.sink {
                        ProcessorSink::Store(sink) => {
                            let reset_count = i64::from(clock.reset_counter(channel));
                            // Under rotation every batch carries one epoch:
                            // flush the previous epoch before switching.
                            if rotating && reset_count != last_reset_count {
                                if !batch.is_empty() {
                                    if let Err(e) = sink.insert(
                                        std::mem::take(&mut batch),
                                        processor_id,
                                        last_reset_count,
                                    ) {
                                        return self.insert_failed(e);
                                    }
                                }
                                last_reset_count = reset_count;
                            }

                            let debug = self.options.debug_output().then(|| DebugFields {
                                header_time: read.header_time,
                                raw_time: occ.time,
                                header_batch_id: read.reset_epoch,
                                channel_batch_ids: (0..NUM_CHANNELS)
                                    .map(|c| clock.reset_counter(c))
                                    .collect(),
                            });
                            batch.push(OccurrenceDoc {
                                id: Oid::new(),
                                module: occ.module,
                                channel: occ.channel,
                                time: time64,
                                endtime: time64 + event_size,
                                integral,
                                debug,
                                data: (!self.options.lite_mode()).then_some(payload),
                            });

                            let size = batch.len() as i32;
                            let mut flush =
                                size > self.options.mongo_min_insert_size || size < 0;
                            if b == total - 1 {
                                // Last record of this round of BLTs.
                                flush = true;
                            }
                            if flush {
                                let tag = if rotating { last_reset_count } else { -1 };
                                if let Err(e) =
                                    sink.insert(std::mem::take(&mut batch), processor_id, tag)
                                {
                                    return self.insert_failed(e);
                                }
                            }
                        }
                        ProcessorSink::File(file) => {
                            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
                            let at_boundary = match &event_indices {
                                None => true,
                                Some(indices) => indices.get(next_event) == Some(&b),
                            };
                            if at_boundary {
                                if let Some(handle) = open_handle.take() {
                                    file.close_event(handle, true)?;
                                }
                                open_handle = Some(file.create_event(occ.time)?);
                                if event_indices.is_some() {
                                    next_event += 1;
                                }
                            }
                            if let Some(handle) = open_handle {
                                file.add_data(handle, occ.channel, occ.module, payload, time64)?;
                                if b == total - 1 {
                                    file.close_event(handle, true)?;
                                    open_handle = None;
                                }
                            }
                        }
                        ProcessorSink::Discard => {}
                    }
                }

                if let Some(tx) = &self.status_tx {
                    let _ = tx.send(WorkerStatus::new(
                        self.worker_id,
                        module,
                        blts_read,
                        bytes_read,
                        self.state,
                    ));
                }
                self.state = ProcessorState::Idle;
            }
        }

        self.state = ProcessorState::Finished;
        spdlog::info!(
            "Worker {} finished after {} BLTs ({})",
            self.worker_id,
            blts_read,
            human_bytes::human_bytes(bytes_read as f64)
        );
        Ok(())
    }

    fn insert_failed(&mut self, e: super::error::SinkError) -> Result<(), ProcessorError> {
        spdlog::error!(
            "Buffer store insert error from worker {}: {}",
            self.worker_id,
            e
        );
        self.state = ProcessorState::Errored;
        Err(e.into())
    }

    /// Run the parser selected by `processing_mode`, consuming the buffers.
    fn parse(
        &self,
        module: i32,
        buffers: Vec<RawBlt>,
        event_indices: &mut Option<Vec<usize>>,
    ) -> Vec<Occurrence> {
        match self.options.processing_mode() {
            ProcessingMode::Raw => buffers
                .into_iter()
                .filter(|b| !b.words.is_empty())
                .map(|b| whole_buffer_occurrence(module, b))
                .collect(),
            ProcessingMode::Blocks => blt::split_blocks(buffers)
                .into_iter()
                .map(|b| whole_buffer_occurrence(module, b))
                .collect(),
            ProcessingMode::ChannelsZle => {
                let mut indices = Vec::new();
                let occurrences = blt::split_channels(buffers, true, Some(&mut indices));
                *event_indices = Some(indices);
                occurrences
            }
            ProcessingMode::ChannelsNoZle => {
                let mut indices = Vec::new();
                let occurrences = blt::split_channels(buffers, false, Some(&mut indices));
                *event_indices = Some(indices);
                occurrences
            }
            ProcessingMode::ChannelsNewFw => blt::split_channels_new_fw(buffers),
        }
    }
}

/// Raw and block modes keep whole triggers together under channel 0.
fn whole_buffer_occurrence(module: i32, buffer: RawBlt) -> Occurrence {
    Occurrence {
        module,
        channel: 0,
        time: blt::header_time_of(&buffer.words),
        payload: buffer.words,
    }
}

/// Spawn the configured number of workers over a shared digitizer pool.
pub fn run_readout(
    options: Arc<RunOptions>,
    digitizers: Arc<Vec<Arc<dyn Digitizer>>>,
    sink: ProcessorSink,
    status_tx: Option<Sender<WorkerStatus>>,
) -> Vec<JoinHandle<Result<(), ProcessorError>>> {
    (0..options.num_threads())
        .map(|worker_id| {
            let mut processor = DataProcessor::new(
                options.clone(),
                digitizers.clone(),
                sink.clone(),
                worker_id,
            );
            if let Some(tx) = &status_tx {
                processor = processor.with_status(tx.clone());
            }
            thread::spawn(move || processor.run())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{HEADER_MARK, TIME_MASK};
    use crate::digitizer::{BltRead, PlaybackDigitizer};
    use crate::sink::SinkTarget;
    use crate::store::{MemoryConnector, MemoryStore};

    fn options(directives: &[&str]) -> Arc<RunOptions> {
        let mut options = RunOptions::default();
        for line in directives {
            options.apply_line(line);
        }
        Arc::new(options)
    }

    fn store_sink(store: Arc<MemoryStore>) -> ProcessorSink {
        ProcessorSink::Store(Arc::new(DocumentSink::new(
            Arc::new(MemoryConnector::new(store)),
            SinkTarget {
                address: "mongodb://daq0:27017/".into(),
                database: "data".into(),
                collection: "run_0001".into(),
            },
        )))
    }

    /// Legacy trigger: header + equal channel shares, no ZLE.
    fn raw_trigger(mask: u32, time: u32, samples_per_channel: u32) -> Vec<u32> {
        let size = 4 + mask.count_ones() * samples_per_channel;
        let mut words = vec![
            (HEADER_MARK << 20) | size,
            mask,
            0,
            time & TIME_MASK,
        ];
        for i in 0..mask.count_ones() * samples_per_channel {
            words.push(0x0064_0064 + i);
        }
        words
    }

    fn single_read(module: i32, words: Vec<u32>, reset_epoch: u32, header_time: u32) -> BltRead {
        BltRead {
            buffers: vec![RawBlt::new(module, words)],
            reset_epoch,
            header_time,
        }
    }

    fn pool(reads: Vec<BltRead>, module: i32) -> Arc<Vec<Arc<dyn Digitizer>>> {
        Arc::new(vec![Arc::new(PlaybackDigitizer::new(module, reads)) as Arc<dyn Digitizer>])
    }

    #[test]
    fn two_channel_trigger_lands_as_two_records() {
        let store = MemoryStore::new();
        let options = options(&[
            "write_mode 2",
            "processing_mode 3",
            "compression 0",
            "lite_mode 0",
            "mongo_min_insert_size 1000",
        ]);
        let reads = vec![single_read(1, raw_trigger(0x03, 1000, 6), 0, 1000)];
        let mut processor = DataProcessor::new(options, pool(reads, 1), store_sink(store.clone()), 0);
        processor.run().unwrap();
        assert_eq!(processor.state(), ProcessorState::Finished);

        let docs = store.data_batches("data.run_0001");
        assert_eq!(docs.len(), 2);
        for (channel, doc) in docs.iter().enumerate() {
            assert_eq!(doc.module, 1);
            assert_eq!(doc.channel, channel as u8);
            assert_eq!(doc.time, 1000);
            assert_eq!(doc.endtime, 1000 + 24);
            assert_eq!(doc.data.as_ref().map(Vec::len), Some(24));
            assert!(doc.integral.is_none());
        }
    }

    #[test]
    fn batches_flush_at_threshold_and_at_the_blt_boundary() {
        let store = MemoryStore::new();
        let options = options(&[
            "write_mode 2",
            "processing_mode 3",
            "mongo_min_insert_size 100",
        ]);
        // 250 one-channel triggers in one buffer -> 250 records.
        let mut words = Vec::new();
        for i in 0..250 {
            words.extend(raw_trigger(0x01, i, 2));
        }
        let reads = vec![single_read(1, words, 0, 0)];
        let mut processor = DataProcessor::new(options, pool(reads, 1), store_sink(store.clone()), 0);
        processor.run().unwrap();

        let sizes: Vec<usize> = store.batch_log().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![101, 101, 48]);
    }

    #[test]
    fn rotation_flushes_homogeneous_epochs() {
        let store = MemoryStore::new();
        let options = options(&[
            "write_mode 2",
            "processing_mode 3",
            "rotating_collections 1",
            "mongo_min_insert_size 1000",
        ]);
        // Two triggers on one channel straddling a clock wrap.
        let mut words = raw_trigger(0x01, 0x7FFF_FF00, 2);
        words.extend(raw_trigger(0x01, 0x10, 2));
        let reads = vec![single_read(1, words, 0, 0x7FFF_FF00)];
        let mut processor = DataProcessor::new(options, pool(reads, 1), store_sink(store.clone()), 0);
        processor.run().unwrap();

        // Epoch 0 batch went to cycle 0, epoch 1 batch to cycle 1.
        assert_eq!(store.data_batches("data.run_0001_0").len(), 1);
        assert_eq!(store.data_batches("data.run_0001_1").len(), 1);
        let wrapped = &store.data_batches("data.run_0001_1")[0];
        assert_eq!(wrapped.time, (1u64 << 31) + 0x10);
    }

    #[test]
    fn insert_failure_ends_the_run_errored() {
        let store = MemoryStore::new();
        let options = options(&[
            "write_mode 2",
            "processing_mode 3",
            "mongo_min_insert_size 0",
        ]);
        let reads = vec![
            single_read(1, raw_trigger(0x01, 5, 2), 0, 5),
            single_read(1, raw_trigger(0x01, 6, 2), 0, 6),
        ];
        let sink = store_sink(store.clone());
        // Registration and the first insert succeed, the second insert fails.
        store.set_fail_inserts_after(1);
        let mut processor = DataProcessor::new(options, pool(reads, 1), sink, 0);
        assert!(processor.run().is_err());
        assert_eq!(processor.state(), ProcessorState::Errored);
        assert_eq!(store.batch_log().len(), 1);
    }

    #[test]
    fn lite_mode_omits_payload_and_integral_is_attached() {
        let store = MemoryStore::new();
        let options = options(&[
            "write_mode 2",
            "processing_mode 3",
            "lite_mode 1",
            "occurrence_integral 2",
            "mongo_min_insert_size 1000",
        ]);
        let reads = vec![single_read(4, raw_trigger(0x01, 50, 4), 0, 50)];
        let mut processor = DataProcessor::new(options, pool(reads, 4), store_sink(store.clone()), 0);
        processor.run().unwrap();
        let docs = store.data_batches("data.run_0001");
        assert_eq!(docs.len(), 1);
        assert!(docs[0].data.is_none());
        assert!(docs[0].integral.is_some());
    }

    #[test]
    fn snappy_payloads_shrink_and_round_trip() {
        let store = MemoryStore::new();
        let options = options(&[
            "write_mode 2",
            "processing_mode 3",
            "compression 1",
            "mongo_min_insert_size 1000",
        ]);
        // Flat baseline waveform, so the payload is highly compressible.
        let mut words = vec![(HEADER_MARK << 20) | (4 + 512), 0x01, 0, 10];
        words.extend(std::iter::repeat(0x0064_0064).take(512));
        let reads = vec![single_read(2, words, 0, 10)];
        let mut processor = DataProcessor::new(options, pool(reads, 2), store_sink(store.clone()), 0);
        processor.run().unwrap();
        let docs = store.data_batches("data.run_0001");
        let zipped = docs[0].data.as_ref().unwrap();
        assert!(zipped.len() < 512 * 4);
        let unzipped = crate::compression::decompress_payload(zipped).unwrap();
        assert_eq!(unzipped.len(), 512 * 4);
        // endtime tracks the stored (compressed) size
        assert_eq!(docs[0].endtime, docs[0].time + zipped.len() as u64);
    }

    #[test]
    fn file_mode_groups_occurrences_by_trigger() {
        let prefix = std::env::temp_dir()
            .join("tpc_daq_processor_file_mode")
            .to_string_lossy()
            .into_owned();
        let options = options(&["write_mode 1", "processing_mode 3"]);
        let mut words = raw_trigger(0x03, 100, 2);
        words.extend(raw_trigger(0x01, 200, 2));
        let reads = vec![single_read(1, words, 0, 100)];
        let sink = ProcessorSink::File(Arc::new(Mutex::new(
            FileSink::new(&prefix, -1).unwrap(),
        )));
        let mut processor = DataProcessor::new(options, pool(reads, 1), sink, 0);
        processor.run().unwrap();

        let bytes = std::fs::read(format!("{prefix}_{:06}.pb", 0)).unwrap();
        let events = crate::file_sink::decode_events(&bytes).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].occurrences.len(), 2);
        assert_eq!(events[0].time, 100);
        assert_eq!(events[1].occurrences.len(), 1);
        assert_eq!(events[1].time, 200);
        std::fs::remove_file(format!("{prefix}_{:06}.pb", 0)).ok();
    }

    #[test]
    fn discard_sink_still_drains_everything() {
        let options = options(&["write_mode 0", "processing_mode 3"]);
        let digi = Arc::new(PlaybackDigitizer::new(
            1,
            vec![single_read(1, raw_trigger(0x0F, 1, 8), 0, 1)],
        ));
        let pool: Arc<Vec<Arc<dyn Digitizer>>> = Arc::new(vec![digi.clone() as _]);
        let mut processor = DataProcessor::new(options, pool, ProcessorSink::Discard, 0);
        processor.run().unwrap();
        assert!(!digi.active());
        assert_eq!(processor.state(), ProcessorState::Finished);
    }
}

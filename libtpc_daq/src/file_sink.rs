//! Protocol-buffer file output, the alternative to the document sink.
//!
//! Events are built up occurrence by occurrence through an integer handle
//! and written as length-prefixed protobuf messages (4-byte little-endian
//! length, then the encoded event). Files roll over after a configured
//! number of events.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use prost::Message;

use super::error::FileSinkError;

/// One waveform fragment inside a stored event.
#[derive(Clone, PartialEq, Message)]
pub struct PbOccurrence {
    #[prost(int32, tag = "1")]
    pub module: i32,
    #[prost(uint32, tag = "2")]
    pub channel: u32,
    #[prost(uint64, tag = "3")]
    pub time: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

/// One trigger worth of occurrences.
#[derive(Clone, PartialEq, Message)]
pub struct PbEvent {
    /// 31-bit trigger time of the event header.
    #[prost(uint32, tag = "1")]
    pub time: u32,
    #[prost(message, repeated, tag = "2")]
    pub occurrences: Vec<PbOccurrence>,
}

/// Writes events to a rolling series of `<path>_NNNNNN.pb` files.
pub struct FileSink {
    path_prefix: String,
    events_per_file: i32,
    writer: BufWriter<File>,
    file_index: u32,
    events_in_file: i32,
    open_event: Option<(i32, PbEvent)>,
    next_handle: i32,
}

impl FileSink {
    /// Open the first output file. `events_per_file < 1` disables rolling.
    pub fn new(path_prefix: &str, events_per_file: i32) -> Result<Self, FileSinkError> {
        let writer = Self::open_file(path_prefix, 0)?;
        Ok(Self {
            path_prefix: path_prefix.to_string(),
            events_per_file,
            writer,
            file_index: 0,
            events_in_file: 0,
            open_event: None,
            next_handle: 0,
        })
    }

    fn open_file(prefix: &str, index: u32) -> Result<BufWriter<File>, FileSinkError> {
        let path = PathBuf::from(format!("{prefix}_{index:06}.pb"));
        Ok(BufWriter::new(File::create(path)?))
    }

    /// Start a new event at the given header time.
    ///
    /// Only one event can be open at a time; opening a new one while another
    /// is open implicitly closes the old one.
    pub fn create_event(&mut self, time: u32) -> Result<i32, FileSinkError> {
        if let Some((handle, _)) = self.open_event {
            self.close_event(handle, false)?;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open_event = Some((
            handle,
            PbEvent {
                time,
                occurrences: Vec::new(),
            },
        ));
        Ok(handle)
    }

    /// Append one occurrence to the open event.
    pub fn add_data(
        &mut self,
        handle: i32,
        channel: u8,
        module: i32,
        payload: Vec<u8>,
        time64: u64,
    ) -> Result<(), FileSinkError> {
        match self.open_event.as_mut() {
            Some((open, event)) if *open == handle => {
                event.occurrences.push(PbOccurrence {
                    module,
                    channel: u32::from(channel),
                    time: time64,
                    payload,
                });
                Ok(())
            }
            _ => Err(FileSinkError::BadHandle(handle)),
        }
    }

    /// Write the event out. `finalize` also flushes the file.
    pub fn close_event(&mut self, handle: i32, finalize: bool) -> Result<(), FileSinkError> {
        let (open, event) = self
            .open_event
            .take()
            .ok_or(FileSinkError::BadHandle(handle))?;
        if open != handle {
            self.open_event = Some((open, event));
            return Err(FileSinkError::BadHandle(handle));
        }
        let encoded = event.encode_to_vec();
        self.writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        self.writer.write_all(&encoded)?;
        self.events_in_file += 1;
        if self.events_per_file > 0 && self.events_in_file >= self.events_per_file {
            self.roll()?;
        }
        if finalize {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<(), FileSinkError> {
        self.writer.flush()?;
        self.file_index += 1;
        self.writer = Self::open_file(&self.path_prefix, self.file_index)?;
        self.events_in_file = 0;
        Ok(())
    }

    /// Number of the file currently being written.
    pub fn file_index(&self) -> u32 {
        self.file_index
    }
}

/// Decode a length-prefixed event stream, the reader-side counterpart.
pub fn decode_events(bytes: &[u8]) -> Result<Vec<PbEvent>, prost::DecodeError> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            break; // trailing partial message
        }
        events.push(PbEvent::decode(&bytes[offset..offset + len])?);
        offset += len;
    }
    Ok(events)
}

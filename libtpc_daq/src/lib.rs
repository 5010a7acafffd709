//! # tpc_daq
//!
//! tpc_daq is the data-acquisition control and event-processing core of a
//! TPC readout platform, written in Rust. A master coordinator directs a
//! fleet of slave readers, each owning one or more waveform digitizers.
//! Slaves stream block transfers (BLTs) off the hardware, split them into
//! per-channel occurrences, lift the 31-bit trigger times onto a monotonic
//! 64-bit timeline, optionally compress and integrate the waveforms, and
//! batch the records into a sharded document store or into protobuf files.
//! The master resolves operator commands, assembles and maintains the run
//! metadata document, and provisions (possibly rotating, possibly sharded)
//! destination collections with explicit pre-splits and chunk migrations.
//!
//! ## Layout
//!
//! The slave-side pipeline runs `Hardware -> blt -> timeline -> processor ->
//! sink -> store`; the master side is `orchestrator` + `provision`. The
//! hardware bus driver and the store wire client are external collaborators,
//! represented here by the [`digitizer::Digitizer`], [`store::DocumentStore`]
//! and [`store::BufferStore`] traits. [`store::MemoryStore`] implements the
//! store traits in memory for tests and offline work.
//!
//! ## Configuration
//!
//! Runs are configured through a line-oriented parameter file (`key value…`,
//! `#` comments, unknown keys ignored) or through run-mode documents stored
//! in the monitor database. Run modes may inherit from a parent mode; fields
//! of the child dominate. See [`options::RunOptions`] for the directive set.
//!
//! ## Output
//!
//! With `write_mode 2` records land in `<database>.<run name>` (suffixed
//! `_<cycle>` under rotating collections); each record carries the module,
//! channel, 64-bit time window and the (optionally snappy-compressed)
//! payload. With `write_mode 1` events are written to a rolling series of
//! length-prefixed protobuf files instead. `write_mode 0` parses and drops,
//! which is useful for baseline runs.

pub mod blt;
pub mod compression;
pub mod constants;
pub mod digitizer;
pub mod error;
pub mod file_sink;
pub mod options;
pub mod orchestrator;
pub mod processor;
pub mod provision;
pub mod sink;
pub mod store;
pub mod timeline;
pub mod waveform;
pub mod worker_status;

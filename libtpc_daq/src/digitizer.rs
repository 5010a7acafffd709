//! The seam between the processing pipeline and the hardware driver.
//!
//! The VME/optical-link library lives outside this crate; all the pipeline
//! needs is the block-transfer contract below. A playback implementation is
//! provided for baseline runs and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::blt::RawBlt;

/// One block transfer together with the reader's clock snapshot at read time.
#[derive(Debug, Clone, Default)]
pub struct BltRead {
    pub buffers: Vec<RawBlt>,
    /// How many times the 31-bit clock had wrapped when the BLT was read.
    pub reset_epoch: u32,
    /// Trigger time of the first header, taken at read time.
    pub header_time: u32,
}

/// A digitizer as seen by the data processors.
///
/// Workers share a pool of these. `request_data_lock` must not block; a
/// worker that loses the race simply moves on to the next module.
/// `read_blt` owns the lock on entry and releases it before returning.
pub trait Digitizer: Send + Sync {
    /// Module serial number, the `module` field of every record downstream.
    fn id(&self) -> i32;

    /// False once the board is disarmed and its buffers are drained.
    fn active(&self) -> bool;

    /// Try to claim the module for one read. Non-blocking.
    fn request_data_lock(&self) -> bool;

    /// Drain the board's output buffer. Releases the data lock.
    fn read_blt(&self) -> BltRead;
}

/// A scripted digitizer replaying canned BLTs.
///
/// Stands in for real hardware in baseline mode and in the test suites: it
/// honors the same lock discipline and goes inactive once drained.
pub struct PlaybackDigitizer {
    id: i32,
    queue: Mutex<VecDeque<BltRead>>,
    locked: AtomicBool,
}

impl PlaybackDigitizer {
    pub fn new(id: i32, reads: Vec<BltRead>) -> Self {
        Self {
            id,
            queue: Mutex::new(reads.into()),
            locked: AtomicBool::new(false),
        }
    }
}

impl Digitizer for PlaybackDigitizer {
    fn id(&self) -> i32 {
        self.id
    }

    fn active(&self) -> bool {
        match self.queue.lock() {
            Ok(queue) => !queue.is_empty(),
            Err(_) => false,
        }
    }

    fn request_data_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn read_blt(&self) -> BltRead {
        let read = match self.queue.lock() {
            Ok(mut queue) => queue.pop_front().unwrap_or_default(),
            Err(_) => BltRead::default(),
        };
        self.locked.store(false, Ordering::Release);
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_drains_and_goes_inactive() {
        let digi = PlaybackDigitizer::new(
            4,
            vec![BltRead {
                buffers: vec![RawBlt::new(4, vec![1, 2, 3])],
                reset_epoch: 2,
                header_time: 99,
            }],
        );
        assert!(digi.active());
        assert!(digi.request_data_lock());
        // Second claim must fail while the lock is held.
        assert!(!digi.request_data_lock());
        let read = digi.read_blt();
        assert_eq!(read.reset_epoch, 2);
        assert_eq!(read.buffers.len(), 1);
        // read_blt released the lock.
        assert!(digi.request_data_lock());
        assert!(!digi.active());
    }
}

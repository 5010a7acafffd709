use super::processor::ProcessorState;

/// Progress snapshot sent by a processor worker after each BLT.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub module: i32,
    pub blts_read: u64,
    pub bytes_read: u64,
    pub state: ProcessorState,
}

impl WorkerStatus {
    pub fn new(
        worker_id: usize,
        module: i32,
        blts_read: u64,
        bytes_read: u64,
        state: ProcessorState,
    ) -> Self {
        Self {
            worker_id,
            module,
            blts_read,
            bytes_read,
            state,
        }
    }
}

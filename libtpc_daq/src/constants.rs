//! Bit-level constants of the digitizer data format and the DAQ clock.

/// Word used as filler between events in a BLT buffer.
pub const FILLER_WORD: u32 = 0xFFFF_FFFF;
/// Value of the top 12 bits of an event header word.
pub const HEADER_MARK: u32 = 0xA00;
/// Mask selecting the event size field of a legacy header word.
pub const HEADER_SIZE_MASK: u32 = 0x00FF_FFFF;
/// Mask selecting the block size field of a header word (words, pre-scaling).
pub const BLOCK_SIZE_MASK: u32 = 0xFFFF;
/// Mask selecting the 31-bit trigger time counter.
pub const TIME_MASK: u32 = 0x7FFF_FFFF;
/// Channel mask bits of header word 1.
pub const CHANNEL_MASK: u32 = 0xFF;
/// Board-fail bit of header word 1 (new firmware only).
pub const BOARD_FAIL_BIT: u32 = 0x0400_0000;
/// Control-word nibble marking good data in a ZLE stream.
pub const ZLE_GOOD_NIBBLE: u32 = 0x8;
/// Mask selecting the word count of a ZLE control word.
pub const ZLE_SIZE_MASK: u32 = 0x0FFF_FFFF;
/// Number of channels per digitizer.
pub const NUM_CHANNELS: usize = 8;
/// Words in an event header.
pub const HEADER_WORDS: usize = 4;
/// Width of the digitizer trigger time counter in bits.
pub const TIME_BITS: u32 = 31;
/// Two timestamps further apart than this are assumed to straddle a clock reset.
pub const RESET_GAP_TICKS: i64 = 1_000_000_000;
/// Mask selecting one 14-bit ADC sample (two samples are packed per word).
pub const SAMPLE_MASK: u32 = 0x3FFF;
/// Seconds per wrap of the 31-bit trigger time counter.
pub const CLOCK_WRAP_SECONDS: f64 = 21.0;

//! Splitting raw BLT buffers into per-channel occurrences.
//!
//! A block transfer returns one or more triggers back to back, each starting
//! with a four word header (`word >> 20 == 0xA00`), optionally padded with
//! `0xFFFFFFFF` filler. Two firmware generations are handled: the legacy
//! format where one header time covers every channel (with or without ZLE),
//! and the new firmware where each channel block carries its own size and
//! trigger time. All splitters consume their input buffers.

use super::constants::*;

/// One raw block transfer as read off a digitizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlt {
    pub module: i32,
    pub words: Vec<u32>,
}

impl RawBlt {
    pub fn new(module: i32, words: Vec<u32>) -> Self {
        Self { module, words }
    }

    /// Buffer size in bytes. Always a multiple of four.
    pub fn size_bytes(&self) -> u32 {
        (self.words.len() * 4) as u32
    }
}

/// A contiguous waveform fragment from a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub module: i32,
    pub channel: u8,
    /// 31-bit trigger time of the first sample.
    pub time: u32,
    pub payload: Vec<u32>,
}

impl Occurrence {
    /// Payload as little-endian bytes, the layout the sinks store.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() * 4);
        for word in &self.payload {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

/// Pull the trigger time out of the first header of a buffer.
///
/// Used by the raw and block processing modes, which keep whole triggers
/// together instead of splitting channels.
pub fn header_time_of(words: &[u32]) -> u32 {
    let mut pnt = 0;
    while pnt < words.len() && words[pnt] == FILLER_WORD {
        pnt += 1;
    }
    if pnt + 3 < words.len() && words[pnt] >> 20 == HEADER_MARK {
        return words[pnt + 3] & TIME_MASK;
    }
    0
}

/// Break BLTs into individual triggers by locating headers.
///
/// Each output buffer is one trigger, header included. Empty input buffers
/// are rejected and filler words are skipped.
pub fn split_blocks(blts: Vec<RawBlt>) -> Vec<RawBlt> {
    let mut out = Vec::new();
    for blt in blts {
        if blt.words.is_empty() {
            continue;
        }
        let words = &blt.words;
        let mut idx = 0;
        while idx < words.len() {
            if words[idx] == FILLER_WORD || words[idx] >> 20 != HEADER_MARK {
                idx += 1;
                continue;
            }
            let size = ((words[idx] & BLOCK_SIZE_MASK) * 4) as usize;
            if size == 0 || idx + size > words.len() {
                spdlog::warn!(
                    "Trigger at word {} of module {} claims {} words but only {} remain",
                    idx,
                    blt.module,
                    size,
                    words.len() - idx
                );
                break;
            }
            out.push(RawBlt::new(blt.module, words[idx..idx + size].to_vec()));
            idx += size;
        }
    }
    out
}

/// Split legacy-firmware BLTs into per-channel occurrences.
///
/// With `zle` the channel data is run-length encoded: control words with a
/// top nibble of `0x8` announce `word & 0x0FFFFFFF` good words, anything else
/// stands for `2 * word` skipped samples. Without ZLE every unmasked channel
/// carries an equal share of the event body.
///
/// `event_indices`, when supplied, receives the index of the first output
/// occurrence of every trigger so the file sink can group them into events.
pub fn split_channels(
    blts: Vec<RawBlt>,
    zle: bool,
    mut event_indices: Option<&mut Vec<usize>>,
) -> Vec<Occurrence> {
    let mut out: Vec<Occurrence> = Vec::new();
    for blt in blts {
        if blt.words.is_empty() {
            continue;
        }
        let words = &blt.words;
        let mut idx = 0;
        'trigger: while idx < words.len() {
            if words[idx] == FILLER_WORD || words[idx] >> 20 != HEADER_MARK {
                idx += 1;
                continue;
            }
            if idx + HEADER_WORDS > words.len() {
                spdlog::warn!("Truncated header at end of BLT from module {}", blt.module);
                break;
            }
            let mask = words[idx + 1] & CHANNEL_MASK;
            let mut channel_size = 0u32;
            if !zle {
                // Every set channel gets an equal share of the event body.
                let size_field = words[idx] & HEADER_SIZE_MASK;
                if mask.count_ones() == 0 || size_field < 4 {
                    idx += 1;
                    continue;
                }
                channel_size = (size_field - 4) / mask.count_ones();
            }
            if let Some(indices) = event_indices.as_deref_mut() {
                indices.push(out.len());
            }
            let header_time = words[idx + 3] & TIME_MASK;
            idx += HEADER_WORDS;

            for channel in 0..NUM_CHANNELS as u8 {
                if mask >> channel & 1 == 0 {
                    continue;
                }
                if zle {
                    if idx >= words.len() {
                        spdlog::warn!(
                            "Channel {} size word missing in BLT from module {}",
                            channel,
                            blt.module
                        );
                        break 'trigger;
                    }
                    channel_size = words[idx];
                    idx += 1;
                }

                // Samples skipped so far, for timing the next fragment.
                let mut sample_cnt = 0u32;
                let mut word_cnt: u32 = if zle { 1 } else { 0 };
                while word_cnt < channel_size {
                    if zle && idx >= words.len() {
                        spdlog::warn!(
                            "Channel {} data ends before its declared size in BLT from module {}",
                            channel,
                            blt.module
                        );
                        break 'trigger;
                    }
                    if zle && words[idx] >> 28 != ZLE_GOOD_NIBBLE {
                        sample_cnt = sample_cnt.wrapping_add(words[idx].wrapping_mul(2));
                        idx += 1;
                        word_cnt += 1;
                        continue;
                    }
                    let good = if zle {
                        let good = (words[idx] & ZLE_SIZE_MASK) as usize;
                        idx += 1;
                        word_cnt += 1;
                        good
                    } else {
                        channel_size as usize
                    };
                    if idx + good > words.len() {
                        spdlog::warn!(
                            "Channel {} fragment of {} words runs past the BLT from module {}",
                            channel,
                            good,
                            blt.module
                        );
                        break 'trigger;
                    }
                    out.push(Occurrence {
                        module: blt.module,
                        channel,
                        time: header_time.wrapping_add(sample_cnt),
                        payload: words[idx..idx + good].to_vec(),
                    });
                    idx += good;
                    word_cnt += good as u32;
                    sample_cnt += 2 * good as u32;
                }
            }
        }
    }
    out
}

/// Split new-firmware BLTs into per-channel occurrences.
///
/// Each channel block is `size, time, data…` where `size` counts the two
/// block header words. A block that claims more words than the buffer holds
/// is dumped to the log and the rest of that BLT is dropped; the run goes on.
pub fn split_channels_new_fw(blts: Vec<RawBlt>) -> Vec<Occurrence> {
    let mut out = Vec::new();
    for blt in blts {
        if blt.words.is_empty() {
            continue;
        }
        let words = &blt.words;
        let size_words = words.len();
        let mut idx = 0;
        'trigger: while idx < size_words {
            if words[idx] == FILLER_WORD || words[idx] >> 20 != HEADER_MARK {
                idx += 1;
                continue;
            }
            if idx + HEADER_WORDS > size_words {
                spdlog::warn!("Truncated header at end of BLT from module {}", blt.module);
                break;
            }
            let mask = words[idx + 1] & CHANNEL_MASK;
            if words[idx + 1] & BOARD_FAIL_BIT != 0 {
                // PLL loss or similar; the operator decides what to do with it.
                spdlog::error!("Board fail flag set on module {}", blt.module);
            }
            idx += HEADER_WORDS;

            for channel in 0..NUM_CHANNELS as u8 {
                if mask >> channel & 1 == 0 {
                    continue;
                }
                if idx + 2 > size_words {
                    spdlog::warn!(
                        "Channel {} block header missing in BLT from module {}",
                        channel,
                        blt.module
                    );
                    break 'trigger;
                }
                let channel_size = words[idx] as usize;
                let channel_time = words[idx + 1] & TIME_MASK;
                idx += 2;
                if channel_size < 2 || idx + channel_size - 2 > size_words {
                    spdlog::error!(
                        "Bad channel block: index {} channelSize {} channel {} channelTime {} \
                         from max {} words. Dump: {}",
                        idx,
                        channel_size,
                        channel,
                        channel_time,
                        size_words,
                        dump_words(&words[..idx])
                    );
                    break 'trigger;
                }
                out.push(Occurrence {
                    module: blt.module,
                    channel,
                    time: channel_time,
                    payload: words[idx..idx + channel_size - 2].to_vec(),
                });
                idx += channel_size - 2;
            }
        }
    }
    out
}

fn dump_words(words: &[u32]) -> String {
    words
        .iter()
        .map(|w| format!("{w:08x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a legacy header for `size_words` total words and a channel mask.
    fn header(size_words: u32, mask: u32, time: u32) -> [u32; 4] {
        [
            (HEADER_MARK << 20) | (size_words & HEADER_SIZE_MASK),
            mask,
            0,
            time & TIME_MASK,
        ]
    }

    fn raw_event(mask: u32, time: u32, samples_per_channel: usize) -> Vec<u32> {
        let n_chan = mask.count_ones() as usize;
        let size = 4 + n_chan * samples_per_channel;
        let mut words: Vec<u32> = header(size as u32, mask, time).to_vec();
        for c in 0..n_chan {
            for s in 0..samples_per_channel {
                words.push((c * 1000 + s) as u32);
            }
        }
        words
    }

    /// A trigger for the block splitter, whose header size field counts
    /// four-word units.
    fn block_event(total_words: u32, time: u32) -> Vec<u32> {
        let mut words = vec![(HEADER_MARK << 20) | (total_words / 4), 0x01, 0, time];
        words.resize(total_words as usize, 0xBEEF);
        words
    }

    #[test]
    fn split_blocks_finds_triggers_and_skips_filler() {
        let mut words = vec![FILLER_WORD, FILLER_WORD];
        words.extend(block_event(8, 42));
        words.push(FILLER_WORD);
        words.extend(block_event(12, 43));
        let blocks = split_blocks(vec![RawBlt::new(5, words)]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].words.len(), 8);
        assert_eq!(blocks[1].words.len(), 12);
        assert_eq!(header_time_of(&blocks[0].words), 42);
        assert_eq!(header_time_of(&blocks[1].words), 43);
        assert!(blocks.iter().all(|b| b.module == 5));
    }

    #[test]
    fn split_blocks_drops_a_trigger_running_past_the_buffer() {
        let mut words = block_event(8, 7);
        words.truncate(6);
        assert!(split_blocks(vec![RawBlt::new(0, words)]).is_empty());
    }

    #[test]
    fn split_blocks_rejects_empty_buffers() {
        assert!(split_blocks(vec![RawBlt::new(0, Vec::new())]).is_empty());
    }

    #[test]
    fn split_channels_raw_shares_body_equally() {
        let blt = RawBlt::new(7, raw_event(0x03, 1000, 6));
        let occurrences = split_channels(vec![blt], false, None);
        assert_eq!(occurrences.len(), 2);
        for (c, occ) in occurrences.iter().enumerate() {
            assert_eq!(occ.module, 7);
            assert_eq!(occ.channel, c as u8);
            assert_eq!(occ.time, 1000);
            assert_eq!(occ.payload.len(), 6);
            assert_eq!(occ.payload_bytes().len(), 24);
        }
    }

    #[test]
    fn split_channels_raw_empty_mask_is_skipped() {
        let blt = RawBlt::new(0, header(4, 0x00, 99).to_vec());
        assert!(split_channels(vec![blt], false, None).is_empty());
    }

    #[test]
    fn split_channels_zle_expands_skips_into_sample_offsets() {
        // One channel: size word, skip control (3 -> 6 samples), good control
        // with 2 words, two data words.
        let mut words = header(0, 0x01, 500).to_vec();
        words.push(5); // channel size in words, inclusive of control words
        words.push(3); // not 0x8 nibble: skip 2*3 samples
        words.push(0x8000_0002); // two good words follow
        words.push(0xAAAA);
        words.push(0xBBBB);
        let occurrences = split_channels(vec![RawBlt::new(1, words)], true, None);
        assert_eq!(occurrences.len(), 1);
        assert_eq!(occurrences[0].time, 506);
        assert_eq!(occurrences[0].payload, vec![0xAAAA, 0xBBBB]);
    }

    #[test]
    fn split_channels_zle_multiple_fragments_in_one_channel() {
        let mut words = header(0, 0x02, 100).to_vec();
        words.push(7); // size word
        words.push(0x8000_0001); // one good word at t=100
        words.push(0x1);
        words.push(4); // skip 8 samples
        words.push(0x8000_0002); // two good words at t=100+2+8
        words.push(0x2);
        words.push(0x3);
        let occurrences = split_channels(vec![RawBlt::new(1, words)], true, None);
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0].channel, 1);
        assert_eq!(occurrences[0].time, 100);
        assert_eq!(occurrences[1].time, 110);
        assert_eq!(occurrences[1].payload, vec![0x2, 0x3]);
    }

    #[test]
    fn event_indices_mark_trigger_boundaries() {
        let mut words = raw_event(0x03, 10, 4);
        words.extend(raw_event(0x01, 11, 4));
        let mut indices = Vec::new();
        let occurrences = split_channels(vec![RawBlt::new(0, words)], false, Some(&mut indices));
        assert_eq!(occurrences.len(), 3);
        assert_eq!(indices, vec![0, 2]);
    }

    fn new_fw_event(channels: &[(u8, u32, &[u32])]) -> Vec<u32> {
        let mask = channels.iter().fold(0u32, |m, (c, _, _)| m | 1 << c);
        let mut words = vec![(HEADER_MARK << 20) | 0, mask, 0, 0];
        for (_, time, payload) in channels {
            words.push(payload.len() as u32 + 2);
            words.push(*time);
            words.extend_from_slice(payload);
        }
        words
    }

    #[test]
    fn split_new_fw_reads_per_channel_times() {
        let words = new_fw_event(&[(0, 1234, &[1, 2, 3]), (4, 5678, &[9, 8])]);
        let occurrences = split_channels_new_fw(vec![RawBlt::new(3, words)]);
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0].channel, 0);
        assert_eq!(occurrences[0].time, 1234);
        assert_eq!(occurrences[0].payload, vec![1, 2, 3]);
        assert_eq!(occurrences[1].channel, 4);
        assert_eq!(occurrences[1].time, 5678);
    }

    #[test]
    fn split_new_fw_drops_out_of_bounds_blocks_without_panicking() {
        let mut words = vec![(HEADER_MARK << 20) | 0, 0x01, 0, 0];
        words.push(100); // claims 98 payload words, buffer has 1
        words.push(77);
        words.push(0xDEAD);
        let occurrences = split_channels_new_fw(vec![RawBlt::new(9, words)]);
        assert!(occurrences.is_empty());
    }

    #[test]
    fn round_trip_preserves_per_channel_payloads() {
        // Random-ish masks and sizes; reassembling payload words must return
        // exactly the body that went in.
        for (mask, samples) in [(0x03u32, 6usize), (0xFF, 16), (0x15, 33)] {
            let body: Vec<u32> = (0..mask.count_ones() as usize * samples)
                .map(|v| v as u32)
                .collect();
            let mut words = header(4 + body.len() as u32, mask, 77).to_vec();
            words.extend_from_slice(&body);
            let occurrences = split_channels(vec![RawBlt::new(0, words)], false, None);
            let rebuilt: Vec<u32> = occurrences.iter().flat_map(|o| o.payload.clone()).collect();
            assert_eq!(rebuilt, body);
        }
    }
}

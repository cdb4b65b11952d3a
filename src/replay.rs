/*! Listfile replay.

Reads an archive's byte stream in chunks and demultiplexes it into
per-crate `ReadoutData` messages, reproducing what the readout producers
emitted during the live run. The crate owning each part is recovered from
the data itself: USB frame headers carry the controller id in their `ctrl`
field, ETH packets in their first header word.

Contiguous parts for the same crate are coalesced into one message before
being handed to that crate's pipeline.
*/
use log::{debug, info, trace, warn};

use crate::eth;
use crate::frame;
use crate::listfile::ReadHandle;
use crate::message;
use crate::pipeline::{JobContext, JobHandle, LoopResult, OutputWriter, send_shutdown, start_job};
use crate::transport::ConnectionType;

/// Chunk size of reads from the archive.
pub const READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Payload bytes per output message before a flush.
const MESSAGE_RESERVE: usize = 1024 * 1024;

/// One part of the replay stream: a whole USB frame or a whole ETH packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartInfo {
    pub crate_id: u8,
    pub part_words: usize,
    pub buffer_type: ConnectionType,
}

/// Classify the part starting at `words[0]`.
///
/// Returns `None` when the words cannot be classified yet, i.e. a possible
/// ETH header pair whose second word is not in the buffer.
#[must_use]
pub fn extract_part_info(words: &[u32]) -> Option<PartInfo> {
    let first = *words.first()?;

    if frame::is_known_frame_header(first) {
        let info = frame::extract_frame_info(first);
        return Some(PartInfo {
            crate_id: info.ctrl,
            part_words: usize::from(info.len) + 1,
            buffer_type: ConnectionType::Usb,
        });
    }

    if words.len() < 2 {
        return None;
    }

    let hdr = eth::PayloadHeader {
        header0: first,
        header1: words[1],
    };
    Some(PartInfo {
        crate_id: hdr.controller_id(),
        part_words: eth::HEADER_WORDS + usize::from(hdr.data_word_count()),
        buffer_type: ConnectionType::Eth,
    })
}

struct Output {
    msg: Option<Vec<u8>>,
    message_number: u32,
}

/// Per-crate outputs of a replay. Index is the crate id; crates without a
/// writer are skipped.
pub struct ReplayOutputs {
    writers: Vec<Option<Box<dyn OutputWriter>>>,
    outputs: Vec<Output>,
}

impl ReplayOutputs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writers: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn set_writer(&mut self, crate_id: u8, writer: Box<dyn OutputWriter>) {
        let index = usize::from(crate_id);
        while self.writers.len() <= index {
            self.writers.push(None);
            self.outputs.push(Output {
                msg: None,
                message_number: 0,
            });
        }
        self.writers[index] = Some(writer);
    }

    fn flush(&mut self, crate_id: usize) {
        let Some(writer) = self.writers.get(crate_id).and_then(Option::as_ref) else {
            return;
        };
        if let Some(msg) = self.outputs[crate_id].msg.take() {
            trace!(
                "replay: crate{crate_id}: flushing message #{} of {} bytes",
                self.outputs[crate_id].message_number,
                msg.len()
            );
            if writer.write_message(msg).is_err() {
                warn!("replay: crate{crate_id}: output link closed");
            }
        }
    }

    fn append(&mut self, crate_id: usize, buffer_type: ConnectionType, bytes: &[u8]) {
        if self.writers.get(crate_id).and_then(Option::as_ref).is_none() {
            return;
        }

        let needs_new = match &self.outputs[crate_id].msg {
            None => true,
            Some(msg) => msg.len() + bytes.len() > message::READOUT_DATA_HEADER_SIZE + MESSAGE_RESERVE,
        };

        if needs_new {
            self.flush(crate_id);
            let output = &mut self.outputs[crate_id];
            output.message_number = output.message_number.wrapping_add(1);
            output.msg = Some(message::new_readout_data_message(
                crate_id as u8,
                output.message_number,
                buffer_type,
                MESSAGE_RESERVE,
            ));
        }

        self.outputs[crate_id].msg.as_mut().unwrap().extend_from_slice(bytes);
    }

    fn finish(&mut self) {
        for crate_id in 0..self.writers.len() {
            self.flush(crate_id);
            if let Some(writer) = self.writers[crate_id].as_ref() {
                send_shutdown(writer.as_ref());
            }
        }
    }
}

impl Default for ReplayOutputs {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream a listfile through the per-crate outputs until exhausted or told
/// to quit.
pub fn replay_loop(context: &JobContext, reader: &mut dyn ReadHandle, outputs: &mut ReplayOutputs) -> LoopResult {
    let mut result = LoopResult::ok();
    // Carry buffer: unconsumed bytes from the previous chunk stay at the
    // front.
    let mut buffer: Vec<u8> = Vec::with_capacity(2 * READ_CHUNK_SIZE);
    let mut total_bytes = 0u64;

    info!("{}: entering replay loop", context.name());

    'outer: while !context.should_quit() {
        let old_len = buffer.len();
        buffer.resize(old_len + READ_CHUNK_SIZE, 0);
        let n = match reader.read(&mut buffer[old_len..]) {
            Ok(n) => n,
            Err(e) => {
                buffer.truncate(old_len);
                result.error = Some(e);
                break;
            }
        };
        buffer.truncate(old_len + n);
        total_bytes += n as u64;

        let at_eof = n == 0;

        let word_count = buffer.len() / 4;
        let words: Vec<u32> = buffer[..word_count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        // Identify whole parts, coalescing runs of the same crate.
        let mut pos = 0usize;
        let mut run_start = 0usize;
        let mut run: Option<PartInfo> = None;

        loop {
            let part = extract_part_info(&words[pos..]);

            let complete = match part {
                Some(p) => pos + p.part_words <= word_count,
                None => false,
            };

            if !complete {
                if let Some(r) = run {
                    outputs.append(usize::from(r.crate_id), r.buffer_type, &buffer[run_start * 4..pos * 4]);
                }

                if pos == 0 && !words.is_empty() {
                    if let Some(p) = part {
                        if p.part_words > word_count && at_eof {
                            warn!(
                                "{}: truncated part at end of stream ({} of {} words)",
                                context.name(),
                                word_count,
                                p.part_words
                            );
                            buffer.clear();
                            break 'outer;
                        }
                    } else if at_eof || words.len() >= 2 {
                        // Cannot classify the stream head; no way to resync.
                        warn!("{}: unclassifiable word {:#010x}, stopping", context.name(), words[0]);
                        result.error = Some(crate::Error::InvalidBufferHeader(words[0]));
                        buffer.clear();
                        break 'outer;
                    }
                }

                // Keep the unconsumed tail for the next chunk.
                buffer.drain(..pos * 4);
                break;
            }

            let part = part.unwrap();

            match run {
                Some(r) if r.crate_id == part.crate_id && r.buffer_type == part.buffer_type => {}
                Some(r) => {
                    outputs.append(usize::from(r.crate_id), r.buffer_type, &buffer[run_start * 4..pos * 4]);
                    run_start = pos;
                    run = Some(part);
                }
                None => {
                    run_start = pos;
                    run = Some(part);
                }
            }

            pos += part.part_words;
        }

        if at_eof {
            if !buffer.is_empty() {
                debug!("{}: {} trailing bytes at end of stream", context.name(), buffer.len());
            }
            break;
        }
    }

    outputs.finish();
    info!("{}: replay done, {total_bytes} bytes", context.name());
    result
}

pub fn spawn_replay(name: &str, mut reader: Box<dyn ReadHandle + Send>, mut outputs: ReplayOutputs) -> JobHandle {
    let context = JobContext::new(name);
    start_job(context, move |ctx| replay_loop(&ctx, reader.as_mut(), &mut outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, make_frame_header};
    use crate::pipeline::link;
    use crate::transport::PacketChannel;

    struct SliceReader {
        chunks: Vec<Vec<u8>>,
        next: usize,
    }

    impl ReadHandle for SliceReader {
        fn read(&mut self, dest: &mut [u8]) -> crate::Result<usize> {
            if self.next >= self.chunks.len() {
                return Ok(0);
            }
            let chunk = &self.chunks[self.next];
            assert!(chunk.len() <= dest.len());
            dest[..chunk.len()].copy_from_slice(chunk);
            self.next += 1;
            Ok(chunk.len())
        }
    }

    fn words_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn usb_frame(crate_id: u8, payload: &[u32]) -> Vec<u32> {
        let mut v = vec![make_frame_header(
            FrameType::StackFrame,
            0,
            1,
            crate_id,
            payload.len() as u16,
        )];
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn classify_usb_and_eth_parts() {
        let usb = usb_frame(3, &[0x11, 0x22]);
        assert_eq!(
            extract_part_info(&usb),
            Some(PartInfo {
                crate_id: 3,
                part_words: 3,
                buffer_type: ConnectionType::Usb,
            })
        );

        let hdr = eth::PayloadHeader::pack(PacketChannel::Data, 7, 2, 5, Some(0));
        assert_eq!(
            extract_part_info(&[hdr.header0, hdr.header1]),
            Some(PartInfo {
                crate_id: 2,
                part_words: 7,
                buffer_type: ConnectionType::Eth,
            })
        );

        // A lone non-frame word might be the first half of an ETH header.
        assert_eq!(extract_part_info(&[0x0000_1234]), None);
    }

    fn collect_messages(rx: &crate::pipeline::InputReader) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match rx.read_message().unwrap() {
                Some(msg) if message::is_shutdown_message(&msg) => break,
                Some(msg) => out.push(msg),
                None => {}
            }
        }
        out
    }

    #[test]
    fn demultiplexes_by_crate() {
        let frames0a = usb_frame(0, &[0xA1]);
        let frames0b = usb_frame(0, &[0xA2]);
        let frames1 = usb_frame(1, &[0xB1, 0xB2]);

        let mut stream = Vec::new();
        stream.extend(words_bytes(&frames0a));
        stream.extend(words_bytes(&frames0b));
        stream.extend(words_bytes(&frames1));

        let reader = SliceReader {
            chunks: vec![stream],
            next: 0,
        };

        let (tx0, rx0) = link(8);
        let (tx1, rx1) = link(8);
        let mut outputs = ReplayOutputs::new();
        outputs.set_writer(0, Box::new(tx0));
        outputs.set_writer(1, Box::new(tx1));

        let handle = spawn_replay("replay test", Box::new(reader), outputs);

        let msgs0 = collect_messages(&rx0);
        let msgs1 = collect_messages(&rx1);
        assert!(!handle.join().has_error());

        // Contiguous crate-0 frames are coalesced into one message.
        assert_eq!(msgs0.len(), 1);
        let hdr0 = message::parse_readout_data_header(&msgs0[0]).unwrap();
        assert_eq!(hdr0.crate_id, 0);
        assert_eq!(hdr0.message_number, 1);
        assert_eq!(hdr0.buffer_type, ConnectionType::Usb);

        let mut expected0 = words_bytes(&frames0a);
        expected0.extend(words_bytes(&frames0b));
        assert_eq!(message::readout_data_payload(&msgs0[0]).unwrap(), &expected0[..]);

        assert_eq!(msgs1.len(), 1);
        assert_eq!(
            message::readout_data_payload(&msgs1[0]).unwrap(),
            &words_bytes(&frames1)[..]
        );
    }

    #[test]
    fn carries_partial_frame_across_chunks() {
        let frame = usb_frame(0, &[0x11, 0x22, 0x33]);
        let bytes = words_bytes(&frame);

        // Split mid-frame.
        let reader = SliceReader {
            chunks: vec![bytes[..6].to_vec(), bytes[6..].to_vec()],
            next: 0,
        };

        let (tx0, rx0) = link(8);
        let mut outputs = ReplayOutputs::new();
        outputs.set_writer(0, Box::new(tx0));

        let handle = spawn_replay("replay split test", Box::new(reader), outputs);

        let msgs = collect_messages(&rx0);
        assert!(!handle.join().has_error());

        assert_eq!(msgs.len(), 1);
        assert_eq!(message::readout_data_payload(&msgs[0]).unwrap(), &bytes[..]);
    }

    #[test]
    fn eth_stream_demultiplex() {
        let payload = [0xF3A1_0000u32, 0x42];
        let hdr = eth::PayloadHeader::pack(PacketChannel::Data, 1, 4, payload.len() as u16, Some(0));
        let mut words = vec![hdr.header0, hdr.header1];
        words.extend_from_slice(&payload);

        let reader = SliceReader {
            chunks: vec![words_bytes(&words)],
            next: 0,
        };

        let (tx, rx) = link(8);
        let mut outputs = ReplayOutputs::new();
        outputs.set_writer(4, Box::new(tx));

        let handle = spawn_replay("replay eth test", Box::new(reader), outputs);
        let msgs = collect_messages(&rx);
        assert!(!handle.join().has_error());

        assert_eq!(msgs.len(), 1);
        let hdr = message::parse_readout_data_header(&msgs[0]).unwrap();
        assert_eq!(hdr.crate_id, 4);
        assert_eq!(hdr.buffer_type, ConnectionType::Eth);
    }
}

/*! In-process and on-disk message format.

Pipeline stages exchange owned byte buffers. Every message starts with a
base header carrying the message type and a monotonically increasing
message number (from 1, wrapping) used for loss accounting downstream. All
header fields are little-endian and 4-byte aligned.

`ReadoutData` messages carry raw controller output, possibly mixed with
system event frames; their payload is exactly what gets appended to a
listfile. `ParsedEvents` messages carry a sequence of sections produced by
the readout parser stage.
*/
use crate::transport::ConnectionType;
use crate::{Error, Result, eth, frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    GracefulShutdown = 0,
    ReadoutData = 1,
    ParsedEvents = 2,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        Some(match v {
            0 => MessageType::GracefulShutdown,
            1 => MessageType::ReadoutData,
            2 => MessageType::ParsedEvents,
            _ => None?,
        })
    }
}

/// `[type:u8, pad:3, message_number:u32]`
pub const BASE_HEADER_SIZE: usize = 8;

/// Base header plus `[buffer_type:u32, crate_id:u8, pad:3]`
pub const READOUT_DATA_HEADER_SIZE: usize = BASE_HEADER_SIZE + 8;

/// ParsedEvents messages have no extra header fields.
pub const PARSED_EVENTS_HEADER_SIZE: usize = BASE_HEADER_SIZE;

/// Section magic for a parsed readout event.
pub const PARSED_DATA_EVENT_MAGIC: u8 = 0xF3;
/// Section magic for a parsed system event.
pub const PARSED_SYSTEM_EVENT_MAGIC: u8 = 0xFA;

fn buffer_type_code(ct: ConnectionType) -> u32 {
    match ct {
        ConnectionType::Usb => 0,
        ConnectionType::Eth => 1,
    }
}

fn buffer_type_from_code(v: u32) -> Result<ConnectionType> {
    match v {
        0 => Ok(ConnectionType::Usb),
        1 => Ok(ConnectionType::Eth),
        _ => Err(Error::WrongMessageType(v as u8)),
    }
}

fn write_base_header(msg: &mut Vec<u8>, message_type: MessageType, message_number: u32) {
    msg.push(message_type as u8);
    msg.extend_from_slice(&[0u8; 3]);
    msg.extend_from_slice(&message_number.to_le_bytes());
}

/// Message type of a raw message.
pub fn message_type(msg: &[u8]) -> Result<MessageType> {
    if msg.len() < BASE_HEADER_SIZE {
        return Err(Error::MessageTooShort(msg.len()));
    }
    MessageType::from_u8(msg[0]).ok_or(Error::WrongMessageType(msg[0]))
}

/// Message number of a raw message.
pub fn message_number(msg: &[u8]) -> Result<u32> {
    if msg.len() < BASE_HEADER_SIZE {
        return Err(Error::MessageTooShort(msg.len()));
    }
    Ok(u32::from_le_bytes(msg[4..8].try_into().unwrap()))
}

#[must_use]
pub fn is_shutdown_message(msg: &[u8]) -> bool {
    matches!(message_type(msg), Ok(MessageType::GracefulShutdown))
}

/// Build the distinguished shutdown message appended to every output at
/// stop time.
#[must_use]
pub fn shutdown_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(BASE_HEADER_SIZE);
    write_base_header(&mut msg, MessageType::GracefulShutdown, 0);
    msg
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadoutDataHeader {
    pub message_number: u32,
    pub buffer_type: ConnectionType,
    pub crate_id: u8,
}

/// Start a ReadoutData message. `reserve` pre-allocates payload space so
/// producers can append without reallocating.
#[must_use]
pub fn new_readout_data_message(
    crate_id: u8,
    message_number: u32,
    buffer_type: ConnectionType,
    reserve: usize,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(READOUT_DATA_HEADER_SIZE + reserve);
    write_base_header(&mut msg, MessageType::ReadoutData, message_number);
    msg.extend_from_slice(&buffer_type_code(buffer_type).to_le_bytes());
    msg.push(crate_id);
    msg.extend_from_slice(&[0u8; 3]);
    msg
}

pub fn parse_readout_data_header(msg: &[u8]) -> Result<ReadoutDataHeader> {
    if msg.len() < READOUT_DATA_HEADER_SIZE {
        return Err(Error::MessageTooShort(msg.len()));
    }
    match message_type(msg)? {
        MessageType::ReadoutData => {}
        other => return Err(Error::WrongMessageType(other as u8)),
    }

    Ok(ReadoutDataHeader {
        message_number: message_number(msg)?,
        buffer_type: buffer_type_from_code(u32::from_le_bytes(msg[8..12].try_into().unwrap()))?,
        crate_id: msg[12],
    })
}

/// Payload of a ReadoutData message: the raw readout byte stream.
pub fn readout_data_payload(msg: &[u8]) -> Result<&[u8]> {
    if msg.len() < READOUT_DATA_HEADER_SIZE {
        return Err(Error::MessageTooShort(msg.len()));
    }
    Ok(&msg[READOUT_DATA_HEADER_SIZE..])
}

/// Start a ParsedEvents message.
#[must_use]
pub fn new_parsed_events_message(message_number: u32, reserve: usize) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PARSED_EVENTS_HEADER_SIZE + reserve);
    write_base_header(&mut msg, MessageType::ParsedEvents, message_number);
    msg
}

/// One module's data within a parsed readout event section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleData {
    pub prefix: Vec<u32>,
    pub dynamic: Vec<u32>,
    pub suffix: Vec<u32>,
    /// Set when the module has a dynamic part, even an empty one.
    pub has_dynamic: bool,
}

// Per-module descriptor: [prefix_size:u16, suffix_size:u16,
// dynamic_size:u32, has_dynamic:u8, pad:3]
const MODULE_HEADER_SIZE: usize = 12;

/// Append a parsed readout event section:
/// `[0xF3, crate_id, event_index, module_count]` followed by per-module
/// descriptors and the concatenated module payload words.
pub fn append_event_section(msg: &mut Vec<u8>, crate_id: u8, event_index: u8, modules: &[ModuleData]) {
    debug_assert!(modules.len() <= u8::MAX as usize);

    msg.push(PARSED_DATA_EVENT_MAGIC);
    msg.push(crate_id);
    msg.push(event_index);
    msg.push(modules.len() as u8);

    for m in modules {
        msg.extend_from_slice(&(m.prefix.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(m.suffix.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(m.dynamic.len() as u32).to_le_bytes());
        msg.push(u8::from(m.has_dynamic));
        msg.extend_from_slice(&[0u8; 3]);
    }

    for m in modules {
        for w in m.prefix.iter().chain(m.dynamic.iter()).chain(m.suffix.iter()) {
            msg.extend_from_slice(&w.to_le_bytes());
        }
    }
}

/// Append a parsed system event section: `[0xFA, crate_id, pad:2,
/// event_size:u32]` followed by the raw frame words (header included).
pub fn append_system_event_section(msg: &mut Vec<u8>, crate_id: u8, data: &[u32]) {
    msg.push(PARSED_SYSTEM_EVENT_MAGIC);
    msg.push(crate_id);
    msg.extend_from_slice(&[0u8; 2]);
    msg.extend_from_slice(&(data.len() as u32).to_le_bytes());
    for w in data {
        msg.extend_from_slice(&w.to_le_bytes());
    }
}

/// A section decoded from a ParsedEvents message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedSection {
    ReadoutEvent {
        crate_id: u8,
        event_index: u8,
        modules: Vec<ModuleData>,
    },
    SystemEvent {
        crate_id: u8,
        /// Raw frame words, header included.
        data: Vec<u32>,
    },
}

/// Iterator over the sections of a ParsedEvents message body.
pub struct ParsedSectionIter<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> ParsedSectionIter<'a> {
    /// Iterate over a full ParsedEvents message (header is skipped).
    pub fn new(msg: &'a [u8]) -> Result<Self> {
        if msg.len() < PARSED_EVENTS_HEADER_SIZE {
            return Err(Error::MessageTooShort(msg.len()));
        }
        match message_type(msg)? {
            MessageType::ParsedEvents => {}
            other => return Err(Error::WrongMessageType(other as u8)),
        }
        Ok(Self {
            body: &msg[PARSED_EVENTS_HEADER_SIZE..],
            pos: 0,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.body.len() - self.pos < n {
            return Err(Error::MessageTooShort(self.body.len()));
        }
        let s = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_words(&mut self, n: usize) -> Result<Vec<u32>> {
        let bytes = self.take(n * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }
}

impl Iterator for ParsedSectionIter<'_> {
    type Item = Result<ParsedSection>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.body.len() {
            return None;
        }

        let magic = self.body[self.pos];

        let item = (|| -> Result<ParsedSection> {
            match magic {
                PARSED_DATA_EVENT_MAGIC => {
                    let head = self.take(4)?;
                    let crate_id = head[1];
                    let event_index = head[2];
                    let module_count = usize::from(head[3]);

                    struct Sizes {
                        prefix: usize,
                        suffix: usize,
                        dynamic: usize,
                        has_dynamic: bool,
                    }

                    let mut sizes = Vec::with_capacity(module_count);
                    for _ in 0..module_count {
                        let h = self.take(MODULE_HEADER_SIZE)?;
                        sizes.push(Sizes {
                            prefix: usize::from(u16::from_le_bytes(h[0..2].try_into().unwrap())),
                            suffix: usize::from(u16::from_le_bytes(h[2..4].try_into().unwrap())),
                            dynamic: u32::from_le_bytes(h[4..8].try_into().unwrap()) as usize,
                            has_dynamic: h[8] != 0,
                        });
                    }

                    let mut modules = Vec::with_capacity(module_count);
                    for s in &sizes {
                        modules.push(ModuleData {
                            prefix: self.take_words(s.prefix)?,
                            dynamic: self.take_words(s.dynamic)?,
                            suffix: self.take_words(s.suffix)?,
                            has_dynamic: s.has_dynamic,
                        });
                    }

                    Ok(ParsedSection::ReadoutEvent {
                        crate_id,
                        event_index,
                        modules,
                    })
                }
                PARSED_SYSTEM_EVENT_MAGIC => {
                    let head = self.take(8)?;
                    let crate_id = head[1];
                    let size = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
                    Ok(ParsedSection::SystemEvent {
                        crate_id,
                        data: self.take_words(size)?,
                    })
                }
                other => Err(Error::WrongMessageType(other)),
            }
        })();

        if item.is_err() {
            // Don't loop forever on a corrupt body.
            self.pos = self.body.len();
        }

        Some(item)
    }
}

/// Move trailing bytes that do not form whole MVLC frames (USB) or whole
/// packets (ETH) from the end of a ReadoutData message into `tmp`, so that
/// every emitted message is a concatenation of complete frames. Returns the
/// number of bytes moved.
pub fn fixup_listfile_buffer_message(buffer_type: ConnectionType, msg: &mut Vec<u8>, tmp: &mut Vec<u8>) -> Result<usize> {
    let payload_start = READOUT_DATA_HEADER_SIZE;
    if msg.len() < payload_start {
        return Err(Error::MessageTooShort(msg.len()));
    }

    let payload = &msg[payload_start..];
    let words: Vec<u32> = payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let mut pos = 0usize; // in words

    loop {
        let remaining = words.len() - pos;
        if remaining == 0 {
            break;
        }

        let part_words = match buffer_type {
            ConnectionType::Usb => {
                let info = frame::extract_frame_info(words[pos]);
                usize::from(info.len) + 1
            }
            ConnectionType::Eth => {
                if remaining < eth::HEADER_WORDS {
                    break;
                }
                let hdr = eth::PayloadHeader {
                    header0: words[pos],
                    header1: words[pos + 1],
                };
                eth::HEADER_WORDS + usize::from(hdr.data_word_count())
            }
        };

        if part_words > remaining {
            break;
        }
        pos += part_words;
    }

    let keep_bytes = payload_start + pos * 4;
    let moved = msg.len() - keep_bytes;

    tmp.clear();
    tmp.extend_from_slice(&msg[keep_bytes..]);
    msg.truncate(keep_bytes);

    Ok(moved)
}

/*! Readout stream parser.

Reconstructs per-event, per-module data from the MVLC's continuation-framed
wire format. The input is lossful: USB bulk buffers can be dropped when the
host falls behind, ETH datagrams can be lost in the network. The parser is
a resumable state machine that survives both by resetting to a scan for the
next event start, counting what it had to throw away.

Module data within one event is split into up to three parts, derived from
the readout stack commands of the module's group:

* prefix: fixed-size single reads and markers before the block transfer,
* dynamic: one variable-size block read, delivered in `BlockRead` frames,
* suffix: fixed-size reads after the block transfer.

Parsed data is delivered through [`ParserCallbacks`]; the parser never
aborts the stream on malformed input.
*/
use std::collections::BTreeMap;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::command::{StackCommand, StackCommandBuilder, vme_amods};
use crate::eth;
use crate::frame::{self, FrameType, extract_frame_info, system_event};
use crate::transport::ConnectionType;

/// Parts of one group's readout within an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupReadoutStructure {
    pub prefix_len: u8,
    pub has_dynamic: bool,
    pub suffix_len: u8,
}

impl GroupReadoutStructure {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefix_len == 0 && !self.has_dynamic && self.suffix_len == 0
    }
}

/// Derive a group's readout structure from its stack commands.
///
/// Single reads and marker writes produce exactly one word each; a block
/// read produces the dynamic part. At most one dynamic part per group, and
/// nothing but suffix reads may follow it.
pub fn parse_group_readout_commands(commands: &[StackCommand]) -> crate::Result<GroupReadoutStructure> {
    enum State {
        Prefix,
        Dynamic,
        Suffix,
    }

    let mut state = State::Prefix;
    let mut result = GroupReadoutStructure::default();

    for cmd in commands {
        let single_word = match cmd {
            StackCommand::VMERead { amod, .. } => !vme_amods::is_block_mode(*amod),
            StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => true,
            StackCommand::VMEBlockRead { .. } | StackCommand::VMEBlockRead2eSST { .. } => false,
            StackCommand::VMEWrite { .. } | StackCommand::SoftwareDelay { .. } => continue,
        };

        if single_word {
            match state {
                State::Prefix => result.prefix_len += 1,
                State::Dynamic => {
                    state = State::Suffix;
                    result.suffix_len += 1;
                }
                State::Suffix => result.suffix_len += 1,
            }
        } else {
            match state {
                State::Prefix => {
                    result.has_dynamic = true;
                    state = State::Dynamic;
                }
                State::Dynamic => {
                    return Err(crate::Error::InvalidConfig(
                        "multiple block reads in module readout".into(),
                    ));
                }
                State::Suffix => {
                    return Err(crate::Error::InvalidConfig(
                        "block read after suffix in module readout".into(),
                    ));
                }
            }
        }
    }

    Ok(result)
}

/// Per-stack, per-group readout structure.
pub type ReadoutStructure = Vec<Vec<GroupReadoutStructure>>;

pub fn build_readout_structure(readout_stacks: &[StackCommandBuilder]) -> crate::Result<ReadoutStructure> {
    let mut result = Vec::with_capacity(readout_stacks.len());

    for stack in readout_stacks {
        let mut groups = Vec::with_capacity(stack.group_count());
        for group in stack.get_groups() {
            groups.push(parse_group_readout_commands(&group.commands)?);
        }
        result.push(groups);
    }

    Ok(result)
}

/// Parsed data consumer.
///
/// For each event the sequence is `begin_event`, then per module any of
/// `module_prefix` / `module_dynamic` / `module_suffix` whose part is
/// non-empty, then `end_event`. System events arrive out of band with
/// their original frame header as the first word.
pub trait ParserCallbacks {
    fn begin_event(&mut self, _event_index: u8) {}
    fn module_prefix(&mut self, _event_index: u8, _module_index: u8, _data: &[u32]) {}
    fn module_dynamic(&mut self, _event_index: u8, _module_index: u8, _data: &[u32]) {}
    fn module_suffix(&mut self, _event_index: u8, _module_index: u8, _data: &[u32]) {}
    fn end_event(&mut self, _event_index: u8) {}
    fn system_event(&mut self, _data: &[u32]) {}
}

/// Non-fatal parse outcomes. The parser resets its event state, counts the
/// error and resumes on the next buffer or datagram.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no frame header present in packet")]
    NoHeaderPresent,
    #[error("no stack frame found")]
    NoStackFrameFound,
    #[error("not a stack frame")]
    NotAStackFrame,
    #[error("not a block read frame")]
    NotABlockFrame,
    #[error("not a stack continuation")]
    NotAStackContinuation,
    #[error("stack index changed mid event")]
    StackIndexChanged,
    #[error("stack index out of range")]
    StackIndexOutOfRange,
    #[error("group index out of range")]
    GroupIndexOutOfRange,
    #[error("empty stack frame")]
    EmptyStackFrame,
    #[error("unexpected open block frame")]
    UnexpectedOpenBlockFrame,
    #[error("unexpected end of input: {0}")]
    UnexpectedEndOfInput(&'static str),
    #[error("parse_readout_contents not advancing")]
    ParseReadoutContentsNotAdvancing,
    #[error("eth buffer iteration not advancing")]
    ParseEthBufferNotAdvancing,
    #[error("eth packet iteration not advancing")]
    ParseEthPacketNotAdvancing,
}

impl ParseError {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ParseError::NoHeaderPresent => "NoHeaderPresent",
            ParseError::NoStackFrameFound => "NoStackFrameFound",
            ParseError::NotAStackFrame => "NotAStackFrame",
            ParseError::NotABlockFrame => "NotABlockFrame",
            ParseError::NotAStackContinuation => "NotAStackContinuation",
            ParseError::StackIndexChanged => "StackIndexChanged",
            ParseError::StackIndexOutOfRange => "StackIndexOutOfRange",
            ParseError::GroupIndexOutOfRange => "GroupIndexOutOfRange",
            ParseError::EmptyStackFrame => "EmptyStackFrame",
            ParseError::UnexpectedOpenBlockFrame => "UnexpectedOpenBlockFrame",
            ParseError::UnexpectedEndOfInput(_) => "UnexpectedEndOfInput",
            ParseError::ParseReadoutContentsNotAdvancing => "ParseReadoutContentsNotAdvancing",
            ParseError::ParseEthBufferNotAdvancing => "ParseEthBufferNotAdvancing",
            ParseError::ParseEthPacketNotAdvancing => "ParseEthPacketNotAdvancing",
        }
    }

    fn is_exception(&self) -> bool {
        matches!(self, ParseError::UnexpectedEndOfInput(_))
    }
}

/// Buffers lost between two successive buffer numbers on a 32-bit counter
/// starting at 1. A duplicate number counts as a full wrap.
#[must_use]
pub fn calc_buffer_loss(buffer_number: u32, last_buffer_number: u32) -> u32 {
    buffer_number.wrapping_sub(last_buffer_number).wrapping_sub(1)
}

#[derive(Clone, Debug, Default)]
pub struct ParserCounters {
    pub buffers_processed: u64,
    /// Buffers lost before they reached this parser.
    pub internal_buffer_loss: u64,
    pub eth_packets_processed: u64,
    pub eth_packet_loss: u64,
    /// Input bytes that did not contribute to an emitted event.
    pub unused_bytes: u64,
    pub events: u64,
    pub event_hits: BTreeMap<u8, u64>,
    pub system_events: u64,
    pub system_event_types: BTreeMap<u8, u64>,
    pub parser_exceptions: u64,
    pub parse_results: BTreeMap<&'static str, u64>,
}

/// An open frame: header word plus the payload words not yet consumed.
/// The frame is closed once `words_left` reaches zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameState {
    pub header: u32,
    pub words_left: u16,
}

impl FrameState {
    fn new(header: u32) -> FrameState {
        FrameState {
            header,
            words_left: extract_frame_info(header).len,
        }
    }

    fn is_open(&self) -> bool {
        self.words_left > 0
    }

    fn info(&self) -> frame::FrameInfo {
        extract_frame_info(self.header)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ModuleParseState {
    #[default]
    Prefix,
    Dynamic,
    Suffix,
}

#[derive(Clone, Copy, Debug, Default)]
struct Span {
    offset: usize,
    size: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct GroupSpans {
    prefix: Span,
    dynamic: Span,
    suffix: Span,
}

struct Cursor<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.words.len()
    }

    fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }

    fn peek(&self) -> Option<u32> {
        self.words.get(self.pos).copied()
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        debug_assert!(self.pos <= self.words.len());
    }

    fn slice(&self, n: usize) -> &'a [u32] {
        &self.words[self.pos..self.pos + n]
    }
}

/// Resumable parser for one crate's readout stream.
pub struct ReadoutParser {
    input_format: ConnectionType,
    readout_structure: ReadoutStructure,
    spans: Vec<GroupSpans>,
    work_buffer: Vec<u32>,
    last_buffer_number: u32,
    last_packet_number: Option<u16>,
    event_index: Option<usize>,
    module_index: usize,
    module_parse_state: ModuleParseState,
    cur_stack_frame: FrameState,
    cur_block_frame: FrameState,
    pub counters: ParserCounters,
}

const INITIAL_WORK_BUFFER_WORDS: usize = 1024 * 1024 / 4;

impl ReadoutParser {
    /// Build a parser from the readout stacks of a crate config.
    pub fn new(input_format: ConnectionType, readout_stacks: &[StackCommandBuilder]) -> crate::Result<Self> {
        Ok(Self::from_structure(input_format, build_readout_structure(readout_stacks)?))
    }

    #[must_use]
    pub fn from_structure(input_format: ConnectionType, readout_structure: ReadoutStructure) -> Self {
        let max_groups = readout_structure.iter().map(Vec::len).max().unwrap_or(0);

        ReadoutParser {
            input_format,
            readout_structure,
            spans: vec![GroupSpans::default(); max_groups],
            work_buffer: Vec::with_capacity(INITIAL_WORK_BUFFER_WORDS),
            last_buffer_number: 0,
            last_packet_number: None,
            event_index: None,
            module_index: 0,
            module_parse_state: ModuleParseState::Prefix,
            cur_stack_frame: FrameState::default(),
            cur_block_frame: FrameState::default(),
            counters: ParserCounters::default(),
        }
    }

    #[must_use]
    pub fn input_format(&self) -> ConnectionType {
        self.input_format
    }

    #[must_use]
    pub fn structure(&self) -> &ReadoutStructure {
        &self.readout_structure
    }

    fn is_event_in_progress(&self) -> bool {
        self.event_index.is_some()
    }

    fn clear_event_state(&mut self) {
        self.event_index = None;
        self.module_index = 0;
        self.module_parse_state = ModuleParseState::Prefix;
        self.cur_stack_frame = FrameState::default();
        self.cur_block_frame = FrameState::default();
    }

    fn count_error(&mut self, e: &ParseError) {
        if e.is_exception() {
            self.counters.parser_exceptions += 1;
        } else {
            *self.counters.parse_results.entry(e.name()).or_default() += 1;
        }
    }

    fn begin_event(&mut self, header: u32) -> Result<(), ParseError> {
        debug_assert!(!self.is_event_in_progress());

        let info = extract_frame_info(header);

        if info.frame_type != FrameType::StackFrame as u8 {
            warn!("NotAStackFrame: {header:#010x}");
            return Err(ParseError::NotAStackFrame);
        }

        if info.stack == 0 || usize::from(info.stack - 1) >= self.readout_structure.len() {
            return Err(ParseError::StackIndexOutOfRange);
        }

        self.work_buffer.clear();
        for span in &mut self.spans {
            *span = GroupSpans::default();
        }

        self.event_index = Some(usize::from(info.stack - 1));
        self.module_index = 0;
        self.module_parse_state = ModuleParseState::Prefix;
        self.cur_stack_frame = FrameState::new(header);
        self.cur_block_frame = FrameState::default();
        Ok(())
    }

    /// Copy `n` words from the cursor into the work buffer, accounting them
    /// against the open stack frame.
    fn copy_to_work_buffer(&mut self, cursor: &mut Cursor, n: usize) {
        debug_assert!(cursor.remaining() >= n);
        self.work_buffer.extend_from_slice(cursor.slice(n));
        cursor.advance(n);
        self.cur_stack_frame.words_left = self.cur_stack_frame.words_left.saturating_sub(n as u16);
    }

    /// Invoke the system event callback if the cursor sits on a known
    /// system event frame.
    fn try_handle_system_event<C: ParserCallbacks>(
        &mut self,
        callbacks: &mut C,
        cursor: &mut Cursor,
    ) -> Result<bool, ParseError> {
        let Some(header) = cursor.peek() else {
            return Ok(false);
        };

        if !system_event::is_known_system_event(header) {
            return Ok(false);
        }

        let len = usize::from(extract_frame_info(header).len);

        if cursor.remaining() <= len {
            return Err(ParseError::UnexpectedEndOfInput("system event exceeds input"));
        }

        let subtype = system_event::extract_subtype(header);
        *self.counters.system_event_types.entry(subtype).or_default() += 1;
        self.counters.system_events += 1;

        callbacks.system_event(cursor.slice(len + 1));
        cursor.advance(len + 1);
        Ok(true)
    }

    /// Advance over StackFrame/StackContinuation frames until a StackFrame
    /// header is found, counting skipped frames as unused. Any other word
    /// stops the search; scanning random data for lengths would mean
    /// trusting garbage.
    fn find_stack_frame_header(&mut self, cursor: &mut Cursor) -> Result<bool, ParseError> {
        while let Some(header) = cursor.peek() {
            let info = extract_frame_info(header);

            if info.frame_type == FrameType::StackFrame as u8 {
                return Ok(true);
            }

            if info.frame_type != FrameType::StackContinuation as u8 {
                return Ok(false);
            }

            if cursor.remaining() <= usize::from(info.len) {
                return Err(ParseError::UnexpectedEndOfInput("skipping frame"));
            }

            self.counters.unused_bytes += (u64::from(info.len) + 1) * 4;
            cursor.advance(usize::from(info.len) + 1);
        }

        Ok(false)
    }

    fn flush_event<C: ParserCallbacks>(&mut self, callbacks: &mut C) {
        debug_assert!(!self.cur_block_frame.is_open());
        let ei = self.event_index.expect("flush without open event") as u8;
        let module_count = self.readout_structure[usize::from(ei)].len();

        callbacks.begin_event(ei);

        for mi in 0..module_count {
            let spans = &self.spans[mi];

            if spans.prefix.size > 0 {
                callbacks.module_prefix(
                    ei,
                    mi as u8,
                    &self.work_buffer[spans.prefix.offset..spans.prefix.offset + spans.prefix.size],
                );
            }
            if spans.dynamic.size > 0 {
                callbacks.module_dynamic(
                    ei,
                    mi as u8,
                    &self.work_buffer[spans.dynamic.offset..spans.dynamic.offset + spans.dynamic.size],
                );
            }
            if spans.suffix.size > 0 {
                callbacks.module_suffix(
                    ei,
                    mi as u8,
                    &self.work_buffer[spans.suffix.offset..spans.suffix.offset + spans.suffix.size],
                );
            }
        }

        callbacks.end_event(ei);

        self.counters.events += 1;
        *self.counters.event_hits.entry(ei).or_default() += 1;
        self.clear_event_state();
    }

    /// Core loop. The cursor spans a full USB buffer or the payload of one
    /// UDP packet and must start on a frame boundary when the parser is
    /// idle.
    fn parse_readout_contents<C: ParserCallbacks>(
        &mut self,
        callbacks: &mut C,
        cursor: &mut Cursor,
        is_eth: bool,
    ) -> Result<(), ParseError> {
        'outer: while !cursor.is_empty() {
            let last_pos = cursor.pos;

            if !self.cur_stack_frame.is_open() {
                // With no open stack frame there must be no open block
                // frame; block data is always contained in stack frames.
                if self.cur_block_frame.is_open() {
                    return Err(ParseError::UnexpectedOpenBlockFrame);
                }

                // USB buffers carry system frames inline. For ETH they are
                // handled at the datagram level: a packet payload may start
                // with continuation data that happens to look like 0xFA.
                if !is_eth && self.try_handle_system_event(callbacks, cursor)? {
                    continue 'outer;
                }

                if self.is_event_in_progress() {
                    let header = cursor
                        .peek()
                        .ok_or(ParseError::UnexpectedEndOfInput("continuation header"))?;
                    let info = extract_frame_info(header);

                    if info.frame_type != FrameType::StackContinuation as u8 {
                        return Err(ParseError::NotAStackContinuation);
                    }

                    if info.stack == 0 || usize::from(info.stack - 1) != self.event_index.unwrap_or(usize::MAX) {
                        return Err(ParseError::StackIndexChanged);
                    }

                    self.cur_stack_frame = FrameState::new(header);
                    cursor.advance(1);
                } else {
                    if !self.find_stack_frame_header(cursor)? {
                        return Err(ParseError::NoStackFrameFound);
                    }

                    let header = cursor.peek().ok_or(ParseError::UnexpectedEndOfInput("event header"))?;
                    self.begin_event(header)?;
                    cursor.advance(1);
                    trace!("began event {:?} from header {header:#010x}", self.event_index);
                }
            }

            debug_assert!(self.is_event_in_progress());
            let ei = self.event_index.unwrap();
            let module_count = self.readout_structure[ei].len();

            if self.module_index < module_count {
                let parts = self.readout_structure[ei][self.module_index];
                let mi = self.module_index;

                match self.module_parse_state {
                    ModuleParseState::Prefix => {
                        if self.spans[mi].prefix.size < usize::from(parts.prefix_len) {
                            if self.spans[mi].prefix.size == 0 {
                                self.spans[mi].prefix.offset = self.work_buffer.len();
                            }

                            let words_left_in_span = usize::from(parts.prefix_len) - self.spans[mi].prefix.size;
                            let n = words_left_in_span
                                .min(usize::from(self.cur_stack_frame.words_left))
                                .min(cursor.remaining());
                            self.copy_to_work_buffer(cursor, n);
                            self.spans[mi].prefix.size += n;
                        }

                        if self.spans[mi].prefix.size == usize::from(parts.prefix_len) {
                            if parts.has_dynamic {
                                self.module_parse_state = ModuleParseState::Dynamic;
                                continue 'outer;
                            } else if parts.suffix_len != 0 {
                                self.module_parse_state = ModuleParseState::Suffix;
                                continue 'outer;
                            }
                            self.module_index += 1;
                            self.module_parse_state = ModuleParseState::Prefix;
                        }
                    }

                    ModuleParseState::Dynamic => {
                        debug_assert!(parts.has_dynamic);

                        if !self.cur_block_frame.is_open() {
                            let header = cursor
                                .peek()
                                .ok_or(ParseError::UnexpectedEndOfInput("block frame header"))?;

                            if !frame::is_blockread_frame(header) {
                                debug!("NotABlockFrame: header={header:#010x}");
                                self.clear_event_state();
                                return Err(ParseError::NotABlockFrame);
                            }

                            // The block header itself counts against the
                            // enclosing stack frame.
                            cursor.advance(1);
                            self.cur_stack_frame.words_left = self.cur_stack_frame.words_left.saturating_sub(1);
                            self.cur_block_frame = FrameState::new(header);
                        }

                        if self.spans[mi].dynamic.size == 0 {
                            self.spans[mi].dynamic.offset = self.work_buffer.len();
                        }

                        let n = usize::from(self.cur_block_frame.words_left)
                            .min(usize::from(self.cur_stack_frame.words_left))
                            .min(cursor.remaining());
                        self.copy_to_work_buffer(cursor, n);
                        self.spans[mi].dynamic.size += n;
                        self.cur_block_frame.words_left -= n as u16;

                        if !self.cur_block_frame.is_open() && !self.cur_block_frame.info().has_continue() {
                            self.cur_block_frame = FrameState::default();

                            if parts.suffix_len == 0 {
                                self.module_index += 1;
                                self.module_parse_state = ModuleParseState::Prefix;
                            } else {
                                self.module_parse_state = ModuleParseState::Suffix;
                                continue 'outer;
                            }
                        }
                    }

                    ModuleParseState::Suffix => {
                        if self.spans[mi].suffix.size < usize::from(parts.suffix_len) {
                            if self.spans[mi].suffix.size == 0 {
                                self.spans[mi].suffix.offset = self.work_buffer.len();
                            }

                            let words_left_in_span = usize::from(parts.suffix_len) - self.spans[mi].suffix.size;
                            let n = words_left_in_span
                                .min(usize::from(self.cur_stack_frame.words_left))
                                .min(cursor.remaining());
                            self.copy_to_work_buffer(cursor, n);
                            self.spans[mi].suffix.size += n;
                        }

                        if self.spans[mi].suffix.size >= usize::from(parts.suffix_len) {
                            self.module_index += 1;
                            self.module_parse_state = ModuleParseState::Prefix;
                        }
                    }
                }

                // Disabled modules produce no readout data at all.
                while self.module_index < module_count && self.readout_structure[ei][self.module_index].is_empty() {
                    self.module_index += 1;
                }
            }

            if self.module_index >= module_count {
                // Payload words past the configured module parts are
                // counted and skipped so the event can still be emitted
                // once the frame chain ends.
                if self.cur_stack_frame.is_open() {
                    let n = usize::from(self.cur_stack_frame.words_left).min(cursor.remaining());
                    if n > 0 {
                        warn!(
                            "event {ei}: skipping {n} unexpected trailing words in stack frame {:#010x}",
                            self.cur_stack_frame.header
                        );
                    }
                    cursor.advance(n);
                    self.cur_stack_frame.words_left -= n as u16;
                    self.counters.unused_bytes += (n as u64) * 4;
                }

                if !self.cur_stack_frame.is_open() {
                    if self.cur_stack_frame.info().has_continue() {
                        // Event data continues in the next StackContinuation.
                        self.cur_stack_frame = FrameState::default();
                    } else {
                        self.flush_event(callbacks);
                    }
                }
            }

            if cursor.pos == last_pos {
                return Err(ParseError::ParseReadoutContentsNotAdvancing);
            }
        }

        Ok(())
    }

    /// Parse the payload of one UDP packet. Packet loss is handled by the
    /// caller; the cursor must span exactly the packet words including the
    /// two ETH header words.
    fn parse_eth_packet<C: ParserCallbacks>(
        &mut self,
        callbacks: &mut C,
        cursor: &mut Cursor,
    ) -> Result<(), ParseError> {
        if cursor.remaining() < eth::HEADER_WORDS {
            return Err(ParseError::UnexpectedEndOfInput("eth header words"));
        }

        let hdr = eth::PayloadHeader {
            header0: cursor.peek().unwrap(),
            header1: cursor.slice(2)[1],
        };
        cursor.advance(eth::HEADER_WORDS);

        if !self.is_event_in_progress() {
            // Idle parsers can only start at a frame header; the packet
            // header tells us where the first one is.
            if !hdr.is_next_header_pointer_present() {
                return Err(ParseError::NoHeaderPresent);
            }

            let skip = usize::from(hdr.next_header_pointer());
            if cursor.remaining() < skip {
                return Err(ParseError::UnexpectedEndOfInput("next header pointer"));
            }
            cursor.advance(skip);
            self.counters.unused_bytes += (skip as u64) * 4;
        }

        while !cursor.is_empty() {
            let last_pos = cursor.pos;
            self.parse_readout_contents(callbacks, cursor, true)?;
            if !cursor.is_empty() && cursor.pos == last_pos {
                return Err(ParseError::ParseEthPacketNotAdvancing);
            }
        }

        Ok(())
    }

    /// Parse one readout buffer in the parser's input format.
    ///
    /// Buffer numbers are consecutive from 1; a gap resets the event state
    /// and is counted as internal buffer loss. Parse errors also reset the
    /// event state and are counted; the parser stays usable for the next
    /// buffer.
    pub fn parse_buffer<C: ParserCallbacks>(
        &mut self,
        callbacks: &mut C,
        buffer_number: u32,
        words: &[u32],
    ) -> Result<(), ParseError> {
        match self.input_format {
            ConnectionType::Usb => self.parse_buffer_usb(callbacks, buffer_number, words),
            ConnectionType::Eth => self.parse_buffer_eth(callbacks, buffer_number, words),
        }
    }

    fn handle_buffer_loss(&mut self, buffer_number: u32) {
        let loss = calc_buffer_loss(buffer_number, self.last_buffer_number);
        self.last_buffer_number = buffer_number;

        if loss != 0 {
            debug!("buffer loss: {loss} buffers, resetting event state");
            self.clear_event_state();
            self.counters.internal_buffer_loss += u64::from(loss);
            // Also forget the packet number so the loss is not counted a
            // second time as ETH packet loss.
            self.last_packet_number = None;
        }
    }

    fn parse_buffer_usb<C: ParserCallbacks>(
        &mut self,
        callbacks: &mut C,
        buffer_number: u32,
        words: &[u32],
    ) -> Result<(), ParseError> {
        trace!("begin parsing USB buffer {buffer_number}, {} words", words.len());
        self.handle_buffer_loss(buffer_number);

        let mut cursor = Cursor::new(words);

        if let Err(e) = self.parse_readout_contents(callbacks, &mut cursor, false) {
            self.clear_event_state();
            self.counters.unused_bytes += (cursor.remaining() as u64) * 4;
            self.count_error(&e);
            return Err(e);
        }

        self.counters.buffers_processed += 1;
        Ok(())
    }

    fn parse_buffer_eth<C: ParserCallbacks>(
        &mut self,
        callbacks: &mut C,
        buffer_number: u32,
        words: &[u32],
    ) -> Result<(), ParseError> {
        trace!("begin parsing ETH buffer {buffer_number}, {} words", words.len());
        self.handle_buffer_loss(buffer_number);

        let mut cursor = Cursor::new(words);

        while !cursor.is_empty() {
            let last_pos = cursor.pos;

            // ETH readout buffers are a mix of software generated system
            // event frames and raw packets starting with the header pair.
            match self.try_handle_system_event(callbacks, &mut cursor) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    self.clear_event_state();
                    self.counters.unused_bytes += (cursor.remaining() as u64) * 4;
                    self.count_error(&e);
                    return Err(e);
                }
            }

            if cursor.remaining() < eth::HEADER_WORDS {
                self.clear_event_state();
                self.counters.unused_bytes += (cursor.remaining() as u64) * 4;
                let e = ParseError::UnexpectedEndOfInput("eth header words");
                self.count_error(&e);
                return Err(e);
            }

            let hdr = eth::PayloadHeader {
                header0: cursor.slice(2)[0],
                header1: cursor.slice(2)[1],
            };
            let packet_words = eth::HEADER_WORDS + usize::from(hdr.data_word_count());

            if cursor.remaining() < packet_words {
                self.clear_event_state();
                self.counters.unused_bytes += (cursor.remaining() as u64) * 4;
                let e = ParseError::UnexpectedEndOfInput("eth packet exceeds buffer");
                self.count_error(&e);
                return Err(e);
            }

            if let Some(last) = self.last_packet_number {
                let loss = eth::calc_packet_loss(last, hdr.packet_number());
                if loss > 0 {
                    warn!(
                        "eth packet loss: last={last}, current={}, loss={loss}",
                        hdr.packet_number()
                    );
                    self.clear_event_state();
                    self.counters.eth_packet_loss += u64::from(loss);
                }
            }
            self.last_packet_number = Some(hdr.packet_number());

            let mut packet_cursor = Cursor::new(cursor.slice(packet_words));

            if let Err(e) = self.parse_eth_packet(callbacks, &mut packet_cursor) {
                self.clear_event_state();
                self.counters.eth_packets_processed += 1;
                self.counters.unused_bytes += (packet_cursor.remaining() as u64) * 4;
                self.count_error(&e);
                cursor.advance(packet_words);
                continue;
            }

            self.counters.eth_packets_processed += 1;
            cursor.advance(packet_words);

            if cursor.pos == last_pos {
                let e = ParseError::ParseEthBufferNotAdvancing;
                self.count_error(&e);
                return Err(e);
            }
        }

        self.counters.buffers_processed += 1;
        Ok(())
    }
}

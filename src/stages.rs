/*! Pipeline stages.

The stage loops connecting a controller to its consumers:

* readout producer: drains the data pipe into `ReadoutData` messages,
* readout parser: turns `ReadoutData` into `ParsedEvents` messages,
* listfile writer: appends `ReadoutData` payloads to an archive,
* event consumer: feeds parsed events to an [`EventConsumer`].

All loops follow the same pattern: poll the input with a short timeout,
check the quit flag, account counters per message, forward the shutdown
message and exit on it. See [`crate::pipeline`] for the runtime pieces.
*/
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::listfile::WriteHandle;
use crate::message::{self, ModuleData};
use crate::mvlc::Mvlc;
use crate::pipeline::{
    InputReader, JobContext, JobHandle, LoopResult, OutputWriter, StopWatch, send_shutdown, start_job,
};
use crate::readout_parser::{ParserCallbacks, ReadoutParser, ReadoutStructure, calc_buffer_loss};
use crate::transport::{ConnectionType, Pipe};
use crate::{Error, eth};

/// Output messages are flushed after this much time even when not full.
pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Payload space reserved per output message.
pub const MESSAGE_RESERVE: usize = 1024 * 1024;

/// Parsed data consumer driven by the consumer stage. The analysis behind
/// it is opaque to the readout core.
pub trait EventConsumer: Send {
    fn begin_event(&mut self, _crate_id: u8, _event_index: u8) {}
    fn module_data(&mut self, _crate_id: u8, _event_index: u8, _module_index: u8, _data: &ModuleData) {}
    fn end_event(&mut self, _crate_id: u8, _event_index: u8) {}
    fn system_event(&mut self, _crate_id: u8, _data: &[u32]) {}
}

//
// Readout producer
//

/// Drain the controller's data pipe into ReadoutData messages until told
/// to quit. Messages are flushed when nearly full or after
/// [`FLUSH_TIMEOUT`]; a trailing partial frame is carried over into the
/// next message so every message holds whole frames.
pub fn readout_producer_loop(
    context: &JobContext,
    mvlc: &Mvlc,
    crate_id: u8,
    output: &dyn OutputWriter,
) -> LoopResult {
    let buffer_type = mvlc.connection_type();
    let transport = mvlc.transport();
    let mut message_number = 1u32;
    let mut previous_data: Vec<u8> = Vec::new();
    let mut result = LoopResult::ok();

    info!("{}: starting readout, crate{crate_id}, {buffer_type:?}", context.name());

    // On ETH this teaches the MVLC the client's data port before any
    // triggers fire; a no-op on USB.
    if let Err(e) = transport.redirect_data_stream() {
        return LoopResult::from_error(e);
    }

    let mut msg = new_producer_message(crate_id, &mut message_number, buffer_type, &previous_data);
    let mut last_flush = Instant::now();
    let mut scratch = vec![0u8; eth::JUMBO_FRAME_MAX_SIZE.max(64 * 1024)];

    while !context.should_quit() {
        let read_bytes = {
            let _guard = mvlc.locks().lock_data();
            match buffer_type {
                ConnectionType::Eth => match transport.read_packet(Pipe::Data, &mut scratch) {
                    Ok(res) => {
                        msg.extend_from_slice(&scratch[..res.bytes_transferred]);
                        res.bytes_transferred
                    }
                    Err(Error::Timeout) => 0,
                    Err(e) => {
                        error!("{}: data pipe error: {e}", context.name());
                        result.error = Some(e);
                        break;
                    }
                },
                ConnectionType::Usb => {
                    let res = transport.read(Pipe::Data, &mut scratch);
                    msg.extend_from_slice(&scratch[..res.bytes_transferred]);
                    match res.error {
                        None | Some(Error::Timeout) => res.bytes_transferred,
                        Some(e) => {
                            error!("{}: data pipe error: {e}", context.name());
                            result.error = Some(e);
                            break;
                        }
                    }
                }
            }
        };

        trace!("{}: read {read_bytes} bytes from the data pipe", context.name());

        {
            let mut counters = context.reader_counters().lock();
            counters.bytes_received += read_bytes as u64;
        }

        let payload_len = msg.len() - message::READOUT_DATA_HEADER_SIZE;
        let full = payload_len + eth::JUMBO_FRAME_MAX_SIZE >= MESSAGE_RESERVE;

        if full || last_flush.elapsed() >= FLUSH_TIMEOUT {
            if full {
                debug!("{}: flushing full output message #{}", context.name(), message_number - 1);
            }
            let flushed = flush_producer_message(context, buffer_type, msg, &mut previous_data, output);
            msg = new_producer_message(crate_id, &mut message_number, buffer_type, &previous_data);
            last_flush = Instant::now();
            if let Err(e) = flushed {
                result.error = Some(e);
                break;
            }
        }
    }

    if flush_producer_message(context, buffer_type, msg, &mut previous_data, output).is_ok() && !previous_data.is_empty()
    {
        // A leftover partial frame has nowhere to go; it is lost with the
        // end of the run.
        warn!("{}: dropping {} trailing bytes at readout stop", context.name(), previous_data.len());
    }

    send_shutdown(output);
    info!("{}: readout stopped", context.name());
    result
}

fn new_producer_message(
    crate_id: u8,
    message_number: &mut u32,
    buffer_type: ConnectionType,
    previous_data: &[u8],
) -> Vec<u8> {
    let number = *message_number;
    *message_number = message_number.wrapping_add(1);
    let mut msg = message::new_readout_data_message(crate_id, number, buffer_type, MESSAGE_RESERVE);
    msg.extend_from_slice(previous_data);
    msg
}

fn flush_producer_message(
    context: &JobContext,
    buffer_type: ConnectionType,
    mut msg: Vec<u8>,
    previous_data: &mut Vec<u8>,
    output: &dyn OutputWriter,
) -> crate::Result<()> {
    let moved = message::fixup_listfile_buffer_message(buffer_type, &mut msg, previous_data)?;
    if moved > 0 {
        debug!("{}: moved {moved} trailing bytes into the next message", context.name());
    }

    let msg_size = msg.len();
    let mut sw = StopWatch::start();
    output.write_message(msg)?;

    let mut counters = context.writer_counters().lock();
    counters.t_send += sw.interval();
    counters.t_total += sw.total();
    counters.messages_sent += 1;
    counters.bytes_sent += msg_size as u64;
    Ok(())
}

//
// Readout parser stage
//

/// Serializes parser callbacks into ParsedEvents messages, flushing to the
/// output when a message fills up.
struct ParsedEventsWriter<'a> {
    context: &'a JobContext,
    output: &'a dyn OutputWriter,
    crate_id: u8,
    structure: ReadoutStructure,
    modules: Vec<ModuleData>,
    msg: Option<Vec<u8>>,
    message_number: u32,
    write_error: Option<Error>,
}

impl<'a> ParsedEventsWriter<'a> {
    fn new(
        context: &'a JobContext,
        output: &'a dyn OutputWriter,
        crate_id: u8,
        structure: ReadoutStructure,
    ) -> Self {
        Self {
            context,
            output,
            crate_id,
            structure,
            modules: Vec::new(),
            msg: None,
            message_number: 0,
            write_error: None,
        }
    }

    fn message(&mut self) -> &mut Vec<u8> {
        self.msg.get_or_insert_with(|| {
            self.message_number = self.message_number.wrapping_add(1);
            message::new_parsed_events_message(self.message_number, MESSAGE_RESERVE)
        })
    }

    fn flush(&mut self) {
        let Some(msg) = self.msg.take() else {
            return;
        };

        let msg_size = msg.len();
        let mut sw = StopWatch::start();

        match self.output.write_message(msg) {
            Ok(()) => {
                let mut counters = self.context.writer_counters().lock();
                counters.t_send += sw.interval();
                counters.t_total += sw.total();
                counters.messages_sent += 1;
                counters.bytes_sent += msg_size as u64;
                trace!("{}: sent parsed events message #{}", self.context.name(), self.message_number);
            }
            Err(e) => {
                warn!("{}: error writing parsed events message: {e}", self.context.name());
                self.write_error = Some(e);
            }
        }
    }

    fn flush_if_full(&mut self) {
        if self.msg.as_ref().is_some_and(|m| m.len() >= MESSAGE_RESERVE) {
            self.flush();
        }
    }
}

impl ParserCallbacks for ParsedEventsWriter<'_> {
    fn begin_event(&mut self, event_index: u8) {
        let module_count = self
            .structure
            .get(usize::from(event_index))
            .map(Vec::len)
            .unwrap_or(0);
        self.modules = vec![ModuleData::default(); module_count];

        for (mi, m) in self.modules.iter_mut().enumerate() {
            m.has_dynamic = self.structure[usize::from(event_index)][mi].has_dynamic;
        }
    }

    fn module_prefix(&mut self, _ei: u8, mi: u8, data: &[u32]) {
        self.modules[usize::from(mi)].prefix = data.to_vec();
    }

    fn module_dynamic(&mut self, _ei: u8, mi: u8, data: &[u32]) {
        self.modules[usize::from(mi)].dynamic = data.to_vec();
    }

    fn module_suffix(&mut self, _ei: u8, mi: u8, data: &[u32]) {
        self.modules[usize::from(mi)].suffix = data.to_vec();
    }

    fn end_event(&mut self, event_index: u8) {
        let crate_id = self.crate_id;
        let modules = std::mem::take(&mut self.modules);
        message::append_event_section(self.message(), crate_id, event_index, &modules);
        self.flush_if_full();
    }

    fn system_event(&mut self, data: &[u32]) {
        let crate_id = self.crate_id;
        message::append_system_event_section(self.message(), crate_id, data);
        self.flush_if_full();
    }
}

/// Parse ReadoutData messages into ParsedEvents messages.
pub fn readout_parser_loop(
    context: &JobContext,
    crate_id: u8,
    parser: &mut ReadoutParser,
    input: &InputReader,
    output: &dyn OutputWriter,
) -> LoopResult {
    let mut result = LoopResult::ok();
    let mut writer = ParsedEventsWriter::new(context, output, crate_id, parser_structure(parser));
    let mut last_flush = Instant::now();

    info!("{}: entering readout parser loop, crate{crate_id}", context.name());

    while !context.should_quit() {
        let mut sw = StopWatch::start();

        let msg = match input.read_message() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                result.error = Some(e);
                break;
            }
        };

        if message::is_shutdown_message(&msg) {
            info!("{}: received shutdown message, leaving loop", context.name());
            break;
        }

        let header = match message::parse_readout_data_header(&msg) {
            Ok(h) => h,
            Err(e) => {
                warn!("{}: bad input message: {e}", context.name());
                continue;
            }
        };

        let t_receive = sw.interval();

        let payload = message::readout_data_payload(&msg).unwrap_or(&[]);
        let words: Vec<u32> = payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        // Input message loss shows up as a buffer number gap and makes the
        // parser resynchronize.
        if let Err(e) = parser.parse_buffer(&mut writer, header.message_number, &words) {
            debug!("{}: parse error in message {}: {e}", context.name(), header.message_number);
        }

        let t_process = sw.interval();

        {
            let mut counters = context.reader_counters().lock();
            counters.bytes_received += msg.len() as u64;
            counters.messages_received += 1;
            counters.messages_lost = parser.counters.internal_buffer_loss;
            counters.t_receive += t_receive;
            counters.t_process += t_process;
            counters.t_total += sw.total();
        }

        if writer.msg.is_some() && last_flush.elapsed() >= FLUSH_TIMEOUT {
            writer.flush();
            last_flush = Instant::now();
        }

        if let Some(e) = writer.write_error.take() {
            result.error = Some(e);
            break;
        }
    }

    writer.flush();
    send_shutdown(output);

    log_parser_counters(context.name(), &parser.counters);
    info!("{}: leaving readout parser loop", context.name());
    result
}

fn parser_structure(parser: &ReadoutParser) -> ReadoutStructure {
    // The callbacks need the per-event module counts and dynamic flags
    // while the parser itself is mutably borrowed.
    parser.structure().clone()
}

fn log_parser_counters(name: &str, c: &crate::readout_parser::ParserCounters) {
    info!(
        "{name}: parser counters: buffers={}, events={}, system_events={}, \
         buffer_loss={}, eth_packets={}, eth_packet_loss={}, unused_bytes={}, exceptions={}",
        c.buffers_processed,
        c.events,
        c.system_events,
        c.internal_buffer_loss,
        c.eth_packets_processed,
        c.eth_packet_loss,
        c.unused_bytes,
        c.parser_exceptions,
    );

    for (error_name, count) in &c.parse_results {
        info!("{name}: parse result {error_name}: {count}");
    }
}

//
// Listfile writer stage
//

/// Write ReadoutData payloads to a listfile. With no handle the stage
/// drains and discards, which keeps the producer unthrottled on runs that
/// do not record.
pub fn listfile_writer_loop(
    context: &JobContext,
    input: &InputReader,
    mut handle: Option<Box<dyn WriteHandle>>,
) -> LoopResult {
    let mut result = LoopResult::ok();
    let mut last_message_numbers: HashMap<u8, u32> = HashMap::new();

    info!("{}: entering listfile writer loop", context.name());

    while !context.should_quit() {
        let mut sw = StopWatch::start();

        let msg = match input.read_message() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                result.error = Some(e);
                break;
            }
        };

        if message::is_shutdown_message(&msg) {
            info!("{}: received shutdown message, leaving loop", context.name());
            break;
        }

        let header = match message::parse_readout_data_header(&msg) {
            Ok(h) => h,
            Err(e) => {
                warn!("{}: bad input message: {e}", context.name());
                continue;
            }
        };

        let t_receive = sw.interval();

        let last = last_message_numbers.entry(header.crate_id).or_insert(0);
        let loss = calc_buffer_loss(header.message_number, *last);
        if loss > 0 {
            warn!(
                "{}: lost {loss} messages from crate{} (message_number={}, last={})",
                context.name(),
                header.crate_id,
                header.message_number,
                *last
            );
        }
        *last = header.message_number;

        if let Some(handle) = handle.as_mut() {
            match message::readout_data_payload(&msg) {
                Ok(payload) => {
                    if let Err(e) = handle.write(payload) {
                        // Keep draining; the recording is incomplete but the
                        // readout must not stall.
                        warn!("{}: error writing to listfile: {e}", context.name());
                    }
                }
                Err(e) => warn!("{}: {e}", context.name()),
            }
        }

        let t_process = sw.interval();

        let mut counters = context.reader_counters().lock();
        counters.bytes_received += msg.len() as u64;
        counters.messages_received += 1;
        counters.messages_lost += u64::from(loss);
        counters.t_receive += t_receive;
        counters.t_process += t_process;
        counters.t_total += sw.total();
    }

    if let Some(handle) = handle.as_mut() {
        if let Err(e) = handle.finalize() {
            warn!("{}: error finalizing listfile: {e}", context.name());
            if result.error.is_none() {
                result.error = Some(e);
            }
        }
    }

    info!("{}: leaving listfile writer loop", context.name());
    result
}

//
// Event consumer stage
//

/// Feed ParsedEvents messages to an [`EventConsumer`].
pub fn event_consumer_loop(
    context: &JobContext,
    input: &InputReader,
    consumer: &mut dyn EventConsumer,
) -> LoopResult {
    let mut result = LoopResult::ok();
    let mut last_message_number = 0u32;
    let mut lost_total = 0u64;

    info!("{}: entering event consumer loop", context.name());

    while !context.should_quit() {
        let mut sw = StopWatch::start();

        let msg = match input.read_message() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                result.error = Some(e);
                break;
            }
        };

        if message::is_shutdown_message(&msg) {
            info!("{}: received shutdown message, leaving loop", context.name());
            break;
        }

        let number = match message::message_number(&msg) {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: bad input message: {e}", context.name());
                continue;
            }
        };

        let t_receive = sw.interval();

        lost_total += u64::from(calc_buffer_loss(number, last_message_number));
        last_message_number = number;

        let sections = match message::ParsedSectionIter::new(&msg) {
            Ok(iter) => iter,
            Err(e) => {
                warn!("{}: bad parsed events message: {e}", context.name());
                continue;
            }
        };

        for section in sections {
            match section {
                Ok(message::ParsedSection::ReadoutEvent {
                    crate_id,
                    event_index,
                    modules,
                }) => {
                    consumer.begin_event(crate_id, event_index);
                    for (mi, m) in modules.iter().enumerate() {
                        consumer.module_data(crate_id, event_index, mi as u8, m);
                    }
                    consumer.end_event(crate_id, event_index);
                }
                Ok(message::ParsedSection::SystemEvent { crate_id, data }) => {
                    consumer.system_event(crate_id, &data);
                }
                Err(e) => {
                    warn!("{}: corrupt section in message {number}: {e}", context.name());
                    break;
                }
            }
        }

        let t_process = sw.interval();

        let mut counters = context.reader_counters().lock();
        counters.bytes_received += msg.len() as u64;
        counters.messages_received += 1;
        counters.messages_lost = lost_total;
        counters.t_receive += t_receive;
        counters.t_process += t_process;
        counters.t_total += sw.total();
    }

    info!("{}: leaving event consumer loop", context.name());
    result
}

//
// Spawn helpers
//

pub fn spawn_readout_producer(
    name: &str,
    mvlc: Arc<Mvlc>,
    crate_id: u8,
    output: Box<dyn OutputWriter>,
) -> JobHandle {
    let context = JobContext::new(name);
    start_job(context, move |ctx| {
        readout_producer_loop(&ctx, &mvlc, crate_id, output.as_ref())
    })
}

pub fn spawn_readout_parser(
    name: &str,
    crate_id: u8,
    mut parser: ReadoutParser,
    input: InputReader,
    output: Box<dyn OutputWriter>,
) -> JobHandle {
    let context = JobContext::new(name);
    start_job(context, move |ctx| {
        readout_parser_loop(&ctx, crate_id, &mut parser, &input, output.as_ref())
    })
}

pub fn spawn_listfile_writer(name: &str, input: InputReader, handle: Option<Box<dyn WriteHandle>>) -> JobHandle {
    let context = JobContext::new(name);
    start_job(context, move |ctx| listfile_writer_loop(&ctx, &input, handle))
}

pub fn spawn_event_consumer(name: &str, input: InputReader, mut consumer: Box<dyn EventConsumer>) -> JobHandle {
    let context = JobContext::new(name);
    start_job(context, move |ctx| event_consumer_loop(&ctx, &input, consumer.as_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, make_frame_header};
    use crate::pipeline::link;
    use crate::readout_parser::GroupReadoutStructure;
    use parking_lot::Mutex;

    fn parser_for(prefix_len: u8, has_dynamic: bool) -> ReadoutParser {
        ReadoutParser::from_structure(
            ConnectionType::Usb,
            vec![vec![GroupReadoutStructure {
                prefix_len,
                has_dynamic,
                suffix_len: 0,
            }]],
        )
    }

    fn readout_message(message_number: u32, words: &[u32]) -> Vec<u8> {
        let mut msg = message::new_readout_data_message(0, message_number, ConnectionType::Usb, 0);
        for w in words {
            msg.extend_from_slice(&w.to_le_bytes());
        }
        msg
    }

    #[derive(Default)]
    struct Counting {
        events: Arc<Mutex<Vec<(u8, u8)>>>,
        module_words: Arc<Mutex<usize>>,
        system_events: Arc<Mutex<usize>>,
    }

    impl EventConsumer for Counting {
        fn end_event(&mut self, crate_id: u8, event_index: u8) {
            self.events.lock().push((crate_id, event_index));
        }
        fn module_data(&mut self, _ci: u8, _ei: u8, _mi: u8, data: &ModuleData) {
            *self.module_words.lock() += data.prefix.len() + data.dynamic.len() + data.suffix.len();
        }
        fn system_event(&mut self, _ci: u8, _data: &[u32]) {
            *self.system_events.lock() += 1;
        }
    }

    #[test]
    fn parser_stage_end_to_end() {
        let (tx_in, rx_in) = link(4);
        let (tx_out, rx_out) = link(4);

        let parser = parser_for(2, false);
        let handle = spawn_readout_parser("parser test", 0, parser, rx_in, Box::new(tx_out));

        let words = [
            make_frame_header(FrameType::StackFrame, 0, 1, 0, 2),
            0xAAAA_0001,
            0xAAAA_0002,
        ];
        tx_in.write_message(readout_message(1, &words)).unwrap();
        send_shutdown(&tx_in);

        // First the parsed events message, then the forwarded shutdown.
        let mut parsed = None;
        loop {
            match rx_out.read_message().unwrap() {
                Some(msg) if message::is_shutdown_message(&msg) => break,
                Some(msg) => parsed = Some(msg),
                None => {}
            }
        }

        let parsed = parsed.expect("no parsed events message received");
        let sections: Vec<_> = message::ParsedSectionIter::new(&parsed)
            .unwrap()
            .collect::<crate::Result<_>>()
            .unwrap();

        assert_eq!(sections.len(), 1);
        match &sections[0] {
            message::ParsedSection::ReadoutEvent {
                crate_id,
                event_index,
                modules,
            } => {
                assert_eq!(*crate_id, 0);
                assert_eq!(*event_index, 0);
                assert_eq!(modules.len(), 1);
                assert_eq!(modules[0].prefix, vec![0xAAAA_0001, 0xAAAA_0002]);
                assert!(!modules[0].has_dynamic);
            }
            other => panic!("unexpected section {other:?}"),
        }

        assert!(!handle.join().has_error());
    }

    #[test]
    fn consumer_stage_counts_events() {
        let (tx_in, rx_in) = link(4);

        let consumer = Counting::default();
        let events = consumer.events.clone();
        let module_words = consumer.module_words.clone();
        let system_events = consumer.system_events.clone();

        let handle = spawn_event_consumer("consumer test", rx_in, Box::new(consumer));

        let mut msg = message::new_parsed_events_message(1, 0);
        message::append_event_section(
            &mut msg,
            2,
            1,
            &[ModuleData {
                prefix: vec![1, 2],
                dynamic: vec![],
                suffix: vec![],
                has_dynamic: false,
            }],
        );
        message::append_system_event_section(&mut msg, 2, &[0xFA00_0000]);
        tx_in.write_message(msg).unwrap();
        send_shutdown(&tx_in);

        assert!(!handle.join().has_error());
        assert_eq!(events.lock().as_slice(), &[(2, 1)]);
        assert_eq!(*module_words.lock(), 2);
        assert_eq!(*system_events.lock(), 1);
    }

    /// In-memory WriteHandle capturing everything written.
    struct CapturingHandle {
        data: Arc<Mutex<Vec<u8>>>,
        finalized: Arc<Mutex<bool>>,
    }

    impl WriteHandle for CapturingHandle {
        fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
            self.data.lock().extend_from_slice(data);
            Ok(data.len())
        }
        fn finalize(&mut self) -> crate::Result<()> {
            *self.finalized.lock() = true;
            Ok(())
        }
    }

    #[test]
    fn listfile_writer_stage_writes_payloads() {
        let (tx_in, rx_in) = link(4);

        let data = Arc::new(Mutex::new(Vec::new()));
        let finalized = Arc::new(Mutex::new(false));
        let handle = CapturingHandle {
            data: data.clone(),
            finalized: finalized.clone(),
        };

        let job = spawn_listfile_writer("listfile test", rx_in, Some(Box::new(handle)));

        let words = [make_frame_header(FrameType::StackFrame, 0, 1, 0, 1), 0x1234_5678];
        tx_in.write_message(readout_message(1, &words)).unwrap();
        // Skip message 2 to trigger loss accounting.
        tx_in.write_message(readout_message(3, &words)).unwrap();
        send_shutdown(&tx_in);

        let result = job.join();
        assert!(!result.has_error());
        assert!(*finalized.lock());

        let expected: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).chain(
            words.iter().flat_map(|w| w.to_le_bytes()),
        ).collect();
        assert_eq!(*data.lock(), expected);
    }
}

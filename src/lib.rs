/*! Data acquisition framework for the Mesytec MVLC VME readout controller.

This crate talks to one or more MVLC controllers over USB or UDP, drives
programmable VME readout stacks, streams the resulting binary event data
through a pipeline of decoding and reassembly stages, and persists raw
data to split, optionally compressed archive files.

# Architecture overview

A readout run is a chain of stages connected by bounded in-process message
links, each stage on its own thread:

```text
  VME crate --USB/UDP--> [ readout producer ]
                             ├──> [ listfile writer ]
                             └──> [ readout parser ] ──> [ event consumer ]
```

A replay run substitutes the producer with the listfile reader:

```text
  [ listfile reader ] --> [ replay demux ] --> per-crate [ parser ] --> ...
```

The main pieces:

* [`command`]: super and stack command programs, built with fluent
  builders and serialized to the controller's 32-bit word format.
* [`transport`], [`eth`], [`usb`]: duplex byte transports over the two
  logical MVLC pipes with per-pipe timeouts and statistics.
* [`dialog`]: framed request/mirror/response transactions with retry and
  stack error notification harvesting.
* [`mvlc`]: the owning controller handle, combining transport, dialog and
  DAQ start/stop.
* [`readout_parser`]: a resumable state machine reconstructing per-event,
  per-module data from the lossful continuation-framed readout stream.
* [`pipeline`], [`stages`]: the message-passing runtime with
  backpressure, counters, and graceful shutdown.
* [`listfile`]: the split/append ZIP archive format, co-designed with the
  parser so replays are byte-identical to live runs.
* [`replay`], [`multi_crate`]: listfile demultiplexing and the merged
  cross-crate event model.

# Example

Parsing a readout buffer without any hardware attached:

```
use mvlc_daq::readout_parser::{GroupReadoutStructure, ParserCallbacks, ReadoutParser};
use mvlc_daq::transport::ConnectionType;

struct PrintEvents;

impl ParserCallbacks for PrintEvents {
    fn module_prefix(&mut self, ei: u8, mi: u8, data: &[u32]) {
        println!("event {ei}, module {mi}: {data:x?}");
    }
}

// One readout stack, one module producing two prefix words per event.
let structure = vec![vec![GroupReadoutStructure {
    prefix_len: 2,
    has_dynamic: false,
    suffix_len: 0,
}]];

let mut parser = ReadoutParser::from_structure(ConnectionType::Usb, structure);
let mut sink = PrintEvents;

// A StackFrame for stack 1 carrying the two words.
let buffer = [0xF301_0002u32, 0xAAAA_0001, 0xAAAA_0002];
parser.parse_buffer(&mut sink, 1, &buffer)?;
assert_eq!(parser.counters.events, 1);
# Ok::<(), mvlc_daq::readout_parser::ParseError>(())
```
*/

pub mod command;
pub mod config;
pub mod dialog;
pub mod eth;
pub mod frame;
pub mod listfile;
pub mod message;
pub mod multi_crate;
pub mod mvlc;
pub mod pipeline;
pub mod readout_parser;
pub mod replay;
pub mod stages;
pub mod transport;
pub mod usb;

/// Crate wide error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying OS level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Config (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Transport errors.
    /// The connection to the controller failed or broke.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A read or write did not complete in time.
    #[error("timeout")]
    Timeout,

    /// Fewer bytes transferred than required.
    #[error("short transfer: expected {expected} bytes, got {got}")]
    ShortTransfer {
        /// Bytes required.
        expected: usize,
        /// Bytes actually transferred.
        got: usize,
    },

    /// The USB FIFO chip is not configured for streaming.
    #[error("USB chip configuration invalid for streaming")]
    ChipConfigError,

    /// Hostname resolution failed.
    #[error("host lookup failed for {0}")]
    HostLookupError(String),

    /// No usable pair of consecutive local UDP ports.
    #[error("binding local ports failed")]
    BindError,

    /// The device is already opened by another process.
    #[error("device in use")]
    InUse,

    /// Operation not available on this backend or build.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    // Protocol errors.
    /// Mirror check on an empty request.
    #[error("mirror check: empty request")]
    MirrorEmptyRequest,

    /// Mirror check on an empty response.
    #[error("mirror check: empty response")]
    MirrorEmptyResponse,

    /// The mirror response is shorter than the request.
    #[error("mirror check: response too short")]
    MirrorShortResponse,

    /// The mirror response does not echo the request.
    #[error("mirror check: response does not match request")]
    MirrorNotEqual,

    /// All mirror transaction retries timed out.
    #[error("mirror transaction: max retries exceeded")]
    MirrorMaxRetriesExceeded,

    /// A transaction response has the wrong size.
    #[error("unexpected response size: expected {expected} words, got {got}")]
    UnexpectedResponseSize {
        /// Expected word count.
        expected: usize,
        /// Received word count.
        got: usize,
    },

    /// A response frame failed the caller's header validation.
    #[error("unexpected buffer header {0:#010x}")]
    UnexpectedBufferHeader(u32),

    /// A response word is not a known frame header.
    #[error("invalid buffer header {0:#010x}")]
    InvalidBufferHeader(u32),

    /// A stack response frame is not a stack frame.
    #[error("invalid stack frame header {0:#010x}")]
    InvalidStackHeader(u32),

    /// The controller flagged a stack syntax error.
    #[error("stack syntax error")]
    StackSyntaxError,

    /// The VME bus did not answer (frame timeout flag).
    #[error("no VME response")]
    NoVMEResponse,

    /// More input is required to finish decoding.
    #[error("need more data")]
    NeedMoreData,

    /// A datagram carried an out of range packet channel.
    #[error("UDP packet channel {0} out of range")]
    UdpPacketChannelOutOfRange(u8),

    /// No matching response frame arrived within the wait budget.
    #[error("read response: max wait exceeded")]
    ReadResponseMaxWaitExceeded,

    // Codec errors.
    /// Unknown command opcode in a buffer being decoded.
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    /// A buffer ended in the middle of a multi-word command.
    #[error("truncated input")]
    TruncatedInput,

    /// The command has no wire representation.
    #[error("command not serializable: {0}")]
    NotSerializable(&'static str),

    /// A stack program does not fit into the available stack memory.
    #[error("stack memory exceeded")]
    StackMemoryExceeded,

    /// A crate config violates a structural invariant.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Listfile archive error.
    #[error("archive error: {0}")]
    Archive(String),

    // Pipeline errors.
    /// The other end of a pipeline link is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// An in-process message is shorter than its header.
    #[error("message too short ({0} bytes)")]
    MessageTooShort(usize),

    /// An in-process message has an unexpected type.
    #[error("wrong message type {0:#04x}")]
    WrongMessageType(u8),

    /// Readout stream parse error.
    #[error(transparent)]
    Parse(#[from] readout_parser::ParseError),
}

/// Crate wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

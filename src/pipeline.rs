/*! Pipeline runtime.

A pipeline is a linear chain of stages, each running on its own OS thread,
connected by bounded in-process message links. The default link blocks the
producer when the consumer falls behind, so backpressure propagates
upstream. Lossy broadcast links drop messages on the producer side instead;
they are used for snoop outputs that must never stall the readout.

Cancellation is cooperative: a stage polls its quit flag around every
blocking read, which uses a short timeout. Graceful shutdown is in-band: a
distinguished shutdown message flows through the links; each stage forwards
it and exits.
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};

use crate::message;
use crate::{Error, Result};

/// A message travelling between stages. Owned bytes; the layout is defined
/// in [`crate::message`].
pub type Message = Vec<u8>;

/// Default bound of a blocking link.
pub const DEFAULT_LINK_CAPACITY: usize = 16;

/// Poll interval for cooperative cancellation at blocking reads.
pub const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Final state of a stage loop.
#[derive(Debug, Default)]
pub struct LoopResult {
    pub error: Option<Error>,
}

impl LoopResult {
    #[must_use]
    pub fn ok() -> LoopResult {
        LoopResult::default()
    }

    #[must_use]
    pub fn from_error(e: Error) -> LoopResult {
        LoopResult { error: Some(e) }
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl std::fmt::Display for LoopResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            None => write!(f, "Ok"),
            Some(e) => write!(f, "error={e}"),
        }
    }
}

/// Reading end of a link.
pub struct InputReader {
    rx: Receiver<Message>,
}

impl InputReader {
    /// Read one message. `Ok(None)` means the poll timeout elapsed; check
    /// the quit flag and retry.
    pub fn read_message(&self) -> Result<Option<Message>> {
        match self.rx.recv_timeout(READ_POLL_TIMEOUT) {
            Ok(msg) => Ok(Some(msg)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }
}

/// Writing end of one or more links.
pub trait OutputWriter: Send {
    fn write_message(&self, msg: Message) -> Result<()>;
}

/// Blocking bounded writer: stalls the caller when the link is full.
pub struct LinkWriter {
    tx: Sender<Message>,
}

impl OutputWriter for LinkWriter {
    fn write_message(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::ChannelClosed)
    }
}

/// Create a bounded blocking link.
#[must_use]
pub fn link(capacity: usize) -> (LinkWriter, InputReader) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (LinkWriter { tx }, InputReader { rx })
}

/// Lossy fan-out writer: a full or closed subscriber loses the message,
/// the others still get their copy.
#[derive(Default)]
pub struct BroadcastWriter {
    subscribers: Vec<Sender<Message>>,
    dropped: AtomicU64,
}

impl BroadcastWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscriber(&mut self, capacity: usize) -> InputReader {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        self.subscribers.push(tx);
        InputReader { rx }
    }

    /// Messages dropped so far across all subscribers.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl OutputWriter for BroadcastWriter {
    fn write_message(&self, msg: Message) -> Result<()> {
        for tx in &self.subscribers {
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

/// Fan out to several writers, e.g. the parser link plus a listfile link.
#[derive(Default)]
pub struct MultiWriter {
    writers: Vec<Box<dyn OutputWriter>>,
}

impl MultiWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, writer: Box<dyn OutputWriter>) {
        self.writers.push(writer);
    }
}

impl OutputWriter for MultiWriter {
    fn write_message(&self, msg: Message) -> Result<()> {
        // The last writer gets the original, earlier ones a copy.
        for w in &self.writers[..self.writers.len().saturating_sub(1)] {
            w.write_message(msg.clone())?;
        }
        if let Some(last) = self.writers.last() {
            last.write_message(msg)?;
        }
        Ok(())
    }
}

/// Per-stage throughput and timing counters.
#[derive(Clone, Debug, Default)]
pub struct StageCounters {
    pub bytes_received: u64,
    pub messages_received: u64,
    pub messages_lost: u64,
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub t_receive: Duration,
    pub t_process: Duration,
    pub t_send: Duration,
    pub t_total: Duration,
}

/// Counters shared between a stage and its monitors. The mutex makes a
/// multi-field snapshot consistent.
pub type SharedCounters = Arc<parking_lot::Mutex<StageCounters>>;

/// Measures the intervals between processing phases of one message.
pub struct StopWatch {
    start: Instant,
    last: Instant,
}

impl StopWatch {
    #[must_use]
    pub fn start() -> StopWatch {
        let now = Instant::now();
        StopWatch { start: now, last: now }
    }

    /// Time since the last interval call.
    pub fn interval(&mut self) -> Duration {
        let now = Instant::now();
        let dt = now - self.last;
        self.last = now;
        dt
    }

    /// Time since construction.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Everything a stage loop needs besides its reader/writer.
#[derive(Clone)]
pub struct JobContext {
    name: Arc<String>,
    quit: Arc<AtomicBool>,
    reader_counters: SharedCounters,
    writer_counters: SharedCounters,
}

impl JobContext {
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> JobContext {
        JobContext {
            name: Arc::new(name.into()),
            quit: Arc::new(AtomicBool::new(false)),
            reader_counters: SharedCounters::default(),
            writer_counters: SharedCounters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn set_quit(&self, b: bool) {
        self.quit.store(b, Ordering::Release);
    }

    #[must_use]
    pub fn reader_counters(&self) -> &SharedCounters {
        &self.reader_counters
    }

    #[must_use]
    pub fn writer_counters(&self) -> &SharedCounters {
        &self.writer_counters
    }
}

/// A running stage: context plus its thread.
pub struct JobHandle {
    context: JobContext,
    thread: std::thread::JoinHandle<LoopResult>,
}

impl JobHandle {
    #[must_use]
    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn set_quit(&self, b: bool) {
        self.context.set_quit(b);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the stage to exit and log its final state.
    pub fn join(self) -> LoopResult {
        let name = self.context.name().to_string();
        let result = match self.thread.join() {
            Ok(r) => r,
            Err(_) => LoopResult::from_error(Error::ChannelClosed),
        };

        let reader = self.context.reader_counters.lock().clone();
        let writer = self.context.writer_counters.lock().clone();
        info!(
            "{name}: result={result}, received {} messages / {} bytes (lost {}), sent {} messages / {} bytes",
            reader.messages_received, reader.bytes_received, reader.messages_lost, writer.messages_sent, writer.bytes_sent,
        );

        result
    }
}

/// Spawn a stage loop on its own named thread.
pub fn start_job<F>(context: JobContext, f: F) -> JobHandle
where
    F: FnOnce(JobContext) -> LoopResult + Send + 'static,
{
    let thread_context = context.clone();
    let name = context.name().to_string();

    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            debug!("entering {}", thread_context.name());
            let result = f(thread_context.clone());
            debug!("leaving {} ({result})", thread_context.name());
            result
        })
        .expect("spawning stage thread");

    JobHandle { context, thread }
}

/// Gracefully stop a pipeline: quit the first stage, whose shutdown message
/// drains through the links, then join every stage in order.
pub fn shutdown_pipeline(handles: Vec<JobHandle>) -> Vec<LoopResult> {
    if let Some(first) = handles.first() {
        first.set_quit(true);
    }

    handles
        .into_iter()
        .map(|h| {
            let r = h.join();
            if r.has_error() {
                warn!("stage finished with {r}");
            }
            r
        })
        .collect()
}

/// Forward the shutdown message to an output, ignoring closed links.
pub fn send_shutdown(writer: &dyn OutputWriter) {
    if writer.write_message(message::shutdown_message()).is_err() {
        debug!("shutdown message dropped, link already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_fifo() -> Result<()> {
        let (tx, rx) = link(8);
        for i in 0..5u32 {
            tx.write_message(i.to_le_bytes().to_vec())?;
        }
        for i in 0..5u32 {
            let msg = rx.read_message()?.unwrap();
            assert_eq!(msg, i.to_le_bytes().to_vec());
        }
        assert!(rx.read_message()?.is_none());
        Ok(())
    }

    #[test]
    fn bounded_link_applies_backpressure() -> Result<()> {
        let (tx, rx) = link(1);
        tx.write_message(vec![1])?;

        let blocked = std::thread::spawn(move || {
            tx.write_message(vec![2]).unwrap();
            tx.write_message(vec![3]).unwrap();
        });

        // The sender can only finish once this side drains.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        assert_eq!(rx.read_message()?.unwrap(), vec![1]);
        assert_eq!(rx.read_message()?.unwrap(), vec![2]);
        assert_eq!(rx.read_message()?.unwrap(), vec![3]);
        blocked.join().unwrap();
        Ok(())
    }

    #[test]
    fn closed_link_reports_channel_closed() {
        let (tx, rx) = link(1);
        drop(rx);
        assert!(matches!(tx.write_message(vec![1]), Err(Error::ChannelClosed)));

        let (tx, rx) = link(1);
        drop(tx);
        assert!(matches!(rx.read_message(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn broadcast_drops_when_full() -> Result<()> {
        let mut bc = BroadcastWriter::new();
        let fast = bc.add_subscriber(8);
        let slow = bc.add_subscriber(1);

        bc.write_message(vec![1])?;
        bc.write_message(vec![2])?; // slow subscriber's queue is full

        assert_eq!(bc.dropped(), 1);
        assert_eq!(fast.read_message()?.unwrap(), vec![1]);
        assert_eq!(fast.read_message()?.unwrap(), vec![2]);
        assert_eq!(slow.read_message()?.unwrap(), vec![1]);
        assert!(slow.read_message()?.is_none());
        Ok(())
    }

    #[test]
    fn job_runs_and_joins() {
        let context = JobContext::new("test job");
        let handle = start_job(context, |ctx| {
            while !ctx.should_quit() {
                std::thread::sleep(Duration::from_millis(1));
            }
            LoopResult::ok()
        });

        handle.set_quit(true);
        let result = handle.join();
        assert!(!result.has_error());
    }

    #[test]
    fn shutdown_message_passes_through_stage() -> Result<()> {
        let (tx_in, rx_in) = link(4);
        let (tx_out, rx_out) = link(4);

        let context = JobContext::new("forwarder");
        let handle = start_job(context, move |ctx| {
            while !ctx.should_quit() {
                match rx_in.read_message() {
                    Ok(Some(msg)) => {
                        let shutdown = message::is_shutdown_message(&msg);
                        tx_out.write_message(msg).unwrap();
                        if shutdown {
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
            LoopResult::ok()
        });

        tx_in.write_message(vec![9, 9, 9, 9, 0, 0, 0, 0])?;
        send_shutdown(&tx_in);

        let first = rx_out.read_message()?.unwrap();
        assert!(!message::is_shutdown_message(&first));
        let second = rx_out.read_message()?.unwrap();
        assert!(message::is_shutdown_message(&second));

        assert!(!handle.join().has_error());
        Ok(())
    }
}

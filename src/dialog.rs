/*! Request/response dialog with the MVLC.

Every super command buffer written to the command pipe is answered with a
mirror: the MVLC echoes the uploaded words framed as a SuperFrame. The
dialog verifies the mirror before trusting any transaction, retries on
timeouts, and harvests asynchronous stack error notification frames that
the controller interleaves into the response stream.

A dialog instance is not thread safe; the owning controller handle
serializes access through the command pipe lock.
*/
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::command::{SuperCommandBuilder, make_command_buffer, stacks};
use crate::frame::{self, extract_frame_info};
use crate::transport::{Pipe, Transport};
use crate::{Error, Result};

/// Retry bound for mirror transactions hitting transport timeouts.
pub const MIRROR_MAX_RETRIES: u32 = 3;

/// Wall-clock budget for finding a matching response frame.
pub const READ_RESPONSE_MAX_WAIT: Duration = Duration::from_secs(60);

// Workaround for USB2 devices: a read can time out despite data being
// queued at the endpoint; the immediate second read succeeds.
const MAX_READ_ATTEMPTS: u32 = 2;

/// Compare a mirror response against the request.
///
/// Word 0 of the response is the MVLC assigned frame header and the last
/// request word is the buffer end marker; everything in between must match.
pub fn check_mirror(request: &[u32], response: &[u32]) -> Result<()> {
    if request.is_empty() {
        return Err(Error::MirrorEmptyRequest);
    }
    if response.is_empty() {
        return Err(Error::MirrorEmptyResponse);
    }
    if response.len() < request.len() - 1 {
        return Err(Error::MirrorShortResponse);
    }

    for i in 1..request.len() - 1 {
        if request[i] != response[i] {
            return Err(Error::MirrorNotEqual);
        }
    }

    Ok(())
}

pub struct Dialog {
    transport: Arc<dyn Transport>,
    /// Monotonic 16-bit counter prepended to outgoing command buffers so
    /// responses can be correlated after packet loss.
    reference_word: u16,
    /// StackError frames received while waiting for responses.
    stack_error_notifications: Vec<Vec<u32>>,
}

impl Dialog {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            reference_word: 1,
            stack_error_notifications: Vec::new(),
        }
    }

    fn next_reference_word(&mut self) -> u16 {
        let v = self.reference_word;
        self.reference_word = self.reference_word.wrapping_add(1);
        v
    }

    /// Drain the queued stack error notification frames.
    pub fn take_stack_error_notifications(&mut self) -> Vec<Vec<u32>> {
        std::mem::take(&mut self.stack_error_notifications)
    }

    fn write_words(&self, buffer: &[u32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(buffer.len() * 4);
        for w in buffer {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.transport.write(Pipe::Command, &bytes)?;
        Ok(())
    }

    /// Read exactly `count` words from the command pipe.
    fn read_words(&self, count: usize) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut bytes = vec![0u8; count * 4];

        for attempt in 0..MAX_READ_ATTEMPTS {
            let res = self.transport.read(Pipe::Command, &mut bytes);

            match res.error {
                Some(Error::Timeout) if res.bytes_transferred == 0 && attempt + 1 < MAX_READ_ATTEMPTS => {
                    continue;
                }
                Some(e) => return Err(e),
                None => {}
            }

            if res.bytes_transferred != bytes.len() {
                return Err(Error::ShortTransfer {
                    expected: bytes.len(),
                    got: res.bytes_transferred,
                });
            }

            return Ok(bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect());
        }

        Err(Error::Timeout)
    }

    /// Read one whole frame: a known header word plus its payload.
    fn read_known_buffer(&self) -> Result<Vec<u32>> {
        let header = self.read_words(1)?[0];

        if !frame::is_known_frame_header(header) {
            return Err(Error::InvalidBufferHeader(header));
        }

        let len = usize::from(extract_frame_info(header).len);
        let mut result = Vec::with_capacity(1 + len);
        result.push(header);
        result.extend(self.read_words(len)?);
        Ok(result)
    }

    /// Read whole frames until one passes `validator`.
    ///
    /// StackError frames are diverted into the notification queue instead of
    /// being returned. Any other non-matching frame fails with
    /// `UnexpectedBufferHeader`. The total wait is bounded by
    /// [`READ_RESPONSE_MAX_WAIT`].
    pub fn read_response<V>(&mut self, validator: V) -> Result<Vec<u32>>
    where
        V: Fn(u32) -> bool,
    {
        let t_start = Instant::now();

        loop {
            let buffer = self.read_known_buffer()?;
            debug_assert!(!buffer.is_empty());
            let header = buffer[0];

            if frame::is_stack_error(header) {
                trace!("diverting stack error notification, header={header:#010x}");
                self.stack_error_notifications.push(buffer);

                if t_start.elapsed() >= READ_RESPONSE_MAX_WAIT {
                    return Err(Error::ReadResponseMaxWaitExceeded);
                }
                continue;
            }

            if !validator(header) {
                warn!("response header validation failed, header={header:#010x}");
                return Err(Error::UnexpectedBufferHeader(header));
            }

            return Ok(buffer);
        }
    }

    /// Write a command buffer and verify the mirror response. Transport
    /// timeouts are retried up to [`MIRROR_MAX_RETRIES`] times.
    pub fn mirror_transaction(&mut self, request: &[u32]) -> Result<Vec<u32>> {
        for attempt in 0..MIRROR_MAX_RETRIES {
            if let Err(e) = self.write_words(request) {
                warn!("mirror write error: {e} (attempt {} of {MIRROR_MAX_RETRIES})", attempt + 1);
                if matches!(e, Error::Timeout) {
                    continue;
                }
                return Err(e);
            }

            match self.read_response(frame::is_super_frame) {
                Err(e) => {
                    warn!("mirror read error: {e} (attempt {} of {MIRROR_MAX_RETRIES})", attempt + 1);
                    if matches!(e, Error::Timeout) {
                        continue;
                    }
                    return Err(e);
                }
                Ok(response) => {
                    check_mirror(request, &response)?;
                    return Ok(response);
                }
            }
        }

        Err(Error::MirrorMaxRetriesExceeded)
    }

    /// Upload a stack-0 program and execute it immediately, returning the
    /// concatenated response frames (headers included).
    ///
    /// `upload` is the super command buffer produced from
    /// [`crate::command::make_stack_upload_commands`].
    pub fn stack_transaction(&mut self, upload: &[u32]) -> Result<Vec<u32>> {
        self.mirror_transaction(upload)?;

        self.write_register(stacks::get_offset_register(stacks::IMMEDIATE_STACK_ID), 0)?;
        self.write_register(
            stacks::get_trigger_register(stacks::IMMEDIATE_STACK_ID),
            1u32 << stacks::IMMEDIATE_SHIFT,
        )?;

        let mut dest = self.read_response(frame::is_stack_frame)?;
        debug_assert!(!dest.is_empty());

        let mut flags = extract_frame_info(dest[0]).flags;

        while flags & frame::frame_flags::CONTINUE != 0 {
            let continuation = self.read_response(frame::is_stack_continuation)?;
            flags = extract_frame_info(continuation[0]).flags;
            dest.extend(continuation);
        }

        if flags & frame::frame_flags::TIMEOUT != 0 {
            return Err(Error::NoVMEResponse);
        }
        if flags & frame::frame_flags::SYNTAX_ERROR != 0 {
            return Err(Error::StackSyntaxError);
        }

        Ok(dest)
    }

    /// Read one internal MVLC register.
    pub fn read_register(&mut self, address: u16) -> Result<u32> {
        let reference = self.next_reference_word();
        let request = make_command_buffer(
            &SuperCommandBuilder::new()
                .add_reference_word(reference)
                .add_read_local(address)
                .get_commands(),
        );

        trace!("read_register {address:#06x}");
        let response = self.mirror_transaction(&request)?;

        if response.len() < 4 {
            return Err(Error::UnexpectedResponseSize {
                expected: 4,
                got: response.len(),
            });
        }

        Ok(response[3])
    }

    /// Write one internal MVLC register.
    pub fn write_register(&mut self, address: u16, value: u32) -> Result<()> {
        let reference = self.next_reference_word();
        let request = make_command_buffer(
            &SuperCommandBuilder::new()
                .add_reference_word(reference)
                .add_write_local(address, value)
                .get_commands(),
        );

        trace!("write_register {address:#06x} = {value:#010x}");
        let response = self.mirror_transaction(&request)?;

        if response.len() != 4 {
            return Err(Error::UnexpectedResponseSize {
                expected: 4,
                got: response.len(),
            });
        }

        Ok(())
    }

    fn stack_transaction_for(&mut self, stack: crate::command::StackCommandBuilder) -> Result<Vec<u32>> {
        let reference = self.next_reference_word();
        let words = crate::command::make_stack_buffer(&stack.get_commands())?;
        let commands = SuperCommandBuilder::new()
            .add_reference_word(reference)
            .add_commands(&crate::command::make_stack_upload_commands(
                Pipe::Command as u8,
                0,
                &words,
            ))
            .get_commands();

        self.stack_transaction(&make_command_buffer(&commands))
    }

    /// Single VME read through an immediate stack.
    pub fn vme_read(&mut self, address: u32, amod: u8, data_width: crate::command::VMEDataWidth) -> Result<u32> {
        let response = self.stack_transaction_for(
            crate::command::StackCommandBuilder::new().add_vme_read(address, amod, data_width),
        )?;

        if response.len() != 2 {
            return Err(Error::UnexpectedResponseSize {
                expected: 2,
                got: response.len(),
            });
        }

        let mask = match data_width {
            crate::command::VMEDataWidth::D16 => 0x0000_ffff,
            crate::command::VMEDataWidth::D32 => 0xffff_ffff,
        };

        Ok(response[1] & mask)
    }

    /// Single VME write through an immediate stack.
    pub fn vme_write(
        &mut self,
        address: u32,
        value: u32,
        amod: u8,
        data_width: crate::command::VMEDataWidth,
    ) -> Result<()> {
        let response = self.stack_transaction_for(
            crate::command::StackCommandBuilder::new().add_vme_write(address, value, amod, data_width),
        )?;

        if response.len() != 1 {
            return Err(Error::UnexpectedResponseSize {
                expected: 1,
                got: response.len(),
            });
        }

        Ok(())
    }

    /// VME block read through an immediate stack. Returns the raw response
    /// frames; use [`crate::mvlc::parse_stack_response`] to extract the
    /// payload.
    pub fn vme_block_read(&mut self, address: u32, amod: u8, max_transfers: u16) -> Result<Vec<u32>> {
        let response = self.stack_transaction_for(
            crate::command::StackCommandBuilder::new().add_vme_block_read(address, amod, max_transfers),
        )?;
        debug!("vme_block_read: {} response words", response.len());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, frame_flags, make_frame_header};
    use crate::transport::{ConnectionType, PIPE_COUNT, PipeStats, ReadResult};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted transport: reads serve queued words, writes are recorded.
    struct ScriptedTransport {
        rx: Mutex<VecDeque<u8>>,
        tx: Mutex<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(VecDeque::new()),
                tx: Mutex::new(Vec::new()),
            })
        }

        fn queue_words(&self, words: &[u32]) {
            let mut rx = self.rx.lock();
            for w in words {
                rx.extend(w.to_le_bytes());
            }
        }

        fn written_words(&self) -> Vec<u32> {
            self.tx
                .lock()
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn connection_type(&self) -> ConnectionType {
            ConnectionType::Usb
        }

        fn write(&self, _pipe: Pipe, data: &[u8]) -> Result<usize> {
            self.tx.lock().extend_from_slice(data);
            Ok(data.len())
        }

        fn read(&self, _pipe: Pipe, dest: &mut [u8]) -> ReadResult {
            let mut rx = self.rx.lock();
            let mut copied = 0;
            while copied < dest.len() {
                match rx.pop_front() {
                    Some(b) => {
                        dest[copied] = b;
                        copied += 1;
                    }
                    None => {
                        return ReadResult {
                            bytes_transferred: copied,
                            error: Some(Error::Timeout),
                        };
                    }
                }
            }
            ReadResult::ok(copied)
        }

        fn set_read_timeout(&mut self, _pipe: Pipe, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn read_timeout(&self, _pipe: Pipe) -> Duration {
            Duration::from_millis(1)
        }

        fn pipe_stats(&self) -> [PipeStats; PIPE_COUNT] {
            Default::default()
        }
    }

    // The mirror of a request: a SuperFrame echoing the words between the
    // buffer start/end markers, followed by any produced result words.
    fn mirror_response(request: &[u32], results: &[u32]) -> Vec<u32> {
        let body_len = request.len() - 2 + results.len();
        let mut resp = vec![make_frame_header(FrameType::SuperFrame, 0, 0, 0, body_len as u16)];
        resp.extend_from_slice(&request[1..request.len() - 1]);
        resp.extend_from_slice(results);
        resp
    }

    #[test]
    fn check_mirror_cases() {
        let req = [0xF100_0000, 0x0101_0001, 0x0102_1337, 0xF200_0000];
        let good = [0xF100_0003, 0x0101_0001, 0x0102_1337, 0xdead_beef];
        assert!(check_mirror(&req, &good).is_ok());

        assert!(matches!(check_mirror(&[], &good), Err(Error::MirrorEmptyRequest)));
        assert!(matches!(check_mirror(&req, &[]), Err(Error::MirrorEmptyResponse)));
        assert!(matches!(
            check_mirror(&req, &good[..2]),
            Err(Error::MirrorShortResponse)
        ));

        let bad = [0xF100_0003, 0x0101_0002, 0x0102_1337, 0xdead_beef];
        assert!(matches!(check_mirror(&req, &bad), Err(Error::MirrorNotEqual)));
    }

    #[test]
    fn read_register_transaction() -> Result<()> {
        let transport = ScriptedTransport::new();
        let mut dialog = Dialog::new(transport.clone());

        // Expected request: buffer start, ref word 1, read local, buffer end.
        let request = [0xF100_0000, 0x0101_0001, 0x0102_6008, 0xF200_0000];
        transport.queue_words(&mirror_response(&request, &[0x0000_5008]));

        let value = dialog.read_register(0x6008)?;
        assert_eq!(value, 0x5008);
        assert_eq!(transport.written_words(), request);
        Ok(())
    }

    #[test]
    fn stack_error_notifications_are_diverted() -> Result<()> {
        let transport = ScriptedTransport::new();
        let mut dialog = Dialog::new(transport.clone());

        let request = [0xF100_0000, 0x0101_0001, 0x0102_6008, 0xF200_0000];
        let notification = [make_frame_header(FrameType::StackError, 0, 2, 0, 1), 0x0001_0002];
        transport.queue_words(&notification);
        transport.queue_words(&mirror_response(&request, &[42]));

        assert_eq!(dialog.read_register(0x6008)?, 42);

        let notifications = dialog.take_stack_error_notifications();
        assert_eq!(notifications, vec![notification.to_vec()]);
        assert!(dialog.take_stack_error_notifications().is_empty());
        Ok(())
    }

    #[test]
    fn mirror_mismatch_is_detected() {
        let transport = ScriptedTransport::new();
        let mut dialog = Dialog::new(transport.clone());

        let request = [0xF100_0000, 0x0101_0001, 0x0102_6008, 0xF200_0000];
        let mut response = mirror_response(&request, &[42]);
        response[2] = 0x0102_9999; // corrupt the echoed command
        transport.queue_words(&response);

        assert!(matches!(dialog.read_register(0x6008), Err(Error::MirrorNotEqual)));
    }

    #[test]
    fn unexpected_header_is_detected() {
        let transport = ScriptedTransport::new();
        let mut dialog = Dialog::new(transport.clone());

        // A stack frame where a super frame mirror is expected.
        transport.queue_words(&[make_frame_header(FrameType::StackFrame, 0, 0, 0, 0)]);

        assert!(matches!(
            dialog.read_register(0x6008),
            Err(Error::UnexpectedBufferHeader(_))
        ));
    }

    #[test]
    fn stack_transaction_concatenates_continuations() -> Result<()> {
        let transport = ScriptedTransport::new();
        let mut dialog = Dialog::new(transport.clone());

        // Upload request mirror.
        let upload = [0xF100_0000, 0x0204_2000, 0xF300_0000, 0xF200_0000];
        transport.queue_words(&mirror_response(&upload, &[]));

        // Mirrors for the offset and trigger register writes.
        let offset_req = [0xF100_0000, 0x0101_0001, 0x0204_1200, 0x0000_0000, 0xF200_0000];
        transport.queue_words(&mirror_response(&offset_req, &[]));
        let trigger_req = [0xF100_0000, 0x0101_0002, 0x0204_1100, 0x0000_0100, 0xF200_0000];
        transport.queue_words(&mirror_response(&trigger_req, &[]));

        // Stack response: one frame with Continue, one continuation.
        transport.queue_words(&[
            make_frame_header(FrameType::StackFrame, frame_flags::CONTINUE, 0, 0, 2),
            0x11,
            0x22,
        ]);
        transport.queue_words(&[
            make_frame_header(FrameType::StackContinuation, 0, 0, 0, 1),
            0x33,
        ]);

        let response = dialog.stack_transaction(&upload)?;
        assert_eq!(response.len(), 5);
        assert_eq!(response[1], 0x11);
        assert_eq!(response[2], 0x22);
        assert_eq!(response[4], 0x33);
        Ok(())
    }

    #[test]
    fn stack_transaction_vme_timeout() {
        let transport = ScriptedTransport::new();
        let mut dialog = Dialog::new(transport.clone());

        let upload = [0xF100_0000, 0x0204_2000, 0xF300_0000, 0xF200_0000];
        transport.queue_words(&mirror_response(&upload, &[]));
        let offset_req = [0xF100_0000, 0x0101_0001, 0x0204_1200, 0x0000_0000, 0xF200_0000];
        transport.queue_words(&mirror_response(&offset_req, &[]));
        let trigger_req = [0xF100_0000, 0x0101_0002, 0x0204_1100, 0x0000_0100, 0xF200_0000];
        transport.queue_words(&mirror_response(&trigger_req, &[]));

        transport.queue_words(&[make_frame_header(
            FrameType::StackFrame,
            frame_flags::TIMEOUT,
            0,
            0,
            0,
        )]);

        assert!(matches!(dialog.stack_transaction(&upload), Err(Error::NoVMEResponse)));
    }
}

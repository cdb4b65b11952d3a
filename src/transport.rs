/*! Byte transport to an MVLC controller.

The MVLC exposes two logical pipes: the command pipe for dialog traffic and
the data pipe for autonomous readout output. Both are independently
readable and writable with their own timeouts. [`Transport`] abstracts over
the USB and ETH backends.

A transport owns its OS handles. Reconnecting after an error means dropping
the instance and creating a fresh one.
*/
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The two logical MVLC pipes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Pipe {
    Command = 0,
    Data = 1,
}

pub const PIPE_COUNT: usize = 2;

/// Kind of controller connection. Also selects the listfile magic and the
/// parser's outer framing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Usb,
    Eth,
}

/// The write timeout applies to USB only; ETH sends are blocking socket
/// writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of a pipe read.
///
/// A read that transfers some bytes and then hits a timeout reports both
/// the partial count and the error.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub bytes_transferred: usize,
    pub error: Option<Error>,
}

impl ReadResult {
    #[must_use]
    pub fn ok(bytes_transferred: usize) -> Self {
        Self {
            bytes_transferred,
            error: None,
        }
    }

    #[must_use]
    pub fn err(error: Error) -> Self {
        Self {
            bytes_transferred: 0,
            error: Some(error),
        }
    }
}

/// Data channels multiplexed onto the ETH pipes. Each channel has its own
/// 12-bit packet number counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketChannel {
    /// Command and mirror responses.
    Command = 0,
    /// Stack output routed to the command pipe.
    Stack = 1,
    /// Readout data routed to the data pipe.
    Data = 2,
}

pub const PACKET_CHANNEL_COUNT: usize = 3;

impl PacketChannel {
    pub fn from_u8(v: u8) -> Option<PacketChannel> {
        Some(match v {
            0 => PacketChannel::Command,
            1 => PacketChannel::Stack,
            2 => PacketChannel::Data,
            _ => None?,
        })
    }
}

/// One ETH datagram read off a pipe.
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketReadResult {
    pub bytes_transferred: usize,
    pub header0: u32,
    pub header1: u32,
    /// Packets lost on this channel since the previous read.
    pub lost_packets: u32,
}

impl PacketReadResult {
    #[must_use]
    pub fn payload_header(&self) -> crate::eth::PayloadHeader {
        crate::eth::PayloadHeader {
            header0: self.header0,
            header1: self.header1,
        }
    }
}

/// Per-pipe receive statistics.
#[derive(Clone, Debug, Default)]
pub struct PipeStats {
    pub receive_attempts: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub short_packets: u64,
    /// Packets whose size is not a whole word multiple.
    pub packets_with_residue: u64,
    pub no_header: u64,
    pub header_out_of_range: u64,
    pub packet_channel_out_of_range: u64,
    pub lost_packets: u64,
    /// Histogram of datagram sizes in bytes.
    pub packet_sizes: BTreeMap<usize, u64>,
    /// Histogram of the frame types the next-header pointers point at.
    pub header_types: BTreeMap<u8, u64>,
}

/// Per packet-channel receive statistics.
#[derive(Clone, Debug, Default)]
pub struct PacketChannelStats {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub no_header: u64,
    pub header_out_of_range: u64,
    pub lost_packets: u64,
    pub packet_sizes: BTreeMap<usize, u64>,
    pub header_types: BTreeMap<u8, u64>,
}

/// Duplex byte transport over both MVLC pipes.
///
/// `read_packet` is not reentrant on one pipe; callers serialize through the
/// pipe locks held by the owning controller handle.
pub trait Transport: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    /// Write the full buffer to the pipe. Short writes are an error.
    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize>;

    /// Read up to `dest.len()` bytes from the pipe.
    fn read(&self, pipe: Pipe, dest: &mut [u8]) -> ReadResult;

    fn set_read_timeout(&mut self, pipe: Pipe, timeout: Duration) -> Result<()>;
    fn read_timeout(&self, pipe: Pipe) -> Duration;

    /// Read exactly one UDP datagram. ETH only.
    fn read_packet(&self, _pipe: Pipe, _dest: &mut [u8]) -> Result<PacketReadResult> {
        Err(Error::UnsupportedOperation("read_packet"))
    }

    /// Called once at readout start. On ETH this announces the client's
    /// data port to the controller and resets the packet counters; a no-op
    /// elsewhere.
    fn redirect_data_stream(&self) -> Result<()> {
        Ok(())
    }

    /// Pipe statistics snapshot.
    fn pipe_stats(&self) -> [PipeStats; PIPE_COUNT];
}

/// One fair mutex per pipe.
///
/// `lock_both` always acquires command before data so that connect and
/// disconnect sequences cannot deadlock against dialog users.
#[derive(Default)]
pub struct PipeLocks {
    cmd: parking_lot::Mutex<()>,
    data: parking_lot::Mutex<()>,
}

pub struct BothPipesGuard<'a> {
    _cmd: parking_lot::MutexGuard<'a, ()>,
    _data: parking_lot::MutexGuard<'a, ()>,
}

impl PipeLocks {
    pub fn lock_cmd(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.cmd.lock()
    }

    pub fn lock_data(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.data.lock()
    }

    pub fn lock_both(&self) -> BothPipesGuard<'_> {
        BothPipesGuard {
            _cmd: self.cmd.lock(),
            _data: self.data.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_channel_range() {
        assert_eq!(PacketChannel::from_u8(2), Some(PacketChannel::Data));
        assert_eq!(PacketChannel::from_u8(3), None);
    }

    #[test]
    fn lock_both_then_single() {
        let locks = PipeLocks::default();
        {
            let _g = locks.lock_both();
        }
        let _c = locks.lock_cmd();
        let _d = locks.lock_data();
    }
}

/*! USB transport backend.

The MVLC's FT601 FIFO chip exposes the two pipes as bulk endpoints: command
out `0x02`, command in `0x82`, data in `0x83`. Bulk reads deliver whatever
the chip has queued, so a buffered layer keeps one 1 MiB read buffer per
pipe and serves arbitrary byte ranges from it. There is exactly one read
path; every read goes through the buffer.

The libusb-backed device lives behind the `usb` cargo feature. The buffered
layer is hardware independent and works on any [`RawPipes`] implementation.
*/
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;

use crate::transport::{
    ConnectionType, PIPE_COUNT, Pipe, PipeStats, ReadResult, Transport,
};
use crate::{Error, Result};

/// Limit imposed by single bulk transfers on the FT601.
pub const USB_SINGLE_TRANSFER_MAX_BYTES: usize = 1024 * 1024;

/// Per-pipe read buffer size.
pub const READ_BUFFER_SIZE: usize = USB_SINGLE_TRANSFER_MAX_BYTES;

pub const EP_CMD_OUT: u8 = 0x02;
pub const EP_CMD_IN: u8 = 0x82;
pub const EP_DATA_IN: u8 = 0x83;

/// Raw bulk access to the two pipes.
pub trait RawPipes: Send + Sync {
    /// Write the buffer to the pipe's out endpoint.
    fn write_bulk(&self, pipe: Pipe, data: &[u8], timeout: Duration) -> Result<usize>;

    /// One bulk read from the pipe's in endpoint. Returns the number of
    /// bytes delivered; `Error::Timeout` if nothing arrived in time.
    fn read_bulk(&self, pipe: Pipe, dest: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Fixed-capacity read buffer with a moving start offset.
struct ReadBuffer {
    buffer: Vec<u8>,
    start: usize,
}

impl ReadBuffer {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(READ_BUFFER_SIZE),
            start: 0,
        }
    }

    fn size(&self) -> usize {
        self.buffer.len() - self.start
    }

    fn consume(&mut self, dest: &mut [u8], copied: &mut usize) {
        let n = std::cmp::min(self.size(), dest.len() - *copied);
        dest[*copied..*copied + n].copy_from_slice(&self.buffer[self.start..self.start + n]);
        self.start += n;
        *copied += n;
        if self.start == self.buffer.len() {
            self.buffer.clear();
            self.start = 0;
        }
    }
}

/// USB backend over any [`RawPipes`] implementation.
pub struct UsbTransport {
    raw: Box<dyn RawPipes>,
    read_timeouts: [Duration; PIPE_COUNT],
    write_timeout: Duration,
    read_buffers: [Mutex<ReadBuffer>; PIPE_COUNT],
    stats: Mutex<[PipeStats; PIPE_COUNT]>,
}

impl UsbTransport {
    pub fn new(raw: Box<dyn RawPipes>) -> Self {
        Self {
            raw,
            read_timeouts: [crate::transport::DEFAULT_READ_TIMEOUT; PIPE_COUNT],
            write_timeout: crate::transport::DEFAULT_WRITE_TIMEOUT,
            read_buffers: [Mutex::new(ReadBuffer::new()), Mutex::new(ReadBuffer::new())],
            stats: Mutex::new(Default::default()),
        }
    }

    /// Open the nth FT601 device on the bus. Requires the `usb` feature.
    #[cfg(feature = "usb")]
    pub fn open_by_index(index: usize) -> Result<Self> {
        Ok(Self::new(Box::new(device::UsbDevice::open_by_index(index)?)))
    }

    /// Open the device with the given serial string. Requires the `usb`
    /// feature.
    #[cfg(feature = "usb")]
    pub fn open_by_serial(serial: &str) -> Result<Self> {
        Ok(Self::new(Box::new(device::UsbDevice::open_by_serial(serial)?)))
    }
}

impl Transport for UsbTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize> {
        let written = self.raw.write_bulk(pipe, data, self.write_timeout)?;
        if written != data.len() {
            return Err(Error::ShortTransfer {
                expected: data.len(),
                got: written,
            });
        }
        Ok(written)
    }

    fn read(&self, pipe: Pipe, dest: &mut [u8]) -> ReadResult {
        let mut buffer = self.read_buffers[pipe as usize].lock();
        let timeout = self.read_timeout(pipe);
        let deadline = Instant::now() + timeout;
        let mut copied = 0usize;

        buffer.consume(dest, &mut copied);

        while copied < dest.len() {
            let now = Instant::now();
            if now >= deadline {
                return ReadResult {
                    bytes_transferred: copied,
                    error: Some(Error::Timeout),
                };
            }

            debug_assert_eq!(buffer.size(), 0);
            buffer.buffer.resize(READ_BUFFER_SIZE, 0);
            buffer.start = 0;

            {
                let mut stats = self.stats.lock();
                stats[pipe as usize].receive_attempts += 1;
            }

            match self.raw.read_bulk(pipe, &mut buffer.buffer, deadline - now) {
                Ok(n) => {
                    trace!("pipe {pipe:?}: bulk read returned {n} bytes");
                    buffer.buffer.truncate(n);
                    let mut stats = self.stats.lock();
                    stats[pipe as usize].received_packets += 1;
                    stats[pipe as usize].received_bytes += n as u64;
                }
                Err(e) => {
                    buffer.buffer.clear();
                    return ReadResult {
                        bytes_transferred: copied,
                        error: Some(e),
                    };
                }
            }

            buffer.consume(dest, &mut copied);
        }

        ReadResult::ok(copied)
    }

    fn set_read_timeout(&mut self, pipe: Pipe, timeout: Duration) -> Result<()> {
        self.read_timeouts[pipe as usize] = timeout;
        Ok(())
    }

    fn read_timeout(&self, pipe: Pipe) -> Duration {
        self.read_timeouts[pipe as usize]
    }

    fn pipe_stats(&self) -> [PipeStats; PIPE_COUNT] {
        self.stats.lock().clone()
    }
}

#[cfg(feature = "usb")]
mod device {
    use super::*;

    const VENDOR_ID: u16 = 0x0403;
    const PRODUCT_ID: u16 = 0x601f;

    /// One open FT601 handle. Owns the libusb device; moving is fine,
    /// copying is not.
    pub struct UsbDevice {
        handle: rusb::DeviceHandle<rusb::GlobalContext>,
    }

    impl UsbDevice {
        fn open<F>(pred: F) -> Result<UsbDevice>
        where
            F: Fn(usize, &rusb::Device<rusb::GlobalContext>) -> bool,
        {
            let devices = rusb::devices().map_err(|e| Error::ConnectionError(e.to_string()))?;

            let mut index = 0usize;
            for device in devices.iter() {
                let desc = match device.device_descriptor() {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                    continue;
                }
                if pred(index, &device) {
                    let mut handle = device.open().map_err(|e| Error::ConnectionError(e.to_string()))?;
                    handle
                        .claim_interface(0)
                        .map_err(|e| Error::ConnectionError(e.to_string()))?;
                    // The FT601 exposes the FIFO endpoints on interface 1.
                    // Failing to claim it means the chip is not configured
                    // for the streaming FIFO mode the MVLC needs.
                    handle.claim_interface(1).map_err(|_| Error::ChipConfigError)?;
                    return Ok(UsbDevice { handle });
                }
                index += 1;
            }

            Err(Error::ConnectionError("no matching MVLC USB device".into()))
        }

        pub fn open_by_index(wanted: usize) -> Result<UsbDevice> {
            Self::open(|index, _| index == wanted)
        }

        pub fn open_by_serial(serial: &str) -> Result<UsbDevice> {
            Self::open(|_, device| {
                let Ok(desc) = device.device_descriptor() else {
                    return false;
                };
                let Ok(handle) = device.open() else {
                    return false;
                };
                handle
                    .read_serial_number_string_ascii(&desc)
                    .map(|s| s == serial)
                    .unwrap_or(false)
            })
        }

        fn map_err(e: rusb::Error) -> Error {
            match e {
                rusb::Error::Timeout => Error::Timeout,
                other => Error::ConnectionError(other.to_string()),
            }
        }
    }

    impl RawPipes for UsbDevice {
        fn write_bulk(&self, pipe: Pipe, data: &[u8], timeout: Duration) -> Result<usize> {
            match pipe {
                Pipe::Command => self
                    .handle
                    .write_bulk(EP_CMD_OUT, data, timeout)
                    .map_err(Self::map_err),
                Pipe::Data => Err(Error::UnsupportedOperation("write on the USB data pipe")),
            }
        }

        fn read_bulk(&self, pipe: Pipe, dest: &mut [u8], timeout: Duration) -> Result<usize> {
            let ep = match pipe {
                Pipe::Command => EP_CMD_IN,
                Pipe::Data => EP_DATA_IN,
            };
            self.handle.read_bulk(ep, dest, timeout).map_err(Self::map_err)
        }
    }
}

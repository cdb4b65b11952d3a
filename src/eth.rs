/*! UDP transport backend.

The MVLC listens on a fixed command port; the data port is the command port
plus one. The backend binds two consecutive local ports and `connect()`s one
socket to each remote port, so stray datagrams from other hosts are
filtered by the kernel.

Every datagram starts with two header words carrying the packet channel, a
12-bit channel-specific packet number, the payload word count and a pointer
to the first frame header inside the payload. Packet loss is detected per
channel from gaps in the packet numbers.
*/
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::transport::{
    ConnectionType, PACKET_CHANNEL_COUNT, PIPE_COUNT, PacketChannel, PacketChannelStats, PacketReadResult, Pipe,
    PipeStats, ReadResult, Transport,
};
use crate::{Error, Result, frame};

pub const COMMAND_PORT: u16 = 0x8000;
pub const DATA_PORT: u16 = COMMAND_PORT + 1;

pub const HEADER_WORDS: usize = 2;
pub const HEADER_BYTES: usize = HEADER_WORDS * 4;

pub const JUMBO_FRAME_MAX_SIZE: usize = 9000;

/// Kernel receive buffer requested for the data socket.
const DATA_SOCKET_RECEIVE_BUFFER_SIZE: usize = 100 * 1024 * 1024;

mod header0 {
    pub const PACKET_CHANNEL_SHIFT: u32 = 28;
    pub const PACKET_CHANNEL_MASK: u32 = 0b11;
    pub const PACKET_NUMBER_SHIFT: u32 = 16;
    pub const PACKET_NUMBER_MASK: u32 = 0xfff;
    pub const CONTROLLER_ID_SHIFT: u32 = 13;
    pub const CONTROLLER_ID_MASK: u32 = 0b111;
    pub const NUM_DATA_WORDS_MASK: u32 = 0x1fff;
}

mod header1 {
    pub const TIMESTAMP_SHIFT: u32 = 12;
    pub const TIMESTAMP_MASK: u32 = 0xfffff;
    pub const HEADER_POINTER_MASK: u32 = 0xfff;
    pub const NO_HEADER_POINTER_PRESENT: u16 = 0xfff;
}

/// The two header words prefixed to every MVLC datagram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PayloadHeader {
    pub header0: u32,
    pub header1: u32,
}

impl PayloadHeader {
    #[must_use]
    pub fn packet_channel(&self) -> u8 {
        ((self.header0 >> header0::PACKET_CHANNEL_SHIFT) & header0::PACKET_CHANNEL_MASK) as u8
    }

    #[must_use]
    pub fn packet_number(&self) -> u16 {
        ((self.header0 >> header0::PACKET_NUMBER_SHIFT) & header0::PACKET_NUMBER_MASK) as u16
    }

    /// Controller id stamped into the reserved header0 bits.
    #[must_use]
    pub fn controller_id(&self) -> u8 {
        ((self.header0 >> header0::CONTROLLER_ID_SHIFT) & header0::CONTROLLER_ID_MASK) as u8
    }

    /// Payload words following the two header words.
    #[must_use]
    pub fn data_word_count(&self) -> u16 {
        (self.header0 & header0::NUM_DATA_WORDS_MASK) as u16
    }

    /// 1 ms resolution timestamp, wraps after about 17.5 minutes.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        (self.header1 >> header1::TIMESTAMP_SHIFT) & header1::TIMESTAMP_MASK
    }

    /// Word offset of the first frame header in the payload.
    #[must_use]
    pub fn next_header_pointer(&self) -> u16 {
        (self.header1 & header1::HEADER_POINTER_MASK) as u16
    }

    /// False if the payload is pure continuation data with no frame header.
    #[must_use]
    pub fn is_next_header_pointer_present(&self) -> bool {
        self.next_header_pointer() != header1::NO_HEADER_POINTER_PRESENT
    }

    /// Pack header words. Used when generating test and replay data.
    #[must_use]
    pub fn pack(
        channel: PacketChannel,
        packet_number: u16,
        controller_id: u8,
        data_words: u16,
        next_header_pointer: Option<u16>,
    ) -> PayloadHeader {
        let header0 = u32::from(channel as u8) << header0::PACKET_CHANNEL_SHIFT
            | (u32::from(packet_number) & header0::PACKET_NUMBER_MASK) << header0::PACKET_NUMBER_SHIFT
            | (u32::from(controller_id) & header0::CONTROLLER_ID_MASK) << header0::CONTROLLER_ID_SHIFT
            | u32::from(data_words) & header0::NUM_DATA_WORDS_MASK;
        let header1 = u32::from(next_header_pointer.unwrap_or(header1::NO_HEADER_POINTER_PRESENT))
            & header1::HEADER_POINTER_MASK;
        PayloadHeader { header0, header1 }
    }
}

/// Packets lost between two successive packet numbers on one channel.
///
/// The counter is 12 bits wide; a wrap from 0xfff to 0x000 is zero loss.
#[must_use]
pub fn calc_packet_loss(last_packet_number: u16, packet_number: u16) -> u32 {
    const MAX: i32 = header0::PACKET_NUMBER_MASK as i32;

    let diff = i32::from(packet_number) - i32::from(last_packet_number);

    if diff < 1 {
        (MAX + diff) as u32
    } else {
        (diff - 1) as u32
    }
}

struct EthStats {
    pipes: [PipeStats; PIPE_COUNT],
    channels: [PacketChannelStats; PACKET_CHANNEL_COUNT],
    last_packet_numbers: [Option<u16>; PACKET_CHANNEL_COUNT],
}

/// UDP backend. Created connected; dropped to disconnect.
pub struct EthTransport {
    sockets: [UdpSocket; PIPE_COUNT],
    read_timeouts: [Duration; PIPE_COUNT],
    /// Reassembly buffers backing the byte-stream `read` interface, one per
    /// pipe. Datagram payloads are appended with their header words
    /// stripped.
    read_buffers: [Mutex<VecDeque<u8>>; PIPE_COUNT],
    stats: Mutex<EthStats>,
    remote: SocketAddr,
}

fn set_receive_buffer_size(socket: &UdpSocket, bytes: usize) -> Result<usize> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = bytes.try_into().unwrap_or(libc::c_int::MAX);
    // SAFETY: plain setsockopt/getsockopt on an owned, open fd.
    unsafe {
        let rc = libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let mut actual: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::addr_of_mut!(actual).cast(),
            &mut len,
        );
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(actual as usize)
    }
}

/// Bind two sockets on consecutive local ports.
fn bind_socket_pair() -> Result<[UdpSocket; 2]> {
    const ATTEMPTS: usize = 10;

    for _ in 0..ATTEMPTS {
        let first = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| Error::BindError)?;
        let port = first.local_addr().map_err(|_| Error::BindError)?.port();

        if port == u16::MAX {
            continue;
        }

        if let Ok(second) = UdpSocket::bind(("0.0.0.0", port + 1)) {
            return Ok([first, second]);
        }
    }

    Err(Error::BindError)
}

impl EthTransport {
    /// Connect to the MVLC at `host` using the standard command port.
    pub fn connect(host: &str) -> Result<EthTransport> {
        Self::connect_to(host, COMMAND_PORT)
    }

    /// Connect using a non-standard command port. The data port is always
    /// the command port plus one.
    pub fn connect_to(host: &str, command_port: u16) -> Result<EthTransport> {
        let remote = (host, command_port)
            .to_socket_addrs()
            .map_err(|_| Error::HostLookupError(host.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::HostLookupError(host.to_string()))?;

        let sockets = bind_socket_pair()?;

        let mut data_remote = remote;
        data_remote.set_port(command_port + 1);

        sockets[Pipe::Command as usize]
            .connect(remote)
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        sockets[Pipe::Data as usize]
            .connect(data_remote)
            .map_err(|e| Error::ConnectionError(e.to_string()))?;

        let got = set_receive_buffer_size(&sockets[Pipe::Data as usize], DATA_SOCKET_RECEIVE_BUFFER_SIZE)?;
        if got < DATA_SOCKET_RECEIVE_BUFFER_SIZE {
            debug!("data socket receive buffer: requested {DATA_SOCKET_RECEIVE_BUFFER_SIZE} bytes, got {got}");
        }

        let mut result = EthTransport {
            sockets,
            read_timeouts: [crate::transport::DEFAULT_READ_TIMEOUT; PIPE_COUNT],
            read_buffers: Default::default(),
            stats: Mutex::new(EthStats {
                pipes: Default::default(),
                channels: Default::default(),
                last_packet_numbers: [None; PACKET_CHANNEL_COUNT],
            }),
            remote,
        };

        for pipe in [Pipe::Command, Pipe::Data] {
            result.set_read_timeout(pipe, crate::transport::DEFAULT_READ_TIMEOUT)?;
        }

        debug!("connected to {remote} / {data_remote}");
        Ok(result)
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send an empty datagram from the data socket so the MVLC learns the
    /// client's data destination port. Done once at readout start.
    pub fn send_data_hello(&self) -> Result<()> {
        self.sockets[Pipe::Data as usize]
            .send(&[])
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        Ok(())
    }

    /// Reset per-pipe and per-channel counters, e.g. at readout start.
    pub fn reset_stats(&self) {
        let mut stats = self.stats.lock();
        stats.pipes = Default::default();
        stats.channels = Default::default();
        stats.last_packet_numbers = [None; PACKET_CHANNEL_COUNT];
    }

    #[must_use]
    pub fn packet_channel_stats(&self) -> [PacketChannelStats; PACKET_CHANNEL_COUNT] {
        self.stats.lock().channels.clone()
    }

    fn socket(&self, pipe: Pipe) -> &UdpSocket {
        &self.sockets[pipe as usize]
    }

    fn receive_one_packet(&self, pipe: Pipe, dest: &mut [u8]) -> Result<usize> {
        match self.socket(pipe).recv(dest) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::Timeout)
            }
            Err(e) => Err(Error::ConnectionError(e.to_string())),
        }
    }
}

impl Transport for EthTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Eth
    }

    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize> {
        let sent = self
            .socket(pipe)
            .send(data)
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        if sent != data.len() {
            return Err(Error::ShortTransfer {
                expected: data.len(),
                got: sent,
            });
        }
        Ok(sent)
    }

    /// Byte-stream read built on packet reads: payloads are buffered per
    /// pipe with the ETH header words stripped.
    fn read(&self, pipe: Pipe, dest: &mut [u8]) -> ReadResult {
        let mut buffer = self.read_buffers[pipe as usize].lock();
        let mut copied = 0usize;
        let deadline = Instant::now() + self.read_timeout(pipe);
        let mut packet = [0u8; JUMBO_FRAME_MAX_SIZE];

        loop {
            while copied < dest.len() {
                match buffer.pop_front() {
                    Some(b) => {
                        dest[copied] = b;
                        copied += 1;
                    }
                    None => break,
                }
            }

            if copied == dest.len() {
                return ReadResult::ok(copied);
            }

            if Instant::now() >= deadline {
                return ReadResult {
                    bytes_transferred: copied,
                    error: Some(Error::Timeout),
                };
            }

            match self.read_packet(pipe, &mut packet) {
                Ok(res) => {
                    if res.bytes_transferred > HEADER_BYTES {
                        buffer.extend(&packet[HEADER_BYTES..res.bytes_transferred]);
                    }
                }
                Err(Error::Timeout) => {
                    return ReadResult {
                        bytes_transferred: copied,
                        error: Some(Error::Timeout),
                    };
                }
                Err(e) => {
                    return ReadResult {
                        bytes_transferred: copied,
                        error: Some(e),
                    };
                }
            }
        }
    }

    fn set_read_timeout(&mut self, pipe: Pipe, timeout: Duration) -> Result<()> {
        self.sockets[pipe as usize]
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        self.read_timeouts[pipe as usize] = timeout;
        Ok(())
    }

    fn read_timeout(&self, pipe: Pipe) -> Duration {
        self.read_timeouts[pipe as usize]
    }

    fn redirect_data_stream(&self) -> Result<()> {
        self.send_data_hello()?;
        self.reset_stats();
        Ok(())
    }

    fn read_packet(&self, pipe: Pipe, dest: &mut [u8]) -> Result<PacketReadResult> {
        let mut stats = self.stats.lock();
        stats.pipes[pipe as usize].receive_attempts += 1;

        let bytes = self.receive_one_packet(pipe, dest)?;

        let pipe_stats = &mut stats.pipes[pipe as usize];
        pipe_stats.received_packets += 1;
        pipe_stats.received_bytes += bytes as u64;
        *pipe_stats.packet_sizes.entry(bytes).or_default() += 1;

        if bytes < HEADER_BYTES {
            pipe_stats.short_packets += 1;
            warn!("pipe {pipe:?}: datagram smaller than the MVLC header pair ({bytes} bytes)");
            return Err(Error::ShortTransfer {
                expected: HEADER_BYTES,
                got: bytes,
            });
        }

        if bytes % 4 != 0 {
            pipe_stats.packets_with_residue += 1;
        }

        let mut res = PacketReadResult {
            bytes_transferred: bytes,
            header0: u32::from_le_bytes(dest[0..4].try_into().unwrap()),
            header1: u32::from_le_bytes(dest[4..8].try_into().unwrap()),
            lost_packets: 0,
        };

        let hdr = res.payload_header();
        trace!(
            "pipe {pipe:?}: packet channel={} number={} words={} nhp={:#x}",
            hdr.packet_channel(),
            hdr.packet_number(),
            hdr.data_word_count(),
            hdr.next_header_pointer()
        );

        let Some(channel) = PacketChannel::from_u8(hdr.packet_channel()) else {
            pipe_stats.packet_channel_out_of_range += 1;
            return Err(Error::UdpPacketChannelOutOfRange(hdr.packet_channel()));
        };

        let available_payload_words = (bytes - HEADER_BYTES) / 4;

        // Histogram the frame type the header pointer points at; this gives
        // a cheap sanity signal on live data.
        if hdr.is_next_header_pointer_present() {
            if usize::from(hdr.next_header_pointer()) >= available_payload_words {
                stats.pipes[pipe as usize].header_out_of_range += 1;
                stats.channels[channel as usize].header_out_of_range += 1;
            } else {
                let off = HEADER_BYTES + usize::from(hdr.next_header_pointer()) * 4;
                let header = u32::from_le_bytes(dest[off..off + 4].try_into().unwrap());
                let ft = frame::get_frame_type(header);
                *stats.pipes[pipe as usize].header_types.entry(ft).or_default() += 1;
                *stats.channels[channel as usize].header_types.entry(ft).or_default() += 1;
            }
        } else {
            stats.pipes[pipe as usize].no_header += 1;
            stats.channels[channel as usize].no_header += 1;
        }

        let channel_stats = &mut stats.channels[channel as usize];
        channel_stats.received_packets += 1;
        channel_stats.received_bytes += bytes as u64;
        *channel_stats.packet_sizes.entry(bytes).or_default() += 1;

        if let Some(last) = stats.last_packet_numbers[channel as usize] {
            let loss = calc_packet_loss(last, hdr.packet_number());
            if loss > 0 {
                warn!(
                    "pipe {pipe:?}: channel {channel:?} lost {loss} packets (last={last}, current={})",
                    hdr.packet_number()
                );
            }
            res.lost_packets = loss;
            stats.pipes[pipe as usize].lost_packets += u64::from(loss);
            stats.channels[channel as usize].lost_packets += u64::from(loss);
        }
        stats.last_packet_numbers[channel as usize] = Some(hdr.packet_number());

        Ok(res)
    }

    fn pipe_stats(&self) -> [PipeStats; PIPE_COUNT] {
        self.stats.lock().pipes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_loss_simple() {
        assert_eq!(calc_packet_loss(0x003, 0x006), 2);
        assert_eq!(calc_packet_loss(0x003, 0x004), 0);
    }

    #[test]
    fn packet_loss_wrap() {
        assert_eq!(calc_packet_loss(0xfff, 0x000), 0);
        assert_eq!(calc_packet_loss(0xffe, 0x001), 2);
    }

    #[test]
    fn payload_header_fields() {
        let hdr = PayloadHeader::pack(PacketChannel::Data, 0x123, 5, 100, Some(3));
        assert_eq!(hdr.packet_channel(), 2);
        assert_eq!(hdr.packet_number(), 0x123);
        assert_eq!(hdr.controller_id(), 5);
        assert_eq!(hdr.data_word_count(), 100);
        assert_eq!(hdr.next_header_pointer(), 3);
        assert!(hdr.is_next_header_pointer_present());

        let none = PayloadHeader::pack(PacketChannel::Command, 0, 0, 10, None);
        assert!(!none.is_next_header_pointer_present());
    }

    // Loopback socket pair standing in for an MVLC. The fake sender sockets
    // are bound to the ports the transport connected to, so datagrams pass
    // the kernel's connected-socket source filter.
    struct FakeMvlc {
        cmd: UdpSocket,
        data: UdpSocket,
        client_cmd: SocketAddr,
        client_data: SocketAddr,
    }

    impl FakeMvlc {
        fn send_cmd(&self, bytes: &[u8]) {
            self.cmd.send_to(bytes, self.client_cmd).unwrap();
        }
        fn send_data(&self, bytes: &[u8]) {
            self.data.send_to(bytes, self.client_data).unwrap();
        }
    }

    fn test_pair() -> (EthTransport, FakeMvlc) {
        let cmd_sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = cmd_sock.local_addr().unwrap().port();
        let data_sock = UdpSocket::bind(("127.0.0.1", port + 1)).expect("consecutive test port taken");

        let transport = EthTransport::connect_to("127.0.0.1", port).unwrap();

        let client_port = transport.sockets[0].local_addr().unwrap().port();
        let client_cmd: SocketAddr = format!("127.0.0.1:{client_port}").parse().unwrap();
        let client_data: SocketAddr = format!("127.0.0.1:{}", client_port + 1).parse().unwrap();

        (
            transport,
            FakeMvlc {
                cmd: cmd_sock,
                data: data_sock,
                client_cmd,
                client_data,
            },
        )
    }

    fn make_packet(channel: PacketChannel, number: u16, payload: &[u32]) -> Vec<u8> {
        let hdr = PayloadHeader::pack(channel, number, 0, payload.len() as u16, Some(0));
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&hdr.header0.to_le_bytes());
        bytes.extend_from_slice(&hdr.header1.to_le_bytes());
        for w in payload {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn read_packet_and_loss_counting() {
        let (mut transport, fake) = test_pair();
        transport.set_read_timeout(Pipe::Data, Duration::from_millis(2000)).unwrap();

        fake.send_data(&make_packet(PacketChannel::Data, 3, &[0xF300_0000]));
        fake.send_data(&make_packet(PacketChannel::Data, 6, &[0xF300_0000]));

        let mut buf = [0u8; JUMBO_FRAME_MAX_SIZE];

        let r1 = transport.read_packet(Pipe::Data, &mut buf).unwrap();
        assert_eq!(r1.payload_header().packet_number(), 3);
        assert_eq!(r1.lost_packets, 0);

        let r2 = transport.read_packet(Pipe::Data, &mut buf).unwrap();
        assert_eq!(r2.payload_header().packet_number(), 6);
        assert_eq!(r2.lost_packets, 2);

        let stats = transport.packet_channel_stats();
        assert_eq!(stats[PacketChannel::Data as usize].received_packets, 2);
        assert_eq!(stats[PacketChannel::Data as usize].lost_packets, 2);
    }

    #[test]
    fn stream_read_strips_headers() {
        let (mut transport, fake) = test_pair();
        transport.set_read_timeout(Pipe::Command, Duration::from_millis(2000)).unwrap();

        fake.send_cmd(&make_packet(PacketChannel::Command, 1, &[0xF100_0002, 0x1111_1111, 0x2222_2222]));

        let mut dest = [0u8; 12];
        let res = transport.read(Pipe::Command, &mut dest);
        assert!(res.error.is_none());
        assert_eq!(res.bytes_transferred, 12);
        assert_eq!(u32::from_le_bytes(dest[0..4].try_into().unwrap()), 0xF100_0002);
        assert_eq!(u32::from_le_bytes(dest[8..12].try_into().unwrap()), 0x2222_2222);
    }

    #[test]
    fn stream_read_times_out() {
        let (mut transport, _fake) = test_pair();
        transport.set_read_timeout(Pipe::Command, Duration::from_millis(20)).unwrap();

        let mut dest = [0u8; 4];
        let res = transport.read(Pipe::Command, &mut dest);
        assert_eq!(res.bytes_transferred, 0);
        assert!(matches!(res.error, Some(Error::Timeout)));
    }
}

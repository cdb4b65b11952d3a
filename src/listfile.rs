/*! Listfile archives.

A listfile stores one run's raw readout stream plus enough metadata to
replay it: a standard ZIP container whose entries hold the byte stream in
order. Each entry begins with the 8-byte connection magic (`MVLC_USB` or
`MVLC_ETH`); the first entry additionally carries a preamble of software
generated system event frames describing the crate config and the start
time. Replays of an archive are byte-identical to the live stream the
parser saw.

Entries are either raw or LZ4 frame compressed, the latter marked by an
`.lz4` suffix on the entry name. A size threshold splits the stream into
numbered entries; splits always happen between messages, never inside one.
*/
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::{debug, info, warn};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::config::CrateConfig;
use crate::frame::{extract_frame_info, system_event};
use crate::transport::ConnectionType;
use crate::{Error, Result};

pub const MAGIC_LEN: usize = 8;

#[must_use]
pub fn file_magic(ct: ConnectionType) -> &'static [u8; MAGIC_LEN] {
    match ct {
        ConnectionType::Usb => b"MVLC_USB",
        ConnectionType::Eth => b"MVLC_ETH",
    }
}

pub fn connection_type_from_magic(magic: &[u8]) -> Result<ConnectionType> {
    match magic {
        b"MVLC_USB" => Ok(ConnectionType::Usb),
        b"MVLC_ETH" => Ok(ConnectionType::Eth),
        _ => Err(Error::Archive(format!("unknown file magic {magic:x?}"))),
    }
}

/// Byte sink for readout data. The writer stage feeds whole messages.
pub trait WriteHandle: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush and close the sink. Called once when the writing stage ends.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sequential byte source over an archive's data stream.
pub trait ReadHandle {
    /// Read up to `dest.len()` bytes. 0 means end of stream.
    fn read(&mut self, dest: &mut [u8]) -> Result<usize>;
}

/// Per-entry compression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryCompression {
    #[default]
    Raw,
    Lz4,
}

/// Split a payload into system event frames, setting the continue bit on
/// all but the last frame.
#[must_use]
pub fn make_system_event_frames(subtype: u8, payload: &[u32]) -> Vec<u32> {
    let mut result = Vec::with_capacity(payload.len() + 2);
    let mut chunks = payload.chunks(system_event::MAX_CONTENTS_WORDS).peekable();

    if payload.is_empty() {
        result.push(system_event::make_header(subtype, 0, false));
        return result;
    }

    while let Some(chunk) = chunks.next() {
        let cont = chunks.peek().is_some();
        result.push(system_event::make_header(subtype, chunk.len() as u16, cont));
        result.extend_from_slice(chunk);
    }

    result
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Build the preamble bytes for the first archive entry: the magic, an
/// endian marker, the crate config as a VMEConfig system event and the run
/// start timestamp.
pub fn make_preamble(buffer_type: ConnectionType, config: &CrateConfig, unix_timestamp: u64) -> Result<Vec<u8>> {
    let mut bytes = file_magic(buffer_type).to_vec();

    let endian = make_system_event_frames(system_event::subtype::ENDIAN_MARKER, &[system_event::ENDIAN_MARKER_VALUE]);
    bytes.extend(words_to_bytes(&endian));

    let yaml = crate::config::to_yaml(config)?;
    let mut config_bytes = yaml.into_bytes();
    while config_bytes.len() % 4 != 0 {
        config_bytes.push(0);
    }
    let config_frames = make_system_event_frames(system_event::subtype::VME_CONFIG, &bytes_to_words(&config_bytes));
    bytes.extend(words_to_bytes(&config_frames));

    let ts = [unix_timestamp as u32, (unix_timestamp >> 32) as u32];
    let ts_frames = make_system_event_frames(system_event::subtype::UNIX_TIMESTAMP, &ts);
    bytes.extend(words_to_bytes(&ts_frames));

    Ok(bytes)
}

enum OpenEntry {
    None,
    Raw,
    Lz4(Box<FrameEncoder<Vec<u8>>>),
}

/// Sequential ZIP archive writer.
///
/// Entries are written strictly one after the other; opening a new entry
/// finishes the previous one.
pub struct ZipCreator {
    /// None once the archive has been closed.
    writer: Option<zip::ZipWriter<BufWriter<File>>>,
    entry: OpenEntry,
    entry_name: String,
    /// Uncompressed payload bytes written to the current entry.
    entry_bytes: u64,
}

impl ZipCreator {
    pub fn create(path: &Path) -> Result<ZipCreator> {
        let file = File::create(path)?;
        Ok(ZipCreator {
            writer: Some(zip::ZipWriter::new(BufWriter::new(file))),
            entry: OpenEntry::None,
            entry_name: String::new(),
            entry_bytes: 0,
        })
    }

    fn map_zip<T>(r: std::result::Result<T, zip::result::ZipError>) -> Result<T> {
        r.map_err(|e| Error::Archive(e.to_string()))
    }

    fn writer(&mut self) -> Result<&mut zip::ZipWriter<BufWriter<File>>> {
        self.writer.as_mut().ok_or_else(|| Error::Archive("archive already closed".into()))
    }

    /// Open a deflate compressed entry.
    pub fn create_zip_entry(&mut self, name: &str, compress_level: i64) -> Result<()> {
        self.close_current_entry()?;

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(compress_level))
            .large_file(true);
        Self::map_zip(self.writer()?.start_file(name, options))?;

        self.entry = OpenEntry::Raw;
        self.entry_name = name.to_string();
        self.entry_bytes = 0;
        Ok(())
    }

    /// Open an LZ4 frame compressed entry. The data is LZ4 framed and
    /// stored uncompressed at the ZIP layer; `.lz4` is appended to the
    /// name.
    pub fn create_lz4_entry(&mut self, name: &str) -> Result<()> {
        self.close_current_entry()?;

        let entry_name = format!("{name}.lz4");
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true);
        Self::map_zip(self.writer()?.start_file(&entry_name, options))?;

        self.entry = OpenEntry::Lz4(Box::new(FrameEncoder::new(Vec::new())));
        self.entry_name = entry_name;
        self.entry_bytes = 0;
        Ok(())
    }

    #[must_use]
    pub fn has_open_entry(&self) -> bool {
        !matches!(self.entry, OpenEntry::None)
    }

    #[must_use]
    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    #[must_use]
    pub fn entry_bytes(&self) -> u64 {
        self.entry_bytes
    }

    pub fn write_to_entry(&mut self, data: &[u8]) -> Result<usize> {
        match self.entry {
            OpenEntry::None => {
                return Err(Error::Archive("no open archive entry".into()));
            }
            OpenEntry::Raw => {
                self.writer()?.write_all(data)?;
            }
            OpenEntry::Lz4(_) => {
                // Drain whatever the encoder has produced so far.
                let produced = {
                    let OpenEntry::Lz4(encoder) = &mut self.entry else {
                        unreachable!()
                    };
                    encoder.write_all(data)?;
                    std::mem::take(encoder.get_mut())
                };
                self.writer()?.write_all(&produced)?;
            }
        }

        self.entry_bytes += data.len() as u64;
        Ok(data.len())
    }

    pub fn close_current_entry(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.entry, OpenEntry::None) {
            OpenEntry::None => Ok(()),
            OpenEntry::Raw => Ok(()),
            OpenEntry::Lz4(encoder) => {
                let produced = encoder.finish().map_err(|e| Error::Archive(e.to_string()))?;
                self.writer()?.write_all(&produced)?;
                Ok(())
            }
        }
    }

    pub fn close_archive(&mut self) -> Result<()> {
        self.close_current_entry()?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Archive("archive already closed".into()))?;
        let inner = Self::map_zip(writer.finish())?;
        inner.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_all()?;
        Ok(())
    }
}

/// Configuration of a split listfile writer.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    /// Entry basename; entries become `<basename>.mvmelst[.lz4]` with a
    /// `_partNNN` infix from the second split on.
    pub basename: String,
    pub compression: EntryCompression,
    /// Close the current entry once it holds at least this many bytes.
    /// `None` disables splitting.
    pub split_threshold: Option<u64>,
    /// Deflate level for raw entries.
    pub compress_level: i64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            basename: "listfile".into(),
            compression: EntryCompression::Raw,
            split_threshold: None,
            compress_level: 1,
        }
    }
}

/// Size bounded, split capable listfile writer.
///
/// Every `write` call must carry a whole message; split boundaries fall
/// between calls, never inside one.
pub struct ListfileWriter {
    creator: ZipCreator,
    config: WriterConfig,
    buffer_type: ConnectionType,
    part_index: usize,
    total_bytes: u64,
}

impl ListfileWriter {
    /// Create the archive and write the preamble into the first entry.
    pub fn create(
        path: &Path,
        config: WriterConfig,
        buffer_type: ConnectionType,
        preamble: &[u8],
    ) -> Result<ListfileWriter> {
        let mut result = ListfileWriter {
            creator: ZipCreator::create(path)?,
            config,
            buffer_type,
            part_index: 1,
            total_bytes: 0,
        };

        result.open_entry()?;
        result.creator.write_to_entry(preamble)?;
        info!("created listfile archive {}", path.display());
        Ok(result)
    }

    fn entry_name(&self) -> String {
        if self.part_index == 1 {
            format!("{}.mvmelst", self.config.basename)
        } else {
            format!("{}_part{:03}.mvmelst", self.config.basename, self.part_index)
        }
    }

    fn open_entry(&mut self) -> Result<()> {
        let name = self.entry_name();
        match self.config.compression {
            EntryCompression::Raw => self.creator.create_zip_entry(&name, self.config.compress_level)?,
            EntryCompression::Lz4 => self.creator.create_lz4_entry(&name)?,
        }

        // Parts after the first only repeat the magic.
        if self.part_index > 1 {
            self.creator.write_to_entry(file_magic(self.buffer_type))?;
        }

        debug!("opened listfile entry {}", self.creator.entry_name());
        Ok(())
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn close(mut self) -> Result<()> {
        self.creator.close_archive()
    }
}

impl WriteHandle for ListfileWriter {
    fn finalize(&mut self) -> Result<()> {
        self.creator.close_archive()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.creator.write_to_entry(data)?;
        self.total_bytes += n as u64;

        if let Some(threshold) = self.config.split_threshold {
            if self.creator.entry_bytes() >= threshold {
                self.creator.close_current_entry()?;
                self.part_index += 1;
                self.open_entry()?;
            }
        }

        Ok(n)
    }
}

/// One system event frame from an archive preamble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreambleFrame {
    pub subtype: u8,
    /// Payload words, frame header stripped.
    pub payload: Vec<u32>,
}

/// The decoded head of the first archive entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preamble {
    pub buffer_type: ConnectionType,
    pub frames: Vec<PreambleFrame>,
}

impl Preamble {
    /// Recover the crate config from the VMEConfig frames.
    pub fn crate_config(&self) -> Result<CrateConfig> {
        let mut bytes = Vec::new();
        for frame in self.frames.iter().filter(|f| f.subtype == system_event::subtype::VME_CONFIG) {
            bytes.extend(words_to_bytes(&frame.payload));
        }

        if bytes.is_empty() {
            return Err(Error::Archive("preamble contains no config".into()));
        }

        while bytes.last() == Some(&0) {
            bytes.pop();
        }

        let text = String::from_utf8(bytes).map_err(|e| Error::Archive(e.to_string()))?;
        crate::config::from_yaml(&text)
    }

    /// The run start timestamp, if recorded.
    #[must_use]
    pub fn unix_timestamp(&self) -> Option<u64> {
        self.frames
            .iter()
            .find(|f| f.subtype == system_event::subtype::UNIX_TIMESTAMP)
            .and_then(|f| match f.payload.as_slice() {
                [lo] => Some(u64::from(*lo)),
                [lo, hi, ..] => Some(u64::from(*lo) | u64::from(*hi) << 32),
                [] => None,
            })
    }
}

/// Sequential reader over all entries of a listfile archive.
///
/// Entry payloads are concatenated in archive order; the per-entry magic
/// of parts two and up is validated and skipped, so `read` yields the same
/// byte stream the writer was fed.
pub struct ListfileReader {
    archive: zip::ZipArchive<BufReader<File>>,
    entry_index: usize,
    /// Decompressed bytes of the current entry.
    buffer: Vec<u8>,
    pos: usize,
    magic: Option<ConnectionType>,
}

impl ListfileReader {
    pub fn open(path: &Path) -> Result<ListfileReader> {
        let file = File::open(path)?;
        let archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| Error::Archive(e.to_string()))?;

        let mut reader = ListfileReader {
            archive,
            entry_index: 0,
            buffer: Vec::new(),
            pos: 0,
            magic: None,
        };
        reader.load_entry(0)?;
        Ok(reader)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.archive.len()
    }

    pub fn entry_names(&self) -> Vec<String> {
        (0..self.archive.len())
            .map(|i| self.archive.name_for_index(i).unwrap_or_default().to_string())
            .collect()
    }

    fn load_entry(&mut self, index: usize) -> Result<()> {
        if index >= self.archive.len() {
            self.buffer.clear();
            self.pos = 0;
            return Ok(());
        }

        let mut entry = self
            .archive
            .by_index(index)
            .map_err(|e| Error::Archive(e.to_string()))?;
        let name = entry.name().to_string();

        let mut raw = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut raw)?;

        self.buffer = if name.ends_with(".lz4") {
            let mut decoder = FrameDecoder::new(std::io::Cursor::new(raw));
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            raw
        };
        self.pos = 0;
        self.entry_index = index;

        debug!("loaded listfile entry {name}, {} bytes", self.buffer.len());

        // Every entry repeats the magic; the first keeps it in the stream
        // for read_preamble, later parts have it stripped here.
        if index > 0 {
            if self.buffer.len() < MAGIC_LEN {
                return Err(Error::Archive(format!("entry {name} shorter than the file magic")));
            }
            let ct = connection_type_from_magic(&self.buffer[..MAGIC_LEN])?;
            if let Some(expected) = self.magic {
                if ct != expected {
                    warn!("entry {name}: magic changed mid archive");
                }
            }
            self.pos = MAGIC_LEN;
        }

        Ok(())
    }

    fn remaining_in_entry(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Decode the preamble of the first entry: the magic plus all leading
    /// system event frames. Must be called before streaming data.
    pub fn read_preamble(&mut self) -> Result<Preamble> {
        if self.entry_index != 0 || self.pos != 0 {
            return Err(Error::Archive("preamble already consumed".into()));
        }

        if self.remaining_in_entry() < MAGIC_LEN {
            return Err(Error::Archive("archive shorter than the file magic".into()));
        }

        let buffer_type = connection_type_from_magic(&self.buffer[..MAGIC_LEN])?;
        self.pos = MAGIC_LEN;
        self.magic = Some(buffer_type);

        let mut frames = Vec::new();

        while self.remaining_in_entry() >= 4 {
            let header = u32::from_le_bytes(self.buffer[self.pos..self.pos + 4].try_into().unwrap());

            if !system_event::is_known_system_event(header) {
                break;
            }

            let len = usize::from(extract_frame_info(header).len);
            if self.remaining_in_entry() < 4 + len * 4 {
                return Err(Error::Archive("truncated preamble frame".into()));
            }

            let payload = bytes_to_words(&self.buffer[self.pos + 4..self.pos + 4 + len * 4]);
            frames.push(PreambleFrame {
                subtype: system_event::extract_subtype(header),
                payload,
            });
            self.pos += 4 + len * 4;
        }

        Ok(Preamble { buffer_type, frames })
    }
}

impl ReadHandle for ListfileReader {
    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let mut copied = 0;

        while copied < dest.len() {
            if self.remaining_in_entry() == 0 {
                if self.entry_index + 1 >= self.archive.len() {
                    break;
                }
                self.load_entry(self.entry_index + 1)?;
                continue;
            }

            let n = self.remaining_in_entry().min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
            self.pos += n;
            copied += n;
        }

        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StackCommandBuilder;
    use crate::config::{Connection, Trigger};

    fn test_config() -> CrateConfig {
        CrateConfig {
            crate_id: 1,
            connection: Connection::Eth { host: "mvlc".into() },
            readout_stacks: vec![
                StackCommandBuilder::new()
                    .begin_group("module0")
                    .add_vme_block_read(0, crate::command::vme_amods::MBLT64, 0xffff),
            ],
            triggers: vec![Trigger::IrqWithIack { irq: 1 }],
            ..Default::default()
        }
    }

    fn read_all(reader: &mut ListfileReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[test]
    fn preamble_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run001.zip");
        let config = test_config();

        let preamble = make_preamble(ConnectionType::Eth, &config, 1700_000_000)?;
        let writer = ListfileWriter::create(&path, WriterConfig::default(), ConnectionType::Eth, &preamble)?;
        writer.close()?;

        let mut reader = ListfileReader::open(&path)?;
        let decoded = reader.read_preamble()?;

        assert_eq!(decoded.buffer_type, ConnectionType::Eth);
        assert_eq!(decoded.unix_timestamp(), Some(1700_000_000));
        assert_eq!(decoded.crate_config()?, config);

        let endian = decoded
            .frames
            .iter()
            .find(|f| f.subtype == system_event::subtype::ENDIAN_MARKER)
            .unwrap();
        assert_eq!(endian.payload, vec![system_event::ENDIAN_MARKER_VALUE]);
        Ok(())
    }

    #[test]
    fn split_on_message_boundary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("split.zip");
        let config = test_config();

        let preamble = make_preamble(ConnectionType::Usb, &config, 0)?;
        let writer_config = WriterConfig {
            basename: "split".into(),
            split_threshold: Some(100),
            ..Default::default()
        };
        let mut writer = ListfileWriter::create(&path, writer_config, ConnectionType::Usb, &preamble)?;

        // Each message is larger than the threshold, so every write ends
        // its entry but is never split itself.
        let messages: Vec<Vec<u8>> = vec![vec![0x11; 600], vec![0x22; 600], vec![0x33; 600]];
        for m in &messages {
            writer.write(m)?;
        }
        writer.close()?;

        let mut reader = ListfileReader::open(&path)?;
        let names = reader.entry_names();
        assert_eq!(
            names,
            vec![
                "split.mvmelst".to_string(),
                "split_part002.mvmelst".to_string(),
                "split_part003.mvmelst".to_string(),
                "split_part004.mvmelst".to_string(),
            ]
        );

        let _ = reader.read_preamble()?;
        let data = read_all(&mut reader);

        let mut expected = Vec::new();
        for m in &messages {
            expected.extend_from_slice(m);
        }
        assert_eq!(data, expected);
        Ok(())
    }

    #[test]
    fn lz4_entry_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lz4.zip");
        let config = test_config();

        let preamble = make_preamble(ConnectionType::Eth, &config, 0)?;
        let writer_config = WriterConfig {
            basename: "lz4run".into(),
            compression: EntryCompression::Lz4,
            split_threshold: Some(512),
            ..Default::default()
        };
        let mut writer = ListfileWriter::create(&path, writer_config, ConnectionType::Eth, &preamble)?;

        let payload: Vec<u8> = (0..4096u32).flat_map(|w| w.to_le_bytes()).collect();
        writer.write(&payload)?;
        writer.write(&payload)?;
        writer.close()?;

        let mut reader = ListfileReader::open(&path)?;
        assert!(reader.entry_names().iter().all(|n| n.ends_with(".mvmelst.lz4")));

        let _ = reader.read_preamble()?;
        let data = read_all(&mut reader);

        let mut expected = payload.clone();
        expected.extend_from_slice(&payload);
        assert_eq!(data, expected);
        Ok(())
    }

    #[test]
    fn no_split_without_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nosplit.zip");
        let preamble = make_preamble(ConnectionType::Usb, &test_config(), 0)?;
        let mut writer = ListfileWriter::create(&path, WriterConfig::default(), ConnectionType::Usb, &preamble)?;

        for _ in 0..10 {
            writer.write(&[0xab; 4096])?;
        }
        writer.close()?;

        let reader = ListfileReader::open(&path)?;
        assert_eq!(reader.entry_count(), 1);
        Ok(())
    }

    #[test]
    fn system_event_frame_splitting() {
        let payload = vec![0u32; system_event::MAX_CONTENTS_WORDS + 10];
        let frames = make_system_event_frames(system_event::subtype::VME_CONFIG, &payload);

        let first = extract_frame_info(frames[0]);
        assert_eq!(usize::from(first.len), system_event::MAX_CONTENTS_WORDS);
        assert!(system_event::has_continue(frames[0]));

        let second_header = frames[1 + system_event::MAX_CONTENTS_WORDS];
        assert_eq!(usize::from(extract_frame_info(second_header).len), 10);
        assert!(!system_event::has_continue(second_header));
    }
}

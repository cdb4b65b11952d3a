//! End-to-end test: write a listfile, replay it through the full pipeline
//! and check that every recorded event comes back out of the parser.
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use mvlc_daq::command::{StackCommandBuilder, VMEDataWidth, vme_amods};
use mvlc_daq::config::{Connection, CrateConfig, Trigger};
use mvlc_daq::frame::{FrameType, make_frame_header};
use mvlc_daq::listfile::{
    EntryCompression, ListfileReader, ListfileWriter, WriteHandle, WriterConfig, make_preamble,
};
use mvlc_daq::message::ModuleData;
use mvlc_daq::pipeline::link;
use mvlc_daq::readout_parser::ReadoutParser;
use mvlc_daq::replay::{ReplayOutputs, spawn_replay};
use mvlc_daq::stages::{EventConsumer, spawn_event_consumer, spawn_readout_parser};
use mvlc_daq::transport::ConnectionType;

fn test_config(crate_id: u8) -> CrateConfig {
    CrateConfig {
        crate_id,
        connection: Connection::Usb {
            index: Some(u32::from(crate_id)),
            serial: None,
        },
        readout_stacks: vec![
            StackCommandBuilder::new()
                .begin_group("mdpp16")
                .add_vme_read(0xffff_6030, vme_amods::A32_USER_DATA, VMEDataWidth::D16)
                .add_vme_block_read(0x0100_0000, vme_amods::MBLT64, 0xffff),
        ],
        triggers: vec![Trigger::IrqWithIack { irq: 1 }],
        ..Default::default()
    }
}

/// One event as it appears on the wire: a stack frame containing one
/// prefix word and a two-word block read.
fn event_frames(crate_id: u8, seed: u32) -> Vec<u32> {
    vec![
        make_frame_header(FrameType::StackFrame, 0, 1, crate_id, 4),
        0xAAAA_0000 | seed,
        make_frame_header(FrameType::BlockRead, 0, 0, 0, 2),
        seed,
        seed.wrapping_mul(3),
    ]
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[derive(Default, Clone)]
struct Collector {
    events: Arc<Mutex<Vec<(u8, u8, Vec<ModuleData>)>>>,
}

impl EventConsumer for Collector {
    fn begin_event(&mut self, crate_id: u8, event_index: u8) {
        self.events.lock().push((crate_id, event_index, Vec::new()));
    }
    fn module_data(&mut self, _ci: u8, _ei: u8, _mi: u8, data: &ModuleData) {
        self.events.lock().last_mut().unwrap().2.push(data.clone());
    }
}

#[test]
fn single_crate_roundtrip() -> Result<()> {
    const EVENT_COUNT: u32 = 50;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("run042.zip");
    let config = test_config(0);

    // Record: a small split threshold forces several archive entries.
    {
        let preamble = make_preamble(ConnectionType::Usb, &config, 1_700_000_000)?;
        let writer_config = WriterConfig {
            basename: "run042".into(),
            compression: EntryCompression::Lz4,
            split_threshold: Some(300),
            ..Default::default()
        };
        let mut writer = ListfileWriter::create(&path, writer_config, ConnectionType::Usb, &preamble)?;

        // Ten events per write; splits land between writes.
        for batch in 0..EVENT_COUNT / 10 {
            let mut words = Vec::new();
            for i in 0..10 {
                words.extend(event_frames(0, batch * 10 + i));
            }
            writer.write(&words_to_bytes(&words))?;
        }
        writer.close()?;
    }

    // Replay: archive -> demux -> parser -> collector.
    let mut reader = ListfileReader::open(&path)?;
    assert!(reader.entry_count() > 1, "expected the archive to be split");

    let preamble = reader.read_preamble()?;
    assert_eq!(preamble.buffer_type, ConnectionType::Usb);
    assert_eq!(preamble.unix_timestamp(), Some(1_700_000_000));

    let recovered = preamble.crate_config()?;
    assert_eq!(recovered, config);

    let parser = ReadoutParser::new(ConnectionType::Usb, &recovered.readout_stacks)?;

    let (raw_tx, raw_rx) = link(16);
    let (parsed_tx, parsed_rx) = link(16);

    let collector = Collector::default();
    let events = collector.events.clone();

    let mut outputs = ReplayOutputs::new();
    outputs.set_writer(0, Box::new(raw_tx));

    let replay = spawn_replay("replay", Box::new(reader), outputs);
    let parser_job = spawn_readout_parser("parser", 0, parser, raw_rx, Box::new(parsed_tx));
    let consumer_job = spawn_event_consumer("collector", parsed_rx, Box::new(collector));

    assert!(!replay.join().has_error());
    assert!(!parser_job.join().has_error());
    assert!(!consumer_job.join().has_error());

    let events = events.lock();
    assert_eq!(events.len(), EVENT_COUNT as usize);

    for (seed, (crate_id, event_index, modules)) in events.iter().enumerate() {
        let seed = seed as u32;
        assert_eq!(*crate_id, 0);
        assert_eq!(*event_index, 0);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].prefix, vec![0xAAAA_0000 | seed]);
        assert_eq!(modules[0].dynamic, vec![seed, seed.wrapping_mul(3)]);
        assert!(modules[0].has_dynamic);
        assert!(modules[0].suffix.is_empty());
    }

    Ok(())
}

#[test]
fn two_crate_replay_demultiplexes() -> Result<()> {
    const EVENTS_PER_CRATE: u32 = 20;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("multicrate.zip");
    let config0 = test_config(0);
    let config1 = test_config(1);

    // The merged stream interleaves frames from both crates, the way a
    // multi-crate listfile writer records them.
    {
        let preamble = make_preamble(ConnectionType::Usb, &config0, 0)?;
        let mut writer = ListfileWriter::create(&path, WriterConfig::default(), ConnectionType::Usb, &preamble)?;

        let mut words = Vec::new();
        for i in 0..EVENTS_PER_CRATE {
            words.extend(event_frames(0, i));
            words.extend(event_frames(1, 1000 + i));
        }
        writer.write(&words_to_bytes(&words))?;
        writer.close()?;
    }

    let mut reader = ListfileReader::open(&path)?;
    let _ = reader.read_preamble()?;

    let mut outputs = ReplayOutputs::new();
    let mut parser_jobs = Vec::new();
    let mut collectors = Vec::new();
    let mut consumer_jobs = Vec::new();

    for (crate_id, config) in [(0u8, &config0), (1u8, &config1)] {
        let (raw_tx, raw_rx) = link(16);
        let (parsed_tx, parsed_rx) = link(16);

        outputs.set_writer(crate_id, Box::new(raw_tx));

        let parser = ReadoutParser::new(ConnectionType::Usb, &config.readout_stacks)?;
        parser_jobs.push(spawn_readout_parser(
            &format!("parser{crate_id}"),
            crate_id,
            parser,
            raw_rx,
            Box::new(parsed_tx),
        ));

        let collector = Collector::default();
        collectors.push(collector.events.clone());
        consumer_jobs.push(spawn_event_consumer(
            &format!("collector{crate_id}"),
            parsed_rx,
            Box::new(collector),
        ));
    }

    let replay = spawn_replay("replay", Box::new(reader), outputs);

    assert!(!replay.join().has_error());
    for job in parser_jobs {
        assert!(!job.join().has_error());
    }
    for job in consumer_jobs {
        assert!(!job.join().has_error());
    }

    for (crate_id, events) in collectors.iter().enumerate() {
        let events = events.lock();
        assert_eq!(events.len(), EVENTS_PER_CRATE as usize, "crate {crate_id}");

        for (i, (ci, _ei, modules)) in events.iter().enumerate() {
            assert_eq!(usize::from(*ci), crate_id);
            let seed = if crate_id == 0 { i as u32 } else { 1000 + i as u32 };
            assert_eq!(modules[0].dynamic, vec![seed, seed.wrapping_mul(3)]);
        }
    }

    Ok(())
}

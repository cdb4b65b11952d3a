/*! Owning handle for one MVLC controller.

[`Mvlc`] bundles a transport, the dialog layer and the per-pipe locks.
Dialog operations take only the command pipe lock, so the data pipe can be
drained concurrently by the readout producer. Connect and disconnect
sequences take both locks in command then data order.

Dropping the handle tears down the transport. Reconnecting means building a
fresh handle.
*/
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::command::{
    SplitOptions, StackCommand, StackCommandBuilder, VMEDataWidth, make_stack_buffer, split_commands, stacks,
    vme_amods,
};
use crate::config::{Connection, CrateConfig};
use crate::dialog::Dialog;
use crate::frame::{self, extract_frame_info};
use crate::transport::{ConnectionType, PipeLocks, Transport};
use crate::{Error, Result};

/// Internal register addresses.
pub mod registers {
    /// Send gap for USB in 0.415 us steps.
    pub const USB_SEND_GAP: u16 = 0x0400;

    pub const OWN_IP_LO: u16 = 0x4400;
    pub const OWN_IP_HI: u16 = 0x4402;
    pub const CMD_IP_LO: u16 = 0x440c;
    pub const CMD_IP_HI: u16 = 0x440e;
    pub const CMD_DEST_PORT: u16 = 0x441a;
    pub const DATA_DEST_PORT: u16 = 0x441c;

    /// Bit 0 enables autonomous stack execution in reaction to triggers.
    pub const DAQ_MODE_ENABLE: u16 = 0x1300;

    pub const RESET_REGISTER: u16 = 0x6090;
    pub const HARDWARE_ID: u16 = 0x6008;
    pub const FIRMWARE_REVISION: u16 = 0x600e;
}

/// Expected value of the hardware id register.
pub const HARDWARE_ID_MVLC: u32 = 0x5008;

/// Result of one executed stack command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub command: StackCommand,
    /// Response words produced by this command. Single reads and markers
    /// yield one word, block reads the block payload, writes nothing.
    pub response: Vec<u32>,
}

pub struct Mvlc {
    transport: Arc<dyn Transport>,
    dialog: Mutex<Dialog>,
    locks: PipeLocks,
}

impl Mvlc {
    /// Wrap an already connected transport.
    pub fn from_transport(transport: Arc<dyn Transport>) -> Mvlc {
        Mvlc {
            dialog: Mutex::new(Dialog::new(transport.clone())),
            transport,
            locks: PipeLocks::default(),
        }
    }

    /// Connect according to the config's connection descriptor and verify
    /// the peer is an MVLC.
    pub fn connect(connection: &Connection) -> Result<Mvlc> {
        let mvlc = match connection {
            Connection::Eth { host } => {
                let transport = crate::eth::EthTransport::connect(host)?;
                let mvlc = Mvlc::from_transport(Arc::new(transport));
                mvlc.post_connect_eth()?;
                mvlc
            }
            #[cfg(feature = "usb")]
            Connection::Usb { index, serial } => {
                let transport = match serial {
                    Some(serial) => crate::usb::UsbTransport::open_by_serial(serial)?,
                    None => crate::usb::UsbTransport::open_by_index(index.unwrap_or(0) as usize)?,
                };
                Mvlc::from_transport(Arc::new(transport))
            }
            #[cfg(not(feature = "usb"))]
            Connection::Usb { .. } => {
                return Err(Error::UnsupportedOperation("USB support not compiled in"));
            }
        };

        let id = mvlc.read_register(registers::HARDWARE_ID)?;
        if id != HARDWARE_ID_MVLC {
            return Err(Error::ConnectionError(format!(
                "hardware id {id:#06x}, expected {HARDWARE_ID_MVLC:#06x}"
            )));
        }

        info!("connected, firmware {:#06x}", mvlc.read_register(registers::FIRMWARE_REVISION)?);
        Ok(mvlc)
    }

    // Reading the command IP registers makes the MVLC record the client as
    // its command destination.
    fn post_connect_eth(&self) -> Result<()> {
        let _guard = self.locks.lock_both();
        let mut dialog = self.dialog.lock();
        let lo = dialog.read_register(registers::CMD_IP_LO)?;
        let hi = dialog.read_register(registers::CMD_IP_HI)?;
        debug!("mvlc command ip registers: {hi:#06x}:{lo:#06x}");
        Ok(())
    }

    #[must_use]
    pub fn connection_type(&self) -> ConnectionType {
        self.transport.connection_type()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn locks(&self) -> &PipeLocks {
        &self.locks
    }

    pub fn read_register(&self, address: u16) -> Result<u32> {
        let _guard = self.locks.lock_cmd();
        self.dialog.lock().read_register(address)
    }

    pub fn write_register(&self, address: u16, value: u32) -> Result<()> {
        let _guard = self.locks.lock_cmd();
        self.dialog.lock().write_register(address, value)
    }

    pub fn vme_read(&self, address: u32, amod: u8, data_width: VMEDataWidth) -> Result<u32> {
        let _guard = self.locks.lock_cmd();
        self.dialog.lock().vme_read(address, amod, data_width)
    }

    pub fn vme_write(&self, address: u32, value: u32, amod: u8, data_width: VMEDataWidth) -> Result<()> {
        let _guard = self.locks.lock_cmd();
        self.dialog.lock().vme_write(address, value, amod, data_width)
    }

    pub fn vme_block_read(&self, address: u32, amod: u8, max_transfers: u16) -> Result<Vec<u32>> {
        let _guard = self.locks.lock_cmd();
        let response = self.dialog.lock().vme_block_read(address, amod, max_transfers)?;
        let results = parse_stack_response(
            &[StackCommand::VMEBlockRead {
                address,
                amod,
                transfers: max_transfers,
            }],
            &response,
        )?;
        Ok(results.into_iter().next().map(|r| r.response).unwrap_or_default())
    }

    pub fn take_stack_error_notifications(&self) -> Vec<Vec<u32>> {
        let _guard = self.locks.lock_cmd();
        self.dialog.lock().take_stack_error_notifications()
    }

    /// Upload a stack program to the given word offset in stack memory,
    /// routing its output to `output_pipe`.
    pub fn upload_stack(&self, output_pipe: u8, offset_words: u16, commands: &[StackCommand]) -> Result<()> {
        let words = make_stack_buffer(commands)?;
        let encoded = words.len() + 2;
        let avail = usize::from(stacks::STACK_MEMORY_WORDS) - usize::from(offset_words);

        if encoded > avail {
            return Err(Error::StackMemoryExceeded);
        }

        let _guard = self.locks.lock_cmd();
        let mut dialog = self.dialog.lock();

        let upload = crate::command::make_command_buffer(
            &crate::command::make_stack_upload_commands(output_pipe, offset_words * 4, &words),
        );
        dialog.mirror_transaction(&upload)?;
        Ok(())
    }

    /// Execute a command list through the immediate stack, batching as
    /// allowed by `options`. Software delay parts sleep on the host.
    pub fn run_commands(&self, commands: &[StackCommand], options: SplitOptions) -> Result<Vec<CommandResult>> {
        let parts = split_commands(commands, options, stacks::IMMEDIATE_STACK_RESERVED_WORDS)?;
        let mut results = Vec::with_capacity(commands.len());

        for part in parts {
            if let [StackCommand::SoftwareDelay { ms }] = part.as_slice() {
                debug!("software delay: {ms} ms");
                std::thread::sleep(std::time::Duration::from_millis(u64::from(*ms)));
                results.push(CommandResult {
                    command: part[0],
                    response: Vec::new(),
                });
                continue;
            }

            let response = {
                let _guard = self.locks.lock_cmd();
                let mut dialog = self.dialog.lock();
                let words = make_stack_buffer(&part)?;
                let upload = crate::command::make_command_buffer(
                    &crate::command::make_stack_upload_commands(crate::transport::Pipe::Command as u8, 0, &words),
                );
                dialog.stack_transaction(&upload)?
            };

            results.extend(parse_stack_response(&part, &response)?);
        }

        Ok(results)
    }

    /// Run a builder's commands, e.g. a config's init sequence.
    pub fn run_builder(&self, builder: &StackCommandBuilder, options: SplitOptions) -> Result<Vec<CommandResult>> {
        self.run_commands(&builder.get_commands(), options)
    }

    /// Upload the readout stacks, program the triggers and enable DAQ mode.
    pub fn start_daq(&self, config: &CrateConfig) -> Result<()> {
        config.validate()?;

        // No triggers may fire while stacks are being replaced.
        self.write_register(registers::DAQ_MODE_ENABLE, 0)?;

        self.run_builder(&config.trigger_io, SplitOptions::default())?;
        self.run_builder(&config.init_commands, SplitOptions::default())?;

        let mut offset_words = stacks::IMMEDIATE_STACK_RESERVED_WORDS;

        for (i, stack) in config.readout_stacks.iter().enumerate() {
            let stack_id = stacks::FIRST_READOUT_STACK_ID + i as u8;
            let commands = stack.get_commands();

            self.upload_stack(crate::transport::Pipe::Data as u8, offset_words, &commands)?;
            self.write_register(stacks::get_offset_register(stack_id), u32::from(offset_words) * 4)?;

            offset_words += (make_stack_buffer(&commands)?.len() + 2) as u16;
        }

        for (i, trigger) in config.triggers.iter().enumerate() {
            let stack_id = stacks::FIRST_READOUT_STACK_ID + i as u8;
            self.write_register(stacks::get_trigger_register(stack_id), trigger.register_value())?;
        }

        self.write_register(registers::DAQ_MODE_ENABLE, 1)?;
        info!("daq mode enabled, {} readout stacks", config.readout_stacks.len());
        Ok(())
    }

    /// Disable triggers and DAQ mode, then run the shutdown sequence.
    pub fn stop_daq(&self, config: &CrateConfig) -> Result<()> {
        self.write_register(registers::DAQ_MODE_ENABLE, 0)?;

        for i in 0..config.triggers.len() {
            let stack_id = stacks::FIRST_READOUT_STACK_ID + i as u8;
            self.write_register(stacks::get_trigger_register(stack_id), 0)?;
        }

        self.run_builder(&config.shutdown_commands, SplitOptions::default())?;
        info!("daq mode disabled");
        Ok(())
    }
}

/// Map a raw stack response (as returned by the dialog, outer frame headers
/// included) back onto the command list that produced it.
pub fn parse_stack_response(commands: &[StackCommand], response: &[u32]) -> Result<Vec<CommandResult>> {
    // Flatten the outer StackFrame/StackContinuation framing first; block
    // read frames remain inline in the payload.
    let mut payload = Vec::with_capacity(response.len());
    let mut it = response.iter().copied().peekable();

    while let Some(header) = it.next() {
        if !frame::is_stack_frame(header) && !frame::is_stack_continuation(header) {
            return Err(Error::InvalidStackHeader(header));
        }
        let len = usize::from(extract_frame_info(header).len);
        for _ in 0..len {
            payload.push(it.next().ok_or(Error::TruncatedInput)?);
        }
    }

    let mut words = payload.iter().copied().peekable();
    let mut results = Vec::with_capacity(commands.len());

    for &command in commands {
        let mut result = CommandResult {
            command,
            response: Vec::new(),
        };

        match command {
            StackCommand::VMERead { data_width, amod, .. } => {
                debug_assert!(!vme_amods::is_block_mode(amod));
                let value = words.next().ok_or(Error::TruncatedInput)?;
                let mask = match data_width {
                    VMEDataWidth::D16 => 0x0000_ffff,
                    VMEDataWidth::D32 => 0xffff_ffff,
                };
                result.response.push(value & mask);
            }
            StackCommand::VMEBlockRead { .. } | StackCommand::VMEBlockRead2eSST { .. } => loop {
                let header = words.next().ok_or(Error::TruncatedInput)?;
                if !frame::is_blockread_frame(header) {
                    return Err(Error::InvalidStackHeader(header));
                }
                let info = extract_frame_info(header);
                for _ in 0..info.len {
                    result.response.push(words.next().ok_or(Error::TruncatedInput)?);
                }
                if !info.has_continue() {
                    break;
                }
            },
            StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => {
                result.response.push(words.next().ok_or(Error::TruncatedInput)?);
            }
            StackCommand::VMEWrite { .. } | StackCommand::SoftwareDelay { .. } => {}
        }

        results.push(result);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameType, frame_flags, make_frame_header};

    #[test]
    fn parse_single_read_response() -> Result<()> {
        let commands = [StackCommand::VMERead {
            address: 0x1337,
            amod: vme_amods::A32_USER_DATA,
            data_width: VMEDataWidth::D16,
        }];
        let response = [make_frame_header(FrameType::StackFrame, 0, 0, 0, 1), 0xaabb_ccdd];

        let results = parse_stack_response(&commands, &response)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].response, vec![0xccdd]);
        Ok(())
    }

    #[test]
    fn parse_block_read_with_continuation() -> Result<()> {
        let commands = [StackCommand::VMEBlockRead {
            address: 0,
            amod: vme_amods::MBLT64,
            transfers: 4,
        }];
        let response = [
            make_frame_header(FrameType::StackFrame, 0, 0, 0, 6),
            make_frame_header(FrameType::BlockRead, frame_flags::CONTINUE, 0, 0, 2),
            0x11,
            0x22,
            make_frame_header(FrameType::BlockRead, 0, 0, 0, 2),
            0x33,
            0x44,
        ];

        let results = parse_stack_response(&commands, &response)?;
        assert_eq!(results[0].response, vec![0x11, 0x22, 0x33, 0x44]);
        Ok(())
    }

    #[test]
    fn parse_mixed_commands() -> Result<()> {
        let commands = [
            StackCommand::VMEWrite {
                address: 0x6090,
                value: 3,
                amod: vme_amods::A32_USER_DATA,
                data_width: VMEDataWidth::D16,
            },
            StackCommand::WriteMarker { value: 0x1234_5678 },
            StackCommand::VMERead {
                address: 0x6008,
                amod: vme_amods::A32_USER_DATA,
                data_width: VMEDataWidth::D32,
            },
        ];
        let response = [
            make_frame_header(FrameType::StackFrame, 0, 0, 0, 2),
            0x1234_5678,
            0x0000_5008,
        ];

        let results = parse_stack_response(&commands, &response)?;
        assert_eq!(results[0].response, Vec::<u32>::new());
        assert_eq!(results[1].response, vec![0x1234_5678]);
        assert_eq!(results[2].response, vec![0x5008]);
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_outer_header() {
        let commands = [StackCommand::WriteMarker { value: 1 }];
        let response = [make_frame_header(FrameType::SuperFrame, 0, 0, 0, 1), 1];
        assert!(matches!(
            parse_stack_response(&commands, &response),
            Err(Error::InvalidStackHeader(_))
        ));
    }

    #[test]
    fn parse_spans_stack_continuations() -> Result<()> {
        // Payload split across a StackFrame and a StackContinuation.
        let commands = [
            StackCommand::WriteMarker { value: 1 },
            StackCommand::WriteMarker { value: 2 },
        ];
        let response = [
            make_frame_header(FrameType::StackFrame, frame_flags::CONTINUE, 0, 0, 1),
            0xa,
            make_frame_header(FrameType::StackContinuation, 0, 0, 0, 1),
            0xb,
        ];

        let results = parse_stack_response(&commands, &response)?;
        assert_eq!(results[0].response, vec![0xa]);
        assert_eq!(results[1].response, vec![0xb]);
        Ok(())
    }
}

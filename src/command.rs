/*! MVLC command model: super commands, stack commands and their builders.

Super commands are interpreted directly by the MVLC and always respond on
the command pipe. Stack commands are written into the controller's stack
memory and executed autonomously in response to triggers, or immediately
through the stack 0 trigger register.

Programs are built with [`SuperCommandBuilder`] and [`StackCommandBuilder`]
and serialized to the 32-bit word format with [`make_command_buffer`] and
[`make_stack_buffer`].
*/
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The standard VME address modifiers.
pub mod vme_amods {
    pub const A32_USER_DATA: u8 = 0x09;
    pub const A32_USER_PROGRAM: u8 = 0x0A;
    pub const A32_USER_BLOCK: u8 = 0x0B;
    pub const A32_USER_BLOCK64: u8 = 0x08;

    pub const A32_PRIV_DATA: u8 = 0x0D;
    pub const A32_PRIV_PROGRAM: u8 = 0x0E;
    pub const A32_PRIV_BLOCK: u8 = 0x0F;
    pub const A32_PRIV_BLOCK64: u8 = 0x0C;

    pub const A24_USER_DATA: u8 = 0x39;
    pub const A24_USER_BLOCK: u8 = 0x3B;

    pub const A16_USER: u8 = 0x29;
    pub const A16_PRIV: u8 = 0x2D;

    pub const BLT32: u8 = A32_PRIV_BLOCK;
    pub const MBLT64: u8 = A32_PRIV_BLOCK64;
    pub const BLK_2ESST64: u8 = 0x21;

    #[must_use]
    pub fn is_blt_mode(amod: u8) -> bool {
        matches!(amod, A32_USER_BLOCK | A32_PRIV_BLOCK | A24_USER_BLOCK)
    }

    #[must_use]
    pub fn is_mblt_mode(amod: u8) -> bool {
        matches!(amod, A32_USER_BLOCK64 | A32_PRIV_BLOCK64)
    }

    #[must_use]
    pub fn is_esst64_mode(amod: u8) -> bool {
        amod == BLK_2ESST64
    }

    #[must_use]
    pub fn is_block_mode(amod: u8) -> bool {
        is_blt_mode(amod) || is_mblt_mode(amod) || is_esst64_mode(amod)
    }
}

/// Stack memory layout and per-stack register addresses.
pub mod stacks {
    pub const STACK_COUNT: u8 = 8;
    pub const STACK0_TRIGGER_REGISTER: u16 = 0x1100;
    /// Offsets are relative to STACK_MEMORY_BEGIN, counted in bytes.
    pub const STACK0_OFFSET_REGISTER: u16 = 0x1200;

    pub const STACK_MEMORY_BEGIN: u16 = 0x2000;
    pub const STACK_MEMORY_WORDS: u16 = 1024;
    pub const STACK_MEMORY_BYTES: u16 = STACK_MEMORY_WORDS * 4;

    /// Stack 0 is reserved for immediate execution by the dialog layer.
    pub const IMMEDIATE_STACK_ID: u8 = 0;
    pub const IMMEDIATE_STACK_RESERVED_WORDS: u16 = 128;
    pub const FIRST_READOUT_STACK_ID: u8 = 1;

    pub const TRIGGER_BITS_MASK: u16 = 0b11111;
    pub const TRIGGER_TYPE_SHIFT: u16 = 5;
    pub const IMMEDIATE_SHIFT: u16 = 8;

    #[must_use]
    pub fn get_trigger_register(stack_id: u8) -> u16 {
        STACK0_TRIGGER_REGISTER + u16::from(stack_id) * 4
    }

    #[must_use]
    pub fn get_offset_register(stack_id: u8) -> u16 {
        STACK0_OFFSET_REGISTER + u16::from(stack_id) * 4
    }
}

const SUPER_CMD_SHIFT: u32 = 16;
const SUPER_CMD_MASK: u32 = 0xffff;
const SUPER_CMD_ARG_MASK: u32 = 0xffff;

const STACK_CMD_SHIFT: u32 = 24;
const STACK_CMD_MASK: u32 = 0xff;
const STACK_ARG0_SHIFT: u32 = 16;
const STACK_ARG0_MASK: u32 = 0xff;
const STACK_ARG1_MASK: u32 = 0xffff;

/// 16-bit opcodes of the super command set.
mod super_opcodes {
    pub const CMD_BUFFER_START: u16 = 0xF100;
    pub const CMD_BUFFER_END: u16 = 0xF200;
    pub const REFERENCE_WORD: u16 = 0x0101;
    pub const READ_LOCAL: u16 = 0x0102;
    pub const READ_LOCAL_BLOCK: u16 = 0x0103;
    pub const WRITE_LOCAL: u16 = 0x0204;
    pub const WRITE_RESET: u16 = 0x0206;
}

/// 8-bit opcodes of the stack command set.
mod stack_opcodes {
    pub const STACK_START: u8 = 0xF3;
    pub const STACK_END: u8 = 0xF4;
    pub const VME_READ: u8 = 0x12;
    pub const VME_WRITE: u8 = 0x23;
    pub const WRITE_MARKER: u8 = 0xC2;
    pub const WRITE_SPECIAL: u8 = 0xC1;
}

/// VME data width of single-word reads and writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VMEDataWidth {
    D16 = 0x1,
    #[default]
    D32 = 0x2,
}

impl VMEDataWidth {
    fn from_arg(arg: u16) -> Result<VMEDataWidth> {
        match arg {
            0x1 => Ok(VMEDataWidth::D16),
            0x2 => Ok(VMEDataWidth::D32),
            _ => Err(Error::UnknownOpcode(arg)),
        }
    }
}

/// Transfer rate of 2eSST64 block reads. Encoded in the two bits above the
/// address modifier argument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Blk2eSSTRate {
    #[default]
    Rate160MB = 0,
    Rate276MB = 1,
    Rate300MB = 2,
}

const BLK_2ESST_RATE_SHIFT: u32 = 6;

impl Blk2eSSTRate {
    fn from_bits(bits: u8) -> Blk2eSSTRate {
        match bits & 0b11 {
            1 => Blk2eSSTRate::Rate276MB,
            2 => Blk2eSSTRate::Rate300MB,
            _ => Blk2eSSTRate::Rate160MB,
        }
    }
}

/// A command interpreted directly by the MVLC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuperCommand {
    /// Opaque 16-bit marker echoed in the mirror response.
    ReferenceWord(u16),
    /// Read one internal register.
    ReadLocal { address: u16 },
    /// Read a block of internal registers.
    ReadLocalBlock { address: u16, words: u16 },
    /// Write one internal register.
    WriteLocal { address: u16, value: u32 },
    /// Soft reset via a register write.
    WriteReset,
}

impl SuperCommand {
    /// Number of 32-bit words this command occupies in a command buffer.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            SuperCommand::ReferenceWord(_) | SuperCommand::ReadLocal { .. } | SuperCommand::WriteReset => 1,
            SuperCommand::ReadLocalBlock { .. } | SuperCommand::WriteLocal { .. } => 2,
        }
    }
}

/// A command executable from MVLC stack memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackCommand {
    /// Single VME register read.
    VMERead {
        address: u32,
        amod: u8,
        data_width: VMEDataWidth,
    },
    /// BLT/MBLT block read. `transfers` bounds the number of cycles.
    VMEBlockRead { address: u32, amod: u8, transfers: u16 },
    /// 2eSST64 block read at one of the three fixed rates.
    VMEBlockRead2eSST {
        address: u32,
        rate: Blk2eSSTRate,
        transfers: u16,
    },
    /// Single VME write.
    VMEWrite {
        address: u32,
        value: u32,
        amod: u8,
        data_width: VMEDataWidth,
    },
    /// Emit a literal marker word into the output stream.
    WriteMarker { value: u32 },
    /// Emit an MVLC generated special word (timestamp, trigger summary).
    WriteSpecial { value: u32 },
    /// Host-side delay. Never serialized; the executor splits batches on it
    /// and sleeps instead.
    SoftwareDelay { ms: u32 },
}

impl StackCommand {
    /// Number of 32-bit words this command occupies in stack memory.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            StackCommand::VMERead { .. }
            | StackCommand::VMEBlockRead { .. }
            | StackCommand::VMEBlockRead2eSST { .. }
            | StackCommand::WriteMarker { .. } => 2,
            StackCommand::VMEWrite { .. } => 3,
            StackCommand::WriteSpecial { .. } => 1,
            StackCommand::SoftwareDelay { .. } => 0,
        }
    }
}

/// Append-only list of super commands.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuperCommandBuilder {
    commands: Vec<SuperCommand>,
}

impl SuperCommandBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference_word(mut self, value: u16) -> Self {
        self.commands.push(SuperCommand::ReferenceWord(value));
        self
    }

    pub fn add_read_local(mut self, address: u16) -> Self {
        self.commands.push(SuperCommand::ReadLocal { address });
        self
    }

    pub fn add_read_local_block(mut self, address: u16, words: u16) -> Self {
        self.commands.push(SuperCommand::ReadLocalBlock { address, words });
        self
    }

    pub fn add_write_local(mut self, address: u16, value: u32) -> Self {
        self.commands.push(SuperCommand::WriteLocal { address, value });
        self
    }

    pub fn add_write_reset(mut self) -> Self {
        self.commands.push(SuperCommand::WriteReset);
        self
    }

    pub fn add_commands(mut self, commands: &[SuperCommand]) -> Self {
        self.commands.extend_from_slice(commands);
        self
    }

    /// Upload a stack into stack memory at the given byte offset, routing
    /// its output to `output_pipe`.
    pub fn add_stack_upload(self, stack: &StackCommandBuilder, output_pipe: u8, offset: u16) -> Result<Self> {
        let words = make_stack_buffer(&stack.get_commands())?;
        Ok(self.add_commands(&make_stack_upload_commands(output_pipe, offset, &words)))
    }

    #[must_use]
    pub fn get_commands(&self) -> Vec<SuperCommand> {
        self.commands.clone()
    }
}

/// A named subsequence of a stack, typically one module's readout commands.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub commands: Vec<StackCommand>,
}

/// Append-only list of stack commands, organized into named groups.
///
/// Commands added while no group is open implicitly open an anonymous group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StackCommandBuilder {
    groups: Vec<Group>,
}

impl StackCommandBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_commands(commands: &[StackCommand]) -> Self {
        let mut b = Self::new();
        for cmd in commands {
            b.push(*cmd);
        }
        b
    }

    fn push(&mut self, cmd: StackCommand) {
        if self.groups.is_empty() {
            self.groups.push(Group::default());
        }
        self.groups.last_mut().unwrap().commands.push(cmd);
    }

    pub fn begin_group<S: Into<String>>(mut self, name: S) -> Self {
        self.groups.push(Group {
            name: name.into(),
            commands: Vec::new(),
        });
        self
    }

    pub fn add_group<S: Into<String>>(mut self, name: S, commands: Vec<StackCommand>) -> Self {
        self.groups.push(Group {
            name: name.into(),
            commands,
        });
        self
    }

    pub fn add_command(mut self, cmd: StackCommand) -> Self {
        self.push(cmd);
        self
    }

    pub fn add_vme_read(mut self, address: u32, amod: u8, data_width: VMEDataWidth) -> Self {
        self.push(StackCommand::VMERead {
            address,
            amod,
            data_width,
        });
        self
    }

    pub fn add_vme_block_read(mut self, address: u32, amod: u8, transfers: u16) -> Self {
        self.push(StackCommand::VMEBlockRead {
            address,
            amod,
            transfers,
        });
        self
    }

    pub fn add_vme_block_read_2esst(mut self, address: u32, rate: Blk2eSSTRate, transfers: u16) -> Self {
        self.push(StackCommand::VMEBlockRead2eSST {
            address,
            rate,
            transfers,
        });
        self
    }

    pub fn add_vme_write(mut self, address: u32, value: u32, amod: u8, data_width: VMEDataWidth) -> Self {
        self.push(StackCommand::VMEWrite {
            address,
            value,
            amod,
            data_width,
        });
        self
    }

    pub fn add_write_marker(mut self, value: u32) -> Self {
        self.push(StackCommand::WriteMarker { value });
        self
    }

    pub fn add_software_delay(mut self, ms: u32) -> Self {
        self.push(StackCommand::SoftwareDelay { ms });
        self
    }

    /// All commands of all groups, flattened in order.
    #[must_use]
    pub fn get_commands(&self) -> Vec<StackCommand> {
        self.groups.iter().flat_map(|g| g.commands.iter().copied()).collect()
    }

    #[must_use]
    pub fn get_groups(&self) -> &[Group] {
        &self.groups
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn get_group(&self, index: usize) -> Option<&Group> {
        self.groups.get(index)
    }

    #[must_use]
    pub fn get_group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.commands.is_empty())
    }
}

/// Serialize super commands to the wire format, bracketed by the buffer
/// start/end markers.
#[must_use]
pub fn make_command_buffer(commands: &[SuperCommand]) -> Vec<u32> {
    let mut result = Vec::with_capacity(commands.len() + 2);

    result.push(u32::from(super_opcodes::CMD_BUFFER_START) << SUPER_CMD_SHIFT);

    for cmd in commands {
        match *cmd {
            SuperCommand::ReferenceWord(value) => {
                result.push(u32::from(super_opcodes::REFERENCE_WORD) << SUPER_CMD_SHIFT | u32::from(value));
            }
            SuperCommand::ReadLocal { address } => {
                result.push(u32::from(super_opcodes::READ_LOCAL) << SUPER_CMD_SHIFT | u32::from(address));
            }
            SuperCommand::ReadLocalBlock { address, words } => {
                result.push(u32::from(super_opcodes::READ_LOCAL_BLOCK) << SUPER_CMD_SHIFT | u32::from(address));
                result.push(u32::from(words));
            }
            SuperCommand::WriteLocal { address, value } => {
                result.push(u32::from(super_opcodes::WRITE_LOCAL) << SUPER_CMD_SHIFT | u32::from(address));
                result.push(value);
            }
            SuperCommand::WriteReset => {
                result.push(u32::from(super_opcodes::WRITE_RESET) << SUPER_CMD_SHIFT);
            }
        }
    }

    result.push(u32::from(super_opcodes::CMD_BUFFER_END) << SUPER_CMD_SHIFT);

    result
}

/// Decode a super command buffer. Buffer start/end markers are skipped, all
/// other words must form valid commands.
pub fn super_commands_from_buffer(buffer: &[u32]) -> Result<Vec<SuperCommand>> {
    let mut result = Vec::new();
    let mut it = buffer.iter();

    while let Some(&word) = it.next() {
        let opcode = ((word >> SUPER_CMD_SHIFT) & SUPER_CMD_MASK) as u16;
        let arg = (word & SUPER_CMD_ARG_MASK) as u16;

        match opcode {
            super_opcodes::CMD_BUFFER_START | super_opcodes::CMD_BUFFER_END => continue,
            super_opcodes::REFERENCE_WORD => result.push(SuperCommand::ReferenceWord(arg)),
            super_opcodes::READ_LOCAL => result.push(SuperCommand::ReadLocal { address: arg }),
            super_opcodes::READ_LOCAL_BLOCK => {
                let words = *it.next().ok_or(Error::TruncatedInput)?;
                result.push(SuperCommand::ReadLocalBlock {
                    address: arg,
                    words: (words & SUPER_CMD_ARG_MASK) as u16,
                });
            }
            super_opcodes::WRITE_LOCAL => {
                let value = *it.next().ok_or(Error::TruncatedInput)?;
                result.push(SuperCommand::WriteLocal { address: arg, value });
            }
            super_opcodes::WRITE_RESET => result.push(SuperCommand::WriteReset),
            other => return Err(Error::UnknownOpcode(other)),
        }
    }

    Ok(result)
}

/// Serialize stack commands to a stack memory image.
///
/// Fails on [`StackCommand::SoftwareDelay`], which only exists for the
/// host-side executor.
pub fn make_stack_buffer(commands: &[StackCommand]) -> Result<Vec<u32>> {
    let mut result = Vec::new();

    for cmd in commands {
        match *cmd {
            StackCommand::VMERead {
                address,
                amod,
                data_width,
            } => {
                result.push(
                    u32::from(stack_opcodes::VME_READ) << STACK_CMD_SHIFT
                        | u32::from(amod) << STACK_ARG0_SHIFT
                        | data_width as u32,
                );
                result.push(address);
            }
            StackCommand::VMEBlockRead {
                address,
                amod,
                transfers,
            } => {
                result.push(
                    u32::from(stack_opcodes::VME_READ) << STACK_CMD_SHIFT
                        | u32::from(amod) << STACK_ARG0_SHIFT
                        | u32::from(transfers),
                );
                result.push(address);
            }
            StackCommand::VMEBlockRead2eSST {
                address,
                rate,
                transfers,
            } => {
                let arg0 = u32::from(vme_amods::BLK_2ESST64) | (rate as u32) << BLK_2ESST_RATE_SHIFT;
                result.push(
                    u32::from(stack_opcodes::VME_READ) << STACK_CMD_SHIFT
                        | arg0 << STACK_ARG0_SHIFT
                        | u32::from(transfers),
                );
                result.push(address);
            }
            StackCommand::VMEWrite {
                address,
                value,
                amod,
                data_width,
            } => {
                result.push(
                    u32::from(stack_opcodes::VME_WRITE) << STACK_CMD_SHIFT
                        | u32::from(amod) << STACK_ARG0_SHIFT
                        | data_width as u32,
                );
                result.push(address);
                result.push(value);
            }
            StackCommand::WriteMarker { value } => {
                result.push(u32::from(stack_opcodes::WRITE_MARKER) << STACK_CMD_SHIFT);
                result.push(value);
            }
            StackCommand::WriteSpecial { value } => {
                result.push(u32::from(stack_opcodes::WRITE_SPECIAL) << STACK_CMD_SHIFT | (value & 0x00ff_ffff));
            }
            StackCommand::SoftwareDelay { .. } => {
                return Err(Error::NotSerializable("SoftwareDelay"));
            }
        }
    }

    Ok(result)
}

/// Decode a stack memory image. Stack start/end words are skipped.
pub fn stack_commands_from_buffer(buffer: &[u32]) -> Result<Vec<StackCommand>> {
    let mut result = Vec::new();
    let mut it = buffer.iter();

    while let Some(&word) = it.next() {
        let opcode = ((word >> STACK_CMD_SHIFT) & STACK_CMD_MASK) as u8;
        let arg0 = ((word >> STACK_ARG0_SHIFT) & STACK_ARG0_MASK) as u8;
        let arg1 = (word & STACK_ARG1_MASK) as u16;

        match opcode {
            stack_opcodes::STACK_START | stack_opcodes::STACK_END => continue,
            stack_opcodes::VME_READ => {
                let address = *it.next().ok_or(Error::TruncatedInput)?;
                let amod = arg0 & !(0b11u8 << BLK_2ESST_RATE_SHIFT);

                if vme_amods::is_esst64_mode(amod) {
                    result.push(StackCommand::VMEBlockRead2eSST {
                        address,
                        rate: Blk2eSSTRate::from_bits(arg0 >> BLK_2ESST_RATE_SHIFT),
                        transfers: arg1,
                    });
                } else if vme_amods::is_block_mode(arg0) {
                    result.push(StackCommand::VMEBlockRead {
                        address,
                        amod: arg0,
                        transfers: arg1,
                    });
                } else {
                    result.push(StackCommand::VMERead {
                        address,
                        amod: arg0,
                        data_width: VMEDataWidth::from_arg(arg1)?,
                    });
                }
            }
            stack_opcodes::VME_WRITE => {
                let address = *it.next().ok_or(Error::TruncatedInput)?;
                let value = *it.next().ok_or(Error::TruncatedInput)?;
                result.push(StackCommand::VMEWrite {
                    address,
                    value,
                    amod: arg0,
                    data_width: VMEDataWidth::from_arg(arg1)?,
                });
            }
            stack_opcodes::WRITE_MARKER => {
                let value = *it.next().ok_or(Error::TruncatedInput)?;
                result.push(StackCommand::WriteMarker { value });
            }
            stack_opcodes::WRITE_SPECIAL => {
                result.push(StackCommand::WriteSpecial {
                    value: word & 0x00ff_ffff,
                });
            }
            other => return Err(Error::UnknownOpcode(other.into())),
        }
    }

    Ok(result)
}

/// Build the super command list that uploads a serialized stack into stack
/// memory: one WriteLocal per stack word at consecutive addresses, bracketed
/// by stack start/end words. The start word encodes the output pipe.
#[must_use]
pub fn make_stack_upload_commands(output_pipe: u8, offset: u16, stack_words: &[u32]) -> Vec<SuperCommand> {
    let mut address = stacks::STACK_MEMORY_BEGIN + offset;
    let mut commands = Vec::with_capacity(stack_words.len() + 2);

    commands.push(SuperCommand::WriteLocal {
        address,
        value: u32::from(stack_opcodes::STACK_START) << STACK_CMD_SHIFT
            | u32::from(output_pipe) << STACK_ARG0_SHIFT,
    });
    address += 4;

    for &word in stack_words {
        commands.push(SuperCommand::WriteLocal { address, value: word });
        address += 4;
    }

    commands.push(SuperCommand::WriteLocal {
        address,
        value: u32::from(stack_opcodes::STACK_END) << STACK_CMD_SHIFT,
    });

    commands
}

/// Options for [`split_commands`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SplitOptions {
    /// Merge software delays into batches instead of splitting on them.
    pub ignore_delays: bool,
    /// Emit one command per part, unconditionally.
    pub no_batching: bool,
}

/// Split a command list into parts each of which fits into the immediate
/// stack. Software delays break the batch and become one-element parts
/// unless `ignore_delays` is set.
pub fn split_commands(
    commands: &[StackCommand],
    options: SplitOptions,
    immediate_stack_max_words: u16,
) -> Result<Vec<Vec<StackCommand>>> {
    if options.no_batching {
        return Ok(commands.iter().map(|&cmd| vec![cmd]).collect());
    }

    let max = immediate_stack_max_words as usize;
    let mut result: Vec<Vec<StackCommand>> = Vec::new();
    let mut part: Vec<StackCommand> = Vec::new();
    // Two words are reserved for the stack start/end bracket.
    let mut encoded_size = 2usize;

    for &cmd in commands {
        let is_delay = matches!(cmd, StackCommand::SoftwareDelay { .. });

        if is_delay && !options.ignore_delays {
            if !part.is_empty() {
                result.push(std::mem::take(&mut part));
            }
            result.push(vec![cmd]);
            encoded_size = 2;
            continue;
        }

        if encoded_size + cmd.encoded_size() > max {
            if part.is_empty() {
                return Err(Error::StackMemoryExceeded);
            }
            result.push(std::mem::take(&mut part));
            encoded_size = 2;
            if encoded_size + cmd.encoded_size() > max {
                return Err(Error::StackMemoryExceeded);
            }
        }

        encoded_size += cmd.encoded_size();
        part.push(cmd);
    }

    if !part.is_empty() {
        result.push(part);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_read_local_buffer() {
        let cmds = SuperCommandBuilder::new().add_read_local(0x1337).get_commands();
        let buffer = make_command_buffer(&cmds);
        assert_eq!(buffer, vec![0xF100_0000, 0x0102_1337, 0xF200_0000]);
    }

    #[test]
    fn super_reference_word_buffer() {
        let cmds = SuperCommandBuilder::new().add_reference_word(0x1337).get_commands();
        let buffer = make_command_buffer(&cmds);
        assert_eq!(buffer, vec![0xF100_0000, 0x0101_1337, 0xF200_0000]);
    }

    #[test]
    fn super_write_local_buffer() {
        let cmds = SuperCommandBuilder::new().add_write_local(0x1337, 42).get_commands();
        let buffer = make_command_buffer(&cmds);
        assert_eq!(buffer, vec![0xF100_0000, 0x0204_1337, 42, 0xF200_0000]);
    }

    #[test]
    fn super_roundtrip() -> crate::Result<()> {
        let cmds = SuperCommandBuilder::new()
            .add_reference_word(0xabcd)
            .add_read_local(0x1100)
            .add_read_local_block(0x2000, 768)
            .add_write_local(0x1200, 0xdead_beef)
            .add_write_reset()
            .get_commands();
        let buffer = make_command_buffer(&cmds);
        assert_eq!(super_commands_from_buffer(&buffer)?, cmds);
        Ok(())
    }

    #[test]
    fn super_decode_errors() {
        assert!(matches!(
            super_commands_from_buffer(&[0x0999_0000]),
            Err(Error::UnknownOpcode(0x0999))
        ));
        // WriteLocal missing its value word.
        assert!(matches!(
            super_commands_from_buffer(&[0x0204_1337]),
            Err(Error::TruncatedInput)
        ));
    }

    #[test]
    fn stack_vme_read_buffer() -> crate::Result<()> {
        let cmds = StackCommandBuilder::new()
            .add_vme_read(0x1337, vme_amods::A32_USER_DATA, VMEDataWidth::D32)
            .get_commands();
        let buffer = make_stack_buffer(&cmds)?;
        assert_eq!(buffer, vec![0x1209_0002, 0x0000_1337]);
        Ok(())
    }

    #[test]
    fn stack_roundtrip() -> crate::Result<()> {
        let cmds = StackCommandBuilder::new()
            .add_vme_read(0x6008, vme_amods::A32_USER_DATA, VMEDataWidth::D16)
            .add_vme_block_read(0x0000_1000, vme_amods::MBLT64, 0xffff)
            .add_vme_block_read_2esst(0x0000_2000, Blk2eSSTRate::Rate300MB, 1024)
            .add_vme_write(0x600e, 1, vme_amods::A32_PRIV_DATA, VMEDataWidth::D32)
            .add_write_marker(0x8765_4321)
            .get_commands();
        let buffer = make_stack_buffer(&cmds)?;
        assert_eq!(stack_commands_from_buffer(&buffer)?, cmds);
        Ok(())
    }

    #[test]
    fn software_delay_is_not_serializable() {
        let cmds = StackCommandBuilder::new().add_software_delay(100).get_commands();
        assert!(matches!(
            make_stack_buffer(&cmds),
            Err(Error::NotSerializable(_))
        ));
    }

    #[test]
    fn stack_upload_preamble() -> crate::Result<()> {
        let stack = StackCommandBuilder::new().add_vme_read(0x1337, 0x09, VMEDataWidth::D32);
        let words = make_stack_buffer(&stack.get_commands())?;
        let upload = make_stack_upload_commands(0, 0, &words);

        let expected_values = [0xF300_0000u32, 0x1209_0002, 0x0000_1337, 0xF400_0000];
        assert_eq!(upload.len(), expected_values.len());

        for (i, (cmd, &value)) in upload.iter().zip(expected_values.iter()).enumerate() {
            let address = stacks::STACK_MEMORY_BEGIN + 4 * i as u16;
            assert_eq!(*cmd, SuperCommand::WriteLocal { address, value });
        }
        Ok(())
    }

    #[test]
    fn groups() {
        let stack = StackCommandBuilder::new()
            .add_group(
                "mdpp32",
                vec![StackCommand::VMEBlockRead {
                    address: 0,
                    amod: vme_amods::MBLT64,
                    transfers: 0xffff,
                }],
            )
            .begin_group("counters")
            .add_write_marker(1)
            .add_write_marker(2);

        assert_eq!(stack.group_count(), 2);
        assert_eq!(stack.get_group(0).unwrap().name, "mdpp32");
        assert_eq!(stack.get_group_by_name("counters").unwrap().commands.len(), 2);
        assert_eq!(stack.get_commands().len(), 3);
    }

    #[test]
    fn implicit_group() {
        let stack = StackCommandBuilder::new().add_write_marker(7);
        assert_eq!(stack.group_count(), 1);
        assert_eq!(stack.get_group(0).unwrap().name, "");
    }

    #[test]
    fn split_batches_by_size() -> crate::Result<()> {
        // Each marker encodes to 2 words, plus 2 words bracket per part.
        let cmds: Vec<StackCommand> = (0..10).map(|i| StackCommand::WriteMarker { value: i }).collect();
        let parts = split_commands(&cmds, SplitOptions::default(), 8)?;
        // 3 markers fit into 8 words (2 + 3*2).
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[3].len(), 1);
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 10);
        Ok(())
    }

    #[test]
    fn split_on_delay() -> crate::Result<()> {
        let cmds = vec![
            StackCommand::WriteMarker { value: 1 },
            StackCommand::SoftwareDelay { ms: 100 },
            StackCommand::WriteMarker { value: 2 },
        ];
        let parts = split_commands(&cmds, SplitOptions::default(), 128)?;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], vec![StackCommand::SoftwareDelay { ms: 100 }]);

        let merged = split_commands(
            &cmds,
            SplitOptions {
                ignore_delays: true,
                ..Default::default()
            },
            128,
        )?;
        assert_eq!(merged.len(), 1);
        Ok(())
    }

    #[test]
    fn split_no_batching() -> crate::Result<()> {
        let cmds = vec![
            StackCommand::WriteMarker { value: 1 },
            StackCommand::SoftwareDelay { ms: 1 },
            StackCommand::WriteMarker { value: 2 },
        ];
        let parts = split_commands(
            &cmds,
            SplitOptions {
                no_batching: true,
                ..Default::default()
            },
            128,
        )?;
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() == 1));
        Ok(())
    }

    #[test]
    fn split_oversized_command() {
        let cmds = vec![StackCommand::VMEWrite {
            address: 0,
            value: 0,
            amod: vme_amods::A32_PRIV_DATA,
            data_width: VMEDataWidth::D32,
        }];
        assert!(matches!(
            split_commands(&cmds, SplitOptions::default(), 4),
            Err(Error::StackMemoryExceeded)
        ));
    }
}

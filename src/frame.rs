/*! MVLC wire framing.

All communication with the MVLC is done in 32-bit little-endian words.
Responses and readout data are sequences of frames: a single header word
carrying type, flags, stack number, controller id and payload length,
followed by `length` payload words.
*/

/// Frame type byte in the topmost 8 bits of a frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Mirror response to an uploaded super command buffer.
    SuperFrame = 0xF1,
    /// Output produced by a stack execution.
    StackFrame = 0xF3,
    /// Data produced by a single VME block read.
    BlockRead = 0xF5,
    /// Asynchronous stack error notification.
    StackError = 0xF7,
    /// Continuation of a previous StackFrame.
    StackContinuation = 0xF9,
    /// Software generated event (config dump, timeticks, ...).
    SystemEvent = 0xFA,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<FrameType> {
        Some(match v {
            0xF1 => FrameType::SuperFrame,
            0xF3 => FrameType::StackFrame,
            0xF5 => FrameType::BlockRead,
            0xF7 => FrameType::StackError,
            0xF9 => FrameType::StackContinuation,
            0xFA => FrameType::SystemEvent,
            _ => None?,
        })
    }
}

/// Frame flag bits. Continue and the error flags share a 4 bit field.
pub mod frame_flags {
    pub const TIMEOUT: u8 = 1 << 0;
    pub const BUS_ERROR: u8 = 1 << 1;
    pub const SYNTAX_ERROR: u8 = 1 << 2;
    pub const CONTINUE: u8 = 1 << 3;

    pub const ALL_ERRORS: u8 = TIMEOUT | BUS_ERROR | SYNTAX_ERROR;
}

const TYPE_SHIFT: u32 = 24;
const TYPE_MASK: u32 = 0xff;
const FLAGS_SHIFT: u32 = 20;
const FLAGS_MASK: u32 = 0xf;
const STACK_SHIFT: u32 = 16;
const STACK_MASK: u32 = 0xf;
const CTRL_SHIFT: u32 = 13;
const CTRL_MASK: u32 = 0b111;
const LENGTH_MASK: u32 = 0x1fff;

/// Unpacked frame header word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Raw frame type byte. May be garbage when scanning unaligned data.
    pub frame_type: u8,
    pub flags: u8,
    pub stack: u8,
    pub ctrl: u8,
    /// Number of payload words following the header.
    pub len: u16,
}

impl FrameInfo {
    #[must_use]
    pub fn has_continue(&self) -> bool {
        self.flags & frame_flags::CONTINUE != 0
    }
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.flags & frame_flags::TIMEOUT != 0
    }
    #[must_use]
    pub fn has_syntax_error(&self) -> bool {
        self.flags & frame_flags::SYNTAX_ERROR != 0
    }
}

/// Extract the frame type byte from a header word.
#[must_use]
pub fn get_frame_type(header: u32) -> u8 {
    ((header >> TYPE_SHIFT) & TYPE_MASK) as u8
}

/// Unpack a frame header word into its fields.
#[must_use]
pub fn extract_frame_info(header: u32) -> FrameInfo {
    FrameInfo {
        frame_type: get_frame_type(header),
        flags: ((header >> FLAGS_SHIFT) & FLAGS_MASK) as u8,
        stack: ((header >> STACK_SHIFT) & STACK_MASK) as u8,
        ctrl: ((header >> CTRL_SHIFT) & CTRL_MASK) as u8,
        len: (header & LENGTH_MASK) as u16,
    }
}

/// Pack a frame header word.
#[must_use]
pub fn make_frame_header(frame_type: FrameType, flags: u8, stack: u8, ctrl: u8, len: u16) -> u32 {
    (frame_type as u32) << TYPE_SHIFT
        | (u32::from(flags) & FLAGS_MASK) << FLAGS_SHIFT
        | (u32::from(stack) & STACK_MASK) << STACK_SHIFT
        | (u32::from(ctrl) & CTRL_MASK) << CTRL_SHIFT
        | u32::from(len) & LENGTH_MASK
}

#[must_use]
pub fn is_super_frame(header: u32) -> bool {
    get_frame_type(header) == FrameType::SuperFrame as u8
}

#[must_use]
pub fn is_stack_frame(header: u32) -> bool {
    get_frame_type(header) == FrameType::StackFrame as u8
}

#[must_use]
pub fn is_blockread_frame(header: u32) -> bool {
    get_frame_type(header) == FrameType::BlockRead as u8
}

#[must_use]
pub fn is_stack_error(header: u32) -> bool {
    get_frame_type(header) == FrameType::StackError as u8
}

#[must_use]
pub fn is_stack_continuation(header: u32) -> bool {
    get_frame_type(header) == FrameType::StackContinuation as u8
}

/// True for any of the six defined frame types.
#[must_use]
pub fn is_known_frame_header(header: u32) -> bool {
    FrameType::from_u8(get_frame_type(header)).is_some()
}

/// Software generated system events.
///
/// Layout: `TTTT TTTT CUUU SSSS SSSL LLLL LLLL LLLL` with type 0xFA, a
/// continue bit for multi-part events, a 7 bit subtype and a 13 bit word
/// length.
pub mod system_event {
    use super::{FrameType, get_frame_type};

    pub const CONTINUE_SHIFT: u32 = 23;
    pub const SUBTYPE_SHIFT: u32 = 13;
    pub const SUBTYPE_MASK: u32 = 0x7f;
    pub const LENGTH_MASK: u32 = 0x1fff;

    /// Maximum payload words of a single system event frame.
    pub const MAX_CONTENTS_WORDS: usize = LENGTH_MASK as usize;

    /// Value of the EndianMarker payload, written in native byte order.
    pub const ENDIAN_MARKER_VALUE: u32 = 0x1234_5678;

    pub mod subtype {
        pub const ENDIAN_MARKER: u8 = 0x01;
        pub const VME_CONFIG: u8 = 0x10;
        pub const UNIX_TIMESTAMP: u8 = 0x11;
        pub const PAUSE: u8 = 0x12;
        pub const RESUME: u8 = 0x13;
        pub const END_OF_FILE: u8 = 0x77;
    }

    #[must_use]
    pub fn extract_subtype(header: u32) -> u8 {
        ((header >> SUBTYPE_SHIFT) & SUBTYPE_MASK) as u8
    }

    #[must_use]
    pub fn has_continue(header: u32) -> bool {
        (header >> CONTINUE_SHIFT) & 1 != 0
    }

    #[must_use]
    pub fn is_known_subtype(st: u8) -> bool {
        matches!(
            st,
            subtype::ENDIAN_MARKER
                | subtype::VME_CONFIG
                | subtype::UNIX_TIMESTAMP
                | subtype::PAUSE
                | subtype::RESUME
                | subtype::END_OF_FILE
        )
    }

    /// True if the header word is a system event frame with a known subtype.
    #[must_use]
    pub fn is_known_system_event(header: u32) -> bool {
        get_frame_type(header) == FrameType::SystemEvent as u8
            && is_known_subtype(extract_subtype(header))
    }

    #[must_use]
    pub fn make_header(subtype: u8, len: u16, cont: bool) -> u32 {
        (FrameType::SystemEvent as u32) << super::TYPE_SHIFT
            | u32::from(cont) << CONTINUE_SHIFT
            | (u32::from(subtype) & SUBTYPE_MASK) << SUBTYPE_SHIFT
            | u32::from(len) & LENGTH_MASK
    }
}

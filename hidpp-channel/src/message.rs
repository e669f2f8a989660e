//! Defines the raw messages exchanged across a transport and the framing
//! constants of HID++ reports.

use std::{fmt, time::Instant};

use lazy_static::lazy_static;

use crate::dispatcher::MessageClass;

lazy_static! {
    /// The reference point every message timestamp is measured from.
    static ref PROCESS_START: Instant = Instant::now();
}

pub const SHORT_REPORT_ID: u8 = 0x10;
pub const SHORT_REPORT_LENGTH: usize = 7;

pub const LONG_REPORT_ID: u8 = 0x11;
pub const LONG_REPORT_LENGTH: usize = 20;

pub const VERY_LONG_REPORT_ID: u8 = 0x12;
pub const VERY_LONG_REPORT_LENGTH: usize = 64;

/// Report IDs of the VLP (very long packet) protocol. VLP frames do not have a
/// fixed length.
pub const VLP_REPORT_IDS: [u8; 2] = [0x13, 0x14];

/// All lengths a HID++ frame may have.
pub const HIDPP_REPORT_LENGTHS: [usize; 3] =
    [SHORT_REPORT_LENGTH, LONG_REPORT_LENGTH, VERY_LONG_REPORT_LENGTH];

/// The device index addressing a receiver itself.
pub const RECEIVER_DEVICE_INDEX: u8 = 0xff;

/// Fixed byte offsets inside a HID++ frame.
pub mod offset {
    pub const REPORT_ID: usize = 0;
    pub const DEVICE_INDEX: usize = 1;

    /// HID++1.0 sub ID. Shares its position with [`FEATURE_INDEX`].
    pub const SUB_ID: usize = 2;

    /// HID++2.0 feature index. Shares its position with [`SUB_ID`].
    pub const FEATURE_INDEX: usize = 2;

    /// HID++1.0 register address. Shares its position with
    /// [`FUNCTION_INDEX`].
    pub const ADDRESS: usize = 3;

    /// HID++2.0 function (high nibble) and software ID (low nibble).
    pub const FUNCTION_INDEX: usize = 3;

    /// First parameter byte of a HID++1.0 register access.
    pub const R0: usize = 4;
}

/// Returns the fixed length a HID++ frame with the given report ID must have.
///
/// Returns `None` for report IDs that are not HID++ report IDs.
pub fn expected_length(report_id: u8) -> Option<usize> {
    match report_id {
        SHORT_REPORT_ID => Some(SHORT_REPORT_LENGTH),
        LONG_REPORT_ID => Some(LONG_REPORT_LENGTH),
        VERY_LONG_REPORT_ID => Some(VERY_LONG_REPORT_LENGTH),
        _ => None,
    }
}

/// Monotonic nanoseconds elapsed since the first message of the process was
/// stamped.
pub fn monotonic_ns() -> u64 {
    u64::try_from(PROCESS_START.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Represents a raw message read from or written to a transport.
///
/// Messages are timestamped when they are created. Once a message is placed in
/// a queue it is only ever handed out by value, so nobody can alter it in
/// place.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TransportMessage {
    /// The raw bytes of the report, starting with the report ID.
    pub data: Vec<u8>,

    /// Monotonic nanoseconds, see [`monotonic_ns`].
    pub timestamp: u64,

    /// The class the dispatcher recognized the message as, if any.
    pub message_class: Option<MessageClass>,
}

impl TransportMessage {
    /// Creates a message stamped with the current time.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::with_timestamp(data, monotonic_ns())
    }

    pub fn with_timestamp(data: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            data: data.into(),
            timestamp,
            message_class: None,
        }
    }

    /// Reads the byte at the given offset.
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    pub fn report_id(&self) -> Option<u8> {
        self.byte(offset::REPORT_ID)
    }

    pub fn device_index(&self) -> Option<u8> {
        self.byte(offset::DEVICE_INDEX)
    }

    /// Whether the message is a HID++ frame with a valid length for its
    /// report ID.
    pub fn is_hidpp(&self) -> bool {
        self.report_id()
            .and_then(expected_length)
            .is_some_and(|len| len == self.data.len())
    }

    /// Whether the message carries a VLP report ID.
    pub fn is_vlp(&self) -> bool {
        self.report_id().is_some_and(|id| VLP_REPORT_IDS.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp, HexBytes(&self.data))?;
        if let Some(class) = self.message_class {
            write!(f, " ({class})")?;
        }
        Ok(())
    }
}

/// Formats a byte slice as space-separated upper case hex.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

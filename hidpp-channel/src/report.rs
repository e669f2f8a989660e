//! Report types of USB HID interfaces and the link selection applied when a
//! channel is opened.

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Tags the class of a USB HID interface. Every interface of a device
/// advertises exactly one report type.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum ReportType {
    Hidpp = 0,
    Keyboard = 1,
    Mouse = 2,
    Digitizer = 3,
}

impl ReportType {
    pub const ALL: [ReportType; 4] = [
        ReportType::Hidpp,
        ReportType::Keyboard,
        ReportType::Mouse,
        ReportType::Digitizer,
    ];

    /// The name handed to the USB context when polling an IN endpoint of an
    /// interface of this type.
    ///
    /// Contexts may rely on these names, the HID++ one in particular.
    pub fn polling_trace_name(self) -> &'static str {
        match self {
            ReportType::Hidpp => "HID++ polling",
            ReportType::Keyboard => "HID Keyboard polling",
            ReportType::Mouse => "HID Mouse polling",
            ReportType::Digitizer => "HID Digitizer polling",
        }
    }

    fn link_bits(self) -> (u8, u8) {
        match self {
            ReportType::Hidpp => (LinkEnabler::HID_PP.0, LinkEnabler::DISABLE_HID_PP.0),
            ReportType::Keyboard => (LinkEnabler::KEYBOARD.0, LinkEnabler::DISABLE_KEYBOARD.0),
            ReportType::Mouse => (LinkEnabler::MOUSE.0, LinkEnabler::DISABLE_MOUSE.0),
            ReportType::Digitizer => (LinkEnabler::DIGITIZER.0, LinkEnabler::DISABLE_DIGITIZER.0),
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportType::Hidpp => "HID++",
            ReportType::Keyboard => "Keyboard",
            ReportType::Mouse => "Mouse",
            ReportType::Digitizer => "Digitizer",
        })
    }
}

/// A bit set selecting which report type interfaces are activated when a
/// channel is opened.
///
/// The lower nibble enables links. The upper nibble keeps polling an endpoint
/// but discards every report read from it, which keeps the device from
/// stalling on a full endpoint without filling a queue nobody reads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LinkEnabler(u8);

impl LinkEnabler {
    pub const NONE: Self = Self(0x00);
    pub const HID_PP: Self = Self(0x01);
    pub const KEYBOARD: Self = Self(0x02);
    pub const MOUSE: Self = Self(0x04);
    pub const DIGITIZER: Self = Self(0x08);
    pub const ALL: Self = Self(0x0f);

    pub const DISABLE_HID_PP: Self = Self(0x10);
    pub const DISABLE_KEYBOARD: Self = Self(0x20);
    pub const DISABLE_MOUSE: Self = Self(0x40);
    pub const DISABLE_DIGITIZER: Self = Self(0x80);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the link of the given report type is selected.
    pub fn is_link_enabled(self, report_type: ReportType) -> bool {
        self.0 & report_type.link_bits().0 != 0
    }

    /// Whether reports polled on interfaces of the given type are dropped.
    pub fn discards_report(self, report_type: ReportType) -> bool {
        self.0 & report_type.link_bits().1 != 0
    }
}

impl Default for LinkEnabler {
    fn default() -> Self {
        Self::HID_PP
    }
}

impl BitOr for LinkEnabler {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LinkEnabler {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The radio protocol a device talks to its receiver with, as announced in
/// device connection notifications.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(i16)]
pub enum LogitechProtocol {
    Ble = -2,
    Usb = -1,
    Unknown = 0x00,
    Bluetooth = 0x01,
    Mhz27 = 0x02,
    QuadEquad = 0x03,
    EquadStep4Dj = 0x04,
    DfuLite = 0x05,
    EquadStep4Lite = 0x06,
    EquadStep4Gaming = 0x07,
    EquadStep4Gamepads = 0x08,
    Gotthard = 0x09,
    DaggerRom = 0x0a,
    UnifyingV2 = 0x0b,
    Ls1_0 = 0x0c,
    Ls1_1 = 0x0d,
    Ls2Llpm = 0x0e,
    Ls2Ca = 0x0f,
    BlePro = 0x10,
    Ls2CaCrc24 = 0x11,
    Ls2CaCrc24ForCrush = 0x91,
}

impl LogitechProtocol {
    /// Maps the protocol type byte of a device connection notification.
    ///
    /// Unknown values map to [`Self::Unknown`].
    pub fn from_protocol_byte(value: u8) -> Self {
        Self::try_from(i16::from(value)).unwrap_or(Self::Unknown)
    }

    /// Whether the protocol belongs to the Unifying family of receivers.
    pub fn is_unifying(self) -> bool {
        matches!(
            self,
            Self::QuadEquad
                | Self::EquadStep4Dj
                | Self::EquadStep4Lite
                | Self::EquadStep4Gaming
                | Self::EquadStep4Gamepads
                | Self::DaggerRom
                | Self::UnifyingV2
                | Self::Ls1_0
                | Self::Ls1_1
                | Self::Ls2Llpm
                | Self::Ls2Ca
                | Self::Ls2CaCrc24
        )
    }

    pub fn is_gaming(self) -> bool {
        matches!(
            self,
            Self::EquadStep4Gaming
                | Self::EquadStep4Gamepads
                | Self::Ls1_0
                | Self::Ls1_1
                | Self::Ls2Llpm
                | Self::Ls2Ca
                | Self::Ls2CaCrc24
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_enabler_selects_report_types() {
        let enabler = LinkEnabler::HID_PP | LinkEnabler::MOUSE;

        assert!(enabler.is_link_enabled(ReportType::Hidpp));
        assert!(enabler.is_link_enabled(ReportType::Mouse));
        assert!(!enabler.is_link_enabled(ReportType::Keyboard));
        assert!(!enabler.is_link_enabled(ReportType::Digitizer));
        assert!(LinkEnabler::ALL.contains(enabler));
    }

    #[test]
    fn disable_bits_only_discard() {
        let enabler = LinkEnabler::ALL | LinkEnabler::DISABLE_KEYBOARD;

        assert!(enabler.is_link_enabled(ReportType::Keyboard));
        assert!(enabler.discards_report(ReportType::Keyboard));
        assert!(!enabler.discards_report(ReportType::Hidpp));
    }

    #[test]
    fn protocol_bytes_map_to_protocols() {
        assert_eq!(LogitechProtocol::from_protocol_byte(0x10), LogitechProtocol::BlePro);
        assert_eq!(LogitechProtocol::from_protocol_byte(0x04), LogitechProtocol::EquadStep4Dj);
        assert_eq!(LogitechProtocol::from_protocol_byte(0x7a), LogitechProtocol::Unknown);
        assert!(LogitechProtocol::UnifyingV2.is_unifying());
        assert!(!LogitechProtocol::BlePro.is_unifying());
        assert!(LogitechProtocol::Ls2Llpm.is_gaming());
    }
}

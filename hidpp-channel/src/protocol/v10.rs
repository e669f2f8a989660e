//! HID++1.0 sub IDs, receiver registers and error codes.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The sub ID of HID++1.0 error frames.
pub const ERROR_SUB_ID: u8 = 0x8f;

/// Represents a sub ID of a HID++1.0 message used by the receiver channels.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum SubId {
    /// Notification sent by a receiver when a paired device disconnects.
    DeviceDisconnection = 0x40,

    /// Notification sent by a receiver when a paired device connects, and for
    /// every paired device after a fake arrival.
    DeviceConnection = 0x41,

    /// Sets a 3-byte register value. Answered with the same sub ID (or
    /// [`Self::Error`]).
    SetRegister = 0x80,

    /// Reads a 3-byte register value. Answered with the same sub ID (or
    /// [`Self::Error`]).
    GetRegister = 0x81,

    /// Sets a 16-byte register value.
    SetLongRegister = 0x82,

    /// Reads a 16-byte register value.
    GetLongRegister = 0x83,

    /// Marks an error response. The code can be mapped with
    /// [`ErrorType::try_from`].
    Error = 0x8f,
}

/// Represents a receiver register accessed by the receiver channels.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum RegisterAddress {
    /// Flags controlling which notifications the receiver reports.
    EnableHidppReporting = 0x00,

    /// Writing [`CONNECTION_STATE_FAKE_ARRIVAL`] makes the receiver announce
    /// every paired device again.
    ConnectionState = 0x02,

    /// Long register holding pairing information and device names, selected
    /// by its first parameter byte.
    NonVolatilePairingInformation = 0xb5,
}

/// Bit of the receiver flags byte of [`RegisterAddress::EnableHidppReporting`]
/// enabling wireless notifications.
pub const WIRELESS_NOTIFICATIONS: u8 = 0x01;

/// Value written to [`RegisterAddress::ConnectionState`] to trigger a fake
/// arrival.
pub const CONNECTION_STATE_FAKE_ARRIVAL: u8 = 0x02;

/// Bit of the device information byte of a [`SubId::DeviceConnection`]
/// notification that is set while the link is not established.
pub const LINK_NOT_ESTABLISHED: u8 = 0x40;

/// Represents the type of an error a HID++1.0 device returns in an error
/// frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    Success = 0x00,

    /// The sub ID of the request is invalid.
    InvalidSubId = 0x01,

    /// The register address of the request is invalid.
    InvalidAddress = 0x02,

    /// A value of the request is invalid.
    InvalidValue = 0x03,

    /// A connection request failed on the receiver's side.
    ConnectFail = 0x04,

    /// Too many devices are paired to the receiver.
    TooManyDevices = 0x05,

    AlreadyExists = 0x06,

    /// The receiver is still handling a message to a device.
    Busy = 0x07,

    /// No device is paired at the addressed device index.
    UnknownDevice = 0x08,

    /// The addressed device is paired but disconnected. It reconnects when the
    /// user interacts with it.
    ResourceError = 0x09,

    /// The request is not available in the current context.
    RequestUnavailable = 0x0a,

    InvalidParamValue = 0x0b,
    WrongPinCode = 0x0c,
}

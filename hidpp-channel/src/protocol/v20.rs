//! HID++2.0 error codes.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The feature index of HID++2.0 error frames.
pub const ERROR_FEATURE_INDEX: u8 = 0xff;

/// Represents the type of an error a HID++2.0 device returns in an error
/// frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    NoError = 0x00,
    Unknown = 0x01,

    /// An argument of the request is invalid.
    InvalidArgument = 0x02,

    /// An argument is outside of the accepted range.
    OutOfRange = 0x03,

    HardwareError = 0x04,
    LogitechInternal = 0x05,

    /// No feature is bound to the feature index of the request.
    InvalidFeatureIndex = 0x06,

    /// The feature has no function with the requested ID.
    InvalidFunctionId = 0x07,

    Busy = 0x08,
    Unsupported = 0x09,
}

use std::time::Duration;

use thiserror::Error;

use crate::{
    context::ContextError,
    message::TransportMessage,
    protocol::{self, ErrorCode},
    queue::QueueError,
    report::ReportType,
};

/// The flat classification of a [`ChannelError`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[non_exhaustive]
pub enum Cause {
    ChannelNotOpen,
    AssociatedReceiverChannelNotOpen,
    ExpectedLinkNotPresent,
    AssociatedReceiverChannelExpectedLinkNotPresent,
    WrongParameter,
    ErrorBytesAreSent,
    HardwareDeviceOff,
    DeviceNotConnected,
    ConfigurationError,
    DeviceNotResponding,
    ErrorMessageReceived,
    Unsupported,
    MalformedResponse,
    Context,
}

/// Represents an error that occurred when operating a channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// Indicates that the channel has to be opened first, or was closed while
    /// the operation waited.
    #[error("the channel is not open")]
    ChannelNotOpen,

    /// Indicates that the receiver a through-channel relies on is not open.
    #[error("the associated receiver channel is not open")]
    AssociatedReceiverChannelNotOpen,

    /// Indicates that the device has no interface of the given report type,
    /// or that it was not enabled when opening the channel.
    #[error("no {0} link is present on the channel")]
    ExpectedLinkNotPresent(ReportType),

    /// Indicates that the receiver a through-channel relies on has no
    /// interface of the given report type.
    #[error("no {0} link is present on the associated receiver channel")]
    AssociatedReceiverChannelExpectedLinkNotPresent(ReportType),

    /// Indicates that an argument was rejected.
    #[error("wrong parameter: {0}")]
    WrongParameter(String),

    /// Indicates that the USB stack reported a different amount of bytes
    /// sent than requested.
    #[error("{sent} bytes were sent instead of {expected}")]
    ErrorBytesAreSent { sent: usize, expected: usize },

    /// Indicates that the hardware device powering the device under test is
    /// off.
    #[error("the hardware device is off")]
    HardwareDeviceOff,

    /// Indicates that the device is unplugged, or its wireless link is not
    /// established.
    #[error("the device is not connected")]
    DeviceNotConnected,

    /// Indicates an inconsistent setup, such as two queues bound to the same
    /// device index.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Indicates that no expected message arrived in time.
    #[error("the device did not respond within {0:?}")]
    DeviceNotResponding(Duration),

    /// Indicates that the device answered with an error frame the caller did
    /// not ask for.
    #[error("the device answered with an error: {0}")]
    ErrorMessageReceived(TransportMessage),

    /// Indicates that the channel cannot perform the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Indicates that a response was too short to be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(TransportMessage),

    /// Indicates that the USB context failed.
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl ChannelError {
    pub fn cause(&self) -> Cause {
        match self {
            ChannelError::ChannelNotOpen => Cause::ChannelNotOpen,
            ChannelError::AssociatedReceiverChannelNotOpen => Cause::AssociatedReceiverChannelNotOpen,
            ChannelError::ExpectedLinkNotPresent(_) => Cause::ExpectedLinkNotPresent,
            ChannelError::AssociatedReceiverChannelExpectedLinkNotPresent(_) => {
                Cause::AssociatedReceiverChannelExpectedLinkNotPresent
            },
            ChannelError::WrongParameter(_) => Cause::WrongParameter,
            ChannelError::ErrorBytesAreSent { .. } => Cause::ErrorBytesAreSent,
            ChannelError::HardwareDeviceOff => Cause::HardwareDeviceOff,
            ChannelError::DeviceNotConnected => Cause::DeviceNotConnected,
            ChannelError::Configuration(_) => Cause::ConfigurationError,
            ChannelError::DeviceNotResponding(_) => Cause::DeviceNotResponding,
            ChannelError::ErrorMessageReceived(_) => Cause::ErrorMessageReceived,
            ChannelError::Unsupported(_) => Cause::Unsupported,
            ChannelError::MalformedResponse(_) => Cause::MalformedResponse,
            ChannelError::Context(_) => Cause::Context,
        }
    }

    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::DeviceNotResponding(_) => true,
            ChannelError::Context(err) => err.is_transient(),
            _ => false,
        }
    }

    /// The error code of an escalated error frame.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ChannelError::ErrorMessageReceived(msg) => protocol::error_code(msg),
            _ => None,
        }
    }

    /// Maps errors of a receiver channel to their through-channel
    /// counterpart.
    pub(crate) fn through_receiver(self) -> Self {
        match self {
            ChannelError::ChannelNotOpen => ChannelError::AssociatedReceiverChannelNotOpen,
            ChannelError::ExpectedLinkNotPresent(report_type) => {
                ChannelError::AssociatedReceiverChannelExpectedLinkNotPresent(report_type)
            },
            other => other,
        }
    }
}

impl From<QueueError> for ChannelError {
    fn from(err: QueueError) -> Self {
        ChannelError::Configuration(err.to_string())
    }
}

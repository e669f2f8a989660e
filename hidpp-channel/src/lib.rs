//! Communication channels to Logitech devices speaking HID++.
//!
//! Logitech peripherals are either plugged via USB or paired to a wireless
//! receiver, which relays the traffic of up to six devices. This crate hides
//! both behind a single [`Channel`] trait, so test code can send HID++ reports
//! and wait for responses without caring how the device is reached:
//!
//! - [`UsbChannel`] binds the HID interfaces of a USB device. Each interface
//!   is polled into a queue of its [`ReportType`].
//! - [`UsbReceiverChannel`] extends it with the receiver registers, such as
//!   triggering a fake arrival of every paired device.
//! - [`ThroughReceiverChannel`] addresses a single device index of a receiver.
//!
//! Inbound messages are sorted by a [`HidDispatcher`] into named queues, and
//! requests sent through it are correlated with their responses. Error frames
//! nobody asked for fail the request with [`ChannelError::ErrorMessageReceived`].
//!
//! The USB stack is abstracted by [`context::UsbContext`]. The
//! [`context::rusb::RusbContext`] implementation talks to libusb, while
//! [`mock::MockUsbContext`] replays scripted responses for tests.
//!
//! # Quickstart
//!
//! ```
//! use std::sync::Arc;
//!
//! use hidpp_channel::{
//!     Channel, LinkEnabler, ReceiveOptions, ReportType, TransportMessage, UsbChannel,
//!     context::{InterfaceDescriptor, UsbContextDevice},
//!     mock::MockUsbContext,
//! };
//!
//! // The mock answers the first write with a single response.
//! let ping = [0x10, 0x01, 0x00, 0x1a, 0x00, 0x00, 0x5a];
//! let context = Arc::new(MockUsbContext::new(0, vec![vec![TransportMessage::new(ping)]]));
//!
//! // A device with a single HID++ interface polled on endpoint 0x81.
//! let device = context.plug(
//!     UsbContextDevice::new("mouse", 0x046d, 0xc08b)
//!         .with_interfaces(vec![InterfaceDescriptor::with_in_endpoint(0, ReportType::Hidpp, 1, 64)]),
//! );
//!
//! let channel = UsbChannel::new(device, context);
//! channel.open(LinkEnabler::HID_PP)?;
//!
//! let response = channel.send_data_wait_response(&ping, &ReceiveOptions::hidpp())?;
//! assert_eq!(response.data, ping);
//!
//! // Closing drains every queue.
//! channel.close()?;
//! # Ok::<(), hidpp_channel::ChannelError>(())
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod filter;
pub mod hardware;
pub mod message;
pub mod mock;
pub mod protocol;
pub mod queue;
pub mod report;

pub use channel::{
    Cause, Channel, ChannelError, ReceiveOptions, ThroughReceiverChannel, UsbChannel,
    UsbReceiverChannel,
};
pub use config::ChannelConfig;
pub use dispatcher::{HidDispatcher, MessageClass, QueueName};
pub use filter::{Filters, MessageFilter};
pub use message::TransportMessage;
pub use report::{LinkEnabler, LogitechProtocol, ReportType};

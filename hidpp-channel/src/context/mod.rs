//! The boundary between channels and the USB stack.
//!
//! A [`UsbContext`] enumerates devices and performs the transfers the
//! channels request. Reading the IN endpoints is left to polling threads the
//! context runs on its own, feeding the queues handed to it in
//! [`UsbContext::start_interrupt_read_polling`].

use std::{
    fmt::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::{message::TransportMessage, queue::TimestampedMultiQueue, report::ReportType};

pub mod rusb;

/// Bit of an endpoint address marking the IN direction.
pub const ENDPOINT_DIRECTION_IN: u8 = 0x80;

/// `bmRequestType` of class requests sent to an interface.
pub const HID_CLASS_INTERFACE_OUT: u8 = 0x21;

/// `bmRequestType` of class requests read from an interface.
pub const HID_CLASS_INTERFACE_IN: u8 = 0xa1;

/// Requests of the HID class specification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HidClassRequest {
    GetReport = 0x01,
    GetIdle = 0x02,
    GetProtocol = 0x03,
    SetReport = 0x09,
    SetIdle = 0x0a,
    SetProtocol = 0x0b,
}

impl HidClassRequest {
    /// Whether the request reads data from the device.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            HidClassRequest::GetReport | HidClassRequest::GetIdle | HidClassRequest::GetProtocol
        )
    }
}

/// The setup packet of a control transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EndpointDescriptor {
    /// The endpoint address, including the direction bit.
    pub address: u8,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIRECTION_IN != 0
    }
}

/// A HID interface of an enumerated device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InterfaceDescriptor {
    pub interface_id: u8,
    pub report_type: ReportType,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    /// Creates a descriptor for an interface with a single IN endpoint.
    pub fn with_in_endpoint(
        interface_id: u8,
        report_type: ReportType,
        endpoint_number: u8,
        max_packet_size: u16,
    ) -> Self {
        Self {
            interface_id,
            report_type,
            endpoints: vec![EndpointDescriptor {
                address: endpoint_number | ENDPOINT_DIRECTION_IN,
                max_packet_size,
            }],
        }
    }
}

/// A USB device known to a context.
///
/// The connection flag is maintained by the context. It is cleared as soon as
/// the context notices the device is gone, which makes the channels bound to
/// it fail with [`crate::channel::ChannelError::DeviceNotConnected`].
#[derive(Debug)]
pub struct UsbContextDevice {
    /// A name identifying the device in traces.
    pub reader_name: String,
    pub vid: u16,
    pub pid: u16,
    pub interface_list: Vec<InterfaceDescriptor>,
    pub bus_number: u8,
    pub address: u8,
    pub port_path: Vec<u8>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    connected: AtomicBool,
}

impl UsbContextDevice {
    /// Creates a connected device without interfaces.
    pub fn new(reader_name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            reader_name: reader_name.into(),
            vid,
            pid,
            interface_list: Vec::new(),
            bus_number: 0,
            address: 0,
            port_path: Vec::new(),
            manufacturer: None,
            product: None,
            connected: AtomicBool::new(true),
        }
    }

    pub fn with_interfaces(mut self, interfaces: Vec<InterfaceDescriptor>) -> Self {
        self.interface_list = interfaces;
        self
    }

    pub fn with_location(mut self, bus_number: u8, address: u8, port_path: Vec<u8>) -> Self {
        self.bus_number = bus_number;
        self.address = address;
        self.port_path = port_path;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// The port path in the `bus-port.port` notation of sysfs.
    pub fn port_path_str(&self) -> String {
        join_port_path(self.bus_number, &self.port_path)
    }

    /// Whether the device has an interface of the given report type.
    pub fn has_interface(&self, report_type: ReportType) -> bool {
        self.interface_list
            .iter()
            .any(|interface| interface.report_type == report_type)
    }
}

fn join_port_path(bus_number: u8, port_path: &[u8]) -> String {
    let mut path = bus_number.to_string();
    for (i, port) in port_path.iter().enumerate() {
        let _ = write!(path, "{}{port}", if i == 0 { '-' } else { '.' });
    }
    path
}

/// Invoked with every report polled on an endpoint.
pub type TransferCallback = Arc<dyn Fn(&TransportMessage) + Send + Sync>;

/// Describes the polling of one IN endpoint.
#[derive(Clone)]
pub struct InterruptPolling {
    pub endpoint: u8,
    pub max_packet_size: u16,

    /// The queue polled reports are put into. Reports are only handed to the
    /// transfer callback if `None`.
    pub target: Option<Arc<TimestampedMultiQueue>>,

    /// Names the polling thread. See [`ReportType::polling_trace_name`].
    pub trace_name: &'static str,

    /// Drops every polled report.
    pub discard_report: bool,
}

impl fmt::Debug for InterruptPolling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptPolling")
            .field("endpoint", &self.endpoint)
            .field("max_packet_size", &self.max_packet_size)
            .field("has_target", &self.target.is_some())
            .field("trace_name", &self.trace_name)
            .field("discard_report", &self.discard_report)
            .finish()
    }
}

/// Represents a USB stack able to enumerate devices and perform transfers.
///
/// Implementations must be usable from several threads at once, as channels
/// send from caller threads while polling threads read.
pub trait UsbContext: Send + Sync {
    /// Lists the plugged devices, optionally restricted to a vendor and
    /// product ID.
    fn get_plugged_devices(
        &self,
        vid: Option<u16>,
        pid: Option<u16>,
    ) -> Result<Vec<Arc<UsbContextDevice>>, ContextError>;

    /// Rescans the bus, updating the connection flag of every known device.
    fn update_device_list(&self) -> Result<(), ContextError>;

    /// Whether the context learns about unplugged devices on its own. If not,
    /// channels refresh the device list before relying on the connection
    /// flag.
    fn asynchronous_connection_capability(&self) -> bool;

    fn open_device(&self, device: &UsbContextDevice) -> Result<(), ContextError>;

    fn close_device(&self, device: &UsbContextDevice) -> Result<(), ContextError>;

    /// Performs an OUT control transfer.
    ///
    /// Returns the amount of bytes the stack reports as sent.
    fn control_write(
        &self,
        device: &UsbContextDevice,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ContextError>;

    /// Performs an IN control transfer of up to `length` bytes.
    fn control_read(
        &self,
        device: &UsbContextDevice,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, ContextError>;

    /// Writes to an interrupt OUT endpoint.
    ///
    /// Returns the amount of bytes the stack reports as sent.
    fn interrupt_write(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ContextError>;

    /// Starts reading an IN endpoint in the background.
    fn start_interrupt_read_polling(
        &self,
        device: &UsbContextDevice,
        polling: InterruptPolling,
    ) -> Result<(), ContextError>;

    /// Stops reading one or, if `endpoint` is `None`, every polled endpoint of
    /// the device.
    fn stop_interrupt_read_polling(
        &self,
        device: &UsbContextDevice,
        endpoint: Option<u8>,
    ) -> Result<(), ContextError>;

    /// Pauses the polling of an endpoint without releasing anything.
    fn mute(&self, device: &UsbContextDevice, endpoint: u8) -> Result<(), ContextError>;

    fn unmute(&self, device: &UsbContextDevice, endpoint: u8) -> Result<(), ContextError>;

    /// Replaces the callback invoked for every report polled on an endpoint.
    fn set_transfer_callback(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        callback: Option<TransferCallback>,
    ) -> Result<(), ContextError>;
}

/// Represents an error that occurred inside a [`UsbContext`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// The USB stack reported an error.
    #[error("USB error: {0}")]
    Usb(#[from] ::rusb::Error),

    /// A transfer did not complete in time.
    #[error("the USB transfer timed out")]
    Timeout,

    /// The endpoint stalled.
    #[error("the USB endpoint stalled")]
    Pipe,

    /// The device was not opened by this context.
    #[error("the device {0} is not open")]
    DeviceNotOpen(String),

    /// The endpoint is not polled.
    #[error("the endpoint {0:#04x} is not polled")]
    EndpointNotPolled(u8),

    /// A polling thread could not be spawned.
    #[error("could not spawn a polling thread: {0}")]
    Io(#[from] std::io::Error),
}

impl ContextError {
    /// Whether resending the same transfer may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ContextError::Timeout
                | ContextError::Pipe
                | ContextError::Usb(::rusb::Error::Timeout | ::rusb::Error::Pipe)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_path_uses_sysfs_notation() {
        let device = UsbContextDevice::new("receiver", 0x046d, 0xc52b).with_location(1, 7, vec![2, 3]);
        assert_eq!(device.port_path_str(), "1-2.3");

        let root = UsbContextDevice::new("root", 0x046d, 0xc52b).with_location(3, 1, vec![]);
        assert_eq!(root.port_path_str(), "3");
    }

    #[test]
    fn endpoint_direction() {
        let interface = InterfaceDescriptor::with_in_endpoint(0, ReportType::Hidpp, 1, 64);
        assert!(interface.endpoints[0].is_in());
        assert_eq!(interface.endpoints[0].address, 0x81);

        let out = EndpointDescriptor {
            address: 0x02,
            max_packet_size: 64,
        };
        assert!(!out.is_in());
    }

    #[test]
    fn transient_errors() {
        assert!(ContextError::Timeout.is_transient());
        assert!(ContextError::Usb(::rusb::Error::Pipe).is_transient());
        assert!(!ContextError::Usb(::rusb::Error::NoDevice).is_transient());
    }
}

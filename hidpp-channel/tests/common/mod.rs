//! Devices and scripted receiver responses shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use hidpp_channel::{
    ReportType, TransportMessage, UsbChannel, UsbReceiverChannel,
    channel::ReceiverKind,
    context::{InterfaceDescriptor, UsbContextDevice},
    mock::MockUsbContext,
};

pub const LOGITECH_VID: u16 = 0x046d;
pub const UNIFYING_RECEIVER_PID: u16 = 0xc52b;

/// A device exposing one interface per report type, HID++ first.
pub fn four_interface_device() -> UsbContextDevice {
    UsbContextDevice::new("test device", LOGITECH_VID, 0xc08b)
        .with_interfaces(vec![
            InterfaceDescriptor::with_in_endpoint(0, ReportType::Hidpp, 1, 64),
            InterfaceDescriptor::with_in_endpoint(1, ReportType::Mouse, 2, 64),
            InterfaceDescriptor::with_in_endpoint(2, ReportType::Keyboard, 3, 64),
            InterfaceDescriptor::with_in_endpoint(3, ReportType::Digitizer, 4, 64),
        ])
        .with_location(1, 7, vec![2, 1])
}

/// A receiver laid out the way Unifying receivers are.
pub fn receiver_device() -> UsbContextDevice {
    UsbContextDevice::new("test receiver", LOGITECH_VID, UNIFYING_RECEIVER_PID)
        .with_interfaces(vec![
            InterfaceDescriptor::with_in_endpoint(0, ReportType::Keyboard, 1, 8),
            InterfaceDescriptor::with_in_endpoint(1, ReportType::Mouse, 2, 8),
            InterfaceDescriptor::with_in_endpoint(2, ReportType::Hidpp, 3, 32),
        ])
        .with_location(3, 12, vec![4])
}

pub fn usb_channel(
    bytes_sent_delta: isize,
    responses: Vec<Vec<TransportMessage>>,
) -> (Arc<MockUsbContext>, Arc<UsbContextDevice>, UsbChannel) {
    let context = Arc::new(MockUsbContext::new(bytes_sent_delta, responses));
    let device = context.plug(four_interface_device());
    let channel = UsbChannel::new(Arc::clone(&device), context.clone());
    (context, device, channel)
}

pub fn receiver_channel(
    kind: ReceiverKind,
    responses: Vec<Vec<TransportMessage>>,
) -> (Arc<MockUsbContext>, Arc<UsbReceiverChannel>) {
    let context = Arc::new(MockUsbContext::new(0, responses));
    let device = context.plug(receiver_device());
    let usb = UsbChannel::new(device, context.clone());
    let receiver = UsbReceiverChannel::from_usb_channel(usb, 6)
        .expect("6 paired devices is valid")
        .with_kind(kind);
    (context, Arc::new(receiver))
}

pub fn msg(data: &[u8]) -> TransportMessage {
    TransportMessage::new(data)
}

/// Response to reading the HID++ reporting register.
pub fn get_reporting_response(wireless_notifications: bool) -> TransportMessage {
    msg(&[0x10, 0xff, 0x81, 0x00, 0x00, u8::from(wireless_notifications), 0x00])
}

pub fn set_reporting_response() -> TransportMessage {
    msg(&[0x10, 0xff, 0x80, 0x00, 0x00, 0x00, 0x00])
}

pub fn set_connection_state_response() -> TransportMessage {
    msg(&[0x10, 0xff, 0x80, 0x02, 0x00, 0x00, 0x00])
}

/// A device connection notification of the eQuad step 4 DJ protocol.
pub fn device_connection(device_index: u8, link_established: bool) -> TransportMessage {
    let info = if link_established { 0x00 } else { 0x40 };
    msg(&[0x10, device_index, 0x41, 0x04, info, 0x8a, 0x40])
}

/// The responses of a fake arrival with notifications already enabled.
pub fn fake_arrival(notifications: Vec<TransportMessage>) -> Vec<Vec<TransportMessage>> {
    let mut second = vec![set_connection_state_response()];
    second.extend(notifications);
    vec![vec![get_reporting_response(true)], second]
}

/// A response of the long register holding the pairing information.
pub fn pairing_register_response(r0: u8, payload: &[u8]) -> TransportMessage {
    let mut data = vec![0x11, 0xff, 0x83, 0xb5, r0];
    data.extend_from_slice(payload);
    data.resize(20, 0);
    TransportMessage::new(data)
}

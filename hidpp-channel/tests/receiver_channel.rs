//! Register access and fake arrivals of receiver channels.
//!
//! Run with: `cargo test -p hidpp-channel --test receiver_channel`

mod common;

use std::{sync::Arc, time::Duration};

use common::{
    device_connection, get_reporting_response, msg, receiver_channel, receiver_device,
    set_connection_state_response, set_reporting_response,
};
use hidpp_channel::{
    Cause, Channel, ChannelConfig, LinkEnabler, MessageFilter, QueueName, ReceiveOptions,
    ReportType, UsbChannel, UsbReceiverChannel,
    channel::ReceiverKind,
    dispatcher::MessageClass,
    mock::{MockUsbContext, MockWrite},
};

fn written(writes: &[MockWrite]) -> Vec<Vec<u8>> {
    writes.iter().map(|write| write.data().to_vec()).collect()
}

#[test]
fn paired_device_count_is_validated() {
    for max in [0, 7] {
        let context = Arc::new(MockUsbContext::new(0, vec![]));
        let device = context.plug(receiver_device());
        let usb = UsbChannel::new(device, context);

        let err = UsbReceiverChannel::from_usb_channel(usb, max)
            .err()
            .expect("out of range");
        assert_eq!(err.cause(), Cause::WrongParameter);
    }

    for max in [1, 6] {
        let context = Arc::new(MockUsbContext::new(0, vec![]));
        let device = context.plug(receiver_device());
        let receiver =
            UsbReceiverChannel::from_usb_channel(UsbChannel::new(device, context), max).unwrap();
        assert_eq!(receiver.max_number_of_paired_devices(), max);
        assert_eq!(receiver.kind(), ReceiverKind::Standard);
    }
}

#[test]
fn enabling_reporting_already_enabled_only_reads() {
    let (context, receiver) = receiver_channel(
        ReceiverKind::Standard,
        vec![
            vec![get_reporting_response(true)],
            vec![set_reporting_response()],
        ],
    );
    receiver.open(LinkEnabler::HID_PP).unwrap();

    assert!(receiver.enable_hidpp_reporting(true).unwrap());
    assert_eq!(context.remaining_responses(), 1);

    assert_eq!(
        written(&context.writes()),
        vec![vec![0x10, 0xff, 0x81, 0x00, 0x00, 0x00, 0x00]]
    );
}

#[test]
fn enabling_reporting_writes_the_flag() {
    let (context, receiver) = receiver_channel(
        ReceiverKind::Standard,
        vec![
            vec![get_reporting_response(false)],
            vec![set_reporting_response()],
        ],
    );
    receiver.open(LinkEnabler::HID_PP).unwrap();

    assert!(!receiver.enable_hidpp_reporting(true).unwrap());
    assert_eq!(context.remaining_responses(), 0);

    let writes = written(&context.writes());
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1], vec![0x10, 0xff, 0x80, 0x00, 0x00, 0x01, 0x00]);
}

#[test]
fn disabling_reporting_already_disabled_only_reads() {
    let (context, receiver) = receiver_channel(
        ReceiverKind::Standard,
        vec![
            vec![get_reporting_response(false)],
            vec![set_reporting_response()],
        ],
    );
    receiver.open(LinkEnabler::HID_PP).unwrap();

    assert!(!receiver.enable_hidpp_reporting(false).unwrap());
    assert_eq!(context.remaining_responses(), 1);
}

#[test]
fn disabling_reporting_clears_the_flag() {
    let (context, receiver) = receiver_channel(
        ReceiverKind::Standard,
        vec![
            vec![get_reporting_response(true)],
            vec![set_reporting_response()],
        ],
    );
    receiver.open(LinkEnabler::HID_PP).unwrap();

    assert!(receiver.enable_hidpp_reporting(false).unwrap());

    let writes = written(&context.writes());
    assert_eq!(writes[1], vec![0x10, 0xff, 0x80, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn register_writes_go_to_the_hidpp_interface() {
    let (context, receiver) =
        receiver_channel(ReceiverKind::Standard, vec![vec![get_reporting_response(true)]]);
    receiver.open(LinkEnabler::HID_PP).unwrap();

    receiver.enable_hidpp_reporting(true).unwrap();

    match &context.writes()[0] {
        MockWrite::Control { request, .. } => {
            assert_eq!(request.request_type, 0x21);
            assert_eq!(request.value, 0x0210);
            assert_eq!(request.index, 2);
        },
        other => panic!("expected a control write, got {other:?}"),
    }
}

#[test]
fn register_error_frames_are_escalated() {
    let error = msg(&[0x10, 0xff, 0x8f, 0x81, 0x00, 0x03, 0x00]);
    let (_, receiver) = receiver_channel(ReceiverKind::Standard, vec![vec![error]]);
    receiver.open(LinkEnabler::HID_PP).unwrap();

    let err = receiver.enable_hidpp_reporting(true).unwrap_err();

    assert_eq!(err.cause(), Cause::ErrorMessageReceived);
    assert!(err.error_code().is_some());
}

#[test]
fn silent_receiver_times_out() {
    let context = Arc::new(MockUsbContext::new(0, vec![]));
    let device = context.plug(receiver_device());
    let usb = UsbChannel::new(device, context).with_config(ChannelConfig {
        get_timeout_ms: 50,
        ..ChannelConfig::default()
    });
    let receiver = UsbReceiverChannel::from_usb_channel(usb, 6).unwrap();
    receiver.open(LinkEnabler::HID_PP).unwrap();

    let err = receiver.enable_hidpp_reporting(true).unwrap_err();

    assert_eq!(err.cause(), Cause::DeviceNotResponding);
}

#[test]
fn fake_arrival_restores_disabled_reporting() {
    let (context, receiver) = receiver_channel(
        ReceiverKind::Standard,
        vec![
            vec![get_reporting_response(false)],
            vec![set_reporting_response()],
            vec![set_connection_state_response(), device_connection(1, true)],
            vec![set_reporting_response()],
        ],
    );
    receiver.open(LinkEnabler::HID_PP).unwrap();

    receiver.perform_fake_arrival().unwrap();

    let writes = written(&context.writes());
    assert_eq!(
        writes,
        vec![
            vec![0x10, 0xff, 0x81, 0x00, 0x00, 0x00, 0x00],
            vec![0x10, 0xff, 0x80, 0x00, 0x00, 0x01, 0x00],
            vec![0x10, 0xff, 0x80, 0x02, 0x02, 0x00, 0x00],
            vec![0x10, 0xff, 0x80, 0x00, 0x00, 0x00, 0x00],
        ]
    );
    assert_eq!(context.remaining_responses(), 0);

    // The notification was dispatched while waiting for the last response.
    let options = ReceiveOptions::hidpp()
        .dispatcher(QueueName::ReceiverConnectionEvent, Some(MessageClass::DEVICE_CONNECTION))
        .timeout(Duration::from_millis(50));
    let notification = receiver.get_message(&options).unwrap();
    assert_eq!(notification.device_index(), Some(1));
}

#[test]
fn fake_arrival_keeps_enabled_reporting() {
    let (context, receiver) = receiver_channel(
        ReceiverKind::Standard,
        vec![
            vec![get_reporting_response(true)],
            vec![set_connection_state_response(), device_connection(2, true)],
        ],
    );
    receiver.open(LinkEnabler::HID_PP).unwrap();

    receiver.perform_fake_arrival().unwrap();

    assert_eq!(context.writes().len(), 2);
    assert_eq!(context.remaining_responses(), 0);

    // Notifications stay in the transceiver queue.
    let options = ReceiveOptions::hidpp()
        .filters(MessageFilter::new(2, 0x41))
        .timeout(Duration::from_millis(50));
    let notification = receiver.get_message(&options).unwrap();
    assert_eq!(notification.device_index(), Some(2));
}

#[test]
fn gotthard_receivers_have_no_fake_arrival() {
    let (context, receiver) = receiver_channel(ReceiverKind::Gotthard, vec![]);
    receiver.open(LinkEnabler::HID_PP).unwrap();

    let err = receiver.perform_fake_arrival().unwrap_err();

    assert_eq!(err.cause(), Cause::Unsupported);
    assert!(context.writes().is_empty());
}

#[test]
fn unsubscribed_device_messages_stay_in_transceiver_queue() {
    let (context, receiver) = receiver_channel(ReceiverKind::Standard, vec![]);
    receiver.open(LinkEnabler::HID_PP).unwrap();

    let event = msg(&[0x10, 0x03, 0x05, 0x00, 0x01, 0x00, 0x00]);
    assert!(context.inject(ReportType::Hidpp, event.clone()));

    assert_eq!(receiver.transceiver_queue().get_nowait(), Some(event));
}

#[test]
fn receiver_close_releases_the_device() {
    let (context, receiver) = receiver_channel(ReceiverKind::Standard, vec![]);
    receiver.open(LinkEnabler::HID_PP).unwrap();
    context.inject(ReportType::Hidpp, msg(&[0x10, 0xff, 0x41, 0x04, 0x00, 0x8a, 0x40]));

    receiver.close().unwrap();

    assert!(!receiver.is_open());
    assert!(!context.is_device_open(receiver.usb().device()));
    assert!(receiver.transceiver_queue().is_empty());
    assert_eq!(receiver.get_transport_id(false).unwrap(), 0xc52b);
}

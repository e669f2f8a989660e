//! Lifecycle, sending and receiving of USB channels against a scripted
//! context.
//!
//! Run with: `cargo test -p hidpp-channel --test usb_channel`

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use common::{four_interface_device, msg, receiver_device, usb_channel};
use hidpp_channel::{
    Cause, Channel, ChannelConfig, ChannelError, Filters, LinkEnabler, LogitechProtocol,
    MessageFilter, QueueName, ReceiveOptions, ReportType, UsbChannel,
    context::{ControlRequest, HidClassRequest, TransferCallback},
    dispatcher::MessageClass,
    hardware::HardwareDevice,
    mock::{MockHardwareDevice, MockUsbContext, MockWrite},
};
use proptest::prelude::*;

const PING: [u8; 7] = [0x10, 0x01, 0x00, 0x1a, 0x00, 0x00, 0x5a];
const SHORT_TIMEOUT: Duration = Duration::from_millis(50);

#[test]
fn open_polls_every_enabled_interface() {
    let (context, device, channel) = usb_channel(0, vec![]);

    channel.open(LinkEnabler::ALL).unwrap();

    assert!(channel.is_open());
    assert!(context.is_device_open(&device));
    assert_eq!(channel.report_type_to_interface().len(), 4);
    for report_type in ReportType::ALL {
        assert!(channel.is_link_enabled(report_type));
        assert!(context.is_polling(report_type));
        assert!(channel.queue(report_type).is_empty());
    }

    channel.close().unwrap();

    assert!(!channel.is_open());
    assert!(!context.is_device_open(&device));
    assert!(channel.report_type_to_interface().is_empty());
    for report_type in ReportType::ALL {
        assert!(!channel.is_link_enabled(report_type));
    }
}

#[test]
fn open_binds_only_selected_links() {
    let (context, _, channel) = usb_channel(0, vec![]);

    channel.open(LinkEnabler::HID_PP | LinkEnabler::MOUSE).unwrap();

    let interfaces = channel.report_type_to_interface();
    assert_eq!(interfaces.get(&ReportType::Hidpp), Some(&0));
    assert_eq!(interfaces.get(&ReportType::Mouse), Some(&1));
    assert!(!interfaces.contains_key(&ReportType::Keyboard));
    assert!(!context.is_polling(ReportType::Keyboard));
    assert!(!context.is_polling(ReportType::Digitizer));
}

#[test]
fn link_count_follows_the_enabler() {
    let (_, _, channel) = usb_channel(0, vec![]);

    for (link_enabler, expected) in [
        (LinkEnabler::HID_PP, 1),
        (LinkEnabler::HID_PP | LinkEnabler::MOUSE, 2),
        (LinkEnabler::HID_PP | LinkEnabler::MOUSE | LinkEnabler::KEYBOARD, 3),
        (LinkEnabler::ALL, 4),
    ] {
        channel.open(link_enabler).unwrap();
        assert_eq!(channel.report_type_to_interface().len(), expected);
        channel.close().unwrap();
        assert!(channel.report_type_to_interface().is_empty());
    }
}

#[test]
fn discarded_interfaces_are_polled_but_dropped() {
    let (context, _, channel) = usb_channel(0, vec![]);

    channel
        .open(LinkEnabler::HID_PP | LinkEnabler::DISABLE_MOUSE)
        .unwrap();

    assert!(context.is_polling(ReportType::Mouse));
    assert!(!channel.is_link_enabled(ReportType::Mouse));
    assert!(!context.inject(ReportType::Mouse, msg(&[0x02, 0x00, 0x01, 0x00])));
    assert!(channel.queue(ReportType::Mouse).is_empty());
}

#[test]
fn open_and_close_are_idempotent() {
    let (context, device, channel) = usb_channel(0, vec![]);

    channel.open(LinkEnabler::HID_PP).unwrap();
    channel.open(LinkEnabler::ALL).unwrap();
    assert_eq!(channel.report_type_to_interface().len(), 1);

    channel.close().unwrap();
    channel.close().unwrap();
    assert!(!context.is_device_open(&device));

    // Reopening after a close works like the first open.
    channel.open(LinkEnabler::ALL).unwrap();
    assert_eq!(channel.report_type_to_interface().len(), 4);
}

#[test]
fn open_fails_on_unplugged_device() {
    let (context, device, channel) = usb_channel(0, vec![]);
    context.unplug(&device);

    let err = channel.open(LinkEnabler::ALL).unwrap_err();

    assert_eq!(err.cause(), Cause::DeviceNotConnected);
    assert!(!channel.is_open());
}

#[test]
fn open_requires_the_hardware_device_on() {
    let (_, _, channel) = usb_channel(0, vec![]);
    let hardware = Arc::new(MockHardwareDevice::new());
    let channel = channel.with_hardware_device(hardware.clone());

    assert_eq!(
        channel.open(LinkEnabler::ALL).unwrap_err().cause(),
        Cause::HardwareDeviceOff
    );

    channel.turn_on_hardware_device().unwrap();
    assert!(hardware.is_on());
    assert!(!channel.is_open());
    channel.open(LinkEnabler::ALL).unwrap();

    channel.turn_off_hardware_device().unwrap();
    assert!(!hardware.is_on());
    assert!(!channel.is_open());
}

#[test]
fn hardware_requests_need_a_hardware_device() {
    let (_, _, channel) = usb_channel(0, vec![]);

    assert_eq!(
        channel.turn_on_hardware_device().unwrap_err().cause(),
        Cause::Unsupported
    );
}

#[test]
fn send_on_closed_channel_fails() {
    let (context, _, channel) = usb_channel(0, vec![]);

    let err = channel.send_data(&PING).unwrap_err();

    assert_eq!(err.cause(), Cause::ChannelNotOpen);
    assert!(context.writes().is_empty());
}

#[test]
fn send_uses_set_report_on_hidpp_interface() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    channel.send_data(&PING).unwrap();

    assert_eq!(
        context.writes(),
        vec![MockWrite::Control {
            request: ControlRequest {
                request_type: 0x21,
                request: 0x09,
                value: 0x0210,
                index: 0,
            },
            data: PING.to_vec(),
        }]
    );
}

#[test]
fn send_without_hidpp_link_fails() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::MOUSE).unwrap();

    assert!(matches!(
        channel.send_data(&PING),
        Err(ChannelError::ExpectedLinkNotPresent(ReportType::Hidpp))
    ));
    assert!(matches!(
        channel.get_message(&ReceiveOptions::hidpp()),
        Err(ChannelError::ExpectedLinkNotPresent(ReportType::Hidpp))
    ));
    assert!(context.writes().is_empty());
}

#[test]
fn send_on_unplugged_device_fails() {
    let (context, device, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();
    context.unplug(&device);

    assert_eq!(
        channel.send_data(&PING).unwrap_err().cause(),
        Cause::DeviceNotConnected
    );
}

#[test]
fn short_write_reports_bytes_sent() {
    let (_, _, channel) = usb_channel(-1, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    assert!(matches!(
        channel.send_data(&PING),
        Err(ChannelError::ErrorBytesAreSent {
            sent: 6,
            expected: 7,
        })
    ));
}

#[test]
fn every_bytes_sent_mismatch_fails() {
    for delta in [-3, -2, -1, 1, 2, 3] {
        let (_, _, channel) = usb_channel(delta, vec![]);
        channel.open(LinkEnabler::HID_PP).unwrap();

        let err = channel.send_data(&[0x10, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.cause(), Cause::ErrorBytesAreSent, "delta {delta}");
    }
}

#[test]
fn vlp_reports_need_a_hidpp_length() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    for data in [&[0x13, 0xff, 0x01][..], &[0x13, 0x01, 0x02, 0x10, 0x00], &[0x14; 8]] {
        let err = channel.send_data(data).unwrap_err();
        assert_eq!(err.cause(), Cause::WrongParameter, "{data:02x?}");
    }
    assert!(context.writes().is_empty());
}

#[test]
fn queued_hidpp_frame_is_received() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::ALL).unwrap();

    let frame = msg(&[0x10, 0xff, 0x81, 0x00, 0x00, 0x00, 0x00]);
    assert!(context.inject(ReportType::Hidpp, frame.clone()));

    assert_eq!(channel.get_message(&ReceiveOptions::default()).unwrap(), frame);
}

#[test]
fn queued_message_is_received() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP | LinkEnabler::KEYBOARD).unwrap();

    let report = msg(&[0x01, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
    assert!(context.inject(ReportType::Keyboard, report.clone()));

    let received = channel
        .get_message(&ReceiveOptions::new(ReportType::Keyboard))
        .unwrap();
    assert_eq!(received, report);
    assert!(channel.queue(ReportType::Keyboard).is_empty());
}

#[test]
fn get_message_times_out() {
    let (_, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let err = channel
        .get_message(&ReceiveOptions::hidpp().timeout(SHORT_TIMEOUT))
        .unwrap_err();

    assert!(matches!(err, ChannelError::DeviceNotResponding(timeout) if timeout == SHORT_TIMEOUT));
}

#[test]
fn raw_filters_skip_unrelated_messages() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let event = msg(&[0x10, 0x01, 0x04, 0x00, 0x01, 0x00, 0x00]);
    let response = msg(&[0x10, 0x01, 0x00, 0x1a, 0x00, 0x00, 0x5a]);
    context.inject(ReportType::Hidpp, event.clone());
    context.inject(ReportType::Hidpp, response.clone());

    let options = ReceiveOptions::hidpp().filters(MessageFilter::new(2, 0x00));
    assert_eq!(channel.get_message(&options).unwrap(), response);
    assert_eq!(channel.queue(ReportType::Hidpp).parent().get_nowait(), Some(event));
}

#[test]
fn untargeted_error_frame_fails_the_read() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let error = msg(&[0x10, 0x01, 0x8f, 0x00, 0x1a, 0x02, 0x00]);
    context.inject(ReportType::Hidpp, error.clone());

    let options = ReceiveOptions::hidpp()
        .filters(MessageFilter::new(2, 0x00))
        .timeout(SHORT_TIMEOUT);
    match channel.get_message(&options) {
        Err(ChannelError::ErrorMessageReceived(received)) => assert_eq!(received, error),
        other => panic!("expected an escalated error, got {other:?}"),
    }
    assert_eq!(channel.get_message(&options).unwrap_err().cause(), Cause::DeviceNotResponding);
}

#[test]
fn skipped_error_frames_stay_queued() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let error = msg(&[0x10, 0x01, 0x8f, 0x00, 0x1a, 0x02, 0x00]);
    context.inject(ReportType::Hidpp, error.clone());

    let options = ReceiveOptions::hidpp()
        .filters(MessageFilter::new(2, 0x00))
        .timeout(SHORT_TIMEOUT)
        .skip_error(true);
    assert_eq!(channel.get_message(&options).unwrap_err().cause(), Cause::DeviceNotResponding);
    assert_eq!(channel.queue(ReportType::Hidpp).get_nowait(), Some(error));
}

#[test]
fn dispatcher_queue_reads_pump_the_channel_queue() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let error = msg(&[0x10, 0xff, 0x8f, 0x81, 0x00, 0x03, 0x00]);
    context.inject(ReportType::Hidpp, error.clone());

    let options = ReceiveOptions::hidpp()
        .dispatcher(QueueName::Error, Some(MessageClass::HIDPP1_ERROR))
        .timeout(SHORT_TIMEOUT);
    let received = channel.get_message(&options).unwrap();

    assert_eq!(received.data, error.data);
    assert_eq!(received.message_class, Some(MessageClass::HIDPP1_ERROR));
    assert!(channel.hid_dispatcher().check_empty());
}

#[test]
fn process_all_empties_every_channel_queue() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::ALL).unwrap();

    context.inject(ReportType::Hidpp, msg(&PING));
    context.inject(ReportType::Mouse, msg(&[0x02, 0x00, 0x01, 0x00]));

    assert_eq!(channel.process_all_report_type_in_dispatcher().unwrap(), 2);
    assert!(channel.queue(ReportType::Hidpp).is_empty());
    assert!(channel.queue(ReportType::Mouse).is_empty());
    assert!(!channel.hid_dispatcher().check_empty());
}

#[test]
fn close_aborts_blocked_reads() {
    let (_, _, channel) = usb_channel(0, vec![]);
    let channel = Arc::new(channel);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let reader = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || {
            channel.get_message(&ReceiveOptions::hidpp().timeout(Duration::from_secs(10)))
        })
    };

    thread::sleep(Duration::from_millis(50));
    channel.close().unwrap();

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.cause(), Cause::ChannelNotOpen);
}

#[test]
fn close_drains_channel_and_dispatcher_queues() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::ALL).unwrap();

    context.inject(ReportType::Hidpp, msg(&PING));
    context.inject(ReportType::Digitizer, msg(&[0x0d, 0x01, 0x02]));
    channel
        .hid_dispatcher()
        .get_queue_by_name(QueueName::Event)
        .put(msg(&PING));

    channel.close().unwrap();

    for report_type in ReportType::ALL {
        assert!(channel.queue(report_type).is_empty());
    }
    assert!(channel.hid_dispatcher().check_empty());
}

#[test]
fn mute_pauses_polling() {
    let (context, _, channel) = usb_channel(0, vec![]);

    assert_eq!(channel.mute().unwrap_err().cause(), Cause::ChannelNotOpen);

    channel.open(LinkEnabler::HID_PP | LinkEnabler::MOUSE).unwrap();
    channel.mute().unwrap();
    assert!(context.is_muted(0x81));
    assert!(context.is_muted(0x82));
    assert!(!context.inject(ReportType::Hidpp, msg(&PING)));

    channel.unmute().unwrap();
    assert!(context.inject(ReportType::Hidpp, msg(&PING)));
    assert!(!channel.queue(ReportType::Hidpp).is_empty());
}

#[test]
fn callbacks_see_every_polled_report() {
    let (context, _, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let callback: TransferCallback = {
        let seen = Arc::clone(&seen);
        Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };

    channel
        .update_callback(&[ReportType::Hidpp], Some(callback))
        .unwrap();
    context.inject(ReportType::Hidpp, msg(&PING));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(matches!(
        channel.update_callback(&[ReportType::Mouse], None),
        Err(ChannelError::ExpectedLinkNotPresent(ReportType::Mouse))
    ));
}

#[test]
fn send_data_wait_response_returns_the_response() {
    let (context, _, channel) = usb_channel(0, vec![vec![msg(&PING)]]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let response = channel
        .send_data_wait_response(&PING, &ReceiveOptions::hidpp())
        .unwrap();

    assert_eq!(response.data, PING);
    assert_eq!(context.writes().len(), 1);
}

#[test]
fn send_data_wait_response_resends_after_a_timeout() {
    let (context, _, channel) = usb_channel(0, vec![vec![], vec![msg(&PING)]]);
    let channel = channel.with_config(ChannelConfig {
        retry_count: 3,
        ..ChannelConfig::default()
    });
    channel.open(LinkEnabler::HID_PP).unwrap();

    let options = ReceiveOptions::hidpp().timeout(SHORT_TIMEOUT);
    let response = channel.send_data_wait_response(&PING, &options).unwrap();

    assert_eq!(response.data, PING);
    assert_eq!(context.writes().len(), 2);
    assert!(channel.queue(ReportType::Hidpp).is_empty());
}

#[test]
fn send_data_wait_response_gives_up_after_the_retries() {
    let (context, _, channel) = usb_channel(0, vec![]);
    let channel = channel.with_config(ChannelConfig {
        retry_count: 2,
        ..ChannelConfig::default()
    });
    channel.open(LinkEnabler::HID_PP).unwrap();

    let options = ReceiveOptions::hidpp().timeout(SHORT_TIMEOUT);
    let err = channel.send_data_wait_response(&PING, &options).unwrap_err();

    assert_eq!(err.cause(), Cause::DeviceNotResponding);
    assert_eq!(context.writes().len(), 2);
}

#[test]
fn dispatcher_requests_claim_their_response() {
    let event = msg(&[0x10, 0x01, 0x04, 0x00, 0x01, 0x00, 0x00]);
    let (_, _, channel) = usb_channel(0, vec![vec![event, msg(&PING)]]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    let filters = Filters::all([MessageFilter::new(2, 0x00), MessageFilter::new(3, 0x1a)]);
    let response = channel
        .hid_dispatcher()
        .send_wait_response(&channel, &PING, &filters, Duration::from_secs(1), false)
        .unwrap();

    assert_eq!(response.data, PING);
    assert!(!channel.hid_dispatcher().check_empty());
}

#[test]
fn closing_one_device_keeps_the_pollings_of_another() {
    let context = Arc::new(MockUsbContext::new(0, vec![]));
    let device = context.plug(four_interface_device());
    let receiver = context.plug(receiver_device());
    // Both devices poll endpoint 0x81.
    let first = UsbChannel::new(Arc::clone(&device), context.clone());
    let second = UsbChannel::new(Arc::clone(&receiver), context.clone());
    first.open(LinkEnabler::ALL).unwrap();
    second.open(LinkEnabler::ALL).unwrap();
    assert!(context.is_device_polling(&device, ReportType::Hidpp));
    assert!(context.is_device_polling(&receiver, ReportType::Keyboard));

    first.close().unwrap();

    assert!(!context.is_device_polling(&device, ReportType::Hidpp));
    assert!(context.is_device_polling(&receiver, ReportType::Hidpp));
    assert!(context.is_device_polling(&receiver, ReportType::Keyboard));

    let frame = msg(&PING);
    assert!(context.inject(ReportType::Hidpp, frame.clone()));
    assert_eq!(second.get_message(&ReceiveOptions::default()).unwrap(), frame);
}

#[test]
fn hid_class_requests_address_the_interface() {
    let (context, _, channel) = usb_channel(0, vec![]);
    assert!(matches!(
        channel.hid_class_specific_request(1, HidClassRequest::SetIdle, 0, None, 0),
        Err(ChannelError::ChannelNotOpen)
    ));
    channel.open(LinkEnabler::ALL).unwrap();

    let report = channel
        .hid_class_specific_request(1, HidClassRequest::GetReport, 0x0101, None, 8)
        .unwrap();
    assert_eq!(report.len(), 8);

    let written = channel
        .hid_class_specific_request(1, HidClassRequest::SetIdle, 0, None, 0)
        .unwrap();
    assert!(written.is_empty());
    match context.writes().last() {
        Some(MockWrite::Control { request, .. }) => {
            assert_eq!(request.request_type, 0x21);
            assert_eq!(request.request, 0x0a);
            assert_eq!(request.index, 1);
        },
        other => panic!("expected a control write, got {other:?}"),
    }
}

#[test]
fn device_identity() {
    let (_, _, channel) = usb_channel(0, vec![]);

    assert_eq!(channel.get_usb_vid(), 0x046d);
    assert_eq!(channel.get_usb_pid(), 0xc08b);
    assert_eq!(channel.get_transport_id(false).unwrap(), 0xc08b);
    assert_eq!(channel.get_channel_usb_port_path_list(), vec![2, 1]);
    assert_eq!(channel.get_channel_usb_port_path_str(), "1-2.1");
    assert_eq!(channel.protocol(), LogitechProtocol::Usb);
}

#[test]
fn unplugging_closes_the_channel() {
    let (context, device, channel) = usb_channel(0, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();

    assert!(channel.is_device_connected(false).unwrap());

    context.unplug(&device);
    assert!(!channel.is_device_connected(false).unwrap());
    assert!(!channel.is_open());
}

#[test]
fn waiting_for_the_connection_state() {
    let (context, device, channel) = usb_channel(0, vec![]);

    assert!(channel.wait_device_connection_state(true, SHORT_TIMEOUT).unwrap());
    assert!(!channel.wait_device_connection_state(false, SHORT_TIMEOUT).unwrap());

    let unplug = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            context.unplug(&device);
        })
    };
    assert!(
        channel
            .wait_device_connection_state(false, Duration::from_secs(2))
            .unwrap()
    );
    unplug.join().unwrap();
}

fn open_hidpp_channel(bytes_sent_delta: isize) -> UsbChannel {
    let (_, _, channel) = usb_channel(bytes_sent_delta, vec![]);
    channel.open(LinkEnabler::HID_PP).unwrap();
    channel
}

proptest! {
    #[test]
    fn only_hidpp_lengths_are_sent(len in 1usize..100) {
        let channel = open_hidpp_channel(0);
        let mut data = vec![0x00; len];
        data[0] = 0x10;

        let result = channel.send_data(&data);
        if len == 7 {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result.unwrap_err().cause(), Cause::WrongParameter);
        }
    }

    #[test]
    fn partial_writes_are_reported(delta in -7isize..=8) {
        let channel = open_hidpp_channel(delta);

        let result = channel.send_data(&PING);
        if delta == 0 {
            prop_assert!(result.is_ok());
        } else {
            let sent = usize::try_from(7 + delta).unwrap_or(0);
            let matched = matches!(
                result,
                Err(ChannelError::ErrorBytesAreSent { sent: actual, expected: 7 }) if actual == sent
            );
            prop_assert!(matched, "unexpected result: {:?}", result);
        }
    }
}

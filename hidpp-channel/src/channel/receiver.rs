//! Implements channels to wireless receivers.
//!
//! A receiver relays the HID++ traffic of up to six paired devices, each
//! addressed by its device index. The HID++ queue of a receiver channel fans
//! messages out to the [`ThroughReceiverChannel`] subscribed to their device
//! index. Everything else, including the device connection notifications,
//! stays in the transceiver queue read by the receiver channel itself.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Channel, ChannelError, ReceiveOptions, ThroughReceiverChannel, UsbChannel};
use crate::{
    config::ChannelConfig,
    context::TransferCallback,
    dispatcher::HidDispatcher,
    filter::{Filters, MessageFilter},
    hardware::HardwareDevice,
    message::{RECEIVER_DEVICE_INDEX, SHORT_REPORT_ID, TransportMessage, offset},
    protocol::v10::{
        CONNECTION_STATE_FAKE_ARRIVAL, RegisterAddress, SubId, WIRELESS_NOTIFICATIONS,
    },
    queue::{Deadline, MessageQueue, TimestampedMultiQueue, lock},
    report::{LinkEnabler, LogitechProtocol, ReportType},
};

/// The highest amount of devices a receiver can pair.
pub const MAX_PAIRED_DEVICES: u8 = 6;

/// Offset of the receiver flags in responses of
/// [`RegisterAddress::EnableHidppReporting`].
const RECEIVER_FLAGS_OFFSET: usize = offset::R0 + 1;

/// The family of a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverKind {
    /// Unifying, Bolt and other HID++1.0 receivers.
    #[default]
    Standard,

    /// Gotthard receivers have no fake arrival. Their single device is always
    /// connected.
    Gotthard,
}

/// A channel to a wireless receiver.
pub struct UsbReceiverChannel {
    usb: UsbChannel,
    kind: ReceiverKind,
    max_number_of_paired_devices: u8,
    associated_channels_weak_ref: Mutex<HashMap<u8, Weak<ThroughReceiverChannel>>>,
}

impl UsbReceiverChannel {
    /// Turns a USB channel into a receiver channel.
    ///
    /// Fails with [`ChannelError::WrongParameter`] unless
    /// `max_number_of_paired_devices` is between 1 and [`MAX_PAIRED_DEVICES`].
    pub fn from_usb_channel(
        usb: UsbChannel,
        max_number_of_paired_devices: u8,
    ) -> Result<Self, ChannelError> {
        if !(1..=MAX_PAIRED_DEVICES).contains(&max_number_of_paired_devices) {
            return Err(ChannelError::WrongParameter(format!(
                "max_number_of_paired_devices is {max_number_of_paired_devices}, it should be between 1 and {MAX_PAIRED_DEVICES}"
            )));
        }

        let connection_notifications =
            Filters::from(MessageFilter::new(offset::SUB_ID, SubId::DeviceConnection.into()));
        let usb = usb.with_hidpp_queue(Arc::new(TimestampedMultiQueue::with_parent_pins(
            connection_notifications,
        )));

        Ok(Self {
            usb,
            kind: ReceiverKind::default(),
            max_number_of_paired_devices,
            associated_channels_weak_ref: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_kind(mut self, kind: ReceiverKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn usb(&self) -> &UsbChannel {
        &self.usb
    }

    pub fn kind(&self) -> ReceiverKind {
        self.kind
    }

    pub fn max_number_of_paired_devices(&self) -> u8 {
        self.max_number_of_paired_devices
    }

    /// The HID++ queue fanning messages out by device index.
    pub fn hidpp_queue(&self) -> &Arc<TimestampedMultiQueue> {
        self.usb.queue(ReportType::Hidpp)
    }

    /// The queue of messages not taken by a through-channel.
    pub fn transceiver_queue(&self) -> &Arc<MessageQueue> {
        self.hidpp_queue().parent()
    }

    /// The open through-channel of a device index.
    pub fn associated_channel(&self, device_index: u8) -> Option<Arc<ThroughReceiverChannel>> {
        lock(&self.associated_channels_weak_ref)
            .get(&device_index)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn register_associated(&self, device_index: u8, channel: Weak<ThroughReceiverChannel>) {
        lock(&self.associated_channels_weak_ref).insert(device_index, channel);
    }

    pub(crate) fn unregister_associated(&self, device_index: u8) {
        lock(&self.associated_channels_weak_ref).remove(&device_index);
    }

    fn register_access(
        &self,
        sub_id: SubId,
        address: RegisterAddress,
        params: [u8; 3],
    ) -> Result<TransportMessage, ChannelError> {
        let request = register_request(sub_id, address, params);
        let filters = Filters::all([
            MessageFilter::new(offset::SUB_ID, sub_id.into()),
            MessageFilter::new(offset::ADDRESS, address.into()),
        ]);

        self.hid_dispatcher()
            .send_wait_response(self, &request, &filters, self.config().get_timeout(), false)
    }

    /// Switches the wireless notifications of the receiver on or off.
    ///
    /// The setting is only written if it differs. Returns the previous
    /// setting.
    pub fn enable_hidpp_reporting(&self, enable: bool) -> Result<bool, ChannelError> {
        let response = self.register_access(
            SubId::GetRegister,
            RegisterAddress::EnableHidppReporting,
            [0; 3],
        )?;
        let Some(flags) = response.byte(RECEIVER_FLAGS_OFFSET) else {
            return Err(ChannelError::MalformedResponse(response));
        };

        let enabled = flags & WIRELESS_NOTIFICATIONS != 0;
        if enabled == enable {
            return Ok(enable);
        }

        let flags = if enable { WIRELESS_NOTIFICATIONS } else { 0 };
        self.register_access(
            SubId::SetRegister,
            RegisterAddress::EnableHidppReporting,
            [0, flags, 0],
        )?;
        debug!(channel = self.trace_name(), enable, "changed HID++ reporting");

        Ok(!enable)
    }

    /// Makes the receiver announce every paired device again.
    ///
    /// Notifications are enabled for the time of the request.
    pub fn perform_fake_arrival(&self) -> Result<(), ChannelError> {
        if self.kind == ReceiverKind::Gotthard {
            return Err(ChannelError::Unsupported("Gotthard receivers have no fake arrival"));
        }

        let previous = self.enable_hidpp_reporting(true)?;
        self.register_access(
            SubId::SetRegister,
            RegisterAddress::ConnectionState,
            [CONNECTION_STATE_FAKE_ARRIVAL, 0, 0],
        )?;

        if !previous {
            self.enable_hidpp_reporting(false)?;
        }

        Ok(())
    }
}

fn register_request(sub_id: SubId, address: RegisterAddress, params: [u8; 3]) -> [u8; 7] {
    [
        SHORT_REPORT_ID,
        RECEIVER_DEVICE_INDEX,
        sub_id.into(),
        address.into(),
        params[0],
        params[1],
        params[2],
    ]
}

impl Channel for UsbReceiverChannel {
    fn trace_name(&self) -> &str {
        self.usb.trace_name()
    }

    fn config(&self) -> &ChannelConfig {
        self.usb.config()
    }

    fn hid_dispatcher(&self) -> &Arc<HidDispatcher> {
        self.usb.hid_dispatcher()
    }

    fn is_open(&self) -> bool {
        self.usb.is_open()
    }

    fn open(&self, link_enabler: LinkEnabler) -> Result<(), ChannelError> {
        self.usb.open(link_enabler)
    }

    /// Closes every through-channel of the receiver before closing the
    /// receiver itself.
    fn close(&self) -> Result<(), ChannelError> {
        let _guard = self.usb.lock_lifecycle();

        let associated: Vec<_> = lock(&self.associated_channels_weak_ref).drain().collect();
        for (device_index, channel) in associated {
            match channel.upgrade() {
                Some(channel) => {
                    if let Err(err) = channel.close() {
                        warn!(channel = self.trace_name(), device_index, "could not close through-channel: {err}");
                    }
                },
                None => {
                    let Some(queue) = self.hidpp_queue().remove_device_index_queue(device_index) else {
                        continue;
                    };
                    for msg in queue.clear() {
                        warn!(channel = self.trace_name(), "Untreated message in device index {device_index} queue: {msg}");
                    }
                },
            }
        }

        self.usb.close_unlocked()
    }

    fn mute(&self) -> Result<(), ChannelError> {
        self.usb.mute()
    }

    fn unmute(&self) -> Result<(), ChannelError> {
        self.usb.unmute()
    }

    fn update_callback(
        &self,
        report_types: &[ReportType],
        callback: Option<TransferCallback>,
    ) -> Result<(), ChannelError> {
        self.usb.update_callback(report_types, callback)
    }

    fn send_data(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.usb.send_data(data)
    }

    fn get_message(&self, options: &ReceiveOptions) -> Result<TransportMessage, ChannelError> {
        self.usb.get_message(options)
    }

    fn process_all_report_type_in_dispatcher(&self) -> Result<usize, ChannelError> {
        self.usb.process_all_report_type_in_dispatcher()
    }

    fn process_next_report_type_in_dispatcher(
        &self,
        report_type: ReportType,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        self.usb
            .process_next_report_type_in_dispatcher(report_type, timeout)
    }

    fn is_link_enabled(&self, report_type: ReportType) -> bool {
        self.usb.is_link_enabled(report_type)
    }

    fn get_transport_id(&self, force_refresh_cache: bool) -> Result<u16, ChannelError> {
        self.usb.get_transport_id(force_refresh_cache)
    }

    fn is_device_connected(&self, force_refresh_cache: bool) -> Result<bool, ChannelError> {
        if force_refresh_cache || !self.usb.context().asynchronous_connection_capability() {
            self.usb.context().update_device_list()?;
        }

        let connected = self.usb.device().is_connected();
        if !connected && self.is_open() {
            self.close()?;
        }

        Ok(connected)
    }

    fn wait_device_connection_state(
        &self,
        connected: bool,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        let deadline = Deadline::after(timeout);
        let period = self.config().wait_connection_state_period();

        loop {
            if self.is_device_connected(true)? == connected {
                return Ok(true);
            }
            if deadline.expired() {
                return Ok(false);
            }

            thread::sleep(deadline.remaining().map_or(period, |remaining| remaining.min(period)));
        }
    }

    fn get_channel_usb_port_path_list(&self) -> Vec<u8> {
        self.usb.get_channel_usb_port_path_list()
    }

    fn get_channel_usb_port_path_str(&self) -> String {
        self.usb.get_channel_usb_port_path_str()
    }

    fn hardware_device(&self) -> Option<&Arc<dyn HardwareDevice>> {
        self.usb.hardware_device()
    }

    fn protocol(&self) -> LogitechProtocol {
        LogitechProtocol::Usb
    }
}

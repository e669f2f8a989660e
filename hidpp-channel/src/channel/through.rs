//! Implements channels to devices paired to a receiver.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    Channel, ChannelError, ReceiveOptions, UsbReceiverChannel, check_hidpp_length, dispatch_all,
    dispatch_next, receive_message,
};
use crate::{
    config::ChannelConfig,
    context::TransferCallback,
    dispatcher::{HidDispatcher, QueueName},
    filter::{Filters, MessageFilter},
    hardware::HardwareDevice,
    message::{RECEIVER_DEVICE_INDEX, SHORT_REPORT_ID, TransportMessage, offset},
    protocol::v10::{LINK_NOT_ESTABLISHED, RegisterAddress, SubId},
    queue::{Deadline, MessageQueue, lock},
    report::{LinkEnabler, LogitechProtocol, ReportType},
};

/// How long a connection scan waits on the transceiver queue before looking
/// at the dispatcher again.
const SCAN_SLICE: Duration = Duration::from_millis(10);

/// The family of the link between a receiver and its paired device.
///
/// It selects the layout of the pairing information register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThroughKind {
    #[default]
    Equad,
    BlePro,
    Gotthard,
}

impl ThroughKind {
    /// The first parameters of the pairing information and device name pages
    /// of [`RegisterAddress::NonVolatilePairingInformation`], for device index
    /// 1.
    fn pairing_register_bases(self) -> Option<(u8, u8)> {
        match self {
            ThroughKind::Equad => Some((0x20, 0x40)),
            ThroughKind::BlePro => Some((0x51, 0x61)),
            ThroughKind::Gotthard => None,
        }
    }
}

/// The pairing information and device name responses of a receiver.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DeviceInformation {
    pub pairing_information: TransportMessage,
    pub device_name: TransportMessage,
}

/// A channel to the device paired at a device index of a receiver.
///
/// HID++ messages of the device are read from a queue the receiver fans them
/// out to. Everything else is delegated to the receiver channel.
pub struct ThroughReceiverChannel {
    self_ref: Weak<ThroughReceiverChannel>,
    receiver: Arc<UsbReceiverChannel>,
    device_index: u8,
    kind: ThroughKind,
    trace_name: String,
    config: ChannelConfig,
    dispatcher: Arc<HidDispatcher>,
    hardware_device: Option<Arc<dyn HardwareDevice>>,
    is_open: AtomicBool,
    opening_closing_lock: Mutex<()>,
    hidpp_link_enabled: AtomicBool,
    connected: Mutex<Option<bool>>,
    protocol: Mutex<LogitechProtocol>,
    device_information: Mutex<Option<DeviceInformation>>,
    hidpp_time_stamped_msg_queue: Arc<MessageQueue>,
}

/// Configures a [`ThroughReceiverChannel`].
///
/// The channel inherits the configuration and the hardware device of the
/// receiver unless set.
pub struct ThroughReceiverChannelBuilder {
    receiver: Arc<UsbReceiverChannel>,
    device_index: u8,
    kind: ThroughKind,
    config: Option<ChannelConfig>,
    dispatcher: Option<Arc<HidDispatcher>>,
    hardware_device: Option<Arc<dyn HardwareDevice>>,
    trace_name: Option<String>,
}

impl ThroughReceiverChannelBuilder {
    pub fn kind(mut self, kind: ThroughKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<HidDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn hardware_device(mut self, hardware_device: Arc<dyn HardwareDevice>) -> Self {
        self.hardware_device = Some(hardware_device);
        self
    }

    pub fn trace_name(mut self, trace_name: impl Into<String>) -> Self {
        self.trace_name = Some(trace_name.into());
        self
    }

    /// Creates the channel and subscribes it to the HID++ queue of the
    /// receiver.
    ///
    /// Fails with [`ChannelError::WrongParameter`] if the device index is not
    /// one the receiver can pair, and with [`ChannelError::Configuration`] if
    /// another channel is subscribed to it.
    pub fn build(self) -> Result<Arc<ThroughReceiverChannel>, ChannelError> {
        let max = self.receiver.max_number_of_paired_devices();
        if !(1..=max).contains(&self.device_index) {
            return Err(ChannelError::WrongParameter(format!(
                "device index is {}, it should be between 1 and {max}",
                self.device_index
            )));
        }

        let kind = match self.receiver.kind() {
            super::ReceiverKind::Gotthard => ThroughKind::Gotthard,
            super::ReceiverKind::Standard => self.kind,
        };

        let queue = Arc::new(MessageQueue::new());
        self.receiver
            .hidpp_queue()
            .add_device_index_queue(self.device_index, Arc::clone(&queue))?;

        let (connected, protocol) = match kind {
            ThroughKind::Gotthard => (Some(true), LogitechProtocol::Gotthard),
            _ => (None, LogitechProtocol::Unknown),
        };

        let trace_name = self
            .trace_name
            .unwrap_or_else(|| format!("{} #{}", self.receiver.trace_name(), self.device_index));
        debug!(channel = %trace_name, "subscribed to receiver queue");

        Ok(Arc::new_cyclic(|self_ref| ThroughReceiverChannel {
            self_ref: self_ref.clone(),
            config: self.config.unwrap_or_else(|| self.receiver.config().clone()),
            dispatcher: self.dispatcher.unwrap_or_default(),
            hardware_device: self
                .hardware_device
                .or_else(|| self.receiver.hardware_device().cloned()),
            receiver: self.receiver,
            device_index: self.device_index,
            kind,
            trace_name,
            is_open: AtomicBool::new(false),
            opening_closing_lock: Mutex::new(()),
            hidpp_link_enabled: AtomicBool::new(false),
            connected: Mutex::new(connected),
            protocol: Mutex::new(protocol),
            device_information: Mutex::new(None),
            hidpp_time_stamped_msg_queue: queue,
        }))
    }
}

impl ThroughReceiverChannel {
    pub fn builder(receiver: Arc<UsbReceiverChannel>, device_index: u8) -> ThroughReceiverChannelBuilder {
        ThroughReceiverChannelBuilder {
            receiver,
            device_index,
            kind: ThroughKind::default(),
            config: None,
            dispatcher: None,
            hardware_device: None,
            trace_name: None,
        }
    }

    pub fn receiver(&self) -> &Arc<UsbReceiverChannel> {
        &self.receiver
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn kind(&self) -> ThroughKind {
        self.kind
    }

    /// The queue the receiver puts the HID++ messages of the device in.
    pub fn hidpp_queue(&self) -> &Arc<MessageQueue> {
        &self.hidpp_time_stamped_msg_queue
    }

    /// The connection state learned by the last connection scan.
    pub fn connected_cache(&self) -> Option<bool> {
        *lock(&self.connected)
    }

    /// Subscribes the channel to the HID++ queue of the receiver again.
    pub fn subscribe_to_receiver_multi_queue(&self) -> Result<(), ChannelError> {
        let _guard = lock(&self.opening_closing_lock);
        if self.is_open() {
            return Err(ChannelError::Configuration(
                "an open through-channel is already subscribed".to_owned(),
            ));
        }

        self.receiver
            .hidpp_queue()
            .add_device_index_queue(self.device_index, Arc::clone(&self.hidpp_time_stamped_msg_queue))?;
        debug!(channel = %self.trace_name, "subscribed to receiver queue");
        Ok(())
    }

    /// Stops receiving the HID++ messages of the device, dropping the ones
    /// not read yet.
    pub fn unsubscribe_from_receiver_multi_queue(&self) -> Result<(), ChannelError> {
        let _guard = lock(&self.opening_closing_lock);
        if self.is_open() {
            return Err(ChannelError::Configuration(
                "an open through-channel cannot unsubscribe".to_owned(),
            ));
        }

        self.detach_queue();
        Ok(())
    }

    fn detach_queue(&self) {
        let hidpp_queue = self.receiver.hidpp_queue();
        let subscribed = hidpp_queue
            .device_index_queue(self.device_index)
            .is_some_and(|queue| Arc::ptr_eq(&queue, &self.hidpp_time_stamped_msg_queue));
        if subscribed {
            hidpp_queue.remove_device_index_queue(self.device_index);
            debug!(channel = %self.trace_name, "unsubscribed from receiver queue");
        }

        for msg in self.hidpp_time_stamped_msg_queue.clear() {
            warn!(channel = %self.trace_name, "Untreated message in HID++ timestamped queue: {msg}");
        }
    }

    fn close_unlocked(&self) -> Result<(), ChannelError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            debug!(channel = %self.trace_name, "already closed");
            return Ok(());
        }

        self.hidpp_time_stamped_msg_queue.wake_all();
        self.receiver.unregister_associated(self.device_index);
        self.hidpp_link_enabled.store(false, Ordering::SeqCst);

        if self.config.automatic_message_clear_in_close {
            for msg in self.hidpp_time_stamped_msg_queue.clear() {
                warn!(channel = %self.trace_name, "Untreated message in HID++ timestamped queue: {msg}");
            }
            for (name, msg) in self.dispatcher.clear_all_queues() {
                warn!(channel = %self.trace_name, "Untreated message in HID dispatcher {name} queue: {msg}");
            }
            *lock(&self.device_information) = None;
        }

        debug!(channel = %self.trace_name, "closed");
        Ok(())
    }

    /// Runs `f` with the receiver open, opening it for that time if needed.
    fn with_receiver_open<T>(
        &self,
        f: impl FnOnce(&UsbReceiverChannel) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let receiver = &*self.receiver;
        let opened_here = !receiver.is_open();
        if opened_here {
            receiver
                .open(LinkEnabler::HID_PP)
                .map_err(ChannelError::through_receiver)?;
        }

        let result = f(receiver).map_err(ChannelError::through_receiver);

        if opened_here {
            if let Err(err) = receiver.close() {
                warn!(channel = %self.trace_name, "could not close receiver: {err}");
            }
        }

        result
    }

    fn is_connection_notification(&self, msg: &TransportMessage) -> bool {
        msg.byte(offset::SUB_ID) == Some(SubId::DeviceConnection.into())
            && msg.device_index() == Some(self.device_index)
    }

    /// Learns the connection state of the device from the notifications of a
    /// fake arrival.
    fn scan_connection(&self, receiver: &UsbReceiverChannel) -> Result<bool, ChannelError> {
        let is_notification = |msg: &TransportMessage| self.is_connection_notification(msg);
        let dispatcher = receiver.hid_dispatcher();
        let connection_events = dispatcher.get_queue_by_name(QueueName::ReceiverConnectionEvent);
        let transceiver = receiver.transceiver_queue();

        for (name, msg) in dispatcher.clear_all_queues() {
            debug!(channel = %self.trace_name, "dropping {msg} from HID dispatcher {name} queue");
        }
        while transceiver.get_first_nowait(is_notification).is_some() {}

        receiver.perform_fake_arrival()?;

        let deadline = Deadline::after(self.config.connection_scan_timeout().max(SCAN_SLICE));
        let mut notification = None;
        while notification.is_none() {
            notification = connection_events.get_first_nowait(is_notification).or_else(|| {
                transceiver.get_first_until(is_notification, deadline.capped(SCAN_SLICE))
            });
            if deadline.expired() {
                break;
            }
        }

        // The latest notification wins.
        while let Some(msg) = connection_events
            .get_first_nowait(is_notification)
            .or_else(|| transceiver.get_first_nowait(is_notification))
        {
            if notification
                .as_ref()
                .is_none_or(|latest: &TransportMessage| msg.timestamp >= latest.timestamp)
            {
                notification = Some(msg);
            }
        }

        let Some(msg) = notification else {
            debug!(channel = %self.trace_name, "no connection notification");
            *lock(&self.connected) = Some(false);
            return Ok(false);
        };

        let connected = msg
            .byte(offset::R0)
            .is_some_and(|info| info & LINK_NOT_ESTABLISHED == 0);
        let protocol = LogitechProtocol::from_protocol_byte(msg.byte(offset::ADDRESS).unwrap_or(0));
        info!(channel = %self.trace_name, connected, ?protocol, "DeviceConnection {msg}");

        *lock(&self.connected) = Some(connected);
        *lock(&self.protocol) = protocol;
        Ok(connected)
    }

    fn refresh_connection(&self) -> Result<bool, ChannelError> {
        self.with_receiver_open(|receiver| self.scan_connection(receiver))
    }

    fn read_pairing_register(
        receiver: &UsbReceiverChannel,
        r0: u8,
    ) -> Result<TransportMessage, ChannelError> {
        let request = [
            SHORT_REPORT_ID,
            RECEIVER_DEVICE_INDEX,
            SubId::GetLongRegister.into(),
            RegisterAddress::NonVolatilePairingInformation.into(),
            r0,
            0,
            0,
        ];
        let filters = Filters::all([
            MessageFilter::new(offset::SUB_ID, SubId::GetLongRegister.into()),
            MessageFilter::new(offset::ADDRESS, RegisterAddress::NonVolatilePairingInformation.into()),
            MessageFilter::new(offset::R0, r0),
        ]);

        receiver.hid_dispatcher().send_wait_response(
            receiver,
            &request,
            &filters,
            receiver.config().get_timeout(),
            false,
        )
    }

    /// Reads the pairing information and the device name the receiver
    /// stores for the device.
    pub fn get_device_info(&self, force_refresh_cache: bool) -> Result<DeviceInformation, ChannelError> {
        let (pairing_base, name_base) = self
            .kind
            .pairing_register_bases()
            .ok_or(ChannelError::Unsupported("Gotthard receivers store no pairing information"))?;

        if !force_refresh_cache {
            if let Some(information) = lock(&self.device_information).clone() {
                return Ok(information);
            }
        }

        let offset = self.device_index - 1;
        let information = self.with_receiver_open(|receiver| {
            Ok(DeviceInformation {
                pairing_information: Self::read_pairing_register(receiver, pairing_base + offset)?,
                device_name: Self::read_pairing_register(receiver, name_base + offset)?,
            })
        })?;

        *lock(&self.device_information) = Some(information.clone());
        Ok(information)
    }
}

impl Channel for ThroughReceiverChannel {
    fn trace_name(&self) -> &str {
        &self.trace_name
    }

    fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn hid_dispatcher(&self) -> &Arc<HidDispatcher> {
        &self.dispatcher
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn open(&self, link_enabler: LinkEnabler) -> Result<(), ChannelError> {
        let _guard = lock(&self.opening_closing_lock);
        if self.is_open() {
            debug!(channel = %self.trace_name, "already open");
            return Ok(());
        }

        if !self.receiver.is_open() {
            return Err(ChannelError::AssociatedReceiverChannelNotOpen);
        }
        if self
            .hardware_device
            .as_ref()
            .is_some_and(|hardware| !hardware.is_on())
        {
            return Err(ChannelError::HardwareDeviceOff);
        }

        let connected = match self.connected_cache() {
            Some(true) => true,
            _ => self.refresh_connection()?,
        };
        if !connected {
            return Err(ChannelError::DeviceNotConnected);
        }

        if !self.receiver.is_link_enabled(ReportType::Hidpp) {
            return Err(ChannelError::AssociatedReceiverChannelExpectedLinkNotPresent(
                ReportType::Hidpp,
            ));
        }

        self.hidpp_link_enabled
            .store(link_enabler.is_link_enabled(ReportType::Hidpp), Ordering::SeqCst);
        self.is_open.store(true, Ordering::SeqCst);
        self.receiver
            .register_associated(self.device_index, self.self_ref.clone());

        debug!(channel = %self.trace_name, "opened");
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        let _guard = lock(&self.opening_closing_lock);
        self.close_unlocked()
    }

    fn mute(&self) -> Result<(), ChannelError> {
        if !self.receiver.is_open() {
            return Err(ChannelError::AssociatedReceiverChannelNotOpen);
        }
        self.receiver.mute().map_err(ChannelError::through_receiver)
    }

    fn unmute(&self) -> Result<(), ChannelError> {
        if !self.receiver.is_open() {
            return Err(ChannelError::AssociatedReceiverChannelNotOpen);
        }
        self.receiver.unmute().map_err(ChannelError::through_receiver)
    }

    fn update_callback(
        &self,
        report_types: &[ReportType],
        callback: Option<TransferCallback>,
    ) -> Result<(), ChannelError> {
        self.receiver
            .update_callback(report_types, callback)
            .map_err(ChannelError::through_receiver)
    }

    fn send_data(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }
        if !self.receiver.is_open() {
            return Err(ChannelError::AssociatedReceiverChannelNotOpen);
        }
        if !self.receiver.is_link_enabled(ReportType::Hidpp) {
            return Err(ChannelError::AssociatedReceiverChannelExpectedLinkNotPresent(
                ReportType::Hidpp,
            ));
        }

        check_hidpp_length(data)?;

        let device_index = data.get(offset::DEVICE_INDEX).copied();
        if device_index != Some(self.device_index) {
            return Err(ChannelError::WrongParameter(format!(
                "device index is {:#04x}, it should be {:#04x}",
                device_index.unwrap_or_default(),
                self.device_index
            )));
        }

        self.receiver
            .send_data(data)
            .map_err(ChannelError::through_receiver)
    }

    fn get_message(&self, options: &ReceiveOptions) -> Result<TransportMessage, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }

        if options.report_type != ReportType::Hidpp {
            return self
                .receiver
                .get_message(options)
                .map_err(ChannelError::through_receiver);
        }

        if !self.hidpp_link_enabled.load(Ordering::SeqCst) {
            return Err(ChannelError::ExpectedLinkNotPresent(ReportType::Hidpp));
        }

        let msg = receive_message(
            &self.hidpp_time_stamped_msg_queue,
            &self.dispatcher,
            || self.is_open(),
            options,
            options.effective_timeout(&self.config),
        )?;

        info!(channel = %self.trace_name, "received {msg}");
        Ok(msg)
    }

    fn process_all_report_type_in_dispatcher(&self) -> Result<usize, ChannelError> {
        let relayed = self
            .receiver
            .process_all_report_type_in_dispatcher()
            .map_err(ChannelError::through_receiver)?;

        Ok(relayed
            + dispatch_all(
                &self.hidpp_time_stamped_msg_queue,
                &self.dispatcher,
                ReportType::Hidpp,
            ))
    }

    fn process_next_report_type_in_dispatcher(
        &self,
        report_type: ReportType,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        if report_type != ReportType::Hidpp {
            return self
                .receiver
                .process_next_report_type_in_dispatcher(report_type, timeout)
                .map_err(ChannelError::through_receiver);
        }

        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }

        Ok(dispatch_next(
            &self.hidpp_time_stamped_msg_queue,
            &self.dispatcher,
            report_type,
            timeout,
        ))
    }

    fn is_link_enabled(&self, report_type: ReportType) -> bool {
        match report_type {
            ReportType::Hidpp => self.is_open() && self.hidpp_link_enabled.load(Ordering::SeqCst),
            _ => self.is_open() && self.receiver.is_link_enabled(report_type),
        }
    }

    /// Derives the transport ID from the pairing information: the QUID of
    /// eQuad devices, the Bluetooth product ID of BLE Pro devices.
    fn get_transport_id(&self, force_refresh_cache: bool) -> Result<u16, ChannelError> {
        let (high, low) = match self.kind {
            ThroughKind::Equad => (7, 8),
            ThroughKind::BlePro => (6, 7),
            ThroughKind::Gotthard => {
                return Err(ChannelError::Unsupported("Gotthard receivers have no transport ID"));
            },
        };

        let pairing_information = self.get_device_info(force_refresh_cache)?.pairing_information;
        let (Some(high), Some(low)) = (pairing_information.byte(high), pairing_information.byte(low))
        else {
            return Err(ChannelError::MalformedResponse(pairing_information));
        };

        let id = u16::from_be_bytes([high, low]);
        Ok(match self.kind {
            // BLE Pro receivers store the product ID little-endian.
            ThroughKind::BlePro => id.swap_bytes(),
            _ => id,
        })
    }

    fn is_device_connected(&self, force_refresh_cache: bool) -> Result<bool, ChannelError> {
        if self.kind == ThroughKind::Gotthard {
            return Ok(self.connected_cache().unwrap_or(true));
        }

        if !force_refresh_cache {
            if let Some(connected) = self.connected_cache() {
                return Ok(connected);
            }
        }

        let connected = self.refresh_connection()?;
        if !connected && self.is_open() {
            self.close()?;
        }

        Ok(connected)
    }

    fn wait_device_connection_state(
        &self,
        _connected: bool,
        _timeout: Duration,
    ) -> Result<bool, ChannelError> {
        Err(ChannelError::Unsupported(
            "through-channels cannot wait for a connection state",
        ))
    }

    fn get_channel_usb_port_path_list(&self) -> Vec<u8> {
        self.receiver.get_channel_usb_port_path_list()
    }

    fn get_channel_usb_port_path_str(&self) -> String {
        self.receiver.get_channel_usb_port_path_str()
    }

    fn hardware_device(&self) -> Option<&Arc<dyn HardwareDevice>> {
        self.hardware_device.as_ref()
    }

    fn protocol(&self) -> LogitechProtocol {
        *lock(&self.protocol)
    }
}

impl Drop for ThroughReceiverChannel {
    fn drop(&mut self) {
        if self.is_open() {
            self.receiver.unregister_associated(self.device_index);
        }
        self.detach_queue();
    }
}

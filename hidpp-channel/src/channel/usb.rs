//! Implements channels to devices plugged via USB.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use super::{
    Channel, ChannelError, ReceiveOptions, check_hidpp_length, dispatch_all, dispatch_next,
    receive_message,
};
use crate::{
    config::ChannelConfig,
    context::{
        ControlRequest, HID_CLASS_INTERFACE_IN, HID_CLASS_INTERFACE_OUT, HidClassRequest,
        InterruptPolling, TransferCallback, UsbContext, UsbContextDevice,
    },
    dispatcher::HidDispatcher,
    hardware::HardwareDevice,
    message::{HexBytes, TransportMessage},
    queue::{Deadline, TimestampedMultiQueue, lock},
    report::{LinkEnabler, LogitechProtocol, ReportType},
};

/// Report type value of `wValue` in `SET_REPORT` requests.
const OUTPUT_REPORT: u16 = 0x02;

/// The links opened with a channel.
#[derive(Default)]
struct Links {
    interfaces: BTreeMap<ReportType, u8>,
    endpoints: BTreeMap<ReportType, u8>,

    /// Sending switches to interrupt writes if the HID++ interface has an OUT
    /// endpoint.
    interrupt_out_endpoint: Option<u8>,
}

/// A channel to a device plugged via USB.
///
/// Every HID interface of the device is polled into the queue of its report
/// type, as selected by the [`LinkEnabler`] the channel is opened with. HID++
/// reports are sent to the HID++ interface.
pub struct UsbChannel {
    trace_name: String,
    device: Arc<UsbContextDevice>,
    context: Arc<dyn UsbContext>,
    config: ChannelConfig,
    dispatcher: Arc<HidDispatcher>,
    hardware_device: Option<Arc<dyn HardwareDevice>>,
    is_open: AtomicBool,
    opening_closing_lock: Mutex<()>,
    links: Mutex<Links>,

    /// Indexed by report type.
    queues: [Arc<TimestampedMultiQueue>; 4],
}

impl UsbChannel {
    pub fn new(device: Arc<UsbContextDevice>, context: Arc<dyn UsbContext>) -> Self {
        Self {
            trace_name: device.reader_name.clone(),
            device,
            context,
            config: ChannelConfig::default(),
            dispatcher: Arc::new(HidDispatcher::new()),
            hardware_device: None,
            is_open: AtomicBool::new(false),
            opening_closing_lock: Mutex::new(()),
            links: Mutex::new(Links::default()),
            queues: Default::default(),
        }
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hardware_device(mut self, hardware_device: Arc<dyn HardwareDevice>) -> Self {
        self.hardware_device = Some(hardware_device);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<HidDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_trace_name(mut self, trace_name: impl Into<String>) -> Self {
        self.trace_name = trace_name.into();
        self
    }

    /// Replaces the queue HID++ reports are polled into.
    pub(crate) fn with_hidpp_queue(mut self, queue: Arc<TimestampedMultiQueue>) -> Self {
        self.queues[queue_slot(ReportType::Hidpp)] = queue;
        self
    }

    pub fn device(&self) -> &Arc<UsbContextDevice> {
        &self.device
    }

    pub fn context(&self) -> &Arc<dyn UsbContext> {
        &self.context
    }

    pub fn get_usb_vid(&self) -> u16 {
        self.device.vid
    }

    pub fn get_usb_pid(&self) -> u16 {
        self.device.pid
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.device.manufacturer.as_deref()
    }

    pub fn product(&self) -> Option<&str> {
        self.device.product.as_deref()
    }

    /// The queue reports of the given type are polled into.
    pub fn queue(&self, report_type: ReportType) -> &Arc<TimestampedMultiQueue> {
        &self.queues[queue_slot(report_type)]
    }

    /// The interface of every opened link.
    pub fn report_type_to_interface(&self) -> BTreeMap<ReportType, u8> {
        lock(&self.links).interfaces.clone()
    }

    pub(crate) fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        lock(&self.opening_closing_lock)
    }

    pub(crate) fn open_unlocked(&self, link_enabler: LinkEnabler) -> Result<(), ChannelError> {
        if self.is_open() {
            debug!(channel = %self.trace_name, "already open");
            return Ok(());
        }

        if self
            .hardware_device
            .as_ref()
            .is_some_and(|hardware| !hardware.is_on())
        {
            return Err(ChannelError::HardwareDeviceOff);
        }

        if !self.context.asynchronous_connection_capability() {
            self.context.update_device_list()?;
        }
        if !self.device.is_connected() {
            return Err(ChannelError::DeviceNotConnected);
        }

        debug!(channel = %self.trace_name, link_enabler = link_enabler.bits(), "opening");
        self.context.open_device(&self.device)?;

        for queue in &self.queues {
            queue.clear();
        }

        match self.start_polling(link_enabler) {
            Ok(links) => {
                *lock(&self.links) = links;
                self.is_open.store(true, Ordering::SeqCst);
                Ok(())
            },
            Err(err) => {
                if let Err(stop_err) = self
                    .context
                    .stop_interrupt_read_polling(&self.device, None)
                {
                    debug!(channel = %self.trace_name, "could not stop polling: {stop_err}");
                }
                if let Err(close_err) = self.context.close_device(&self.device) {
                    error!(channel = %self.trace_name, "could not close device: {close_err}");
                }
                Err(err)
            },
        }
    }

    fn start_polling(&self, link_enabler: LinkEnabler) -> Result<Links, ChannelError> {
        let mut links = Links::default();

        for interface in &self.device.interface_list {
            let report_type = interface.report_type;
            let enabled = link_enabler.is_link_enabled(report_type);
            let discard_report = link_enabler.discards_report(report_type);
            if !enabled && !discard_report {
                continue;
            }

            for endpoint in &interface.endpoints {
                if !endpoint.is_in() {
                    if enabled && report_type == ReportType::Hidpp {
                        links.interrupt_out_endpoint = Some(endpoint.address);
                    }
                    continue;
                }

                self.context.start_interrupt_read_polling(
                    &self.device,
                    InterruptPolling {
                        endpoint: endpoint.address,
                        max_packet_size: endpoint.max_packet_size,
                        target: enabled.then(|| Arc::clone(self.queue(report_type))),
                        trace_name: report_type.polling_trace_name(),
                        discard_report,
                    },
                )?;

                if enabled {
                    links.endpoints.insert(report_type, endpoint.address);
                }
            }

            if enabled {
                links.interfaces.insert(report_type, interface.interface_id);
            }
        }

        Ok(links)
    }

    pub(crate) fn close_unlocked(&self) -> Result<(), ChannelError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            debug!(channel = %self.trace_name, "already closed");
            return Ok(());
        }

        debug!(channel = %self.trace_name, "closing");
        for queue in &self.queues {
            queue.wake_all();
        }

        if let Err(err) = self.context.stop_interrupt_read_polling(&self.device, None) {
            error!(channel = %self.trace_name, "could not stop polling: {err}");
        }
        if let Err(err) = self.context.close_device(&self.device) {
            error!(channel = %self.trace_name, "could not close device: {err}");
        }

        for report_type in ReportType::ALL {
            for msg in self.queue(report_type).clear() {
                warn!(channel = %self.trace_name, "Untreated message in {report_type} timestamped queue: {msg}");
            }
        }
        *lock(&self.links) = Links::default();

        for (name, msg) in self.dispatcher.clear_all_queues() {
            warn!(channel = %self.trace_name, "Untreated message in HID dispatcher {name} queue: {msg}");
        }

        Ok(())
    }

    fn endpoints(&self) -> Vec<u8> {
        lock(&self.links).endpoints.values().copied().collect()
    }

    /// Sends a request of the HID class specification to an interface.
    ///
    /// Returns the data read by `GET_*` requests, nothing for the others.
    pub fn hid_class_specific_request(
        &self,
        interface_id: u8,
        request: HidClassRequest,
        value: u16,
        data: Option<&[u8]>,
        length: u16,
    ) -> Result<Vec<u8>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }

        let timeout = self.config.send_timeout();
        if request.is_read() {
            let setup = ControlRequest {
                request_type: HID_CLASS_INTERFACE_IN,
                request: request.into(),
                value,
                index: u16::from(interface_id),
            };
            return Ok(self.context.control_read(&self.device, setup, length, timeout)?);
        }

        let data = data.unwrap_or_default();
        let setup = ControlRequest {
            request_type: HID_CLASS_INTERFACE_OUT,
            request: request.into(),
            value,
            index: u16::from(interface_id),
        };
        let sent = self.context.control_write(&self.device, setup, data, timeout)?;
        if sent != data.len() {
            return Err(ChannelError::ErrorBytesAreSent {
                sent,
                expected: data.len(),
            });
        }

        Ok(Vec::new())
    }
}

fn queue_slot(report_type: ReportType) -> usize {
    usize::from(u8::from(report_type))
}

impl Channel for UsbChannel {
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
        let _guard = self.lock_lifecycle();
        self.open_unlocked(link_enabler)
    }

    fn close(&self) -> Result<(), ChannelError> {
        let _guard = self.lock_lifecycle();
        self.close_unlocked()
    }

    fn mute(&self) -> Result<(), ChannelError> {
        let _guard = self.lock_lifecycle();
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }

        for endpoint in self.endpoints() {
            self.context.mute(&self.device, endpoint)?;
        }
        debug!(channel = %self.trace_name, "muted");
        Ok(())
    }

    fn unmute(&self) -> Result<(), ChannelError> {
        let _guard = self.lock_lifecycle();
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }

        for endpoint in self.endpoints() {
            self.context.unmute(&self.device, endpoint)?;
        }
        debug!(channel = %self.trace_name, "unmuted");
        Ok(())
    }

    fn update_callback(
        &self,
        report_types: &[ReportType],
        callback: Option<TransferCallback>,
    ) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }

        for &report_type in report_types {
            let endpoint = lock(&self.links)
                .endpoints
                .get(&report_type)
                .copied()
                .ok_or(ChannelError::ExpectedLinkNotPresent(report_type))?;
            self.context
                .set_transfer_callback(&self.device, endpoint, callback.clone())?;
        }

        Ok(())
    }

    fn send_data(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }
        if !self.device.is_connected() {
            return Err(ChannelError::DeviceNotConnected);
        }

        let (interface, interrupt_out_endpoint) = {
            let links = lock(&self.links);
            (
                links.interfaces.get(&ReportType::Hidpp).copied(),
                links.interrupt_out_endpoint,
            )
        };
        let interface = interface.ok_or(ChannelError::ExpectedLinkNotPresent(ReportType::Hidpp))?;

        check_hidpp_length(data)?;

        let timeout = self.config.send_timeout();
        let sent = match interrupt_out_endpoint {
            Some(endpoint) => self
                .context
                .interrupt_write(&self.device, endpoint, data, timeout)?,
            None => {
                let report_id = data.first().copied().unwrap_or_default();
                let setup = ControlRequest {
                    request_type: HID_CLASS_INTERFACE_OUT,
                    request: HidClassRequest::SetReport.into(),
                    value: (OUTPUT_REPORT << 8) | u16::from(report_id),
                    index: u16::from(interface),
                };
                self.context.control_write(&self.device, setup, data, timeout)?
            },
        };

        if sent != data.len() {
            return Err(ChannelError::ErrorBytesAreSent {
                sent,
                expected: data.len(),
            });
        }

        info!(channel = %self.trace_name, "sent {}", HexBytes(data));
        Ok(())
    }

    fn get_message(&self, options: &ReceiveOptions) -> Result<TransportMessage, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }
        if !self.is_link_enabled(options.report_type) {
            return Err(ChannelError::ExpectedLinkNotPresent(options.report_type));
        }

        let msg = receive_message(
            self.queue(options.report_type).parent(),
            &self.dispatcher,
            || self.is_open(),
            options,
            options.effective_timeout(&self.config),
        )?;

        info!(channel = %self.trace_name, "received {msg}");
        Ok(msg)
    }

    fn process_all_report_type_in_dispatcher(&self) -> Result<usize, ChannelError> {
        Ok(ReportType::ALL
            .into_iter()
            .map(|report_type| {
                dispatch_all(self.queue(report_type).parent(), &self.dispatcher, report_type)
            })
            .sum())
    }

    fn process_next_report_type_in_dispatcher(
        &self,
        report_type: ReportType,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen);
        }
        if !self.is_link_enabled(report_type) {
            return Err(ChannelError::ExpectedLinkNotPresent(report_type));
        }

        Ok(dispatch_next(
            self.queue(report_type).parent(),
            &self.dispatcher,
            report_type,
            timeout,
        ))
    }

    fn is_link_enabled(&self, report_type: ReportType) -> bool {
        self.is_open() && lock(&self.links).interfaces.contains_key(&report_type)
    }

    fn get_transport_id(&self, _force_refresh_cache: bool) -> Result<u16, ChannelError> {
        Ok(self.device.pid)
    }

    fn is_device_connected(&self, force_refresh_cache: bool) -> Result<bool, ChannelError> {
        if force_refresh_cache || !self.context.asynchronous_connection_capability() {
            self.context.update_device_list()?;
        }

        let connected = self.device.is_connected();
        if !connected && self.is_open() {
            debug!(channel = %self.trace_name, "device unplugged");
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
        let period = self.config.wait_connection_state_period();

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
        self.device.port_path.clone()
    }

    fn get_channel_usb_port_path_str(&self) -> String {
        self.device.port_path_str()
    }

    fn hardware_device(&self) -> Option<&Arc<dyn HardwareDevice>> {
        self.hardware_device.as_ref()
    }

    fn protocol(&self) -> LogitechProtocol {
        LogitechProtocol::Usb
    }
}

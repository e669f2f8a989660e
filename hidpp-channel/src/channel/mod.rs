//! Channels bind the queues of a device to a lifecycle.
//!
//! A channel is created closed. Opening it starts the polling of the selected
//! interfaces, muting pauses the polling and closing releases everything. Every
//! transition is serialized by a per-channel lock, while sending and receiving
//! only observe the open flag. Closing is preemptive: readers blocked in
//! [`Channel::get_message`] return [`ChannelError::ChannelNotOpen`].
//!
//! Three kinds of channels exist:
//!
//! - [`UsbChannel`] talks to a device plugged via USB.
//! - [`UsbReceiverChannel`] talks to a wireless receiver and fans its HID++
//!   traffic out by device index.
//! - [`ThroughReceiverChannel`] talks to one device paired to a receiver.

use std::{sync::Arc, thread, time::Duration};

use tracing::{debug, warn};

use crate::{
    config::ChannelConfig,
    context::TransferCallback,
    dispatcher::{HidDispatcher, MessageClass, QueueName},
    filter::{ErrorEscalation, Filters},
    hardware::HardwareDevice,
    message::{HIDPP_REPORT_LENGTHS, TransportMessage, expected_length},
    queue::{Deadline, MessageQueue},
    report::{LinkEnabler, LogitechProtocol, ReportType},
};

mod error;
pub mod receiver;
pub mod through;
pub mod usb;

pub use error::{Cause, ChannelError};
pub use receiver::{ReceiverKind, UsbReceiverChannel};
pub use through::{DeviceInformation, ThroughKind, ThroughReceiverChannel, ThroughReceiverChannelBuilder};
pub use usb::UsbChannel;

/// How long a dispatcher read waits on the channel queue before looking at
/// the dispatcher queue again.
const DISPATCH_SLICE: Duration = Duration::from_millis(10);

/// The shortest timeout used when draining late responses.
const MIN_DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Selects what [`Channel::get_message`] waits for.
///
/// Without a dispatcher queue or filters, the next message of the report type
/// is returned.
#[derive(Clone, Debug)]
pub struct ReceiveOptions {
    pub report_type: ReportType,

    /// Reads from a dispatcher queue instead of the channel queue. Raw
    /// filters are ignored if set.
    pub dispatcher_queue: Option<QueueName>,

    /// Returns the first message of the channel queue matching the filters.
    pub raw_filters: Option<Filters>,

    /// The class a message of the dispatcher queue needs to have.
    pub message_class: Option<MessageClass>,

    /// Defaults to [`ChannelConfig::get_timeout`]. A zero timeout waits
    /// indefinitely.
    pub timeout: Option<Duration>,

    /// Returns error frames like any other message instead of failing with
    /// [`ChannelError::ErrorMessageReceived`].
    pub skip_error: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::hidpp()
    }
}

impl ReceiveOptions {
    pub fn new(report_type: ReportType) -> Self {
        Self {
            report_type,
            dispatcher_queue: None,
            raw_filters: None,
            message_class: None,
            timeout: None,
            skip_error: false,
        }
    }

    pub fn hidpp() -> Self {
        Self::new(ReportType::Hidpp)
    }

    pub fn filters(mut self, filters: impl Into<Filters>) -> Self {
        self.raw_filters = Some(filters.into());
        self
    }

    /// Reads from the given dispatcher queue, waiting for a message of the
    /// given class if any.
    pub fn dispatcher(mut self, queue: QueueName, class: Option<MessageClass>) -> Self {
        self.dispatcher_queue = Some(queue);
        self.message_class = class;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_error(mut self, skip_error: bool) -> Self {
        self.skip_error = skip_error;
        self
    }

    pub(crate) fn effective_timeout(&self, config: &ChannelConfig) -> Duration {
        self.timeout.unwrap_or_else(|| config.get_timeout())
    }
}

/// Represents a communication channel to a device.
pub trait Channel: Send + Sync {
    /// Names the channel in traces.
    fn trace_name(&self) -> &str;

    fn config(&self) -> &ChannelConfig;

    fn hid_dispatcher(&self) -> &Arc<HidDispatcher>;

    fn is_open(&self) -> bool;

    /// Opens the links selected by the link enabler. Opening an open channel
    /// does nothing.
    fn open(&self, link_enabler: LinkEnabler) -> Result<(), ChannelError>;

    /// Closes the channel and drains its queues. Closing a closed channel
    /// does nothing.
    fn close(&self) -> Result<(), ChannelError>;

    /// Pauses the reception of reports, keeping the channel open.
    fn mute(&self) -> Result<(), ChannelError>;

    fn unmute(&self) -> Result<(), ChannelError>;

    /// Replaces the callback invoked with every report received on the links
    /// of the given types.
    fn update_callback(
        &self,
        report_types: &[ReportType],
        callback: Option<TransferCallback>,
    ) -> Result<(), ChannelError>;

    /// Sends a HID++ report.
    fn send_data(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Waits for a message as selected by the options.
    fn get_message(&self, options: &ReceiveOptions) -> Result<TransportMessage, ChannelError>;

    /// Moves every pending message of the channel queues into the dispatcher.
    ///
    /// Returns the amount of dispatched messages.
    fn process_all_report_type_in_dispatcher(&self) -> Result<usize, ChannelError>;

    /// Waits up to `timeout` for a message of the given report type and
    /// dispatches it.
    ///
    /// Returns whether a message was dispatched.
    fn process_next_report_type_in_dispatcher(
        &self,
        report_type: ReportType,
        timeout: Duration,
    ) -> Result<bool, ChannelError>;

    /// Whether the channel is open and the link of the given report type was
    /// opened with it.
    fn is_link_enabled(&self, report_type: ReportType) -> bool;

    /// The 16-bit identifier of the transport the device is reached over.
    fn get_transport_id(&self, force_refresh_cache: bool) -> Result<u16, ChannelError>;

    fn is_device_connected(&self, force_refresh_cache: bool) -> Result<bool, ChannelError>;

    /// Waits until the device reaches the given connection state.
    ///
    /// Returns whether it did before the timeout.
    fn wait_device_connection_state(
        &self,
        connected: bool,
        timeout: Duration,
    ) -> Result<bool, ChannelError>;

    /// The USB port numbers leading to the device, from the root hub.
    fn get_channel_usb_port_path_list(&self) -> Vec<u8>;

    fn get_channel_usb_port_path_str(&self) -> String;

    fn hardware_device(&self) -> Option<&Arc<dyn HardwareDevice>>;

    /// The protocol the device is reached with.
    fn protocol(&self) -> LogitechProtocol;

    /// Sends a report and waits for the response, resending on timeouts.
    ///
    /// Responses to the resent requests may still arrive after the accepted
    /// one. They are read and dropped before returning.
    fn send_data_wait_response(
        &self,
        data: &[u8],
        options: &ReceiveOptions,
    ) -> Result<TransportMessage, ChannelError> {
        let attempts = self.config().retry_count.max(1);
        let mut retries = 0;

        let response = loop {
            match self.send_data(data).and_then(|()| self.get_message(options)) {
                Ok(response) => break response,
                Err(err) if err.is_retryable() && retries + 1 < attempts => {
                    retries += 1;
                    debug!(channel = self.trace_name(), retries, "resending request: {err}");
                    thread::sleep(self.config().retry_delay());
                },
                Err(err) => return Err(err),
            }
        };

        if retries > 0 {
            warn!(channel = self.trace_name(), "Missed packets: {retries}");

            let drain = options
                .clone()
                .timeout(self.config().retry_delay().max(MIN_DRAIN_TIMEOUT));
            for _ in 0..retries {
                match self.get_message(&drain) {
                    Ok(late) => debug!(channel = self.trace_name(), "dropped late response {late}"),
                    Err(ChannelError::ErrorMessageReceived(late)) => {
                        debug!(channel = self.trace_name(), "dropped late error {late}")
                    },
                    Err(ChannelError::DeviceNotResponding(_)) => break,
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(response)
    }

    /// Powers the hardware device on. The channel stays closed.
    fn turn_on_hardware_device(&self) -> Result<(), ChannelError> {
        let hardware = self
            .hardware_device()
            .ok_or(ChannelError::Unsupported("no hardware device is attached"))?;
        hardware.turn_on();
        Ok(())
    }

    /// Closes the channel and powers the hardware device off.
    fn turn_off_hardware_device(&self) -> Result<(), ChannelError> {
        let hardware = self
            .hardware_device()
            .ok_or(ChannelError::Unsupported("no hardware device is attached"))?;
        self.close()?;
        hardware.turn_off();
        Ok(())
    }
}

/// Checks the length of a HID++ report against its report ID.
pub(crate) fn check_hidpp_length(data: &[u8]) -> Result<(), ChannelError> {
    let report_id = data.first().copied();

    if !HIDPP_REPORT_LENGTHS.contains(&data.len()) {
        return Err(ChannelError::WrongParameter(format!(
            "Packet length: {}, it should be either 7, 20 or 64",
            data.len()
        )));
    }

    match report_id.and_then(|id| expected_length(id).map(|len| (id, len))) {
        Some((id, len)) if len != data.len() => Err(ChannelError::WrongParameter(format!(
            "Packet length: {}, report ID {id:#04x} requires {len}",
            data.len()
        ))),
        _ => Ok(()),
    }
}

/// Waits for a message of a channel queue as selected by the options.
///
/// `is_open` is checked whenever the wait is interrupted or times out, so a
/// concurrent close aborts the read.
pub(crate) fn receive_message(
    source: &MessageQueue,
    dispatcher: &HidDispatcher,
    is_open: impl Fn() -> bool,
    options: &ReceiveOptions,
    timeout: Duration,
) -> Result<TransportMessage, ChannelError> {
    let deadline = Deadline::after(timeout);
    let hidpp = options.report_type == ReportType::Hidpp;

    let Some(queue_name) = options.dispatcher_queue else {
        let escalation = ErrorEscalation::new(options.raw_filters.as_ref(), hidpp, options.skip_error);

        loop {
            let msg = match escalation.filters() {
                Some(filters) => source.get_first_until(|msg| filters.matches(&msg.data), deadline),
                None => source.get_first_until(|_| true, deadline),
            };

            match msg {
                Some(msg) if escalation.is_escalated(&msg.data) => {
                    return Err(ChannelError::ErrorMessageReceived(msg));
                },
                Some(msg) => return Ok(msg),
                None => check_wait(&is_open, &deadline, timeout)?,
            }
        }
    };

    let target = dispatcher.get_queue_by_name(queue_name);
    let wanted = |msg: &TransportMessage| {
        options
            .message_class
            .is_none_or(|class| msg.message_class == Some(class))
    };
    let escalate = hidpp
        && !options.skip_error
        && options.message_class.is_some_and(|class| !class.is_error());

    loop {
        if let Some(msg) = target.get_first_nowait(&wanted) {
            return Ok(msg);
        }

        match source.get_first_until(|_| true, deadline.capped(DISPATCH_SLICE)) {
            Some(mut msg) => {
                let class = dispatcher.classify(options.report_type, &msg.data);
                if escalate && class.is_some_and(MessageClass::is_error) {
                    msg.message_class = class;
                    return Err(ChannelError::ErrorMessageReceived(msg));
                }
                dispatcher.dispatch(options.report_type, msg);
            },
            None => check_wait(&is_open, &deadline, timeout)?,
        }
    }
}

fn check_wait(
    is_open: &impl Fn() -> bool,
    deadline: &Deadline,
    timeout: Duration,
) -> Result<(), ChannelError> {
    if !is_open() {
        Err(ChannelError::ChannelNotOpen)
    } else if deadline.expired() {
        Err(ChannelError::DeviceNotResponding(timeout))
    } else {
        Ok(())
    }
}

/// Dispatches every message currently in a channel queue.
pub(crate) fn dispatch_all(source: &MessageQueue, dispatcher: &HidDispatcher, report_type: ReportType) -> usize {
    let mut count = 0;
    while let Some(msg) = source.get_nowait() {
        dispatcher.dispatch(report_type, msg);
        count += 1;
    }
    count
}

/// Waits for a message of a channel queue and dispatches it.
pub(crate) fn dispatch_next(
    source: &MessageQueue,
    dispatcher: &HidDispatcher,
    report_type: ReportType,
    timeout: Duration,
) -> bool {
    match source.get(timeout) {
        Some(msg) => {
            dispatcher.dispatch(report_type, msg);
            true
        },
        None => false,
    }
}

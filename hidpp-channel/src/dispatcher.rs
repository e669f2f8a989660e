//! Splits the inbound message stream of a channel into named queues and
//! correlates responses with pending requests.
//!
//! Every message is first classified into a [`MessageClass`] using the route
//! tables of the dispatcher. Outstanding requests registered through
//! [`HidDispatcher::send_wait_response`] get the first chance to claim a
//! message, in registration order. Unclaimed messages land in the first named
//! queue accepting their class, or in a fallback queue chosen by the report ID
//! family of the message.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use lazy_static::lazy_static;
use tracing::debug;

use crate::{
    channel::{Channel, ChannelError},
    filter::{ErrorEscalation, Filters},
    message::{VLP_REPORT_IDS, TransportMessage, expected_length, offset},
    queue::{Deadline, MessageQueue, lock},
    protocol::v10::{RegisterAddress, SubId},
    report::ReportType,
};

/// How long a request waiter pumps the channel before checking whether
/// another thread already delivered its response.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// A zero timeout would read without deadline.
const MIN_PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Names the record layout a message was recognized as.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageClass(&'static str);

impl MessageClass {
    pub const HIDPP1_ERROR: Self = Self("Hidpp1ErrorCodes");
    pub const HIDPP2_ERROR: Self = Self("Hidpp2ErrorCodes");
    pub const VLP_ERROR: Self = Self("VlpErrorCodes");

    pub const HID_MOUSE: Self = Self("HidMouse");
    pub const HID_KEYBOARD: Self = Self("HidKeyboard");
    pub const HID_DIGITIZER: Self = Self("HidDigitizer");

    pub const ENABLE_HIDPP_REPORTING_RESPONSE: Self = Self("EnableHidppReportingResponse");
    pub const CONNECTION_STATE_RESPONSE: Self = Self("ConnectionStateResponse");
    pub const PAIRING_INFORMATION_RESPONSE: Self = Self("NonVolatilePairingInformationResponse");
    pub const DEVICE_CONNECTION: Self = Self("DeviceConnection");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(self) -> &'static str {
        self.0
    }

    /// Whether the class is one of the error frame classes.
    pub fn is_error(self) -> bool {
        self == Self::HIDPP1_ERROR || self == Self::HIDPP2_ERROR || self == Self::VLP_ERROR
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Names the queues of a [`HidDispatcher`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(usize)]
pub enum QueueName {
    Important,
    Common,
    Hid,
    HidPp,
    Gaming,
    Mouse,
    Keyboard,
    Touchpad,
    Peripheral,
    Event,
    BatteryEvent,
    Error,
    ReceiverResponse,
    ReceiverEvent,
    ReceiverConnectionEvent,
    VlpImportant,
    VlpCommon,
    VlpEvent,
}

impl QueueName {
    /// Every queue name, in routing order.
    pub const ALL: [QueueName; 18] = [
        QueueName::Important,
        QueueName::Common,
        QueueName::Hid,
        QueueName::HidPp,
        QueueName::Gaming,
        QueueName::Mouse,
        QueueName::Keyboard,
        QueueName::Touchpad,
        QueueName::Peripheral,
        QueueName::Event,
        QueueName::BatteryEvent,
        QueueName::Error,
        QueueName::ReceiverResponse,
        QueueName::ReceiverEvent,
        QueueName::ReceiverConnectionEvent,
        QueueName::VlpImportant,
        QueueName::VlpCommon,
        QueueName::VlpEvent,
    ];
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A feature bound to a feature index of the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FeatureEntry {
    pub feature_id: u16,
    pub version: u8,
}

type FeatureKey = (u16, u8, u8);

#[derive(Clone, Default)]
struct RouteTables {
    accepted: HashMap<QueueName, HashSet<MessageClass>>,
    feature_index_to_id: HashMap<u8, FeatureEntry>,
    feature_responses: HashMap<FeatureKey, MessageClass>,
    feature_events: HashMap<FeatureKey, MessageClass>,
    register_responses: HashMap<(u8, u8), MessageClass>,
    receiver_events: HashMap<u8, MessageClass>,
    vlp_responses: HashMap<FeatureKey, MessageClass>,
}

lazy_static! {
    /// The receiver routes the channel core itself relies on.
    static ref DEFAULT_ROUTES: RouteTables = {
        let mut routes = RouteTables::default();

        for (queue, class) in [
            (QueueName::Error, MessageClass::HIDPP1_ERROR),
            (QueueName::Error, MessageClass::HIDPP2_ERROR),
            (QueueName::Error, MessageClass::VLP_ERROR),
            (QueueName::Mouse, MessageClass::HID_MOUSE),
            (QueueName::Keyboard, MessageClass::HID_KEYBOARD),
            (QueueName::Hid, MessageClass::HID_DIGITIZER),
            (QueueName::ReceiverResponse, MessageClass::ENABLE_HIDPP_REPORTING_RESPONSE),
            (QueueName::ReceiverResponse, MessageClass::CONNECTION_STATE_RESPONSE),
            (QueueName::ReceiverResponse, MessageClass::PAIRING_INFORMATION_RESPONSE),
            (QueueName::ReceiverConnectionEvent, MessageClass::DEVICE_CONNECTION),
        ] {
            routes.accept(queue, class);
        }

        for sub_id in [SubId::SetRegister, SubId::GetRegister] {
            routes.register_responses.insert(
                (sub_id.into(), RegisterAddress::EnableHidppReporting.into()),
                MessageClass::ENABLE_HIDPP_REPORTING_RESPONSE,
            );
            routes.register_responses.insert(
                (sub_id.into(), RegisterAddress::ConnectionState.into()),
                MessageClass::CONNECTION_STATE_RESPONSE,
            );
        }
        routes.register_responses.insert(
            (SubId::GetLongRegister.into(), RegisterAddress::NonVolatilePairingInformation.into()),
            MessageClass::PAIRING_INFORMATION_RESPONSE,
        );
        routes
            .receiver_events
            .insert(SubId::DeviceConnection.into(), MessageClass::DEVICE_CONNECTION);

        routes
    };
}

impl RouteTables {
    fn accept(&mut self, queue: QueueName, class: MessageClass) {
        self.accepted.entry(queue).or_default().insert(class);
    }

    fn queue_accepting(&self, class: MessageClass) -> Option<QueueName> {
        QueueName::ALL.into_iter().find(|name| {
            self.accepted
                .get(name)
                .is_some_and(|classes| classes.contains(&class))
        })
    }

    fn classify(&self, report_type: ReportType, data: &[u8]) -> Option<MessageClass> {
        match report_type {
            ReportType::Mouse => Some(MessageClass::HID_MOUSE),
            ReportType::Keyboard => Some(MessageClass::HID_KEYBOARD),
            ReportType::Digitizer => Some(MessageClass::HID_DIGITIZER),
            ReportType::Hidpp => {
                let report_id = *data.first()?;
                if expected_length(report_id) == Some(data.len()) {
                    self.classify_hidpp(data)
                } else if VLP_REPORT_IDS.contains(&report_id) {
                    self.classify_vlp(data)
                } else {
                    None
                }
            },
        }
    }

    fn classify_hidpp(&self, data: &[u8]) -> Option<MessageClass> {
        let sub_id = *data.get(offset::SUB_ID)?;
        let address = *data.get(offset::ADDRESS)?;

        if sub_id == u8::from(SubId::Error) {
            return Some(MessageClass::HIDPP1_ERROR);
        }
        if sub_id == 0xff {
            return Some(MessageClass::HIDPP2_ERROR);
        }

        if let Some(&class) = self.register_responses.get(&(sub_id, address)) {
            return Some(class);
        }
        if let Some(&class) = self.receiver_events.get(&sub_id) {
            return Some(class);
        }

        let entry = self.feature_index_to_id.get(&sub_id)?;
        let key = (entry.feature_id, entry.version, address >> 4);

        // Events carry a zero software ID.
        if address & 0x0f == 0 {
            if let Some(&class) = self.feature_events.get(&key) {
                return Some(class);
            }
        }

        self.feature_responses.get(&key).copied()
    }

    fn classify_vlp(&self, data: &[u8]) -> Option<MessageClass> {
        let feature_index = *data.get(offset::FEATURE_INDEX)?;
        if feature_index == 0xff {
            return Some(MessageClass::VLP_ERROR);
        }

        let entry = self.feature_index_to_id.get(&feature_index)?;
        let function = *data.get(offset::FUNCTION_INDEX)? >> 4;

        self.vlp_responses
            .get(&(entry.feature_id, entry.version, function))
            .copied()
    }
}

/// Chooses the queue for messages no named queue accepts.
fn fallback_queue(report_type: ReportType, data: &[u8]) -> QueueName {
    match report_type {
        ReportType::Hidpp => match data.first() {
            Some(id) if VLP_REPORT_IDS.contains(id) => QueueName::VlpCommon,
            _ => QueueName::Common,
        },
        _ => QueueName::Hid,
    }
}

struct PendingRequest {
    /// Filters including the error frames the requester gets escalated.
    filters: Filters,

    /// Receives the claimed message. The receiving end is dropped once the
    /// requester stops waiting.
    slot: flume::Sender<TransportMessage>,
}

/// Routes messages into named queues and serves request waiters.
pub struct HidDispatcher {
    queues: Vec<Arc<MessageQueue>>,
    routes: Mutex<RouteTables>,
    pending: Mutex<Vec<PendingRequest>>,
}

impl Default for HidDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HidDispatcher {
    /// Creates a dispatcher knowing the built-in receiver routes.
    pub fn new() -> Self {
        Self {
            queues: QueueName::ALL
                .iter()
                .map(|_| Arc::new(MessageQueue::new()))
                .collect(),
            routes: Mutex::new(DEFAULT_ROUTES.clone()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn get_queue_by_name(&self, name: QueueName) -> &Arc<MessageQueue> {
        &self.queues[name as usize]
    }

    /// Makes a queue accept a message class.
    pub fn accept(&self, queue: QueueName, class: MessageClass) {
        lock(&self.routes).accept(queue, class);
    }

    /// Binds a feature to a feature index. A previous binding of the same
    /// feature to another index is removed.
    pub fn add_feature_entry(&self, feature_index: u8, feature_id: u16, version: u8) {
        let mut routes = lock(&self.routes);
        routes
            .feature_index_to_id
            .retain(|_, entry| entry.feature_id != feature_id);
        routes.feature_index_to_id.insert(
            feature_index,
            FeatureEntry {
                feature_id,
                version,
            },
        );
    }

    pub fn remove_feature_entry(&self, feature_index: u8) -> Option<FeatureEntry> {
        lock(&self.routes).feature_index_to_id.remove(&feature_index)
    }

    pub fn clear_feature_entries(&self) {
        lock(&self.routes).feature_index_to_id.clear();
    }

    pub fn get_feature_entry(&self, feature_index: u8) -> Option<FeatureEntry> {
        lock(&self.routes)
            .feature_index_to_id
            .get(&feature_index)
            .copied()
    }

    pub fn get_feature_index(&self, feature_id: u16) -> Option<u8> {
        lock(&self.routes)
            .feature_index_to_id
            .iter()
            .find(|(_, entry)| entry.feature_id == feature_id)
            .map(|(&index, _)| index)
    }

    /// Routes responses of a feature function to a queue.
    pub fn register_feature_response(
        &self,
        feature_id: u16,
        version: u8,
        function_index: u8,
        class: MessageClass,
        queue: QueueName,
    ) {
        let mut routes = lock(&self.routes);
        routes
            .feature_responses
            .insert((feature_id, version, function_index), class);
        routes.accept(queue, class);
    }

    /// Routes events of a feature to a queue.
    pub fn register_feature_event(
        &self,
        feature_id: u16,
        version: u8,
        event_index: u8,
        class: MessageClass,
        queue: QueueName,
    ) {
        let mut routes = lock(&self.routes);
        routes
            .feature_events
            .insert((feature_id, version, event_index), class);
        routes.accept(queue, class);
    }

    /// Routes HID++1.0 register responses to a queue.
    pub fn register_register_response(
        &self,
        sub_id: u8,
        address: u8,
        class: MessageClass,
        queue: QueueName,
    ) {
        let mut routes = lock(&self.routes);
        routes.register_responses.insert((sub_id, address), class);
        routes.accept(queue, class);
    }

    /// Routes HID++1.0 receiver notifications to a queue.
    pub fn register_receiver_event(&self, sub_id: u8, class: MessageClass, queue: QueueName) {
        let mut routes = lock(&self.routes);
        routes.receiver_events.insert(sub_id, class);
        routes.accept(queue, class);
    }

    pub fn register_vlp_response(
        &self,
        feature_id: u16,
        version: u8,
        function_index: u8,
        class: MessageClass,
        queue: QueueName,
    ) {
        let mut routes = lock(&self.routes);
        routes
            .vlp_responses
            .insert((feature_id, version, function_index), class);
        routes.accept(queue, class);
    }

    /// Copies every route of this dispatcher into another one.
    pub fn dump_mapping_in_other_dispatcher(&self, other: &HidDispatcher) {
        let routes = lock(&self.routes).clone();
        *lock(&other.routes) = routes;
    }

    pub fn classify(&self, report_type: ReportType, data: &[u8]) -> Option<MessageClass> {
        lock(&self.routes).classify(report_type, data)
    }

    /// Classifies a message and hands it to the first pending request it
    /// satisfies, or otherwise to a named queue.
    ///
    /// Returns the queue the message was put in, `None` if a request claimed
    /// it.
    pub fn dispatch(&self, report_type: ReportType, mut msg: TransportMessage) -> Option<QueueName> {
        let name = {
            let routes = lock(&self.routes);
            msg.message_class = routes.classify(report_type, &msg.data);
            msg.message_class
                .and_then(|class| routes.queue_accepting(class))
                .unwrap_or_else(|| fallback_queue(report_type, &msg.data))
        };

        if report_type == ReportType::Hidpp {
            let mut pending = lock(&self.pending);
            pending.retain(|request| !request.slot.is_disconnected());

            if let Some(pos) = pending
                .iter()
                .position(|request| request.filters.matches(&msg.data))
            {
                let request = pending.remove(pos);
                match request.slot.send(msg) {
                    Ok(()) => return None,
                    Err(flume::SendError(returned)) => msg = returned,
                }
            }
        }

        self.get_queue_by_name(name).put(msg);
        Some(name)
    }

    /// Sends a request through the channel and waits until a message matching
    /// the filters is dispatched.
    ///
    /// HID++ error frames the filters do not target fail the request with
    /// [`ChannelError::ErrorMessageReceived`] unless `skip_error` is set. A zero
    /// timeout waits indefinitely.
    pub fn send_wait_response<C: Channel + ?Sized>(
        &self,
        channel: &C,
        request: &[u8],
        filters: &Filters,
        timeout: Duration,
        skip_error: bool,
    ) -> Result<TransportMessage, ChannelError> {
        let escalation = ErrorEscalation::new(Some(filters), true, skip_error);
        let (slot, response) = flume::bounded(1);

        lock(&self.pending).push(PendingRequest {
            filters: escalation.filters().cloned().unwrap_or_default(),
            slot,
        });

        channel.send_data(request)?;

        let deadline = Deadline::after(timeout);
        loop {
            if let Ok(msg) = response.try_recv() {
                if escalation.is_escalated(&msg.data) {
                    return Err(ChannelError::ErrorMessageReceived(msg));
                }
                return Ok(msg);
            }

            if deadline.expired() {
                return Err(ChannelError::DeviceNotResponding(timeout));
            }

            let slice = deadline
                .remaining()
                .map_or(PUMP_INTERVAL, |remaining| remaining.min(PUMP_INTERVAL))
                .max(MIN_PUMP_INTERVAL);
            channel.process_next_report_type_in_dispatcher(ReportType::Hidpp, slice)?;
        }
    }

    /// Drains every queue, returning the removed messages.
    pub fn clear_all_queues(&self) -> Vec<(QueueName, TransportMessage)> {
        let drained: Vec<_> = QueueName::ALL
            .into_iter()
            .flat_map(|name| {
                self.get_queue_by_name(name)
                    .clear()
                    .into_iter()
                    .map(move |msg| (name, msg))
            })
            .collect();

        if !drained.is_empty() {
            debug!(count = drained.len(), "cleared dispatcher queues");
        }

        drained
    }

    /// Whether every queue is empty.
    pub fn check_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.is_empty())
    }
}

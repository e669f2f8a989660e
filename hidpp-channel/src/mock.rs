//! In-memory stand-ins for the USB stack and the hardware device, scripted by
//! tests.
//!
//! [`MockUsbContext`] answers every write with the next batch of scripted
//! messages, delivered on the endpoint polled under the
//! [`ReportType::Hidpp`] trace name.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::trace;

use crate::{
    context::{
        ContextError, ControlRequest, InterruptPolling, TransferCallback, UsbContext,
        UsbContextDevice,
    },
    hardware::HardwareDevice,
    message::TransportMessage,
    queue::{TimestampedMultiQueue, lock},
    report::ReportType,
};

/// A transfer written through a [`MockUsbContext`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MockWrite {
    Control { request: ControlRequest, data: Vec<u8> },
    Interrupt { endpoint: u8, data: Vec<u8> },
}

impl MockWrite {
    pub fn data(&self) -> &[u8] {
        match self {
            MockWrite::Control { data, .. } | MockWrite::Interrupt { data, .. } => data,
        }
    }
}

struct MockPolling {
    trace_name: &'static str,
    target: Option<Arc<TimestampedMultiQueue>>,
    discard_report: bool,
    muted: bool,
    callback: Option<TransferCallback>,
}

/// A [`UsbContext`] replaying scripted responses.
pub struct MockUsbContext {
    bytes_sent_delta: isize,
    asynchronous_connection: bool,
    responses: Mutex<VecDeque<Vec<TransportMessage>>>,
    devices: Mutex<Vec<Arc<UsbContextDevice>>>,
    open_devices: Mutex<HashSet<String>>,
    /// Keyed by reader name and endpoint.
    pollings: Mutex<HashMap<(String, u8), MockPolling>>,
    writes: Mutex<Vec<MockWrite>>,
}

impl MockUsbContext {
    /// Creates a context reporting `len + bytes_sent_delta` bytes sent for
    /// every write, and answering the n-th write with the n-th batch of
    /// `responses`.
    pub fn new(bytes_sent_delta: isize, responses: Vec<Vec<TransportMessage>>) -> Self {
        Self {
            bytes_sent_delta,
            asynchronous_connection: true,
            responses: Mutex::new(responses.into()),
            devices: Mutex::new(Vec::new()),
            open_devices: Mutex::new(HashSet::new()),
            pollings: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Sets whether the context claims to track unplugged devices on its own.
    pub fn with_asynchronous_connection(mut self, asynchronous_connection: bool) -> Self {
        self.asynchronous_connection = asynchronous_connection;
        self
    }

    /// Adds a device to the plugged devices.
    pub fn plug(&self, device: UsbContextDevice) -> Arc<UsbContextDevice> {
        let device = Arc::new(device);
        device.set_connected(true);
        lock(&self.devices).push(Arc::clone(&device));
        device
    }

    pub fn unplug(&self, device: &UsbContextDevice) {
        device.set_connected(false);
    }

    pub fn push_response(&self, batch: Vec<TransportMessage>) {
        lock(&self.responses).push_back(batch);
    }

    /// The amount of scripted batches not consumed by a write yet.
    pub fn remaining_responses(&self) -> usize {
        lock(&self.responses).len()
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        lock(&self.writes).clone()
    }

    pub fn is_device_open(&self, device: &UsbContextDevice) -> bool {
        lock(&self.open_devices).contains(&device.reader_name)
    }

    /// Whether an endpoint is polled under the trace name of the report type.
    pub fn is_polling(&self, report_type: ReportType) -> bool {
        lock(&self.pollings)
            .values()
            .any(|polling| polling.trace_name == report_type.polling_trace_name())
    }

    /// Whether the device polls an endpoint under the trace name of the
    /// report type.
    pub fn is_device_polling(&self, device: &UsbContextDevice, report_type: ReportType) -> bool {
        lock(&self.pollings).iter().any(|((reader_name, _), polling)| {
            *reader_name == device.reader_name
                && polling.trace_name == report_type.polling_trace_name()
        })
    }

    /// Whether an endpoint of any device is muted.
    pub fn is_muted(&self, endpoint: u8) -> bool {
        lock(&self.pollings)
            .iter()
            .any(|((_, polled), polling)| *polled == endpoint && polling.muted)
    }

    /// Delivers a message as if polled on the interface of the report type.
    ///
    /// Returns `false` if the message was dropped because nothing polls such
    /// an interface, or its reports are muted or discarded.
    pub fn inject(&self, report_type: ReportType, msg: TransportMessage) -> bool {
        let (target, callback) = {
            let pollings = lock(&self.pollings);
            let Some(polling) = pollings
                .values()
                .find(|polling| polling.trace_name == report_type.polling_trace_name())
            else {
                return false;
            };

            if polling.muted || polling.discard_report {
                return false;
            }

            (polling.target.clone(), polling.callback.clone())
        };

        trace!(%report_type, "injecting {msg}");
        if let Some(callback) = callback {
            callback(&msg);
        }
        if let Some(target) = target {
            target.put(msg);
        }

        true
    }

    fn answer(&self, data: &[u8]) -> usize {
        if let Some(batch) = lock(&self.responses).pop_front() {
            for msg in batch {
                self.inject(ReportType::Hidpp, msg);
            }
        }

        let sent = data.len() as isize + self.bytes_sent_delta;
        usize::try_from(sent).unwrap_or(0)
    }

    fn ensure_open(&self, device: &UsbContextDevice) -> Result<(), ContextError> {
        if self.is_device_open(device) {
            Ok(())
        } else {
            Err(ContextError::DeviceNotOpen(device.reader_name.clone()))
        }
    }
}

impl UsbContext for MockUsbContext {
    fn get_plugged_devices(
        &self,
        vid: Option<u16>,
        pid: Option<u16>,
    ) -> Result<Vec<Arc<UsbContextDevice>>, ContextError> {
        Ok(lock(&self.devices)
            .iter()
            .filter(|device| device.is_connected())
            .filter(|device| vid.is_none_or(|vid| vid == device.vid))
            .filter(|device| pid.is_none_or(|pid| pid == device.pid))
            .cloned()
            .collect())
    }

    fn update_device_list(&self) -> Result<(), ContextError> {
        Ok(())
    }

    fn asynchronous_connection_capability(&self) -> bool {
        self.asynchronous_connection
    }

    fn open_device(&self, device: &UsbContextDevice) -> Result<(), ContextError> {
        if !device.is_connected() {
            return Err(ContextError::Usb(::rusb::Error::NoDevice));
        }
        lock(&self.open_devices).insert(device.reader_name.clone());
        Ok(())
    }

    fn close_device(&self, device: &UsbContextDevice) -> Result<(), ContextError> {
        if lock(&self.open_devices).remove(&device.reader_name) {
            Ok(())
        } else {
            Err(ContextError::DeviceNotOpen(device.reader_name.clone()))
        }
    }

    fn control_write(
        &self,
        device: &UsbContextDevice,
        request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, ContextError> {
        self.ensure_open(device)?;
        lock(&self.writes).push(MockWrite::Control {
            request,
            data: data.to_vec(),
        });
        Ok(self.answer(data))
    }

    fn control_read(
        &self,
        device: &UsbContextDevice,
        _request: ControlRequest,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, ContextError> {
        self.ensure_open(device)?;
        Ok(vec![0; usize::from(length)])
    }

    fn interrupt_write(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, ContextError> {
        self.ensure_open(device)?;
        lock(&self.writes).push(MockWrite::Interrupt {
            endpoint,
            data: data.to_vec(),
        });
        Ok(self.answer(data))
    }

    fn start_interrupt_read_polling(
        &self,
        device: &UsbContextDevice,
        polling: InterruptPolling,
    ) -> Result<(), ContextError> {
        self.ensure_open(device)?;
        lock(&self.pollings).insert(
            (device.reader_name.clone(), polling.endpoint),
            MockPolling {
                trace_name: polling.trace_name,
                target: polling.target,
                discard_report: polling.discard_report,
                muted: false,
                callback: None,
            },
        );
        Ok(())
    }

    fn stop_interrupt_read_polling(
        &self,
        device: &UsbContextDevice,
        endpoint: Option<u8>,
    ) -> Result<(), ContextError> {
        self.ensure_open(device)?;
        let mut pollings = lock(&self.pollings);
        match endpoint {
            Some(endpoint) => pollings
                .remove(&(device.reader_name.clone(), endpoint))
                .map(drop)
                .ok_or(ContextError::EndpointNotPolled(endpoint)),
            None => {
                pollings.retain(|(reader_name, _), _| *reader_name != device.reader_name);
                Ok(())
            },
        }
    }

    fn mute(&self, device: &UsbContextDevice, endpoint: u8) -> Result<(), ContextError> {
        self.with_polling(device, endpoint, |polling| polling.muted = true)
    }

    fn unmute(&self, device: &UsbContextDevice, endpoint: u8) -> Result<(), ContextError> {
        self.with_polling(device, endpoint, |polling| polling.muted = false)
    }

    fn set_transfer_callback(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        callback: Option<TransferCallback>,
    ) -> Result<(), ContextError> {
        self.with_polling(device, endpoint, |polling| polling.callback = callback)
    }
}

impl MockUsbContext {
    fn with_polling(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        f: impl FnOnce(&mut MockPolling),
    ) -> Result<(), ContextError> {
        let mut pollings = lock(&self.pollings);
        let polling = pollings
            .get_mut(&(device.reader_name.clone(), endpoint))
            .ok_or(ContextError::EndpointNotPolled(endpoint))?;
        f(polling);
        Ok(())
    }
}

/// A hardware device that is off until turned on.
#[derive(Debug, Default)]
pub struct MockHardwareDevice {
    on: AtomicBool,
}

impl MockHardwareDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HardwareDevice for MockHardwareDevice {
    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    fn turn_on(&self) {
        self.on.store(true, Ordering::SeqCst);
    }

    fn turn_off(&self) {
        self.on.store(false, Ordering::SeqCst);
    }
}

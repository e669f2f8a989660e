//! A [`UsbContext`] backed by libusb through the `rusb` crate.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ::rusb::{Context, Device, DeviceHandle, TransferType, UsbContext as _};
use hidreport::{Field, Report, ReportDescriptor, Usage, UsageId, UsagePage};
use tracing::{debug, trace, warn};

use super::{
    ContextError, ControlRequest, EndpointDescriptor, InterfaceDescriptor, InterruptPolling,
    TransferCallback, UsbContext, UsbContextDevice,
};
use crate::{
    message::{LONG_REPORT_ID, SHORT_REPORT_ID, TransportMessage},
    queue::lock,
    report::ReportType,
};

pub const LOGITECH_VENDOR_ID: u16 = 0x046d;

/// hidapi defines this as the maximum expected size of report descriptors.
const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

const HIDPP_USAGE_PAGE: u16 = 0xff00;
const SHORT_REPORT_USAGE: u16 = 0x0001;
const LONG_REPORT_USAGE: u16 = 0x0002;

/// A report descriptor starting with `Usage Page (Digitizer)`.
const DIGITIZER_DESCRIPTOR_PREFIX: [u8; 2] = [0x05, 0x0d];

const HID_INTERFACE_CLASS: u8 = 0x03;
const BOOT_PROTOCOL_KEYBOARD: u8 = 0x01;
const BOOT_PROTOCOL_MOUSE: u8 = 0x02;

const GET_DESCRIPTOR: u8 = 0x06;
const STANDARD_INTERFACE_IN: u8 = 0x81;
const REPORT_DESCRIPTOR_TYPE: u16 = 0x22;

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a polling thread blocks in a single read before checking whether
/// it should stop.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a failed read before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Checks whether a report descriptor declares short or long HID++ input
/// reports.
fn supports_hidpp(raw_descriptor: &[u8]) -> bool {
    let Ok(descriptor) = ReportDescriptor::try_from(raw_descriptor) else {
        return false;
    };

    [
        (SHORT_REPORT_ID, SHORT_REPORT_USAGE),
        (LONG_REPORT_ID, LONG_REPORT_USAGE),
    ]
    .into_iter()
    .any(|(report_id, usage)| {
        descriptor
            .find_input_report(&[report_id])
            .and_then(|report| report.fields().first())
            .and_then(|field| match field {
                Field::Array(arr) => Some(arr.usage_range()),
                _ => None,
            })
            .is_some_and(|range| {
                range
                    .lookup_usage(&Usage::from_page_and_id(
                        UsagePage::from(HIDPP_USAGE_PAGE),
                        UsageId::from(usage),
                    ))
                    .is_some()
            })
    })
}

/// Determines the report type of a HID interface.
///
/// The report descriptor takes precedence over the boot protocol. Returns
/// `None` for interfaces the channels have no use for.
pub fn classify_interface(report_descriptor: Option<&[u8]>, protocol_code: u8) -> Option<ReportType> {
    match report_descriptor {
        Some(raw) if supports_hidpp(raw) => return Some(ReportType::Hidpp),
        Some(raw) if raw.starts_with(&DIGITIZER_DESCRIPTOR_PREFIX) => {
            return Some(ReportType::Digitizer);
        },
        _ => {},
    }

    match protocol_code {
        BOOT_PROTOCOL_KEYBOARD => Some(ReportType::Keyboard),
        BOOT_PROTOCOL_MOUSE => Some(ReportType::Mouse),
        // Without a readable descriptor, the vendor interface of a receiver
        // is the only one not using a boot protocol.
        _ if report_descriptor.is_none() => Some(ReportType::Hidpp),
        _ => None,
    }
}

type DeviceKey = (u8, u8);

fn device_key(device: &UsbContextDevice) -> DeviceKey {
    (device.bus_number, device.address)
}

struct ClaimedInterface {
    number: u8,
    reattach_kernel_driver: bool,
}

struct Poller {
    stop: flume::Sender<()>,
    muted: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<TransferCallback>>>,
    thread: JoinHandle<()>,
}

impl Poller {
    fn stop(self) {
        // The thread owns the receiving end, so this only fails if it already
        // stopped on its own.
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("a polling thread panicked");
        }
    }
}

struct OpenDevice {
    handle: Arc<DeviceHandle<Context>>,
    claimed: Vec<ClaimedInterface>,
    pollers: HashMap<u8, Poller>,
}

impl OpenDevice {
    fn release(self) {
        for (_, poller) in self.pollers {
            poller.stop();
        }
        release_interfaces(&self.handle, &self.claimed);
    }
}

fn release_interfaces(handle: &DeviceHandle<Context>, claimed: &[ClaimedInterface]) {
    for interface in claimed {
        if let Err(err) = handle.release_interface(interface.number) {
            debug!(interface = interface.number, "could not release interface: {err}");
        }
        if interface.reattach_kernel_driver {
            if let Err(err) = handle.attach_kernel_driver(interface.number) {
                warn!(interface = interface.number, "could not reattach kernel driver: {err}");
            }
        }
    }
}

/// Reads the HID report descriptor of an interface.
fn read_report_descriptor(
    handle: &DeviceHandle<Context>,
    interface_number: u8,
) -> Result<Vec<u8>, ::rusb::Error> {
    let mut buf = vec![0u8; MAX_REPORT_DESCRIPTOR_LENGTH];
    let len = handle.read_control(
        STANDARD_INTERFACE_IN,
        GET_DESCRIPTOR,
        REPORT_DESCRIPTOR_TYPE << 8,
        u16::from(interface_number),
        &mut buf,
        DESCRIPTOR_TIMEOUT,
    )?;
    buf.truncate(len);
    Ok(buf)
}

/// A [`UsbContext`] using libusb.
///
/// Enumeration is limited to a single vendor by default, as classifying
/// interfaces requires opening every enumerated device.
pub struct RusbContext {
    context: Context,
    vendor_id: Option<u16>,
    devices: Mutex<Vec<Arc<UsbContextDevice>>>,
    open: Mutex<HashMap<DeviceKey, OpenDevice>>,
}

impl RusbContext {
    /// Creates a context enumerating Logitech devices.
    pub fn new() -> Result<Self, ContextError> {
        Self::with_vendor_id(Some(LOGITECH_VENDOR_ID))
    }

    /// Creates a context enumerating devices of a vendor, or of every vendor
    /// if `None`.
    pub fn with_vendor_id(vendor_id: Option<u16>) -> Result<Self, ContextError> {
        let context = Self {
            context: Context::new()?,
            vendor_id,
            devices: Mutex::new(Vec::new()),
            open: Mutex::new(HashMap::new()),
        };
        context.update_device_list()?;
        Ok(context)
    }

    fn find_usb_device(&self, key: DeviceKey) -> Result<Device<Context>, ContextError> {
        self.context
            .devices()?
            .iter()
            .find(|device| (device.bus_number(), device.address()) == key)
            .ok_or(ContextError::Usb(::rusb::Error::NoDevice))
    }

    fn known_device(&self, key: DeviceKey) -> Option<Arc<UsbContextDevice>> {
        lock(&self.devices)
            .iter()
            .find(|device| device_key(device) == key)
            .cloned()
    }

    fn describe(&self, device: &Device<Context>) -> Result<Option<UsbContextDevice>, ::rusb::Error> {
        let descriptor = device.device_descriptor()?;
        if self
            .vendor_id
            .is_some_and(|vendor_id| vendor_id != descriptor.vendor_id())
        {
            return Ok(None);
        }

        let config = device.active_config_descriptor()?;
        let handle = device.open().ok();

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            let Some(setting) = interface.descriptors().next() else {
                continue;
            };
            if setting.class_code() != HID_INTERFACE_CLASS {
                continue;
            }

            let number = setting.interface_number();
            let report_descriptor = handle
                .as_ref()
                .and_then(|handle| read_report_descriptor(handle, number).ok());
            let Some(report_type) =
                classify_interface(report_descriptor.as_deref(), setting.protocol_code())
            else {
                continue;
            };

            interfaces.push(InterfaceDescriptor {
                interface_id: number,
                report_type,
                endpoints: setting
                    .endpoint_descriptors()
                    .filter(|endpoint| endpoint.transfer_type() == TransferType::Interrupt)
                    .map(|endpoint| EndpointDescriptor {
                        address: endpoint.address(),
                        max_packet_size: endpoint.max_packet_size(),
                    })
                    .collect(),
            });
        }

        if interfaces.is_empty() {
            return Ok(None);
        }

        let port_path = device.port_numbers().unwrap_or_default();
        let mut described = UsbContextDevice::new(
            String::new(),
            descriptor.vendor_id(),
            descriptor.product_id(),
        )
        .with_interfaces(interfaces)
        .with_location(device.bus_number(), device.address(), port_path);

        if let Some(handle) = &handle {
            described.manufacturer = handle.read_manufacturer_string_ascii(&descriptor).ok();
            described.product = handle.read_product_string_ascii(&descriptor).ok();
        }
        described.reader_name = format!(
            "{} ({:04x}:{:04x} at {})",
            described.product.as_deref().unwrap_or("USB device"),
            described.vid,
            described.pid,
            described.port_path_str()
        );

        Ok(Some(described))
    }
}

impl UsbContext for RusbContext {
    fn get_plugged_devices(
        &self,
        vid: Option<u16>,
        pid: Option<u16>,
    ) -> Result<Vec<Arc<UsbContextDevice>>, ContextError> {
        self.update_device_list()?;

        Ok(lock(&self.devices)
            .iter()
            .filter(|device| device.is_connected())
            .filter(|device| vid.is_none_or(|vid| vid == device.vid))
            .filter(|device| pid.is_none_or(|pid| pid == device.pid))
            .cloned()
            .collect())
    }

    fn update_device_list(&self) -> Result<(), ContextError> {
        let plugged: Vec<_> = self.context.devices()?.iter().collect();
        let mut devices = lock(&self.devices);

        for device in devices.iter() {
            let key = device_key(device);
            let present = plugged
                .iter()
                .any(|usb_device| (usb_device.bus_number(), usb_device.address()) == key);
            if device.is_connected() != present {
                debug!(device = %device.reader_name, present, "device connection changed");
                device.set_connected(present);
            }
        }

        for usb_device in &plugged {
            let key = (usb_device.bus_number(), usb_device.address());
            if devices.iter().any(|device| device_key(device) == key) {
                continue;
            }

            match self.describe(usb_device) {
                Ok(Some(device)) => {
                    debug!(device = %device.reader_name, "found device");
                    devices.push(Arc::new(device));
                },
                Ok(None) => {},
                Err(err) => trace!(bus = key.0, address = key.1, "skipping device: {err}"),
            }
        }

        Ok(())
    }

    fn asynchronous_connection_capability(&self) -> bool {
        false
    }

    fn open_device(&self, device: &UsbContextDevice) -> Result<(), ContextError> {
        let key = device_key(device);
        let mut open = lock(&self.open);
        if open.contains_key(&key) {
            return Ok(());
        }

        let handle = self.find_usb_device(key)?.open()?;

        let mut claimed = Vec::with_capacity(device.interface_list.len());
        for interface in &device.interface_list {
            let number = interface.interface_id;
            let reattach_kernel_driver = matches!(handle.kernel_driver_active(number), Ok(true))
                && handle.detach_kernel_driver(number).is_ok();

            if let Err(err) = handle.claim_interface(number) {
                release_interfaces(&handle, &claimed);
                if reattach_kernel_driver {
                    let _ = handle.attach_kernel_driver(number);
                }
                return Err(err.into());
            }

            claimed.push(ClaimedInterface {
                number,
                reattach_kernel_driver,
            });
        }

        debug!(device = %device.reader_name, "opened device");
        open.insert(
            key,
            OpenDevice {
                handle: Arc::new(handle),
                claimed,
                pollers: HashMap::new(),
            },
        );

        Ok(())
    }

    fn close_device(&self, device: &UsbContextDevice) -> Result<(), ContextError> {
        let open_device = lock(&self.open)
            .remove(&device_key(device))
            .ok_or_else(|| ContextError::DeviceNotOpen(device.reader_name.clone()))?;

        open_device.release();
        debug!(device = %device.reader_name, "closed device");

        Ok(())
    }

    fn control_write(
        &self,
        device: &UsbContextDevice,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ContextError> {
        let handle = self.handle(device)?;
        Ok(handle.write_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            data,
            timeout,
        )?)
    }

    fn control_read(
        &self,
        device: &UsbContextDevice,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, ContextError> {
        let handle = self.handle(device)?;
        let mut buf = vec![0u8; usize::from(length)];
        let len = handle.read_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            &mut buf,
            timeout,
        )?;
        buf.truncate(len);
        Ok(buf)
    }

    fn interrupt_write(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ContextError> {
        let handle = self.handle(device)?;
        Ok(handle.write_interrupt(endpoint, data, timeout)?)
    }

    fn start_interrupt_read_polling(
        &self,
        device: &UsbContextDevice,
        polling: InterruptPolling,
    ) -> Result<(), ContextError> {
        let key = device_key(device);
        let mut open = lock(&self.open);
        let open_device = open
            .get_mut(&key)
            .ok_or_else(|| ContextError::DeviceNotOpen(device.reader_name.clone()))?;

        if let Some(previous) = open_device.pollers.remove(&polling.endpoint) {
            previous.stop();
        }

        let (stop, stop_receiver) = flume::bounded::<()>(1);
        let muted = Arc::new(AtomicBool::new(false));
        let callback = Arc::new(Mutex::new(None::<TransferCallback>));
        let known_device = self.known_device(key);
        let endpoint = polling.endpoint;

        let thread = thread::Builder::new()
            .name(polling.trace_name.to_owned())
            .spawn({
                let handle = Arc::clone(&open_device.handle);
                let muted = Arc::clone(&muted);
                let callback = Arc::clone(&callback);

                move || {
                    let mut buf = vec![0u8; usize::from(polling.max_packet_size.max(1))];

                    loop {
                        match stop_receiver.try_recv() {
                            Err(flume::TryRecvError::Empty) => {},
                            _ => break,
                        }

                        let len = match handle.read_interrupt(polling.endpoint, &mut buf, POLL_TIMEOUT) {
                            Ok(len) => len,
                            Err(::rusb::Error::Timeout) => continue,
                            Err(::rusb::Error::NoDevice) => {
                                if let Some(device) = &known_device {
                                    device.set_connected(false);
                                }
                                debug!(endpoint = polling.endpoint, "device gone, stopping polling");
                                break;
                            },
                            Err(err) => {
                                warn!(endpoint = polling.endpoint, "interrupt read failed: {err}");
                                thread::sleep(POLL_ERROR_BACKOFF);
                                continue;
                            },
                        };

                        if polling.discard_report || muted.load(Ordering::SeqCst) {
                            continue;
                        }

                        let msg = TransportMessage::new(&buf[..len]);
                        trace!(name = polling.trace_name, "received {msg}");

                        if let Some(callback) = lock(&callback).clone() {
                            callback(&msg);
                        }
                        if let Some(target) = &polling.target {
                            target.put(msg);
                        }
                    }
                }
            })?;

        open_device.pollers.insert(
            endpoint,
            Poller {
                stop,
                muted,
                callback,
                thread,
            },
        );

        Ok(())
    }

    fn stop_interrupt_read_polling(
        &self,
        device: &UsbContextDevice,
        endpoint: Option<u8>,
    ) -> Result<(), ContextError> {
        let stopped: Vec<Poller> = {
            let mut open = lock(&self.open);
            let open_device = open
                .get_mut(&device_key(device))
                .ok_or_else(|| ContextError::DeviceNotOpen(device.reader_name.clone()))?;

            match endpoint {
                Some(endpoint) => open_device
                    .pollers
                    .remove(&endpoint)
                    .ok_or(ContextError::EndpointNotPolled(endpoint))
                    .map(|poller| vec![poller])?,
                None => open_device.pollers.drain().map(|(_, poller)| poller).collect(),
            }
        };

        for poller in stopped {
            poller.stop();
        }

        Ok(())
    }

    fn mute(&self, device: &UsbContextDevice, endpoint: u8) -> Result<(), ContextError> {
        self.with_poller(device, endpoint, |poller| {
            poller.muted.store(true, Ordering::SeqCst);
        })
    }

    fn unmute(&self, device: &UsbContextDevice, endpoint: u8) -> Result<(), ContextError> {
        self.with_poller(device, endpoint, |poller| {
            poller.muted.store(false, Ordering::SeqCst);
        })
    }

    fn set_transfer_callback(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        callback: Option<TransferCallback>,
    ) -> Result<(), ContextError> {
        self.with_poller(device, endpoint, |poller| {
            *lock(&poller.callback) = callback;
        })
    }
}

impl RusbContext {
    fn handle(&self, device: &UsbContextDevice) -> Result<Arc<DeviceHandle<Context>>, ContextError> {
        lock(&self.open)
            .get(&device_key(device))
            .map(|open_device| Arc::clone(&open_device.handle))
            .ok_or_else(|| ContextError::DeviceNotOpen(device.reader_name.clone()))
    }

    fn with_poller(
        &self,
        device: &UsbContextDevice,
        endpoint: u8,
        f: impl FnOnce(&Poller),
    ) -> Result<(), ContextError> {
        let open = lock(&self.open);
        let poller = open
            .get(&device_key(device))
            .ok_or_else(|| ContextError::DeviceNotOpen(device.reader_name.clone()))?
            .pollers
            .get(&endpoint)
            .ok_or(ContextError::EndpointNotPolled(endpoint))?;

        f(poller);
        Ok(())
    }
}

impl Drop for RusbContext {
    fn drop(&mut self) {
        for (_, open_device) in lock(&self.open).drain() {
            open_device.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_protocols_classify_without_descriptor_match() {
        let unknown = [0x06, 0x00];
        assert_eq!(classify_interface(Some(&unknown), 1), Some(ReportType::Keyboard));
        assert_eq!(classify_interface(Some(&unknown), 2), Some(ReportType::Mouse));
        assert_eq!(classify_interface(Some(&unknown), 0), None);
    }

    #[test]
    fn digitizer_descriptors_are_recognized() {
        let digitizer = [0x05, 0x0d, 0x09, 0x05, 0xa1, 0x01];
        assert_eq!(classify_interface(Some(&digitizer), 0), Some(ReportType::Digitizer));
    }

    #[test]
    fn unreadable_vendor_interface_is_hidpp() {
        assert_eq!(classify_interface(None, 0), Some(ReportType::Hidpp));
        assert_eq!(classify_interface(None, 2), Some(ReportType::Mouse));
    }
}

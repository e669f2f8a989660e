use std::{
    io::{BufWriter, Write},
    sync::Arc,
};

use anyhow::Result;
use clap::Args;
use hidpp_channel::{
    Channel, LinkEnabler, ThroughReceiverChannel, UsbChannel, UsbReceiverChannel,
    channel::{DeviceInformation, ThroughKind},
    context::{
        UsbContext, UsbContextDevice,
        rusb::{LOGITECH_VENDOR_ID, RusbContext},
    },
};
use itertools::Itertools;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{Cli, parse_hex_u16};
use crate::config::{HarnessConfig, ReceiverEntry};

/// Offset of the name length in the device name page of the pairing
/// information register. The name follows it.
const DEVICE_NAME_LENGTH_OFFSET: usize = 5;

/// Detect plugged Logitech devices and the devices paired to known receivers.
#[derive(Args)]
pub struct ProbeCommand {
    /// Only probe devices with this product ID, in hex
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,
}

impl ProbeCommand {
    pub fn execute(&self, root: &Cli, config: &HarnessConfig) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let context: Arc<dyn UsbContext> = Arc::new(RusbContext::new()?);
        let devices = context.get_plugged_devices(Some(LOGITECH_VENDOR_ID), self.pid)?;

        let probed: Vec<_> = devices
            .into_iter()
            .sorted_by_key(|device| device.port_path.clone())
            .map(|device| probe_device(&context, device, config))
            .collect();

        if root.json {
            writeln!(stdout, "{}", json!(probed))?;
            return Ok(());
        }

        if probed.is_empty() {
            writeln!(stdout, "{}", "No Logitech USB devices were found.".bright_black())?;
            return Ok(());
        }

        for (device_i, device) in probed.into_iter().enumerate() {
            if device_i != 0 {
                writeln!(stdout)?;
            }

            writeln!(
                stdout,
                "{}: {} ({:#06x}:{:#06x})",
                device.port_path.bright_black(),
                device.name,
                device.vendor_id.bright_black(),
                device.product_id.bright_black()
            )?;
            writeln!(
                stdout,
                " │  {}",
                device
                    .interfaces
                    .iter()
                    .map(|interface| format!("{} {}", interface.id, interface.report_type))
                    .join(", ")
                    .bright_black()
            )?;

            if device.kind.is_none() {
                writeln!(stdout, " ╰─ {}", "Not a known receiver.".bright_black().italic())?;
                continue;
            }

            if device.slots.is_empty() {
                writeln!(stdout, " ╰─ {}", "No devices were found.".bright_black().italic())?;
                continue;
            }

            let slots_len = device.slots.len();
            for (slot_i, slot) in device.slots.into_iter().enumerate() {
                writeln!(
                    stdout,
                    "{} {}: {} {} ({}) ({})",
                    if slot_i == slots_len - 1 {
                        " ╰─"
                    } else {
                        " ├─"
                    },
                    slot.device_index.bright_blue(),
                    if slot.connected {
                        "●".green().into_styled()
                    } else {
                        "●".red().into_styled()
                    },
                    match slot.name {
                        Some(name) if slot.connected => name,
                        Some(name) => name.bright_black().italic().to_string(),
                        None => "unknown".bright_black().italic().to_string(),
                    },
                    slot.protocol.green(),
                    slot.transport_id
                        .map_or_else(|| "-".to_owned(), |id| format!("{id:#06x}"))
                        .bright_black(),
                )?;
            }
        }

        stdout.flush()?;

        Ok(())
    }
}

fn probe_device(
    context: &Arc<dyn UsbContext>,
    device: Arc<UsbContextDevice>,
    config: &HarnessConfig,
) -> ProbedDevice {
    let entry = config.receiver(device.vid, device.pid);
    let slots = match entry {
        Some(entry) => probe_slots(context, Arc::clone(&device), entry, config).unwrap_or_else(|err| {
            warn!(device = %device.reader_name, "could not probe receiver: {err}");
            Vec::new()
        }),
        None => Vec::new(),
    };

    ProbedDevice {
        name: device
            .product
            .clone()
            .unwrap_or_else(|| device.reader_name.clone()),
        port_path: device.port_path_str(),
        vendor_id: device.vid,
        product_id: device.pid,
        interfaces: device
            .interface_list
            .iter()
            .map(|interface| ProbedInterface {
                id: interface.interface_id,
                report_type: interface.report_type.to_string(),
            })
            .collect(),
        kind: entry.map(|entry| entry.kind),
        slots,
    }
}

fn probe_slots(
    context: &Arc<dyn UsbContext>,
    device: Arc<UsbContextDevice>,
    entry: &ReceiverEntry,
    config: &HarnessConfig,
) -> Result<Vec<ProbedSlot>> {
    let usb = UsbChannel::new(device, Arc::clone(context)).with_config(config.channel.clone());
    let receiver = Arc::new(
        UsbReceiverChannel::from_usb_channel(usb, entry.max_paired)?.with_kind(entry.receiver_kind()),
    );
    receiver.open(LinkEnabler::HID_PP)?;

    let mut slots = Vec::with_capacity(usize::from(entry.max_paired));
    for device_index in 1..=entry.max_paired {
        let through = ThroughReceiverChannel::builder(Arc::clone(&receiver), device_index)
            .kind(entry.kind)
            .build()?;

        let connected = through.is_device_connected(true).unwrap_or_else(|err| {
            debug!(channel = through.trace_name(), "no connection state: {err}");
            false
        });
        let information = through.get_device_info(false).ok();

        // Slots never paired have neither a connection nor a name.
        if !connected && information.is_none() {
            continue;
        }

        slots.push(ProbedSlot {
            device_index,
            connected,
            protocol: format!("{:?}", through.protocol()),
            transport_id: through.get_transport_id(false).ok(),
            name: information.as_ref().and_then(device_name),
        });
    }

    receiver.close()?;
    Ok(slots)
}

fn device_name(information: &DeviceInformation) -> Option<String> {
    let data = &information.device_name.data;
    let len = usize::from(*data.get(DEVICE_NAME_LENGTH_OFFSET)?);
    let start = DEVICE_NAME_LENGTH_OFFSET + 1;
    let name = data.get(start..start + len)?;
    Some(String::from_utf8_lossy(name).into_owned())
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedDevice {
    name: String,
    port_path: String,
    vendor_id: u16,
    product_id: u16,
    interfaces: Vec<ProbedInterface>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ThroughKind>,

    slots: Vec<ProbedSlot>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedInterface {
    id: u8,
    report_type: String,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ProbedSlot {
    device_index: u8,
    connected: bool,
    protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    transport_id: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

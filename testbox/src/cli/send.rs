use std::{
    io::{BufWriter, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Args;
use hidpp_channel::{
    Channel, Filters, LinkEnabler, MessageFilter, ReceiveOptions, ThroughReceiverChannel,
    TransportMessage, UsbChannel, UsbReceiverChannel,
    context::{
        UsbContext,
        rusb::{LOGITECH_VENDOR_ID, RusbContext},
    },
    message::{HexBytes, offset},
};
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, parse_hex_bytes, parse_hex_u8, parse_hex_u16};
use crate::config::HarnessConfig;

/// Send a HID++ report and print the response.
#[derive(Args)]
pub struct SendCommand {
    /// Product ID of the USB device, in hex
    #[arg(long, value_parser = parse_hex_u16)]
    pid: u16,

    /// Send through the receiver to the device paired at this index
    #[arg(short, long)]
    device_index: Option<u8>,

    /// Expected byte at offset 2 of the response, in hex. Defaults to the
    /// one of the report
    #[arg(long, value_parser = parse_hex_u8)]
    sub_id: Option<u8>,

    /// How long to wait for the response, in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Print error frames instead of failing on them
    #[arg(long)]
    skip_error: bool,

    /// The report as hex bytes, e.g. "10 01 00 1a 00 00 5a"
    report: String,
}

impl SendCommand {
    pub fn execute(&self, root: &Cli, config: &HarnessConfig) -> Result<()> {
        let report = parse_hex_bytes(&self.report)?;
        let (Some(&device_index), Some(&sub_id)) =
            (report.get(offset::DEVICE_INDEX), report.get(offset::SUB_ID))
        else {
            bail!("a HID++ report has at least 3 bytes");
        };

        let mut options = ReceiveOptions::hidpp()
            .filters(Filters::all([
                MessageFilter::new(offset::DEVICE_INDEX, device_index),
                MessageFilter::new(offset::SUB_ID, self.sub_id.unwrap_or(sub_id)),
            ]))
            .skip_error(self.skip_error);
        if let Some(timeout) = self.timeout {
            options = options.timeout(Duration::from_millis(timeout));
        }

        let context: Arc<dyn UsbContext> = Arc::new(RusbContext::new()?);
        let device = context
            .get_plugged_devices(Some(LOGITECH_VENDOR_ID), Some(self.pid))?
            .into_iter()
            .next()
            .with_context(|| format!("no device with product ID {:#06x} is plugged", self.pid))?;
        let usb = UsbChannel::new(Arc::clone(&device), context).with_config(config.channel.clone());

        let response = match self.device_index {
            None => send_once(&usb, &report, &options)?,
            Some(index) => {
                let entry = config.receiver(device.vid, device.pid).with_context(|| {
                    format!("{:#06x} is not a known receiver", device.pid)
                })?;
                let receiver = Arc::new(
                    UsbReceiverChannel::from_usb_channel(usb, entry.max_paired)?
                        .with_kind(entry.receiver_kind()),
                );
                receiver.open(LinkEnabler::HID_PP)?;

                let through = ThroughReceiverChannel::builder(Arc::clone(&receiver), index)
                    .kind(entry.kind)
                    .build()?;
                let response = send_once(&*through, &report, &options);
                receiver.close()?;
                response?
            },
        };

        let mut stdout = BufWriter::new(anstream::stdout());
        if root.json {
            writeln!(
                stdout,
                "{}",
                json!({
                    "request": HexBytes(&report).to_string(),
                    "response": HexBytes(&response.data).to_string(),
                    "timestamp": response.timestamp,
                    "class": response.message_class.map(|class| class.name()),
                })
            )?;
        } else {
            writeln!(stdout, "{} {}", "→".bright_black(), HexBytes(&report))?;
            writeln!(stdout, "{} {}", "←".green(), HexBytes(&response.data))?;
        }
        stdout.flush()?;

        Ok(())
    }
}

/// Opens the channel for a single exchange.
fn send_once<C: Channel + ?Sized>(
    channel: &C,
    report: &[u8],
    options: &ReceiveOptions,
) -> Result<TransportMessage> {
    channel.open(LinkEnabler::HID_PP)?;
    let response = channel.send_data_wait_response(report, options);
    channel.close()?;
    Ok(response?)
}

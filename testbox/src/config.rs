use std::{fs, path::Path};

use anyhow::{Context, Result};
use hidpp_channel::{
    ChannelConfig,
    channel::{ReceiverKind, ThroughKind},
    context::rusb::LOGITECH_VENDOR_ID,
};
use serde::{Deserialize, Serialize};

/// Settings of the harness, read from a TOML file.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Used unless `RUST_LOG` is set.
    pub log_level: String,

    pub channel: ChannelConfig,

    /// The USB devices treated as receivers.
    pub receivers: Vec<ReceiverEntry>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_owned(),
            channel: ChannelConfig::default(),
            receivers: vec![
                ReceiverEntry::new(0xc52b, ThroughKind::Equad, 6),
                ReceiverEntry::new(0xc534, ThroughKind::Equad, 2),
                ReceiverEntry::new(0xc548, ThroughKind::BlePro, 6),
            ],
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn receiver(&self, vid: u16, pid: u16) -> Option<&ReceiverEntry> {
        self.receivers
            .iter()
            .find(|entry| entry.vid == vid && entry.pid == pid)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverEntry {
    #[serde(default = "default_vid")]
    pub vid: u16,
    pub pid: u16,

    /// The link family of the paired devices.
    #[serde(default)]
    pub kind: ThroughKind,

    #[serde(default = "default_max_paired")]
    pub max_paired: u8,
}

impl ReceiverEntry {
    fn new(pid: u16, kind: ThroughKind, max_paired: u8) -> Self {
        Self {
            vid: LOGITECH_VENDOR_ID,
            pid,
            kind,
            max_paired,
        }
    }

    pub fn receiver_kind(&self) -> ReceiverKind {
        match self.kind {
            ThroughKind::Gotthard => ReceiverKind::Gotthard,
            ThroughKind::Equad | ThroughKind::BlePro => ReceiverKind::Standard,
        }
    }
}

fn default_vid() -> u16 {
    LOGITECH_VENDOR_ID
}

fn default_max_paired() -> u8 {
    6
}

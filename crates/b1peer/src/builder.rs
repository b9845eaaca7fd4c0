//! # Peer Builder
//!
//! Fluent configuration for opening a peer.

use crate::bus::BusConfig;
use crate::bus::DEFAULT_BUS_PATH;
use crate::bus::LocalBus;
use crate::channel::Channel;
use crate::error::Result;
use crate::peer::Peer;

/// Builds a `Peer`. Without an explicit channel it connects to the
/// `LocalBus` at the configured path.
#[derive(Default)]
pub struct PeerBuilder {
    name: Option<String>,
    bus_path: Option<String>,
    bus_config: Option<BusConfig>,
    channel: Option<Box<dyn Channel>>,
}

impl PeerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in log output. Defaults to `peer<fd>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bus_path(mut self, path: impl Into<String>) -> Self {
        self.bus_path = Some(path.into());
        self
    }

    /// Limits for the bus, applied if this connect creates it.
    pub fn bus_config(mut self, config: BusConfig) -> Self {
        self.bus_config = Some(config);
        self
    }

    /// Uses `channel` instead of connecting to a bus.
    pub fn channel(mut self, channel: Box<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn connect(self) -> Result<Peer> {
        let channel = match self.channel {
            Some(channel) => channel,
            None => {
                let path = self.bus_path.as_deref().unwrap_or(DEFAULT_BUS_PATH);
                let bus = LocalBus::open_with_config(path, self.bus_config.unwrap_or_default());
                Box::new(bus.connect())
            }
        };
        let name = self.name.unwrap_or_else(|| format!("peer{}", channel.descriptor()));
        Ok(Peer::from_channel(name, channel))
    }
}

//! # Environment Bootstrap
//!
//! Hands a connection to code that starts later, through `BUS1_PEER_FD`.
//! The receiving side attaches to the descriptor and picks up the seed
//! stored on the connection, if there is one.

use tracing::debug;

use crate::channel::ChannelError;
use crate::error::Error;
use crate::error::Result;
use crate::peer::Peer;

/// Variable holding the exported connection descriptor.
pub const PEER_FD_ENV: &str = "BUS1_PEER_FD";

impl Peer {
    /// Variables that hand this peer's connection over.
    pub fn environment(&self) -> Vec<(String, String)> {
        vec![(PEER_FD_ENV.to_string(), self.fd().to_string())]
    }

    /// Publishes this peer's connection in the process environment.
    pub fn export_to_environment(&self) -> Result<()> {
        self.check_open()?;
        for (key, value) in self.environment() {
            // SAFETY: the environment is only touched from the thread doing
            // bootstrap; no other thread reads it concurrently.
            unsafe { std::env::set_var(&key, &value) };
        }
        debug!(peer = %self.name(), fd = self.fd(), "exported to environment");
        Ok(())
    }

    /// Attaches to the exported connection and consumes the variable.
    ///
    /// Roots of a stored seed are loaded so `implement` can claim them.
    pub fn new_from_environment() -> Result<Peer> {
        let raw = std::env::var(PEER_FD_ENV).map_err(|e| Error::Environment(format!("{}: {}", PEER_FD_ENV, e)))?;
        let fd = raw.trim().parse::<u64>().map_err(|e| Error::Environment(format!("{}={:?}: {}", PEER_FD_ENV, raw, e)))?;
        // SAFETY: see `export_to_environment`.
        unsafe { std::env::remove_var(PEER_FD_ENV) };

        let peer = Peer::new_from_fd(fd)?;
        match peer.recv_seed() {
            Ok(_) | Err(Error::Channel(ChannelError::NoSeed)) => {}
            Err(e) => return Err(e),
        }
        debug!(peer = %peer.name(), fd, roots = peer.root_names().len(), "attached from environment");
        Ok(peer)
    }
}

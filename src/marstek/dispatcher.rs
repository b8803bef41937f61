//! Mode change commands
//!
//! Commands share the poll gate. They are never queued: a held gate means
//! `Busy` right away.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::protocol;
use super::session::Link;
use super::types::{CommandResult, ManualSchedule, ModeCommand, PassiveSettings, StorageMode};
use crate::errors::CommandError;

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub timeout: Duration,
    /// Extra attempts after the first one, transient errors only
    pub retries: u32,
    pub manual: ManualSchedule,
    pub passive: PassiveSettings,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retries: 2,
            manual: ManualSchedule::default(),
            passive: PassiveSettings::default(),
        }
    }
}

pub struct Dispatcher {
    link: Arc<Link>,
    settings: CommandSettings,
}

impl Dispatcher {
    pub(crate) fn new(link: Arc<Link>, settings: CommandSettings) -> Self {
        Self { link, settings }
    }

    /// Command for `mode` using the configured Manual and Passive settings
    pub fn command(&self, mode: StorageMode) -> ModeCommand {
        ModeCommand::new(mode)
            .with_manual(self.settings.manual.clone())
            .with_passive(self.settings.passive.clone())
    }

    pub fn set_mode(&self, mode: StorageMode) -> Result<CommandResult, CommandError> {
        self.send(&self.command(mode))
    }

    /// Send `command` and wait for the acknowledgment.
    ///
    /// A confirmed change is published right away with the current sequence
    /// number; the next poll reads back the authoritative mode.
    pub fn send(&self, command: &ModeCommand) -> Result<CommandResult, CommandError> {
        let mode = command.mode;
        let Some(mut transport) = self.link.gate.try_lock() else {
            debug!("Transport busy, refusing mode change to {}", mode);
            return Err(CommandError::Busy(mode));
        };

        let request = protocol::encode_mode_command(command)?;
        let attempts = self.settings.retries.saturating_add(1);

        let mut attempt = 0;
        let reply = loop {
            attempt += 1;
            match transport.send_and_receive(&request, self.settings.timeout) {
                Ok(reply) => break reply,
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(
                        "Mode change to {} attempt {}/{} failed: {}",
                        mode, attempt, attempts, e
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Mode change to {} unanswered after {} attempts: {}",
                        mode, attempts, e
                    );
                    return Err(CommandError::Timeout { mode, attempts });
                }
                Err(e) => return Err(e.into()),
            }
        };

        let ack = protocol::decode_ack(&reply).map_err(|e| {
            warn!("Invalid acknowledgment for {} ({} bytes): {}", mode, reply.len(), e);
            e
        })?;

        if !ack.accepted {
            warn!("Device rejected mode change to {}", mode);
            return Ok(CommandResult::rejected());
        }

        info!("Storage mode set to {}", mode);
        let store = &self.link.store;
        store.publish(store.current().with_mode(mode));
        Ok(CommandResult::accepted(mode))
    }
}

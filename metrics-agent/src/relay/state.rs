//! Persisted relay registration (client id, last command and its result)

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::buffer::{quarantine, write_atomic};
use crate::error::StorageError;
use crate::models::ClientRegistration;

pub struct RegistrationStore {
    path: PathBuf,
}

impl RegistrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored registration for `client_id`, or a fresh one.
    ///
    /// A file written for another client id is ignored: the command history
    /// belongs to that identity.
    pub fn load(&self, client_id: &str) -> Result<ClientRegistration, StorageError> {
        match self.read()? {
            Some(stored) if stored.client_id == client_id => {
                debug!(
                    "Loaded registration state: last_command_id={:?}",
                    stored.last_command_id
                );
                Ok(stored)
            }
            Some(stored) => {
                warn!(
                    "Registration state belongs to client {}, starting fresh as {}",
                    stored.client_id, client_id
                );
                Ok(ClientRegistration::new(client_id))
            }
            None => Ok(ClientRegistration::new(client_id)),
        }
    }

    /// The client id this host already uses, or `derive()` persisted as the new one.
    ///
    /// The derived id depends on which interface is primary right now, so it is
    /// only consulted once per state file.
    pub fn resolve_client_id(&self, derive: impl FnOnce() -> String) -> Result<String, StorageError> {
        if let Some(stored) = self.read()? {
            debug!("Using stored client id {}", stored.client_id);
            return Ok(stored.client_id);
        }
        let client_id = derive();
        self.save(&ClientRegistration::new(client_id.as_str()))?;
        info!("Derived new client id {}", client_id);
        Ok(client_id)
    }

    /// Parsed state file; `None` when missing or corrupt (quarantined)
    fn read(&self) -> Result<Option<ClientRegistration>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        match serde_json::from_str::<ClientRegistration>(&content) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                let aside = quarantine(&self.path)?;
                error!(
                    "Registration state {} is corrupt ({}), moved it to {}",
                    self.path.display(),
                    e,
                    aside.display()
                );
                Ok(None)
            }
        }
    }

    pub fn save(&self, registration: &ClientRegistration) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
        }
        let json = serde_json::to_vec_pretty(registration)?;
        write_atomic(&self.path, &json)
    }
}

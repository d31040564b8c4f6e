use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use kpxc_core::AssociationCredentials;

pub const DEFAULT_SERVICE: &str = "kpxc";

/// Association credentials kept in the OS keyring, one entry per database
/// hash, serialised as JSON.
pub struct CredentialStore {
    service: String,
}

impl CredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, db_hash: &str) -> Result<Entry> {
        Entry::new(&self.service, db_hash).map_err(|e| anyhow!("keyring init: {e}"))
    }

    pub fn load(&self, db_hash: &str) -> Result<Option<AssociationCredentials>> {
        match self.entry(db_hash)?.get_password() {
            Ok(json) => {
                let creds = serde_json::from_str(&json).context("decode stored association")?;
                Ok(Some(creds))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!("load association: {e}")),
        }
    }

    pub fn save(&self, db_hash: &str, creds: &AssociationCredentials) -> Result<()> {
        let json = serde_json::to_string(creds).context("encode association")?;
        self.entry(db_hash)?
            .set_password(&json)
            .map_err(|e| anyhow!("store association: {e}"))?;
        Ok(())
    }

    /// Returns false when nothing was stored.
    pub fn delete(&self, db_hash: &str) -> Result<bool> {
        match self.entry(db_hash)?.delete_password() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(anyhow!("delete association: {e}")),
        }
    }
}

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

const KEYRING_SERVICE: &str = "dev.forgepad.daemon";

/// Environment override for the backend bearer token.
pub const TOKEN_ENV: &str = "FORGEPAD_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretSlot {
    BackendToken,
}

impl SecretSlot {
    fn account(self) -> &'static str {
        match self {
            Self::BackendToken => "backend_token",
        }
    }
}

/// Store `value` (trimmed) in the OS keychain.
pub fn set_secret(slot: SecretSlot, value: &str) -> Result<()> {
    store_trimmed(&Keychain, slot, value)
}

pub fn get_secret(slot: SecretSlot) -> Result<Option<String>> {
    Keychain.load(slot)
}

/// Removing an absent secret succeeds.
pub fn delete_secret(slot: SecretSlot) -> Result<()> {
    Keychain.erase(slot)
}

/// Bearer credential for the project backend: `FORGEPAD_TOKEN` first, then
/// the OS keychain. `None` means persistence runs local-only.
pub fn resolve_backend_token() -> Option<String> {
    resolve_token_with(std::env::var(TOKEN_ENV).ok(), &Keychain)
}

fn resolve_token_with(env_value: Option<String>, store: &dyn SecretStore) -> Option<String> {
    if let Some(token) = env_value.filter(|value| !value.trim().is_empty()) {
        return Some(token.trim().to_string());
    }
    match store.load(SecretSlot::BackendToken) {
        Ok(token) => token.filter(|value| !value.trim().is_empty()),
        Err(error) => {
            debug!(error = %error, "keychain unavailable; continuing without backend token");
            None
        }
    }
}

/// Restrict a file to `0o600`. Missing paths are left alone.
pub fn ensure_owner_only_file(path: &Path) -> Result<()> {
    restrict_mode(path, 0o600)
}

/// Restrict a directory to `0o700`. Missing paths are left alone.
pub fn ensure_owner_only_dir(path: &Path) -> Result<()> {
    restrict_mode(path, 0o700)
}

#[cfg(unix)]
fn restrict_mode(path: &Path, wanted: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read metadata for `{}`", path.display()));
        }
    };
    if metadata.permissions().mode() & 0o777 != wanted {
        fs::set_permissions(path, fs::Permissions::from_mode(wanted))
            .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _wanted: u32) -> Result<()> {
    Ok(())
}

trait SecretStore: Send + Sync {
    fn save(&self, slot: SecretSlot, value: &str) -> Result<()>;
    fn load(&self, slot: SecretSlot) -> Result<Option<String>>;
    fn erase(&self, slot: SecretSlot) -> Result<()>;
}

fn store_trimmed(store: &dyn SecretStore, slot: SecretSlot, value: &str) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        bail!("`{}` must not be empty", slot.account());
    }
    store.save(slot, value)
}

struct Keychain;

impl Keychain {
    fn entry(slot: SecretSlot) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, slot.account())
            .with_context(|| format!("failed to open keychain entry `{}`", slot.account()))
    }
}

impl SecretStore for Keychain {
    fn save(&self, slot: SecretSlot, value: &str) -> Result<()> {
        Self::entry(slot)?
            .set_password(value)
            .with_context(|| format!("failed to persist `{}` in keychain", slot.account()))
    }

    fn load(&self, slot: SecretSlot) -> Result<Option<String>> {
        match Self::entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(error)
                .with_context(|| format!("failed to read `{}` from keychain", slot.account())),
        }
    }

    fn erase(&self, slot: SecretSlot) -> Result<()> {
        match Self::entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed to clear `{}` from keychain", slot.account())),
        }
    }
}

//! Process-wide runtime state and collaborator interfaces.
//!
//! Cached default credentials, the signal disposition and
//! library-global initialization live in one [`CoreRuntime`] value
//! created at program start and passed explicitly to every entry point;
//! nothing reaches into globals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::password::Password;
use crate::storage::StorageKind;

/// How many times a credential source may be asked before an
/// authentication error propagates.
pub const MAX_PASSWORD_REQUESTS: u32 = 3;

/// Upper bound for acquiring a per-host connection slot.
pub const ALLOCATE_SERVER_TIMEOUT_SECS: u64 = 3 * 60;

/// Message codes handed to the progress sink alongside free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    None,
    CreateImage,
    AddErrorCorrectionCodes,
    BlankVolume,
    WriteVolume,
    VerifyVolume,
    RequestVolume,
    LoadVolume,
    UnloadVolume,
}

/// Progress callback: `(bytes_done, volume_number, volume_done_pct,
/// code, text)`; returning `false` aborts the operation.
pub type ProgressSink =
    dyn Fn(u64, u32, f64, MessageCode, &str) -> bool + Send + Sync;

/// Result of a volume request interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeRequestResult {
    Ok,
    Unload,
    Abort,
    Fail,
}

/// Volume request callback: asked to provide volume `number`; `message`
/// explains why (e.g. a failed write being retried).
pub type VolumeRequestFn =
    dyn Fn(u32, Option<&str>) -> VolumeRequestResult + Send + Sync;

/// Fills a password given a prompt label; `None` means the user gave up.
pub type PasswordPromptFn = dyn Fn(&str) -> Option<Password> + Send + Sync;

/// Abort predicate, consulted on every transfer iteration and wait.
pub type AbortFn = dyn Fn() -> bool + Send + Sync;

/// Invoked once per successfully closed archive with its printable
/// name and total payload bytes; index keepers hook in here.
pub type CompletionSink = dyn Fn(&str, u64) + Send + Sync;

/// Per-host credentials and related configuration supplied by the
/// embedding application.
pub trait ConfigSource: Send + Sync {
    /// Login information configured for `host` under `kind`, if any.
    fn credentials(&self, kind: StorageKind, host: &str) -> Option<(String, Password)> {
        let _ = (kind, host);
        None
    }
}

/// A `ConfigSource` with nothing configured.
pub struct EmptyConfig;

impl ConfigSource for EmptyConfig {}

/// Process-wide state shared by all sessions.
pub struct CoreRuntime {
    config: Box<dyn ConfigSource>,
    /// Defaults learned from successful interactive logins, keyed by
    /// (kind, host).
    default_credentials: Mutex<HashMap<(StorageKind, String), (String, Password)>>,
    tmp_directory: PathBuf,
}

impl CoreRuntime {
    pub fn new(config: Box<dyn ConfigSource>) -> Self {
        install_signal_disposition();
        CoreRuntime {
            config,
            default_credentials: Mutex::new(HashMap::new()),
            tmp_directory: std::env::temp_dir(),
        }
    }

    pub fn with_tmp_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.tmp_directory = directory.into();
        self
    }

    pub fn tmp_directory(&self) -> &PathBuf {
        &self.tmp_directory
    }

    pub fn config(&self) -> &dyn ConfigSource {
        self.config.as_ref()
    }

    /// Cached default credentials for a host, if a previous interactive
    /// login succeeded.
    pub fn default_credentials(
        &self,
        kind: StorageKind,
        host: &str,
    ) -> Option<(String, Password)> {
        self.default_credentials
            .lock()
            .expect("credential cache lock")
            .get(&(kind, host.to_string()))
            .map(|(user, password)| (user.clone(), password.clone()))
    }

    /// Record credentials that just worked, so later sessions skip the
    /// prompt.
    pub fn remember_credentials(
        &self,
        kind: StorageKind,
        host: &str,
        user: &str,
        password: &Password,
    ) {
        self.default_credentials
            .lock()
            .expect("credential cache lock")
            .insert((kind, host.to_string()), (user.to_string(), password.clone()));
    }
}

impl Default for CoreRuntime {
    fn default() -> Self {
        CoreRuntime::new(Box::new(EmptyConfig))
    }
}

/// Some network libraries raise a timer signal internally; it must not
/// terminate the process.
fn install_signal_disposition() {
    #[cfg(unix)]
    // SAFETY: SIG_IGN is a valid disposition for SIGALRM.
    unsafe {
        libc::signal(libc::SIGALRM, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_cache_roundtrip() {
        let runtime = CoreRuntime::default();
        assert!(runtime.default_credentials(StorageKind::Ftp, "host").is_none());

        let password = Password::from_bytes(b"pw");
        runtime.remember_credentials(StorageKind::Ftp, "host", "bob", &password);
        let (user, cached) = runtime.default_credentials(StorageKind::Ftp, "host").unwrap();
        assert_eq!(user, "bob");
        assert!(cached.equals(&password));

        // Different kind or host: still empty.
        assert!(runtime.default_credentials(StorageKind::Sftp, "host").is_none());
        assert!(runtime.default_credentials(StorageKind::Ftp, "other").is_none());
    }
}

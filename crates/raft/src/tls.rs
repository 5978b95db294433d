//! Certificate provider for the secure transport.
//!
//! The provider owns the node's current TLS certificate/key pair and supports
//! hot-swapping so certificates can be rotated on a live cluster without a
//! restart. Restarting a voting member for a certificate change would risk a
//! quorum-availability dip; swapping in place does not.
//!
//! Reload discipline: the new pair is loaded and parsed fully in memory
//! first, and only on success is the served certificate replaced. The
//! critical section protects a pointer swap, never file I/O, so handshakes
//! are never blocked behind a reload. A failed reload keeps the last
//! known-good certificate serving.

use maat_common::{Error, Result};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Serves the current TLS certificate to the handshake layer.
///
/// `current()` never blocks on I/O and always returns the last successfully
/// loaded pair. Initialization failure is fatal (the transport cannot start);
/// later reload failures are reported and leave the previous certificate
/// serving.
pub struct CertificateProvider {
    cert_file: PathBuf,
    key_file: PathBuf,
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertificateProvider {
    /// Loads the initial certificate/key pair from the given PEM files.
    ///
    /// # Errors
    ///
    /// [`Error::CertificateLoad`] if either file is missing, unreadable, or
    /// does not parse. No valid certificate ever loaded means no transport.
    pub fn load(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let cert_file = cert_file.into();
        let key_file = key_file.into();
        let certified = load_certified_key(&cert_file, &key_file)?;

        Ok(Arc::new(Self {
            cert_file,
            key_file,
            current: RwLock::new(Arc::new(certified)),
        }))
    }

    /// Returns the currently served certificate.
    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current
            .read()
            .expect("certificate lock poisoned")
            .clone()
    }

    /// Reloads the certificate/key pair from disk.
    ///
    /// Parsing happens entirely before the swap; on failure the currently
    /// served certificate is unaffected and the error is returned for the
    /// caller to log.
    pub fn reload(&self) -> Result<()> {
        let certified = load_certified_key(&self.cert_file, &self.key_file)?;

        let mut current = self.current.write().expect("certificate lock poisoned");
        *current = Arc::new(certified);
        Ok(())
    }

    /// Path of the watched certificate file.
    pub fn cert_file(&self) -> &Path {
        &self.cert_file
    }

    /// Path of the watched key file.
    pub fn key_file(&self) -> &Path {
        &self.key_file
    }
}

impl std::fmt::Debug for CertificateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateProvider")
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

impl ResolvesServerCert for CertificateProvider {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        // Handshakes started after a swap see the new certificate;
        // connections already established keep the one they negotiated
        Some(self.current())
    }
}

/// Watches the certificate and key files and reloads the provider on writes.
///
/// The watch handle and the reload task live exactly as long as this value:
/// dropping it closes the event channel and ends the task. Reload failures
/// are logged, never fatal.
pub struct CertificateWatcher {
    // Dropping the watcher drops the event sender, which ends the task
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl CertificateWatcher {
    /// Starts watching the provider's certificate and key paths.
    ///
    /// # Errors
    ///
    /// [`Error::CertificateLoad`] if the watch cannot be established.
    pub fn spawn(provider: Arc<CertificateProvider>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                // Write events trigger a reload; renames and removals do not
                Ok(event)
                    if matches!(
                        event.kind,
                        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
                    ) =>
                {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "certificate watch error");
                }
            }
        })
        .map_err(|e| Error::CertificateLoad(format!("failed to start file watcher: {e}")))?;

        watcher
            .watch(provider.cert_file(), RecursiveMode::NonRecursive)
            .map_err(|e| Error::CertificateLoad(format!("failed to watch certificate: {e}")))?;
        watcher
            .watch(provider.key_file(), RecursiveMode::NonRecursive)
            .map_err(|e| Error::CertificateLoad(format!("failed to watch key: {e}")))?;

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                match provider.reload() {
                    Ok(()) => debug!(
                        cert = %provider.cert_file().display(),
                        "certificate reloaded"
                    ),
                    Err(error) => warn!(
                        %error,
                        "certificate reload failed; keeping previous certificate"
                    ),
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for CertificateWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Load certificates from a PEM file.
pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::CertificateLoad(format!("failed to open certificate file {path:?}: {e}"))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertificateLoad(format!("failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(Error::CertificateLoad(format!(
            "no certificates found in {path:?}"
        )));
    }

    Ok(certs)
}

/// Load a private key from a PEM file.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::CertificateLoad(format!("failed to open key file {path:?}: {e}")))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::CertificateLoad(format!("failed to parse key file: {e}")))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            None => break,
            _ => continue,
        }
    }

    Err(Error::CertificateLoad(format!(
        "no private key found in {path:?}"
    )))
}

fn load_certified_key(cert_file: &Path, key_file: &Path) -> Result<CertifiedKey> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| Error::CertificateLoad(format!("unsupported private key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

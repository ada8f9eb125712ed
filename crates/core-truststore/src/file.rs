//! File-backed certificate group.
//!
//! Canonical layout below a configurable root:
//!
//! ```text
//! <root>/<group>/
//!   trusted/certs/    trusted/crl/
//!   issuer/certs/     issuer/crl/
//!   rejected/certs/
//!   own/certs/        own/private/
//! ```
//!
//! File names are `<CN>[<sha1-thumbprint-hex>].der|.crl`. A watcher on the
//! group root records filesystem changes; every public call first drains
//! the pending change events and, when any are queued, re-reads all four
//! directories from disk before operating. Mutations write the resulting
//! lists back, emptying the target directory (regular files only) first.

use crate::{
    CertificateStore, MemoryCertStore, TrustList, TrustListMask, thumbprint,
};
use core_crypto::{load_certificate, load_crl};
use core_status::{UaError, UaResult};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, TryRecvError, channel};
use tracing::{debug, warn};

/// Certificate group backed by the canonical directory layout.
pub struct FileCertStore {
    memory: MemoryCertStore,
    trusted_certs: PathBuf,
    trusted_crls: PathBuf,
    issuer_certs: PathBuf,
    issuer_crls: PathBuf,
    rejected_certs: PathBuf,
    watch: Mutex<WatchState>,
}

struct WatchState {
    // Kept alive for the watcher thread; events arrive on the receiver.
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `CN` of a certificate or CRL issuer, sanitized for use in a file name.
fn display_name(blob: &[u8]) -> String {
    let raw = if let Ok(cert) = load_certificate(blob) {
        cert.subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok().map(|s| s.to_string()))
    } else if let Ok(crl) = load_crl(blob) {
        crl.issuer_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok().map(|s| s.to_string()))
    } else {
        None
    };
    let name = raw.unwrap_or_else(|| "unknown".to_string());
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

fn read_blobs(dir: &Path) -> UaResult<Vec<Vec<u8>>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|_| UaError::Internal)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    let mut out = Vec::with_capacity(entries.len());
    for path in entries {
        match fs::read(&path) {
            Ok(data) => out.push(data),
            Err(e) => {
                warn!(target: "truststore", path = %path.display(), error = %e,
                      "could not read list entry");
            }
        }
    }
    Ok(out)
}

/// Empty the directory (regular files only, subdirectories are kept) and
/// write every blob under the canonical name scheme.
fn write_blobs(dir: &Path, blobs: &[Vec<u8>], extension: &str) -> UaResult<()> {
    let entries = fs::read_dir(dir).map_err(|_| UaError::Internal)?;
    for entry in entries.filter_map(|e| e.ok()) {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let _ = fs::remove_file(entry.path());
        }
    }
    for blob in blobs {
        let name = format!("{}[{}]{}", display_name(blob), hex(&thumbprint(blob)), extension);
        if let Err(e) = fs::write(dir.join(&name), blob) {
            warn!(target: "truststore", file = name, error = %e, "could not write list entry");
            return Err(UaError::Internal);
        }
    }
    Ok(())
}

impl FileCertStore {
    /// Open (or create) the group `<group>` below `root`. `group` is
    /// `ApplCerts`, `HttpCerts`, `UserTokenCerts` or a printed NodeId for
    /// non-default groups. The on-disk lists are loaded immediately.
    pub fn new(root: &Path, group: &str) -> UaResult<FileCertStore> {
        let base = root.join(group);
        let trusted_certs = base.join("trusted").join("certs");
        let trusted_crls = base.join("trusted").join("crl");
        let issuer_certs = base.join("issuer").join("certs");
        let issuer_crls = base.join("issuer").join("crl");
        let rejected_certs = base.join("rejected").join("certs");
        let own_certs = base.join("own").join("certs");
        let own_private = base.join("own").join("private");
        for dir in [
            &trusted_certs,
            &trusted_crls,
            &issuer_certs,
            &issuer_crls,
            &rejected_certs,
            &own_certs,
            &own_private,
        ] {
            fs::create_dir_all(dir).map_err(|_| UaError::Internal)?;
        }

        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(tx).map_err(|e| {
            warn!(target: "truststore", error = %e, "could not create the store watcher");
            UaError::Internal
        })?;
        watcher
            .watch(&base, RecursiveMode::Recursive)
            .map_err(|_| UaError::Internal)?;

        let store = FileCertStore {
            memory: MemoryCertStore::new(),
            trusted_certs,
            trusted_crls,
            issuer_certs,
            issuer_crls,
            rejected_certs,
            watch: Mutex::new(WatchState {
                _watcher: watcher,
                events: rx,
            }),
        };
        store.reload_from_disk()?;
        // The initial load may have produced watcher noise of its own.
        store.drain_events();
        Ok(store)
    }

    fn drain_events(&self) -> bool {
        let watch = self.watch.lock().unwrap();
        let mut seen = false;
        loop {
            match watch.events.try_recv() {
                Ok(_) => seen = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        seen
    }

    fn reload_from_disk(&self) -> UaResult<()> {
        let list = TrustList {
            trusted_certificates: read_blobs(&self.trusted_certs)?,
            trusted_crls: read_blobs(&self.trusted_crls)?,
            issuer_certificates: read_blobs(&self.issuer_certs)?,
            issuer_crls: read_blobs(&self.issuer_crls)?,
        };
        self.memory.set_trust_list(TrustListMask::ALL, &list)
    }

    /// Pick up external changes before operating on the in-memory state.
    fn sync_pending_changes(&self) -> UaResult<()> {
        if self.drain_events() {
            debug!(target: "truststore", "store changed on disk, reloading");
            self.reload_from_disk()?;
        }
        Ok(())
    }

    /// Write the in-memory lists selected by `mask` back to disk.
    fn persist(&self, mask: TrustListMask) -> UaResult<()> {
        let list = self.memory.get_trust_list(TrustListMask::ALL)?;
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            write_blobs(&self.trusted_certs, &list.trusted_certificates, ".der")?;
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            write_blobs(&self.trusted_crls, &list.trusted_crls, ".crl")?;
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            write_blobs(&self.issuer_certs, &list.issuer_certificates, ".der")?;
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            write_blobs(&self.issuer_crls, &list.issuer_crls, ".crl")?;
        }
        // The write-back itself raises watcher events; absorb them so the
        // next call does not reload needlessly.
        self.drain_events();
        Ok(())
    }

    fn persist_rejected(&self) {
        if let Ok(rejected) = self.memory.get_rejected_list() {
            let _ = write_blobs(&self.rejected_certs, &rejected, ".der");
            self.drain_events();
        }
    }
}

impl CertificateStore for FileCertStore {
    fn get_trust_list(&self, mask: TrustListMask) -> UaResult<TrustList> {
        self.sync_pending_changes()?;
        self.memory.get_trust_list(mask)
    }

    fn set_trust_list(&self, mask: TrustListMask, list: &TrustList) -> UaResult<()> {
        self.sync_pending_changes()?;
        self.memory.set_trust_list(mask, list)?;
        self.persist(mask)
    }

    fn add_to_trust_list(&self, mask: TrustListMask, additions: &TrustList) -> UaResult<()> {
        self.sync_pending_changes()?;
        self.memory.add_to_trust_list(mask, additions)?;
        self.persist(mask)
    }

    fn remove_from_trust_list(&self, mask: TrustListMask, removals: &TrustList) -> UaResult<()> {
        self.sync_pending_changes()?;
        self.memory.remove_from_trust_list(mask, removals)?;
        // Removing certificates may also drop their CRLs.
        let crl_mask = mask
            | if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
                TrustListMask::TRUSTED_CRLS
            } else {
                TrustListMask::empty()
            }
            | if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
                TrustListMask::ISSUER_CRLS
            } else {
                TrustListMask::empty()
            };
        self.persist(crl_mask)
    }

    fn get_rejected_list(&self) -> UaResult<Vec<Vec<u8>>> {
        self.sync_pending_changes()?;
        self.memory.get_rejected_list()
    }

    fn get_certificate_crls(
        &self,
        certificate: &[u8],
        is_trusted: bool,
    ) -> UaResult<Vec<Vec<u8>>> {
        self.sync_pending_changes()?;
        self.memory.get_certificate_crls(certificate, is_trusted)
    }

    fn verify_certificate(&self, certificate: &[u8]) -> UaResult<()> {
        self.sync_pending_changes()?;
        let result = self.memory.verify_certificate(certificate);
        if result.is_err() {
            self.persist_rejected();
        }
        result
    }
}

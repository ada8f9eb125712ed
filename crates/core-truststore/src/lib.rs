//! Certificate groups: trust lists, revocation lists and verification.
//!
//! A group owns four independent lists (trusted and issuer certificates,
//! trusted and issuer CRLs) plus a bounded ring of rejected certificates.
//! Items are raw DER blobs identified by their SHA-1 thumbprint. Chain
//! verification draws issuers from the union of the trusted and issuer
//! lists and enforces CRL coverage: a CA link without an available CRL is a
//! `CertificateRevocationUnknown` failure, a listed serial is
//! `CertificateRevoked`. Every verification failure appends the offending
//! certificate to the rejected ring before it propagates.

mod file;

pub use file::FileCertStore;

use core_crypto::{certificate_thumbprint, load_certificate, load_crl};
use core_status::{UaError, UaResult};
use openssl::x509::{CrlStatus, X509, X509Crl};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, info};

bitflags::bitflags! {
    /// Selects the lists an operation touches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TrustListMask: u32 {
        const TRUSTED_CERTIFICATES = 1;
        const TRUSTED_CRLS = 2;
        const ISSUER_CERTIFICATES = 4;
        const ISSUER_CRLS = 8;
        const ALL = 15;
    }
}

/// The four lists of a certificate group, as raw DER blobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrustList {
    pub trusted_certificates: Vec<Vec<u8>>,
    pub trusted_crls: Vec<Vec<u8>>,
    pub issuer_certificates: Vec<Vec<u8>>,
    pub issuer_crls: Vec<Vec<u8>>,
}

impl TrustList {
    pub fn is_empty(&self) -> bool {
        self.trusted_certificates.is_empty()
            && self.trusted_crls.is_empty()
            && self.issuer_certificates.is_empty()
            && self.issuer_crls.is_empty()
    }
}

/// Common contract of the in-memory and file-backed groups.
pub trait CertificateStore: Send + Sync {
    /// Copy of the selected lists.
    fn get_trust_list(&self, mask: TrustListMask) -> UaResult<TrustList>;

    /// Atomically replace the selected lists.
    fn set_trust_list(&self, mask: TrustListMask, list: &TrustList) -> UaResult<()>;

    /// Merge into the selected lists, deduplicated by thumbprint.
    fn add_to_trust_list(&self, mask: TrustListMask, additions: &TrustList) -> UaResult<()>;

    /// Remove by thumbprint. Removing a CA certificate also removes the
    /// CRLs it issued.
    fn remove_from_trust_list(&self, mask: TrustListMask, removals: &TrustList) -> UaResult<()>;

    /// Rejected certificates, oldest first.
    fn get_rejected_list(&self) -> UaResult<Vec<Vec<u8>>>;

    /// The CRLs of the certificate's direct issuer, drawn from the trusted
    /// CRL list when `is_trusted`, from the issuer CRL list otherwise.
    fn get_certificate_crls(&self, certificate: &[u8], is_trusted: bool)
    -> UaResult<Vec<Vec<u8>>>;

    /// Chain verification with revocation checking.
    fn verify_certificate(&self, certificate: &[u8]) -> UaResult<()>;
}

/// Default capacity of the rejected ring.
pub const DEFAULT_REJECTED_CAP: usize = 100;

const MAX_CHAIN_DEPTH: usize = 16;

#[derive(Default)]
struct StoreState {
    list: TrustList,
    rejected: VecDeque<Vec<u8>>,
}

/// Purely in-memory certificate group.
pub struct MemoryCertStore {
    state: Mutex<StoreState>,
    rejected_cap: usize,
}

impl Default for MemoryCertStore {
    fn default() -> Self {
        Self::new()
    }
}

fn thumbprint(blob: &[u8]) -> Vec<u8> {
    certificate_thumbprint(blob).unwrap_or_default()
}

fn contains_by_thumbprint(list: &[Vec<u8>], blob: &[u8]) -> bool {
    let needle = thumbprint(blob);
    list.iter().any(|other| thumbprint(other) == needle)
}

fn subject_der(cert: &X509) -> Vec<u8> {
    cert.subject_name().to_der().unwrap_or_default()
}

fn issuer_der(cert: &X509) -> Vec<u8> {
    cert.issuer_name().to_der().unwrap_or_default()
}

fn crl_issuer_der(crl: &X509Crl) -> Vec<u8> {
    crl.issuer_name().to_der().unwrap_or_default()
}

/// Drop the CRLs issued by any of `removed_certs` from `crls`.
fn drop_crls_of(crls: &mut Vec<Vec<u8>>, removed_certs: &[X509]) {
    let issuers: Vec<Vec<u8>> = removed_certs.iter().map(subject_der).collect();
    crls.retain(|blob| match load_crl(blob) {
        Ok(crl) => !issuers.contains(&crl_issuer_der(&crl)),
        Err(_) => true,
    });
}

fn remove_by_thumbprint(list: &mut Vec<Vec<u8>>, removals: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let needles: Vec<Vec<u8>> = removals.iter().map(|b| thumbprint(b)).collect();
    let mut removed = Vec::new();
    list.retain(|blob| {
        if needles.contains(&thumbprint(blob)) {
            removed.push(blob.clone());
            false
        } else {
            true
        }
    });
    removed
}

fn time_valid(cert: &X509) -> bool {
    use std::cmp::Ordering;
    let now = match openssl::asn1::Asn1Time::days_from_now(0) {
        Ok(now) => now,
        Err(_) => return false,
    };
    let started = cert
        .not_before()
        .compare(&now)
        .map(|ord| ord != Ordering::Greater)
        .unwrap_or(false);
    let not_expired = cert
        .not_after()
        .compare(&now)
        .map(|ord| ord != Ordering::Less)
        .unwrap_or(false);
    started && not_expired
}

fn is_self_signed(cert: &X509) -> bool {
    if subject_der(cert) != issuer_der(cert) {
        return false;
    }
    match cert.public_key() {
        Ok(key) => cert.verify(&key).unwrap_or(false),
        Err(_) => false,
    }
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::with_rejected_cap(DEFAULT_REJECTED_CAP)
    }

    pub fn with_rejected_cap(rejected_cap: usize) -> Self {
        MemoryCertStore {
            state: Mutex::new(StoreState::default()),
            rejected_cap,
        }
    }

    fn reject(&self, certificate: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let needle = thumbprint(certificate);
        if state
            .rejected
            .iter()
            .any(|other| thumbprint(other) == needle)
        {
            return;
        }
        if state.rejected.len() >= self.rejected_cap {
            state.rejected.pop_front();
        }
        state.rejected.push_back(certificate.to_vec());
    }

    /// Walk from the certificate towards a trusted anchor.
    fn verify_chain(&self, certificate: &[u8]) -> UaResult<()> {
        let leaf = load_certificate(certificate)?;

        let (all_certs, trusted_thumbs, all_crls) = {
            let state = self.state.lock().unwrap();
            let mut certs: Vec<X509> = Vec::new();
            for blob in state
                .list
                .trusted_certificates
                .iter()
                .chain(state.list.issuer_certificates.iter())
            {
                if let Ok(cert) = load_certificate(blob) {
                    certs.push(cert);
                }
            }
            let thumbs: Vec<Vec<u8>> = state
                .list
                .trusted_certificates
                .iter()
                .map(|b| thumbprint(b))
                .collect();
            let mut crls: Vec<X509Crl> = Vec::new();
            for blob in state
                .list
                .trusted_crls
                .iter()
                .chain(state.list.issuer_crls.iter())
            {
                if let Ok(crl) = load_crl(blob) {
                    crls.push(crl);
                }
            }
            (certs, thumbs, crls)
        };

        let mut anchored = false;
        let mut current = leaf;
        for _ in 0..MAX_CHAIN_DEPTH {
            if !time_valid(&current) {
                return Err(UaError::CertificateInvalid);
            }
            let current_der = current.to_der().map_err(|_| UaError::CertificateInvalid)?;
            if trusted_thumbs.contains(&thumbprint(&current_der)) {
                anchored = true;
            }

            if is_self_signed(&current) {
                // Chain root reached.
                return if anchored {
                    Ok(())
                } else {
                    Err(UaError::CertificateUntrusted)
                };
            }

            // Locate the direct issuer in trusted ∪ issuer.
            let issuer_name = issuer_der(&current);
            let issuer = all_certs.iter().find(|candidate| {
                subject_der(candidate) == issuer_name
                    && candidate
                        .public_key()
                        .map(|key| current.verify(&key).unwrap_or(false))
                        .unwrap_or(false)
            });
            let Some(issuer) = issuer else {
                // A directly trusted certificate needs no parent in the
                // issuer list.
                return if anchored {
                    Ok(())
                } else {
                    Err(UaError::CertificateChainIncomplete)
                };
            };

            // Revocation of any link invalidates the chain; a missing CRL
            // leaves revocation undecided.
            let issuer_subject = subject_der(issuer);
            let mut crl_found = false;
            for crl in &all_crls {
                if crl_issuer_der(crl) != issuer_subject {
                    continue;
                }
                crl_found = true;
                if let CrlStatus::Revoked(_) = crl.get_by_serial(current.serial_number()) {
                    return Err(UaError::CertificateRevoked);
                }
            }
            if !crl_found {
                return Err(UaError::CertificateRevocationUnknown);
            }

            current = issuer.clone();
        }
        Err(UaError::CertificateChainIncomplete)
    }
}

impl CertificateStore for MemoryCertStore {
    fn get_trust_list(&self, mask: TrustListMask) -> UaResult<TrustList> {
        let state = self.state.lock().unwrap();
        let mut out = TrustList::default();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            out.trusted_certificates = state.list.trusted_certificates.clone();
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            out.trusted_crls = state.list.trusted_crls.clone();
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            out.issuer_certificates = state.list.issuer_certificates.clone();
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            out.issuer_crls = state.list.issuer_crls.clone();
        }
        Ok(out)
    }

    fn set_trust_list(&self, mask: TrustListMask, list: &TrustList) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            state.list.trusted_certificates = list.trusted_certificates.clone();
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            state.list.trusted_crls = list.trusted_crls.clone();
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            state.list.issuer_certificates = list.issuer_certificates.clone();
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            state.list.issuer_crls = list.issuer_crls.clone();
        }
        Ok(())
    }

    fn add_to_trust_list(&self, mask: TrustListMask, additions: &TrustList) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        let list = &mut state.list;
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            for blob in &additions.trusted_certificates {
                if !contains_by_thumbprint(&list.trusted_certificates, blob) {
                    list.trusted_certificates.push(blob.clone());
                }
            }
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            for blob in &additions.trusted_crls {
                if !contains_by_thumbprint(&list.trusted_crls, blob) {
                    list.trusted_crls.push(blob.clone());
                }
            }
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            for blob in &additions.issuer_certificates {
                if !contains_by_thumbprint(&list.issuer_certificates, blob) {
                    list.issuer_certificates.push(blob.clone());
                }
            }
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            for blob in &additions.issuer_crls {
                if !contains_by_thumbprint(&list.issuer_crls, blob) {
                    list.issuer_crls.push(blob.clone());
                }
            }
        }
        Ok(())
    }

    fn remove_from_trust_list(&self, mask: TrustListMask, removals: &TrustList) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        let list = &mut state.list;
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            let removed =
                remove_by_thumbprint(&mut list.trusted_certificates, &removals.trusted_certificates);
            let removed: Vec<X509> = removed
                .iter()
                .filter_map(|b| load_certificate(b).ok())
                .collect();
            drop_crls_of(&mut list.trusted_crls, &removed);
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            remove_by_thumbprint(&mut list.trusted_crls, &removals.trusted_crls);
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            let removed =
                remove_by_thumbprint(&mut list.issuer_certificates, &removals.issuer_certificates);
            let removed: Vec<X509> = removed
                .iter()
                .filter_map(|b| load_certificate(b).ok())
                .collect();
            drop_crls_of(&mut list.issuer_crls, &removed);
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            remove_by_thumbprint(&mut list.issuer_crls, &removals.issuer_crls);
        }
        Ok(())
    }

    fn get_rejected_list(&self) -> UaResult<Vec<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        Ok(state.rejected.iter().cloned().collect())
    }

    fn get_certificate_crls(
        &self,
        certificate: &[u8],
        is_trusted: bool,
    ) -> UaResult<Vec<Vec<u8>>> {
        let cert = load_certificate(certificate)?;
        let issuer_name = issuer_der(&cert);
        let state = self.state.lock().unwrap();
        let source = if is_trusted {
            &state.list.trusted_crls
        } else {
            &state.list.issuer_crls
        };
        let mut out = Vec::new();
        for blob in source {
            if let Ok(crl) = load_crl(blob) {
                if crl_issuer_der(&crl) == issuer_name {
                    out.push(blob.clone());
                }
            }
        }
        Ok(out)
    }

    fn verify_certificate(&self, certificate: &[u8]) -> UaResult<()> {
        match self.verify_chain(certificate) {
            Ok(()) => {
                debug!(target: "truststore", "certificate verified");
                Ok(())
            }
            Err(e) => {
                info!(target: "truststore", error = %e, "certificate verification failed");
                self.reject(certificate);
                Err(e)
            }
        }
    }
}

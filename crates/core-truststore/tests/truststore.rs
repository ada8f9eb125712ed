//! Trust-list bookkeeping and chain verification.
//!
//! The fixture PKI: `root_ca` (self-signed) signs `intermediate_ca`, which
//! signs `leaf`. Empty CRLs exist for both CAs plus one intermediate CRL
//! that revokes the leaf.

use core_crypto::certificate_thumbprint;
use core_status::UaError;
use core_truststore::{CertificateStore, MemoryCertStore, TrustList, TrustListMask};

const ROOT_CA: &[u8] = include_bytes!("fixtures/root_ca.der");
const INTERMEDIATE_CA: &[u8] = include_bytes!("fixtures/intermediate_ca.der");
const LEAF: &[u8] = include_bytes!("fixtures/leaf.der");
const ROOT_CRL: &[u8] = include_bytes!("fixtures/root_ca_empty.crl");
const INTERMEDIATE_CRL: &[u8] = include_bytes!("fixtures/intermediate_ca_empty.crl");
const INTERMEDIATE_CRL_REVOKED: &[u8] = include_bytes!("fixtures/intermediate_ca_revoked_leaf.crl");

fn ca_list() -> TrustList {
    TrustList {
        trusted_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        trusted_crls: vec![ROOT_CRL.to_vec(), INTERMEDIATE_CRL.to_vec()],
        ..Default::default()
    }
}

#[test]
fn add_and_remove_ca_certificates() {
    let store = MemoryCertStore::new();

    // Root and intermediate CA with their (empty) revocation lists.
    store
        .add_to_trust_list(TrustListMask::ALL, &ca_list())
        .unwrap();

    let list = store.get_trust_list(TrustListMask::ALL).unwrap();
    assert_eq!(list.trusted_certificates.len(), 2);
    assert_eq!(list.trusted_crls.len(), 2);
    assert_eq!(list.issuer_certificates.len(), 0);
    assert_eq!(list.issuer_crls.len(), 0);

    // Removing the certificates also removes the CRLs they issued.
    let removals = TrustList {
        trusted_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        ..Default::default()
    };
    store
        .remove_from_trust_list(TrustListMask::TRUSTED_CERTIFICATES, &removals)
        .unwrap();

    let list = store.get_trust_list(TrustListMask::ALL).unwrap();
    assert!(list.is_empty());
}

#[test]
fn add_deduplicates_by_thumbprint() {
    let store = MemoryCertStore::new();
    store
        .add_to_trust_list(TrustListMask::ALL, &ca_list())
        .unwrap();
    store
        .add_to_trust_list(TrustListMask::ALL, &ca_list())
        .unwrap();
    let list = store.get_trust_list(TrustListMask::ALL).unwrap();
    assert_eq!(list.trusted_certificates.len(), 2);
    assert_eq!(list.trusted_crls.len(), 2);
}

#[test]
fn set_get_round_trip() {
    let store = MemoryCertStore::new();
    let mut list = ca_list();
    list.issuer_certificates = vec![ROOT_CA.to_vec()];
    list.issuer_crls = vec![ROOT_CRL.to_vec()];
    store.set_trust_list(TrustListMask::ALL, &list).unwrap();

    let read = store.get_trust_list(TrustListMask::ALL).unwrap();
    assert_eq!(read, list);

    // Masked replacement only touches the chosen lists.
    store
        .set_trust_list(TrustListMask::ISSUER_CERTIFICATES, &TrustList::default())
        .unwrap();
    let read = store.get_trust_list(TrustListMask::ALL).unwrap();
    assert!(read.issuer_certificates.is_empty());
    assert_eq!(read.trusted_certificates.len(), 2);
}

#[test]
fn certificate_crls_follow_the_direct_issuer() {
    let store = MemoryCertStore::new();
    store
        .add_to_trust_list(TrustListMask::ALL, &ca_list())
        .unwrap();

    // The leaf's direct issuer is the intermediate CA.
    let crls = store.get_certificate_crls(LEAF, true).unwrap();
    assert_eq!(crls.len(), 1);
    assert_eq!(
        certificate_thumbprint(&crls[0]).unwrap(),
        certificate_thumbprint(INTERMEDIATE_CRL).unwrap()
    );

    // The issuer-list side is empty here.
    let crls = store.get_certificate_crls(LEAF, false).unwrap();
    assert!(crls.is_empty());
}

#[test]
fn verify_full_chain() {
    let store = MemoryCertStore::new();
    store
        .add_to_trust_list(TrustListMask::ALL, &ca_list())
        .unwrap();
    store.verify_certificate(LEAF).unwrap();
    assert!(store.get_rejected_list().unwrap().is_empty());
}

#[test]
fn verify_with_issuer_list_anchoring_on_trusted_intermediate() {
    // The intermediate is trusted directly; the root is only an issuer.
    let store = MemoryCertStore::new();
    let list = TrustList {
        trusted_certificates: vec![INTERMEDIATE_CA.to_vec()],
        trusted_crls: vec![INTERMEDIATE_CRL.to_vec()],
        issuer_certificates: vec![],
        issuer_crls: vec![],
    };
    store.add_to_trust_list(TrustListMask::ALL, &list).unwrap();
    store.verify_certificate(LEAF).unwrap();
}

#[test]
fn missing_crl_is_revocation_unknown() {
    let store = MemoryCertStore::new();
    let list = TrustList {
        trusted_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        ..Default::default()
    };
    store.add_to_trust_list(TrustListMask::ALL, &list).unwrap();

    assert_eq!(
        store.verify_certificate(LEAF),
        Err(UaError::CertificateRevocationUnknown)
    );
    // The failure pushed the certificate onto the rejected ring.
    let rejected = store.get_rejected_list().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(
        certificate_thumbprint(&rejected[0]).unwrap(),
        certificate_thumbprint(LEAF).unwrap()
    );
}

#[test]
fn revoked_leaf_is_rejected() {
    let store = MemoryCertStore::new();
    let list = TrustList {
        trusted_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        trusted_crls: vec![ROOT_CRL.to_vec(), INTERMEDIATE_CRL_REVOKED.to_vec()],
        ..Default::default()
    };
    store.add_to_trust_list(TrustListMask::ALL, &list).unwrap();

    assert_eq!(
        store.verify_certificate(LEAF),
        Err(UaError::CertificateRevoked)
    );
    assert_eq!(store.get_rejected_list().unwrap().len(), 1);
}

#[test]
fn unknown_chain_is_incomplete() {
    let store = MemoryCertStore::new();
    // Empty store: the leaf has no located issuer at all.
    assert_eq!(
        store.verify_certificate(LEAF),
        Err(UaError::CertificateChainIncomplete)
    );
}

#[test]
fn untrusted_self_signed_root() {
    let store = MemoryCertStore::new();
    // The chain builds up to the self-signed root, but nothing anchors it.
    let list = TrustList {
        issuer_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        issuer_crls: vec![ROOT_CRL.to_vec(), INTERMEDIATE_CRL.to_vec()],
        ..Default::default()
    };
    store.add_to_trust_list(TrustListMask::ALL, &list).unwrap();

    assert_eq!(
        store.verify_certificate(LEAF),
        Err(UaError::CertificateUntrusted)
    );
}

#[test]
fn garbage_certificate_is_invalid() {
    let store = MemoryCertStore::new();
    assert_eq!(
        store.verify_certificate(b"not a certificate"),
        Err(UaError::CertificateInvalid)
    );
}

#[test]
fn rejected_ring_evicts_oldest_at_cap() {
    let store = MemoryCertStore::with_rejected_cap(2);
    // Three distinct rejected certificates.
    assert!(store.verify_certificate(LEAF).is_err());
    assert!(store.verify_certificate(INTERMEDIATE_CA).is_err());
    assert!(store.verify_certificate(ROOT_CA).is_err());

    let rejected = store.get_rejected_list().unwrap();
    assert_eq!(rejected.len(), 2);
    // Oldest (the leaf) evicted; insertion order kept.
    assert_eq!(
        certificate_thumbprint(&rejected[0]).unwrap(),
        certificate_thumbprint(INTERMEDIATE_CA).unwrap()
    );
    assert_eq!(
        certificate_thumbprint(&rejected[1]).unwrap(),
        certificate_thumbprint(ROOT_CA).unwrap()
    );
}

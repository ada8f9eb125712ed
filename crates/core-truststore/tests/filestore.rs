//! On-disk layout, persistence and change-driven reload of the file store.

use core_crypto::certificate_thumbprint;
use core_truststore::{CertificateStore, FileCertStore, TrustList, TrustListMask};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

const ROOT_CA: &[u8] = include_bytes!("fixtures/root_ca.der");
const INTERMEDIATE_CA: &[u8] = include_bytes!("fixtures/intermediate_ca.der");
const LEAF: &[u8] = include_bytes!("fixtures/leaf.der");
const ROOT_CRL: &[u8] = include_bytes!("fixtures/root_ca_empty.crl");
const INTERMEDIATE_CRL: &[u8] = include_bytes!("fixtures/intermediate_ca_empty.crl");

fn thumbs(blobs: &[Vec<u8>]) -> BTreeSet<Vec<u8>> {
    blobs
        .iter()
        .map(|b| certificate_thumbprint(b).unwrap())
        .collect()
}

fn ca_list() -> TrustList {
    TrustList {
        trusted_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        trusted_crls: vec![ROOT_CRL.to_vec(), INTERMEDIATE_CRL.to_vec()],
        ..Default::default()
    }
}

#[test]
fn creates_canonical_layout() {
    let dir = tempfile::tempdir().unwrap();
    let _store = FileCertStore::new(dir.path(), "ApplCerts").unwrap();
    for sub in [
        "trusted/certs",
        "trusted/crl",
        "issuer/certs",
        "issuer/crl",
        "rejected/certs",
        "own/certs",
        "own/private",
    ] {
        assert!(dir.path().join("ApplCerts").join(sub).is_dir(), "{sub}");
    }
}

#[test]
fn set_persists_and_survives_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileCertStore::new(dir.path(), "ApplCerts").unwrap();
        store.set_trust_list(TrustListMask::ALL, &ca_list()).unwrap();
    }

    // The in-memory state is gone; a fresh store reads the files back.
    let store = FileCertStore::new(dir.path(), "ApplCerts").unwrap();
    let list = store.get_trust_list(TrustListMask::ALL).unwrap();
    assert_eq!(
        thumbs(&list.trusted_certificates),
        thumbs(&ca_list().trusted_certificates)
    );
    assert_eq!(thumbs(&list.trusted_crls), thumbs(&ca_list().trusted_crls));
    assert!(list.issuer_certificates.is_empty());

    // File names follow `<CN>[<thumbprint>].der`.
    let cert_dir = dir.path().join("ApplCerts/trusted/certs");
    let names: Vec<String> = std::fs::read_dir(&cert_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 2);
    let root_hex: String = certificate_thumbprint(ROOT_CA)
        .unwrap()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    assert!(
        names
            .iter()
            .any(|n| n.contains("Demo Root CA") && n.contains(&root_hex) && n.ends_with(".der")),
        "{names:?}"
    );
}

#[test]
fn remove_updates_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCertStore::new(dir.path(), "ApplCerts").unwrap();
    store.set_trust_list(TrustListMask::ALL, &ca_list()).unwrap();

    let removals = TrustList {
        trusted_certificates: vec![ROOT_CA.to_vec(), INTERMEDIATE_CA.to_vec()],
        ..Default::default()
    };
    store
        .remove_from_trust_list(TrustListMask::TRUSTED_CERTIFICATES, &removals)
        .unwrap();

    assert!(store.get_trust_list(TrustListMask::ALL).unwrap().is_empty());
    let count = |sub: &str| {
        std::fs::read_dir(dir.path().join("ApplCerts").join(sub))
            .unwrap()
            .count()
    };
    assert_eq!(count("trusted/certs"), 0);
    // The CRLs of the removed CAs are gone from disk as well.
    assert_eq!(count("trusted/crl"), 0);
}

#[test]
fn external_change_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCertStore::new(dir.path(), "ApplCerts").unwrap();
    assert!(store.get_trust_list(TrustListMask::ALL).unwrap().is_empty());

    // Another process drops a certificate into the trusted folder.
    std::fs::write(
        dir.path().join("ApplCerts/trusted/certs/external.der"),
        LEAF,
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let list = store.get_trust_list(TrustListMask::ALL).unwrap();
        if list.trusted_certificates.len() == 1 {
            assert_eq!(
                certificate_thumbprint(&list.trusted_certificates[0]).unwrap(),
                certificate_thumbprint(LEAF).unwrap()
            );
            break;
        }
        assert!(
            Instant::now() < deadline,
            "external change was never observed"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn verification_failure_is_persisted_in_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCertStore::new(dir.path(), "ApplCerts").unwrap();
    assert!(store.verify_certificate(LEAF).is_err());

    let rejected_dir = dir.path().join("ApplCerts/rejected/certs");
    let count = std::fs::read_dir(&rejected_dir).unwrap().count();
    assert_eq!(count, 1);
}

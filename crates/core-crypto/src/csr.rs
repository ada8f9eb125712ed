//! PKCS#10 signing-request generation.

use crate::{generate_matching_key, primitives};
use core_status::{UaError, UaResult};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::KeyUsage;
use openssl::x509::{GeneralNameRef, X509, X509Extension, X509NameBuilder, X509ReqBuilder};
use std::sync::Mutex;
use tracing::debug;

/// Build the request: key usage and (when the current certificate carries
/// one) the subject-alternative-name extension are copied over, the subject
/// comes from the caller or from the current certificate, and the request
/// is signed with either the current or a freshly generated key.
pub(crate) fn create_signing_request(
    certificate: &X509,
    private_key: &PKey<Private>,
    pending_key: &Mutex<Option<PKey<Private>>>,
    subject: Option<&str>,
    nonce: &[u8],
    regenerate_key: bool,
) -> UaResult<(Vec<u8>, Option<Vec<u8>>)> {
    // The nonce parameter exists for call compatibility; the process RNG is
    // already seeded by the library.
    let _ = nonce;

    let mut builder = X509ReqBuilder::new().map_err(|_| UaError::Internal)?;
    builder.set_version(0).map_err(|_| UaError::Internal)?;

    let mut extensions = Stack::new().map_err(|_| UaError::OutOfMemory)?;
    let key_usage = KeyUsage::new()
        .digital_signature()
        .non_repudiation()
        .key_encipherment()
        .data_encipherment()
        .build()
        .map_err(|_| UaError::Internal)?;
    extensions.push(key_usage).map_err(|_| UaError::Internal)?;

    if let Some(san) = subject_alt_name_of(certificate) {
        match san_extension(&san) {
            Ok(ext) => {
                extensions.push(ext).map_err(|_| UaError::Internal)?;
            }
            Err(_) => {
                debug!(target: "crypto", "could not copy the subject alternative name");
            }
        }
    }
    builder
        .add_extensions(&extensions)
        .map_err(|_| UaError::Internal)?;

    match subject {
        Some(subject) => {
            let name = parse_subject(subject)?;
            builder
                .set_subject_name(&name)
                .map_err(|_| UaError::Internal)?;
        }
        None => {
            builder
                .set_subject_name(certificate.subject_name())
                .map_err(|_| UaError::Internal)?;
        }
    }

    let new_key_der;
    if regenerate_key {
        let fresh = generate_matching_key(private_key)?;
        let der = fresh
            .private_key_to_der()
            .map_err(|_| UaError::Internal)?;
        builder
            .set_pubkey(&fresh)
            .map_err(|_| UaError::Internal)?;
        builder
            .sign(&fresh, MessageDigest::sha256())
            .map_err(|_| UaError::Internal)?;
        *pending_key.lock().unwrap() = Some(fresh);
        new_key_der = Some(der);
    } else {
        let public = certificate
            .public_key()
            .map_err(|_| UaError::CertificateInvalid)?;
        builder
            .set_pubkey(&public)
            .map_err(|_| UaError::Internal)?;
        builder
            .sign(private_key, MessageDigest::sha256())
            .map_err(|_| UaError::Internal)?;
        new_key_der = None;
    }

    let csr = builder
        .build()
        .to_der()
        .map_err(|_| UaError::Internal)?;
    Ok((csr, new_key_der))
}

/// "CN=...,O=..." (comma or slash separated) into an X509 name.
fn parse_subject(subject: &str) -> UaResult<openssl::x509::X509Name> {
    let mut builder = X509NameBuilder::new().map_err(|_| UaError::Internal)?;
    for part in subject.split([',', '/']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((field, value)) = part.split_once('=') else {
            return Err(UaError::InvalidArgument);
        };
        builder
            .append_entry_by_text(field.trim(), value.trim())
            .map_err(|_| UaError::InvalidArgument)?;
    }
    Ok(builder.build())
}

/// Textual form of the certificate's SAN entries, or None when absent.
fn subject_alt_name_of(certificate: &X509) -> Option<String> {
    let names = certificate.subject_alt_names()?;
    let mut parts = Vec::new();
    for name in &names {
        if let Some(entry) = format_general_name(name) {
            parts.push(entry);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

fn format_general_name(name: &GeneralNameRef) -> Option<String> {
    if let Some(dns) = name.dnsname() {
        return Some(format!("DNS:{dns}"));
    }
    if let Some(uri) = name.uri() {
        return Some(format!("URI:{uri}"));
    }
    if let Some(email) = name.email() {
        return Some(format!("email:{email}"));
    }
    if let Some(ip) = name.ipaddress() {
        let formatted = match ip.len() {
            4 => std::net::Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]).to_string(),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                std::net::Ipv6Addr::from(octets).to_string()
            }
            _ => return None,
        };
        return Some(format!("IP:{formatted}"));
    }
    None
}

#[allow(deprecated)]
fn san_extension(value: &str) -> Result<X509Extension, openssl::error::ErrorStack> {
    X509Extension::new_nid(
        None,
        None,
        openssl::nid::Nid::SUBJECT_ALT_NAME,
        value,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_parsing() {
        let name = parse_subject("CN=server.example, O=Example Org").unwrap();
        let der = name.to_der();
        assert!(der.is_ok());
        assert!(parse_subject("no-equals-sign").is_err());
    }
}

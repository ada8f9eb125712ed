//! Low-level OpenSSL helpers shared by all policies.

use core_status::{UaError, UaResult};
use openssl::bn::BigNumContext;
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::hash::{MessageDigest, hash};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private, Public};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::symm::{Cipher, Crypter, Mode};
use openssl::x509::{X509, X509Crl};
use tracing::debug;

/// SHA-1 over the DER form of a certificate.
pub fn certificate_thumbprint(der: &[u8]) -> UaResult<Vec<u8>> {
    let digest = hash(MessageDigest::sha1(), der).map_err(|_| UaError::CertificateInvalid)?;
    Ok(digest.to_vec())
}

/// Load a certificate, DER preferred, PEM accepted.
pub fn load_certificate(data: &[u8]) -> UaResult<X509> {
    X509::from_der(data)
        .or_else(|_| X509::from_pem(data))
        .map_err(|e| {
            debug!(target: "crypto", error = %e, "could not parse the certificate");
            UaError::CertificateInvalid
        })
}

/// Load a CRL, DER preferred, PEM accepted.
pub fn load_crl(data: &[u8]) -> UaResult<X509Crl> {
    X509Crl::from_der(data)
        .or_else(|_| X509Crl::from_pem(data))
        .map_err(|e| {
            debug!(target: "crypto", error = %e, "could not parse the revocation list");
            UaError::CertificateInvalid
        })
}

/// Load a private key: PKCS#8 or key-type DER first, PEM as fallback.
pub fn load_private_key(data: &[u8]) -> UaResult<PKey<Private>> {
    if let Ok(key) = PKey::private_key_from_der(data) {
        return Ok(key);
    }
    if let Ok(rsa) = Rsa::private_key_from_der(data) {
        if let Ok(key) = PKey::from_rsa(rsa) {
            return Ok(key);
        }
    }
    if let Ok(ec) = EcKey::private_key_from_der(data) {
        if let Ok(key) = PKey::from_ec_key(ec) {
            return Ok(key);
        }
    }
    PKey::private_key_from_pem(data).map_err(|e| {
        debug!(target: "crypto", error = %e, "could not parse the private key");
        UaError::CertificateInvalid
    })
}

// ---------------------------------------------------------------------
// Symmetric primitives
// ---------------------------------------------------------------------

/// HMAC over `data`.
pub fn hmac_sign(digest: MessageDigest, key: &[u8], data: &[u8]) -> UaResult<Vec<u8>> {
    let key = PKey::hmac(key).map_err(|_| UaError::Internal)?;
    let mut signer = Signer::new(digest, &key).map_err(|_| UaError::Internal)?;
    signer.update(data).map_err(|_| UaError::Internal)?;
    signer.sign_to_vec().map_err(|_| UaError::Internal)
}

pub fn hmac_verify(
    digest: MessageDigest,
    key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> UaResult<()> {
    let expected = hmac_sign(digest, key, data)?;
    if expected.len() == signature.len() && openssl::memcmp::eq(&expected, signature) {
        Ok(())
    } else {
        Err(UaError::CertificateInvalid)
    }
}

/// Block cipher without padding; `data` must be block-aligned.
pub fn cbc_apply(
    cipher: Cipher,
    mode: Mode,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> UaResult<Vec<u8>> {
    if data.len() % cipher.block_size() != 0 {
        return Err(UaError::InvalidArgument);
    }
    let mut crypter = Crypter::new(cipher, mode, key, Some(iv)).map_err(|_| UaError::Internal)?;
    crypter.pad(false);
    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut out).map_err(|_| UaError::Internal)?;
    written += crypter
        .finalize(&mut out[written..])
        .map_err(|_| UaError::Internal)?;
    out.truncate(written);
    Ok(out)
}

/// TLS-style pseudo-random expansion: `A(0) = seed`,
/// `A(i) = HMAC(secret, A(i-1))`, output blocks `HMAC(secret, A(i) || seed)`.
pub fn p_hash(
    digest: MessageDigest,
    secret: &[u8],
    seed: &[u8],
    out_len: usize,
) -> UaResult<Vec<u8>> {
    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac_sign(digest, secret, seed)?;
    while out.len() < out_len {
        let mut block_input = a.clone();
        block_input.extend_from_slice(seed);
        let block = hmac_sign(digest, secret, &block_input)?;
        out.extend_from_slice(&block);
        a = hmac_sign(digest, secret, &a)?;
    }
    out.truncate(out_len);
    Ok(out)
}

// ---------------------------------------------------------------------
// Elliptic-curve key agreement
// ---------------------------------------------------------------------

/// Fresh ephemeral keypair on the policy curve.
pub fn generate_ephemeral_key(curve: Nid) -> UaResult<PKey<Private>> {
    let group = EcGroup::from_curve_name(curve).map_err(|_| UaError::Internal)?;
    let key = EcKey::generate(&group).map_err(|_| UaError::Internal)?;
    PKey::from_ec_key(key).map_err(|_| UaError::Internal)
}

/// Uncompressed point coordinates `x || y` of the public half (the OPC UA
/// wire form of an ECC nonce: the leading 0x04 tag byte is stripped).
pub fn ephemeral_public_bytes(key: &PKey<Private>) -> UaResult<Vec<u8>> {
    let ec = key.ec_key().map_err(|_| UaError::Internal)?;
    let mut ctx = BigNumContext::new().map_err(|_| UaError::Internal)?;
    let encoded = ec
        .public_key()
        .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
        .map_err(|_| UaError::Internal)?;
    Ok(encoded[1..].to_vec())
}

/// Rebuild a peer public key from wire coordinates `x || y`.
pub fn public_key_from_coordinates(curve: Nid, data: &[u8]) -> UaResult<PKey<Public>> {
    let group = EcGroup::from_curve_name(curve).map_err(|_| UaError::Internal)?;
    if data.len() % 2 != 0 {
        return Err(UaError::InvalidArgument);
    }
    let half = data.len() / 2;
    let x = openssl::bn::BigNum::from_slice(&data[..half]).map_err(|_| UaError::Internal)?;
    let y = openssl::bn::BigNum::from_slice(&data[half..]).map_err(|_| UaError::Internal)?;
    let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y)
        .map_err(|_| UaError::InvalidArgument)?;
    PKey::from_ec_key(ec).map_err(|_| UaError::Internal)
}

/// ECDH shared secret between the local ephemeral key and a peer key.
pub fn ecdh_shared_secret(local: &PKey<Private>, peer: &PKey<Public>) -> UaResult<Vec<u8>> {
    let mut deriver = Deriver::new(local).map_err(|_| UaError::Internal)?;
    deriver.set_peer(peer).map_err(|_| UaError::Internal)?;
    deriver.derive_to_vec().map_err(|_| UaError::Internal)
}

/// HKDF expansion; the OPC UA ECC profiles pass the salt as info as well.
pub fn hkdf(
    digest: &'static openssl::md::MdRef,
    secret: &[u8],
    salt: &[u8],
    info: &[u8],
    out_len: usize,
) -> UaResult<Vec<u8>> {
    let mut ctx = PkeyCtx::new_id(Id::HKDF).map_err(|_| UaError::Internal)?;
    ctx.derive_init().map_err(|_| UaError::Internal)?;
    ctx.set_hkdf_md(digest).map_err(|_| UaError::Internal)?;
    ctx.set_hkdf_key(secret).map_err(|_| UaError::Internal)?;
    ctx.set_hkdf_salt(salt).map_err(|_| UaError::Internal)?;
    ctx.add_hkdf_info(info).map_err(|_| UaError::Internal)?;
    let mut out = vec![0u8; out_len];
    ctx.derive(Some(&mut out)).map_err(|_| UaError::Internal)?;
    Ok(out)
}

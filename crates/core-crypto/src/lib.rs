//! SecureChannel cryptography.
//!
//! A security policy couples the certificate and private key of the local
//! application with the algorithm suite identified by a policy URI. All six
//! suites share one scheme-driven implementation: the per-policy differences
//! (padding, digests, key and nonce lengths, derivation function) live in
//! the [`PolicyKind`] tables, the mechanics live here.
//!
//! Per remote endpoint the stack creates a [`ChannelContext`] carrying the
//! remote certificate and the per-direction symmetric key material; the
//! setter entry points allow key rotation on token renewal.

mod csr;
mod primitives;

pub use primitives::{certificate_thumbprint, load_certificate, load_crl, load_private_key};

use core_status::{UaError, UaResult};
use openssl::ec::EcKey;
use openssl::ecdsa::EcdsaSig;
use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::{MessageDigest, hash};
use openssl::md::Md;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};
use openssl::symm::{Cipher, Mode};
use openssl::x509::X509;
use std::sync::Mutex;
use tracing::{info, warn};

/// Role of the local application; selects the HKDF label of the ECC
/// profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationRole {
    Server,
    Client,
}

impl ApplicationRole {
    fn label(self) -> &'static [u8] {
        match self {
            ApplicationRole::Server => b"opcua-server",
            ApplicationRole::Client => b"opcua-client",
        }
    }

    fn opposite_label(self) -> &'static [u8] {
        match self {
            ApplicationRole::Server => ApplicationRole::Client.label(),
            ApplicationRole::Client => ApplicationRole::Server.label(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymDigest {
    Sha1,
    Sha256,
    Sha384,
}

impl SymDigest {
    fn message_digest(self) -> MessageDigest {
        match self {
            SymDigest::Sha1 => MessageDigest::sha1(),
            SymDigest::Sha256 => MessageDigest::sha256(),
            SymDigest::Sha384 => MessageDigest::sha384(),
        }
    }

    fn md(self) -> &'static openssl::md::MdRef {
        match self {
            SymDigest::Sha1 => Md::sha1(),
            SymDigest::Sha256 => Md::sha256(),
            SymDigest::Sha384 => Md::sha384(),
        }
    }

    fn size(self) -> usize {
        match self {
            SymDigest::Sha1 => 20,
            SymDigest::Sha256 => 32,
            SymDigest::Sha384 => 48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsymSignature {
    RsaPkcs1Sha1,
    RsaPkcs1Sha256,
    RsaPssSha256,
    EcdsaSha256,
    EcdsaSha384,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsymEncryption {
    RsaPkcs1,
    RsaOaepSha1,
    RsaOaepSha256,
    /// The ECC profiles have no asymmetric encryption.
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyDerivation {
    PSha1,
    PSha256,
    Hkdf { curve: Nid, digest: SymDigest },
}

/// Supported policy URIs and their algorithm suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes256Sha256RsaPss,
    EccNistP256,
    EccNistP384,
}

pub const SUPPORTED_POLICY_URIS: [&str; 6] = [
    "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
    "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
    "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
    "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss",
    "http://opcfoundation.org/UA/SecurityPolicy#ECC_nistP256",
    "http://opcfoundation.org/UA/SecurityPolicy#ECC_nistP384",
];

impl PolicyKind {
    pub fn from_uri(uri: &str) -> Option<PolicyKind> {
        match uri {
            u if u == SUPPORTED_POLICY_URIS[0] => Some(PolicyKind::Basic128Rsa15),
            u if u == SUPPORTED_POLICY_URIS[1] => Some(PolicyKind::Basic256),
            u if u == SUPPORTED_POLICY_URIS[2] => Some(PolicyKind::Basic256Sha256),
            u if u == SUPPORTED_POLICY_URIS[3] => Some(PolicyKind::Aes256Sha256RsaPss),
            u if u == SUPPORTED_POLICY_URIS[4] => Some(PolicyKind::EccNistP256),
            u if u == SUPPORTED_POLICY_URIS[5] => Some(PolicyKind::EccNistP384),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            PolicyKind::Basic128Rsa15 => SUPPORTED_POLICY_URIS[0],
            PolicyKind::Basic256 => SUPPORTED_POLICY_URIS[1],
            PolicyKind::Basic256Sha256 => SUPPORTED_POLICY_URIS[2],
            PolicyKind::Aes256Sha256RsaPss => SUPPORTED_POLICY_URIS[3],
            PolicyKind::EccNistP256 => SUPPORTED_POLICY_URIS[4],
            PolicyKind::EccNistP384 => SUPPORTED_POLICY_URIS[5],
        }
    }

    fn asym_signature(self) -> AsymSignature {
        match self {
            PolicyKind::Basic128Rsa15 | PolicyKind::Basic256 => AsymSignature::RsaPkcs1Sha1,
            PolicyKind::Basic256Sha256 => AsymSignature::RsaPkcs1Sha256,
            PolicyKind::Aes256Sha256RsaPss => AsymSignature::RsaPssSha256,
            PolicyKind::EccNistP256 => AsymSignature::EcdsaSha256,
            PolicyKind::EccNistP384 => AsymSignature::EcdsaSha384,
        }
    }

    fn asym_encryption(self) -> AsymEncryption {
        match self {
            PolicyKind::Basic128Rsa15 => AsymEncryption::RsaPkcs1,
            PolicyKind::Basic256 | PolicyKind::Basic256Sha256 => AsymEncryption::RsaOaepSha1,
            PolicyKind::Aes256Sha256RsaPss => AsymEncryption::RsaOaepSha256,
            PolicyKind::EccNistP256 | PolicyKind::EccNistP384 => AsymEncryption::Identity,
        }
    }

    fn sym_cipher(self) -> Cipher {
        match self {
            PolicyKind::Basic128Rsa15 | PolicyKind::EccNistP256 => Cipher::aes_128_cbc(),
            _ => Cipher::aes_256_cbc(),
        }
    }

    fn sym_digest(self) -> SymDigest {
        match self {
            PolicyKind::Basic128Rsa15 | PolicyKind::Basic256 => SymDigest::Sha1,
            PolicyKind::Basic256Sha256
            | PolicyKind::Aes256Sha256RsaPss
            | PolicyKind::EccNistP256 => SymDigest::Sha256,
            PolicyKind::EccNistP384 => SymDigest::Sha384,
        }
    }

    /// Length of the derived signing key.
    pub fn sym_signing_key_length(self) -> usize {
        match self {
            PolicyKind::Basic128Rsa15 => 16,
            PolicyKind::Basic256 => 24,
            PolicyKind::Basic256Sha256 | PolicyKind::Aes256Sha256RsaPss => 32,
            PolicyKind::EccNistP256 => 32,
            PolicyKind::EccNistP384 => 48,
        }
    }

    /// Length of the derived encryption key.
    pub fn sym_encryption_key_length(self) -> usize {
        self.sym_cipher().key_len()
    }

    pub fn sym_block_size(self) -> usize {
        self.sym_cipher().block_size()
    }

    pub fn nonce_length(self) -> usize {
        match self {
            PolicyKind::Basic128Rsa15 => 16,
            PolicyKind::Basic256 | PolicyKind::Basic256Sha256 | PolicyKind::Aes256Sha256RsaPss => {
                32
            }
            PolicyKind::EccNistP256 => 64,
            PolicyKind::EccNistP384 => 96,
        }
    }

    fn key_derivation(self) -> KeyDerivation {
        match self {
            PolicyKind::Basic128Rsa15 | PolicyKind::Basic256 => KeyDerivation::PSha1,
            PolicyKind::Basic256Sha256 | PolicyKind::Aes256Sha256RsaPss => KeyDerivation::PSha256,
            PolicyKind::EccNistP256 => KeyDerivation::Hkdf {
                curve: Nid::X9_62_PRIME256V1,
                digest: SymDigest::Sha256,
            },
            PolicyKind::EccNistP384 => KeyDerivation::Hkdf {
                curve: Nid::SECP384R1,
                digest: SymDigest::Sha384,
            },
        }
    }

    /// Curve coordinate width in bytes for the ECC profiles.
    fn coordinate_size(self) -> usize {
        match self {
            PolicyKind::EccNistP256 => 32,
            PolicyKind::EccNistP384 => 48,
            _ => 0,
        }
    }

    /// RSA padding overhead per plaintext block.
    fn padding_overhead(self) -> usize {
        match self.asym_encryption() {
            AsymEncryption::RsaPkcs1 => 11,
            AsymEncryption::RsaOaepSha1 => 42,
            AsymEncryption::RsaOaepSha256 => 66,
            AsymEncryption::Identity => 0,
        }
    }
}

// ---------------------------------------------------------------------
// Channel context
// ---------------------------------------------------------------------

#[derive(Default)]
struct ChannelKeys {
    local_signing: Vec<u8>,
    local_encrypting: Vec<u8>,
    local_iv: Vec<u8>,
    remote_signing: Vec<u8>,
    remote_encrypting: Vec<u8>,
    remote_iv: Vec<u8>,
}

/// Per-channel state: the remote certificate and the symmetric session key
/// material of both directions. Freed independently of the policy.
pub struct ChannelContext {
    remote_certificate: Vec<u8>,
    remote_cert: X509,
    remote_thumbprint: Vec<u8>,
    keys: Mutex<ChannelKeys>,
    /// Local ephemeral keypair of the ECC profiles, created by
    /// `generate_nonce` and consumed by the key derivation.
    local_ephemeral: Mutex<Option<PKey<Private>>>,
}

impl ChannelContext {
    pub fn remote_certificate(&self) -> &[u8] {
        &self.remote_certificate
    }

    pub fn remote_thumbprint(&self) -> &[u8] {
        &self.remote_thumbprint
    }

    pub fn set_local_sym_signing_key(&self, key: &[u8]) {
        self.keys.lock().unwrap().local_signing = key.to_vec();
    }

    pub fn set_local_sym_encrypting_key(&self, key: &[u8]) {
        self.keys.lock().unwrap().local_encrypting = key.to_vec();
    }

    pub fn set_local_sym_iv(&self, iv: &[u8]) {
        self.keys.lock().unwrap().local_iv = iv.to_vec();
    }

    pub fn set_remote_sym_signing_key(&self, key: &[u8]) {
        self.keys.lock().unwrap().remote_signing = key.to_vec();
    }

    pub fn set_remote_sym_encrypting_key(&self, key: &[u8]) {
        self.keys.lock().unwrap().remote_encrypting = key.to_vec();
    }

    pub fn set_remote_sym_iv(&self, iv: &[u8]) {
        self.keys.lock().unwrap().remote_iv = iv.to_vec();
    }
}

impl Drop for ChannelKeys {
    fn drop(&mut self) {
        // Key material does not outlive the context.
        for buf in [
            &mut self.local_signing,
            &mut self.local_encrypting,
            &mut self.local_iv,
            &mut self.remote_signing,
            &mut self.remote_encrypting,
            &mut self.remote_iv,
        ] {
            buf.iter_mut().for_each(|b| *b = 0);
        }
    }
}

// ---------------------------------------------------------------------
// Security policy
// ---------------------------------------------------------------------

/// One configured policy: algorithm suite plus the local certificate and
/// private key.
pub struct SecurityPolicy {
    kind: PolicyKind,
    role: ApplicationRole,
    local_certificate: Vec<u8>,
    certificate: X509,
    private_key: PKey<Private>,
    local_thumbprint: Vec<u8>,
    /// Key generated for an outstanding signing request, adopted by
    /// `update_certificate`.
    pending_csr_key: Mutex<Option<PKey<Private>>>,
    /// A failed certificate update leaves the policy unusable.
    cleared: bool,
}

impl SecurityPolicy {
    /// `certificate` and `private_key` accept DER (preferred) or PEM.
    pub fn new(
        kind: PolicyKind,
        role: ApplicationRole,
        certificate: &[u8],
        private_key: &[u8],
    ) -> UaResult<SecurityPolicy> {
        let cert = primitives::load_certificate(certificate)?;
        let der = cert.to_der().map_err(|_| UaError::CertificateInvalid)?;
        let key = primitives::load_private_key(private_key)?;
        let thumbprint = primitives::certificate_thumbprint(&der)?;
        info!(target: "crypto", uri = kind.uri(), "security policy created");
        Ok(SecurityPolicy {
            kind,
            role,
            local_certificate: der,
            certificate: cert,
            private_key: key,
            local_thumbprint: thumbprint,
            pending_csr_key: Mutex::new(None),
            cleared: false,
        })
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn uri(&self) -> &'static str {
        self.kind.uri()
    }

    pub fn local_certificate(&self) -> &[u8] {
        &self.local_certificate
    }

    pub fn local_thumbprint(&self) -> &[u8] {
        &self.local_thumbprint
    }

    fn ensure_usable(&self) -> UaResult<()> {
        if self.cleared {
            return Err(UaError::Internal);
        }
        Ok(())
    }

    /// Context for a channel to the holder of `remote_certificate`.
    pub fn new_channel_context(&self, remote_certificate: &[u8]) -> UaResult<ChannelContext> {
        self.ensure_usable()?;
        let cert = primitives::load_certificate(remote_certificate)?;
        let der = cert.to_der().map_err(|_| UaError::CertificateInvalid)?;
        let thumbprint = primitives::certificate_thumbprint(&der)?;
        Ok(ChannelContext {
            remote_certificate: der,
            remote_cert: cert,
            remote_thumbprint: thumbprint,
            keys: Mutex::new(ChannelKeys::default()),
            local_ephemeral: Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------
    // Asymmetric module
    // -----------------------------------------------------------------

    /// Sign with the local private key.
    pub fn asym_sign(&self, data: &[u8]) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        match self.kind.asym_signature() {
            AsymSignature::RsaPkcs1Sha1 => self.rsa_sign(MessageDigest::sha1(), false, data),
            AsymSignature::RsaPkcs1Sha256 => self.rsa_sign(MessageDigest::sha256(), false, data),
            AsymSignature::RsaPssSha256 => self.rsa_sign(MessageDigest::sha256(), true, data),
            AsymSignature::EcdsaSha256 => self.ecdsa_sign(MessageDigest::sha256(), data),
            AsymSignature::EcdsaSha384 => self.ecdsa_sign(MessageDigest::sha384(), data),
        }
    }

    fn rsa_sign(&self, digest: MessageDigest, pss: bool, data: &[u8]) -> UaResult<Vec<u8>> {
        let mut signer =
            Signer::new(digest, &self.private_key).map_err(|_| UaError::Internal)?;
        if pss {
            signer
                .set_rsa_padding(Padding::PKCS1_PSS)
                .and_then(|_| signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH))
                .and_then(|_| signer.set_rsa_mgf1_md(digest))
                .map_err(|_| UaError::Internal)?;
        }
        signer.update(data).map_err(|_| UaError::Internal)?;
        signer.sign_to_vec().map_err(|_| UaError::Internal)
    }

    fn ecdsa_sign(&self, digest: MessageDigest, data: &[u8]) -> UaResult<Vec<u8>> {
        let hashed = hash(digest, data).map_err(|_| UaError::Internal)?;
        let ec = self.private_key.ec_key().map_err(|_| UaError::Internal)?;
        let sig = EcdsaSig::sign(&hashed, &ec).map_err(|_| UaError::Internal)?;
        // Wire form is the fixed-width concatenation r || s.
        let n = self.kind.coordinate_size();
        let mut out = sig
            .r()
            .to_vec_padded(n as i32)
            .map_err(|_| UaError::Internal)?;
        out.extend(
            sig.s()
                .to_vec_padded(n as i32)
                .map_err(|_| UaError::Internal)?,
        );
        Ok(out)
    }

    /// Verify a signature made by the channel's remote endpoint.
    pub fn asym_verify(
        &self,
        channel: &ChannelContext,
        data: &[u8],
        signature: &[u8],
    ) -> UaResult<()> {
        self.ensure_usable()?;
        let public = channel
            .remote_cert
            .public_key()
            .map_err(|_| UaError::CertificateInvalid)?;
        match self.kind.asym_signature() {
            AsymSignature::RsaPkcs1Sha1 => {
                rsa_verify(MessageDigest::sha1(), false, &public, data, signature)
            }
            AsymSignature::RsaPkcs1Sha256 => {
                rsa_verify(MessageDigest::sha256(), false, &public, data, signature)
            }
            AsymSignature::RsaPssSha256 => {
                rsa_verify(MessageDigest::sha256(), true, &public, data, signature)
            }
            AsymSignature::EcdsaSha256 => {
                ecdsa_verify(MessageDigest::sha256(), &public, data, signature)
            }
            AsymSignature::EcdsaSha384 => {
                ecdsa_verify(MessageDigest::sha384(), &public, data, signature)
            }
        }
    }

    /// Encrypt towards the remote endpoint, block by block. The ECC
    /// profiles pass data through unchanged.
    pub fn asym_encrypt(&self, channel: &ChannelContext, data: &[u8]) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        if self.kind.asym_encryption() == AsymEncryption::Identity {
            return Ok(data.to_vec());
        }
        let public = channel
            .remote_cert
            .public_key()
            .map_err(|_| UaError::CertificateInvalid)?;
        let rsa = public.rsa().map_err(|_| UaError::CertificateInvalid)?;
        let cipher_block = rsa.size() as usize;
        let plain_block = cipher_block - self.kind.padding_overhead();
        if data.is_empty() || data.len() % plain_block != 0 {
            return Err(UaError::InvalidArgument);
        }

        let mut out = Vec::with_capacity(data.len() / plain_block * cipher_block);
        for chunk in data.chunks(plain_block) {
            let mut encrypter = Encrypter::new(&public).map_err(|_| UaError::Internal)?;
            self.configure_rsa_padding_enc(&mut encrypter)?;
            let len = encrypter
                .encrypt_len(chunk)
                .map_err(|_| UaError::Internal)?;
            let mut buf = vec![0u8; len];
            let n = encrypter
                .encrypt(chunk, &mut buf)
                .map_err(|_| UaError::Internal)?;
            buf.truncate(n);
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    /// Decrypt with the local private key, block by block.
    pub fn asym_decrypt(&self, data: &[u8]) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        if self.kind.asym_encryption() == AsymEncryption::Identity {
            return Ok(data.to_vec());
        }
        let rsa = self.private_key.rsa().map_err(|_| UaError::Internal)?;
        let cipher_block = rsa.size() as usize;
        if data.is_empty() || data.len() % cipher_block != 0 {
            return Err(UaError::InvalidArgument);
        }

        let mut out = Vec::new();
        for chunk in data.chunks(cipher_block) {
            let mut decrypter =
                Decrypter::new(&self.private_key).map_err(|_| UaError::Internal)?;
            self.configure_rsa_padding_dec(&mut decrypter)?;
            let len = decrypter
                .decrypt_len(chunk)
                .map_err(|_| UaError::Internal)?;
            let mut buf = vec![0u8; len];
            let n = decrypter
                .decrypt(chunk, &mut buf)
                .map_err(|_| UaError::CertificateInvalid)?;
            buf.truncate(n);
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    fn configure_rsa_padding_enc(&self, encrypter: &mut Encrypter<'_>) -> UaResult<()> {
        match self.kind.asym_encryption() {
            AsymEncryption::RsaPkcs1 => encrypter
                .set_rsa_padding(Padding::PKCS1)
                .map_err(|_| UaError::Internal),
            AsymEncryption::RsaOaepSha1 => encrypter
                .set_rsa_padding(Padding::PKCS1_OAEP)
                .map_err(|_| UaError::Internal),
            AsymEncryption::RsaOaepSha256 => encrypter
                .set_rsa_padding(Padding::PKCS1_OAEP)
                .and_then(|_| encrypter.set_rsa_oaep_md(MessageDigest::sha256()))
                .and_then(|_| encrypter.set_rsa_mgf1_md(MessageDigest::sha256()))
                .map_err(|_| UaError::Internal),
            AsymEncryption::Identity => Ok(()),
        }
    }

    fn configure_rsa_padding_dec(&self, decrypter: &mut Decrypter<'_>) -> UaResult<()> {
        match self.kind.asym_encryption() {
            AsymEncryption::RsaPkcs1 => decrypter
                .set_rsa_padding(Padding::PKCS1)
                .map_err(|_| UaError::Internal),
            AsymEncryption::RsaOaepSha1 => decrypter
                .set_rsa_padding(Padding::PKCS1_OAEP)
                .map_err(|_| UaError::Internal),
            AsymEncryption::RsaOaepSha256 => decrypter
                .set_rsa_padding(Padding::PKCS1_OAEP)
                .and_then(|_| decrypter.set_rsa_oaep_md(MessageDigest::sha256()))
                .and_then(|_| decrypter.set_rsa_mgf1_md(MessageDigest::sha256()))
                .map_err(|_| UaError::Internal),
            AsymEncryption::Identity => Ok(()),
        }
    }

    /// Modulus size in bytes of the local key; the ECC profiles report 1.
    pub fn asym_local_key_length(&self) -> usize {
        match self.private_key.rsa() {
            Ok(rsa) => rsa.size() as usize,
            Err(_) => 1,
        }
    }

    pub fn asym_remote_key_length(&self, channel: &ChannelContext) -> usize {
        channel
            .remote_cert
            .public_key()
            .ok()
            .and_then(|k| k.rsa().ok())
            .map(|rsa| rsa.size() as usize)
            .unwrap_or(1)
    }

    pub fn asym_local_signature_size(&self) -> usize {
        match self.kind.asym_signature() {
            AsymSignature::EcdsaSha256 | AsymSignature::EcdsaSha384 => {
                2 * self.kind.coordinate_size()
            }
            _ => self.asym_local_key_length(),
        }
    }

    pub fn asym_remote_signature_size(&self, channel: &ChannelContext) -> usize {
        match self.kind.asym_signature() {
            AsymSignature::EcdsaSha256 | AsymSignature::EcdsaSha384 => {
                2 * self.kind.coordinate_size()
            }
            _ => self.asym_remote_key_length(channel),
        }
    }

    /// Plaintext block size towards the remote endpoint.
    pub fn asym_remote_plain_block_size(&self, channel: &ChannelContext) -> usize {
        if self.kind.asym_encryption() == AsymEncryption::Identity {
            return 1;
        }
        self.asym_remote_key_length(channel)
            .saturating_sub(self.kind.padding_overhead())
            .max(1)
    }

    pub fn asym_remote_cipher_block_size(&self, channel: &ChannelContext) -> usize {
        if self.kind.asym_encryption() == AsymEncryption::Identity {
            return 1;
        }
        self.asym_remote_key_length(channel)
    }

    /// SHA-1 thumbprint of an arbitrary certificate.
    pub fn make_certificate_thumbprint(&self, certificate: &[u8]) -> UaResult<Vec<u8>> {
        primitives::certificate_thumbprint(certificate)
    }

    /// Whether a thumbprint names the local certificate.
    pub fn compare_certificate_thumbprint(&self, thumbprint: &[u8]) -> UaResult<()> {
        if thumbprint == self.local_thumbprint {
            Ok(())
        } else {
            Err(UaError::CertificateInvalid)
        }
    }

    // -----------------------------------------------------------------
    // Symmetric module
    // -----------------------------------------------------------------

    pub fn sym_sign(&self, channel: &ChannelContext, data: &[u8]) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        let keys = channel.keys.lock().unwrap();
        primitives::hmac_sign(self.kind.sym_digest().message_digest(), &keys.local_signing, data)
    }

    pub fn sym_verify(
        &self,
        channel: &ChannelContext,
        data: &[u8],
        signature: &[u8],
    ) -> UaResult<()> {
        self.ensure_usable()?;
        let keys = channel.keys.lock().unwrap();
        primitives::hmac_verify(
            self.kind.sym_digest().message_digest(),
            &keys.remote_signing,
            data,
            signature,
        )
    }

    pub fn sym_encrypt(&self, channel: &ChannelContext, data: &[u8]) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        let keys = channel.keys.lock().unwrap();
        primitives::cbc_apply(
            self.kind.sym_cipher(),
            Mode::Encrypt,
            &keys.local_encrypting,
            &keys.local_iv,
            data,
        )
    }

    pub fn sym_decrypt(&self, channel: &ChannelContext, data: &[u8]) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        let keys = channel.keys.lock().unwrap();
        primitives::cbc_apply(
            self.kind.sym_cipher(),
            Mode::Decrypt,
            &keys.remote_encrypting,
            &keys.remote_iv,
            data,
        )
    }

    pub fn sym_signature_size(&self) -> usize {
        self.kind.sym_digest().size()
    }

    /// Channel nonce. For the RSA profiles this is plain randomness; the
    /// ECC profiles create a fresh ephemeral keypair on the channel and
    /// return its public coordinates.
    pub fn generate_nonce(&self, channel: &ChannelContext) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        match self.kind.key_derivation() {
            KeyDerivation::Hkdf { curve, .. } => {
                let key = primitives::generate_ephemeral_key(curve)?;
                let public = primitives::ephemeral_public_bytes(&key)?;
                *channel.local_ephemeral.lock().unwrap() = Some(key);
                Ok(public)
            }
            _ => {
                let mut nonce = vec![0u8; self.kind.nonce_length()];
                openssl::rand::rand_bytes(&mut nonce).map_err(|_| UaError::Internal)?;
                Ok(nonce)
            }
        }
    }

    /// Derive `out_len` bytes of key material from the exchanged nonces.
    ///
    /// RSA profiles: pseudo-random expansion with `key1` as secret and
    /// `key2` as seed. ECC profiles: HKDF over the ECDH shared secret; the
    /// caller passes `[remote, local]` nonces to derive the local keys and
    /// `[local, remote]` to derive the remote keys.
    pub fn generate_key(
        &self,
        channel: &ChannelContext,
        key1: &[u8],
        key2: &[u8],
        out_len: usize,
    ) -> UaResult<Vec<u8>> {
        self.ensure_usable()?;
        match self.kind.key_derivation() {
            KeyDerivation::PSha1 => {
                primitives::p_hash(MessageDigest::sha1(), key1, key2, out_len)
            }
            KeyDerivation::PSha256 => {
                primitives::p_hash(MessageDigest::sha256(), key1, key2, out_len)
            }
            KeyDerivation::Hkdf { curve, digest } => {
                self.derive_ecc_keys(channel, curve, digest, key1, key2, out_len)
            }
        }
    }

    fn derive_ecc_keys(
        &self,
        channel: &ChannelContext,
        curve: Nid,
        digest: SymDigest,
        key1: &[u8],
        key2: &[u8],
        out_len: usize,
    ) -> UaResult<Vec<u8>> {
        let local = channel
            .local_ephemeral
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(UaError::Internal)?;
        let local_public = primitives::ephemeral_public_bytes(&local)?;

        // The position of the local ephemeral key among the inputs decides
        // whether local or remote keys are derived, and with it the label.
        let (label, remote_public) = if local_public == key1 {
            (self.role.opposite_label(), key2)
        } else if local_public == key2 {
            (self.role.label(), key1)
        } else {
            warn!(target: "crypto", "no input nonce matches the local ephemeral key");
            return Err(UaError::Internal);
        };

        let peer = primitives::public_key_from_coordinates(curve, remote_public)?;
        let shared = primitives::ecdh_shared_secret(&local, &peer)?;

        // Salt: length as uint16 (little endian), label, then the nonces in
        // caller order reversed (the caller order already encodes the
        // direction).
        let mut salt = Vec::with_capacity(2 + label.len() + key1.len() + key2.len());
        salt.extend_from_slice(&(out_len as u16).to_le_bytes());
        salt.extend_from_slice(label);
        salt.extend_from_slice(key2);
        salt.extend_from_slice(key1);

        primitives::hkdf(digest.md(), &shared, &salt, &salt, out_len)
    }

    // -----------------------------------------------------------------
    // Certificate maintenance
    // -----------------------------------------------------------------

    /// DER PKCS#10 signing request. With `regenerate_key` a fresh key of
    /// the same size/curve is created, returned and kept pending until the
    /// matching certificate arrives through `update_certificate`.
    pub fn create_signing_request(
        &self,
        subject: Option<&str>,
        nonce: &[u8],
        regenerate_key: bool,
    ) -> UaResult<(Vec<u8>, Option<Vec<u8>>)> {
        self.ensure_usable()?;
        csr::create_signing_request(
            &self.certificate,
            &self.private_key,
            &self.pending_csr_key,
            subject,
            nonce,
            regenerate_key,
        )
    }

    /// Install a renewed certificate. An empty `new_key` either keeps the
    /// current key (matching public key) or adopts the pending CSR key;
    /// otherwise `new_key` is adopted directly. Failure leaves the policy
    /// unusable.
    pub fn update_certificate(&mut self, new_cert: &[u8], new_key: &[u8]) -> UaResult<()> {
        self.ensure_usable()?;
        let result = self.try_update_certificate(new_cert, new_key);
        if result.is_err() {
            warn!(target: "crypto", "certificate update failed, clearing the policy");
            self.cleared = true;
        }
        result
    }

    fn try_update_certificate(&mut self, new_cert: &[u8], new_key: &[u8]) -> UaResult<()> {
        let cert = primitives::load_certificate(new_cert)?;
        let der = cert.to_der().map_err(|_| UaError::CertificateInvalid)?;
        let cert_public = cert.public_key().map_err(|_| UaError::CertificateInvalid)?;

        let key = if new_key.is_empty() {
            if cert_public.public_eq(&self.private_key) {
                // The certificate was renewed for the current key.
                self.private_key.clone()
            } else if let Some(pending) = self.pending_csr_key.lock().unwrap().take() {
                if !cert_public.public_eq(&pending) {
                    return Err(UaError::CertificateInvalid);
                }
                pending
            } else {
                return Err(UaError::CertificateInvalid);
            }
        } else {
            let key = primitives::load_private_key(new_key)?;
            if !cert_public.public_eq(&key) {
                return Err(UaError::CertificateInvalid);
            }
            key
        };

        self.local_thumbprint = primitives::certificate_thumbprint(&der)?;
        self.local_certificate = der;
        self.certificate = cert;
        self.private_key = key;
        info!(target: "crypto", uri = self.kind.uri(), "local certificate updated");
        Ok(())
    }
}

fn rsa_verify(
    digest: MessageDigest,
    pss: bool,
    public: &PKey<Public>,
    data: &[u8],
    signature: &[u8],
) -> UaResult<()> {
    let mut verifier = Verifier::new(digest, public).map_err(|_| UaError::CertificateInvalid)?;
    if pss {
        verifier
            .set_rsa_padding(Padding::PKCS1_PSS)
            .and_then(|_| verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH))
            .and_then(|_| verifier.set_rsa_mgf1_md(digest))
            .map_err(|_| UaError::CertificateInvalid)?;
    }
    verifier
        .update(data)
        .map_err(|_| UaError::CertificateInvalid)?;
    match verifier.verify(signature) {
        Ok(true) => Ok(()),
        _ => Err(UaError::CertificateInvalid),
    }
}

fn ecdsa_verify(
    digest: MessageDigest,
    public: &PKey<Public>,
    data: &[u8],
    signature: &[u8],
) -> UaResult<()> {
    let hashed = hash(digest, data).map_err(|_| UaError::CertificateInvalid)?;
    if signature.is_empty() || signature.len() % 2 != 0 {
        return Err(UaError::CertificateInvalid);
    }
    let half = signature.len() / 2;
    let r = openssl::bn::BigNum::from_slice(&signature[..half])
        .map_err(|_| UaError::CertificateInvalid)?;
    let s = openssl::bn::BigNum::from_slice(&signature[half..])
        .map_err(|_| UaError::CertificateInvalid)?;
    let sig =
        EcdsaSig::from_private_components(r, s).map_err(|_| UaError::CertificateInvalid)?;
    let ec = public
        .ec_key()
        .map_err(|_| UaError::CertificateInvalid)?;
    match sig.verify(&hashed, &ec) {
        Ok(true) => Ok(()),
        _ => Err(UaError::CertificateInvalid),
    }
}

/// Generate a private key of the same type and size as `reference`.
pub(crate) fn generate_matching_key(reference: &PKey<Private>) -> UaResult<PKey<Private>> {
    if let Ok(rsa) = reference.rsa() {
        let fresh = Rsa::generate(rsa.size() * 8).map_err(|_| UaError::Internal)?;
        return PKey::from_rsa(fresh).map_err(|_| UaError::Internal);
    }
    if let Ok(ec) = reference.ec_key() {
        let fresh = EcKey::generate(ec.group()).map_err(|_| UaError::Internal)?;
        return PKey::from_ec_key(fresh).map_err(|_| UaError::Internal);
    }
    Err(UaError::Internal)
}

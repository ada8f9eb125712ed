//! Shared status taxonomy for the runtime substrate.
//!
//! Every layer (timer, event loop, connection managers, crypto, trust store)
//! reports failures through the same compact set of codes so that callers can
//! match on outcomes without chasing per-crate error types. Details that would
//! otherwise be carried in the error value (errno text, offending parameter
//! names) are logged at the failure site instead.

use thiserror::Error;

/// Status codes surfaced by the runtime substrate.
///
/// Recoverable socket conditions (EINTR, EAGAIN, EWOULDBLOCK) never appear
/// here: they are retried or suppressed at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum UaError {
    /// A programming precondition was violated (reentrant `run`, lifecycle
    /// misuse, malformed internal state).
    #[error("internal error")]
    Internal,
    /// A user-visible bad parameter (non-positive interval, missing required
    /// configuration key, type mismatch).
    #[error("invalid argument")]
    InvalidArgument,
    /// Allocation failed. Never swallowed.
    #[error("out of memory")]
    OutOfMemory,
    /// The operation targets an unknown id (timer entry, connection).
    #[error("not found")]
    NotFound,
    /// Socket-level failure during send or a remote reset; the connection has
    /// been shut down and the application notified.
    #[error("connection closed")]
    ConnectionClosed,
    /// Listen/bind/connect failed during setup; nothing was registered.
    #[error("connection rejected")]
    ConnectionRejected,
    /// The certificate could not be parsed or its signature is wrong.
    #[error("certificate invalid")]
    CertificateInvalid,
    /// The certificate chain ends in a root that is not in the trust list.
    #[error("certificate untrusted")]
    CertificateUntrusted,
    /// No issuer certificate could be located for a chain link.
    #[error("certificate chain incomplete")]
    CertificateChainIncomplete,
    /// No CRL of the issuer is available to decide revocation.
    #[error("certificate revocation unknown")]
    CertificateRevocationUnknown,
    /// A chain link is listed in its issuer's CRL.
    #[error("certificate revoked")]
    CertificateRevoked,
    /// The certificate is not permitted for the requested usage.
    #[error("certificate use not allowed")]
    CertificateUseNotAllowed,
    /// Unclassified socket-creation failure in the datagram open path.
    #[error("out of service")]
    OutOfService,
    /// The remote endpoint is unreachable or dropped the connection attempt.
    #[error("disconnect")]
    Disconnect,
}

impl UaError {
    /// Whether the code belongs to the certificate-verification family.
    pub fn is_certificate_error(self) -> bool {
        matches!(
            self,
            UaError::CertificateInvalid
                | UaError::CertificateUntrusted
                | UaError::CertificateChainIncomplete
                | UaError::CertificateRevocationUnknown
                | UaError::CertificateRevoked
                | UaError::CertificateUseNotAllowed
        )
    }
}

pub type UaResult<T> = Result<T, UaError>;

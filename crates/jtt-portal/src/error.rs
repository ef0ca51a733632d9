use jtt_core::SubResourceKind;
use jtt_storage::TransportError;
use thiserror::Error;

/// Verification could not be (re)established. Fatal to the session.
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("challenge not solved after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
    #[error("portal demanded a challenge right after the bootstrap request")]
    DemandedAfterBootstrap,
    #[error("portal demanded a challenge again for {identifier} after a fresh solve")]
    DemandedAfterRetry { identifier: String },
    #[error("session already terminated")]
    Terminated,
}

/// The portal answered in a shape we do not understand. Fatal to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("response to {context} is missing `{field}`")]
    MissingField {
        field: &'static str,
        context: &'static str,
    },
    #[error("listing envelope rejected: {0}")]
    ListingRejected(RecoverableFetchError),
}

/// Scoped to one entity or one sub-resource collection; the run carries on.
#[derive(Debug, Error)]
pub enum RecoverableFetchError {
    #[error("portal reported success=false")]
    Unsuccessful,
    #[error("portal error: {0}")]
    PortalError(String),
    #[error("portal returned no data")]
    EmptyData,
    #[error("{kind} for {identifier} were not loaded by the last detail request")]
    NotLoaded {
        kind: SubResourceKind,
        identifier: String,
    },
    #[error("unexpected row shape: {0}")]
    Malformed(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Fetch(#[from] RecoverableFetchError),
    #[error("session setup failed: {0}")]
    Setup(String),
}

impl SessionError {
    /// Challenge and protocol failures end the session; everything else only
    /// costs the current entity.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SessionError::Challenge(_) | SessionError::Protocol(_))
    }
}

/// One entity could not be assembled.
#[derive(Debug, Error)]
#[error("entity {identifier} skipped: {source}")]
pub struct EntityError {
    pub identifier: String,
    #[source]
    pub source: SessionError,
}

impl EntityError {
    pub fn is_session_fatal(&self) -> bool {
        self.source.is_session_fatal()
    }
}

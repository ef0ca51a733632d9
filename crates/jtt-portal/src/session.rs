//! Challenge-token session: one authenticated conversation with the portal.
//!
//! Every request carries the current challenge key and view key; both rotate
//! with each response and must be written back before the next request. The
//! portal periodically answers with `captchaRequred`, at which point a fresh
//! challenge has to be solved before the request is retried.

use std::sync::Arc;

use async_trait::async_trait;
use jtt_core::{EntityDetail, FieldMap, SubResourceKind};
use jtt_storage::TransportError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{ChallengeError, ProtocolError, RecoverableFetchError, SessionError};
use crate::protocol::{rows_to_summaries, ChallengeProtocol, ResponseTokens};
use crate::solver::{solution_format_is_valid, ChallengeSolver, SolverError};
use crate::transport::PortalTransport;
use crate::{Listing, SessionStrategy, TargetSpec};

/// Challenge attempts per solve cycle; each attempt uses a fresh image.
pub const MAX_CHALLENGE_ATTEMPTS: u32 = 5;

/// A detail request is sent at most this many times.
pub const DETAIL_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unauthenticated,
    Authenticating,
    Ready,
    RequestSent,
    ChallengeDemanded,
    Terminated,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Unauthenticated, Authenticating)
            | (Authenticating, Ready)
            | (Ready, RequestSent)
            | (RequestSent, Ready)
            | (RequestSent, ChallengeDemanded)
            | (ChallengeDemanded, Authenticating) => true,
            _ => false,
        }
    }
}

/// Per-session tokens. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub target: String,
    pub challenge_key: String,
    pub view_key: String,
    /// Successful detail requests since the last solved challenge.
    pub requests_since_challenge: u32,
}

impl SessionState {
    fn refresh(&mut self, tokens: &ResponseTokens) {
        self.challenge_key.clone_from(&tokens.challenge_key);
        self.view_key.clone_from(&tokens.view_key);
    }
}

#[derive(Debug, Error)]
enum AttemptFailure {
    #[error("challenge transport: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error("portal sent no challenge image")]
    NoImage,
    #[error("answer {0:?} is not {len} alphanumerics", len = crate::solver::SOLUTION_LEN)]
    BadFormat(String),
    #[error("portal rejected the answer")]
    Mismatch,
    #[error("portal matched the answer but returned no key")]
    EmptyKey,
}

/// Sub-resources delivered inside the last detail response.
#[derive(Debug, Clone)]
struct LoadedCollections {
    identifier: String,
    cases: Vec<FieldMap>,
    charges: Vec<FieldMap>,
    holds: Vec<FieldMap>,
}

pub struct PortalSession {
    target: TargetSpec,
    transport: Arc<dyn PortalTransport>,
    solver: Arc<dyn ChallengeSolver>,
    state: SessionState,
    phase: SessionPhase,
    listing: Listing,
    loaded: Option<LoadedCollections>,
}

impl std::fmt::Debug for PortalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalSession")
            .field("target", &self.target.name)
            .field("phase", &self.phase)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PortalSession {
    /// Solves the opening challenge, then bootstraps tokens and the listing snapshot.
    pub async fn connect(
        target: TargetSpec,
        transport: Arc<dyn PortalTransport>,
        solver: Arc<dyn ChallengeSolver>,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            state: SessionState {
                target: target.name.clone(),
                ..SessionState::default()
            },
            target,
            transport,
            solver,
            phase: SessionPhase::Unauthenticated,
            listing: Listing::default(),
            loaded: None,
        };
        match session.bootstrap().await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.terminate();
                Err(err)
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<(), SessionError> {
        self.advance(SessionPhase::Authenticating);
        self.solve_challenge().await?;

        let body = ChallengeProtocol::with_token(&self.state.challenge_key);
        let response = self.transport.bootstrap(&self.target, &body).await?;
        let tokens = response.tokens()?;
        if tokens.challenge_required {
            return Err(ChallengeError::DemandedAfterBootstrap.into());
        }
        let rows = response.offenders.ok_or(ProtocolError::MissingField {
            field: "offenders",
            context: "bootstrap",
        })?;
        let entities = rows_to_summaries(rows, "bootstrap")?;
        self.state.refresh(&tokens);
        info!(jail = %self.target.name, listed = entities.len(), "session ready");
        self.listing = Listing::snapshot(entities);
        self.advance(SessionPhase::Ready);
        Ok(())
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Listing returned by the bootstrap call.
    pub fn listing(&self) -> &Listing {
        &self.listing
    }

    pub fn terminate(&mut self) {
        if self.phase != SessionPhase::Terminated {
            debug!(jail = %self.target.name, from = ?self.phase, "session terminated");
            self.phase = SessionPhase::Terminated;
            self.loaded = None;
        }
    }

    fn advance(&mut self, next: SessionPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    /// Fetch, solve and validate until the portal accepts an answer or the
    /// attempt ceiling is hit. Any failure consumes one attempt.
    async fn solve_challenge(&mut self) -> Result<(), ChallengeError> {
        for attempt in 1..=MAX_CHALLENGE_ATTEMPTS {
            match self.challenge_attempt().await {
                Ok(key) => {
                    self.state.challenge_key = key;
                    self.state.requests_since_challenge = 0;
                    info!(jail = %self.target.name, attempt, "challenge solved");
                    return Ok(());
                }
                Err(reason) => {
                    warn!(jail = %self.target.name, attempt, %reason, "challenge attempt failed");
                }
            }
        }
        Err(ChallengeError::AttemptsExhausted {
            attempts: MAX_CHALLENGE_ATTEMPTS,
        })
    }

    async fn challenge_attempt(&self) -> Result<String, AttemptFailure> {
        let challenge = self.transport.fetch_challenge(&self.target).await?;
        let image = challenge
            .captcha_image
            .filter(|image| !image.is_empty())
            .ok_or(AttemptFailure::NoImage)?;
        let answer = self.solver.solve(&image).await?;
        if !solution_format_is_valid(&answer) {
            return Err(AttemptFailure::BadFormat(answer));
        }
        let result = self
            .transport
            .validate_challenge(
                &self.target,
                &ChallengeProtocol::answer(challenge.captcha_key, answer),
            )
            .await?;
        if !result.captcha_matched {
            return Err(AttemptFailure::Mismatch);
        }
        if result.captcha_key.is_empty() {
            return Err(AttemptFailure::EmptyKey);
        }
        Ok(result.captcha_key)
    }

    /// Detail for one entity. A challenge demand is answered with a solve
    /// cycle and a retry, up to `DETAIL_ATTEMPTS` sends; a demand on the last
    /// send ends the session.
    pub async fn request_detail(&mut self, identifier: &str) -> Result<EntityDetail, SessionError> {
        if self.phase == SessionPhase::Terminated {
            return Err(ChallengeError::Terminated.into());
        }
        self.loaded = None;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.advance(SessionPhase::RequestSent);
            let body = ChallengeProtocol::with_token(&self.state.challenge_key);
            let response = match self
                .transport
                .fetch_detail(&self.target, identifier, &self.state.view_key, &body)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    self.advance(SessionPhase::Ready);
                    return Err(err.into());
                }
            };

            let tokens = match response.tokens() {
                Ok(tokens) => tokens,
                Err(err) => {
                    self.terminate();
                    return Err(err.into());
                }
            };
            self.state.refresh(&tokens);

            if !tokens.challenge_required {
                self.state.requests_since_challenge += 1;
                self.advance(SessionPhase::Ready);
                if response.special_fields.is_none() {
                    let message = response
                        .error_message
                        .as_deref()
                        .map(str::trim)
                        .filter(|m| !m.is_empty());
                    return Err(match message {
                        Some(message) => RecoverableFetchError::PortalError(message.to_string()),
                        None => RecoverableFetchError::EmptyData,
                    }
                    .into());
                }
                let detail = response.detail();
                self.loaded = Some(LoadedCollections {
                    identifier: identifier.to_string(),
                    cases: response.cases.unwrap_or_default(),
                    charges: response.charges.unwrap_or_default(),
                    holds: response.holds.unwrap_or_default(),
                });
                return Ok(detail);
            }

            self.advance(SessionPhase::ChallengeDemanded);
            info!(
                jail = %self.target.name,
                identifier,
                requests_since_challenge = self.state.requests_since_challenge,
                attempt,
                "portal demanded a challenge"
            );
            if attempt >= DETAIL_ATTEMPTS {
                self.terminate();
                return Err(ChallengeError::DemandedAfterRetry {
                    identifier: identifier.to_string(),
                }
                .into());
            }
            self.advance(SessionPhase::Authenticating);
            if let Err(err) = self.solve_challenge().await {
                self.terminate();
                return Err(err.into());
            }
            self.advance(SessionPhase::Ready);
        }
    }

    /// Sub-resources come bundled with the detail response; hand out the
    /// ones loaded for `identifier`.
    pub fn loaded_collection(
        &self,
        kind: SubResourceKind,
        identifier: &str,
    ) -> Result<Vec<FieldMap>, RecoverableFetchError> {
        match &self.loaded {
            Some(loaded) if loaded.identifier == identifier => Ok(match kind {
                SubResourceKind::Cases => loaded.cases.clone(),
                SubResourceKind::Charges => loaded.charges.clone(),
            }),
            _ => Err(RecoverableFetchError::NotLoaded {
                kind,
                identifier: identifier.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SessionStrategy for PortalSession {
    fn target(&self) -> &TargetSpec {
        &self.target
    }

    fn phase(&self) -> SessionPhase {
        self.phase
    }

    async fn listing(&mut self) -> Result<Listing, SessionError> {
        if self.phase == SessionPhase::Terminated {
            return Err(ChallengeError::Terminated.into());
        }
        Ok(self.listing.clone())
    }

    async fn request_detail(&mut self, identifier: &str) -> Result<EntityDetail, SessionError> {
        PortalSession::request_detail(self, identifier).await
    }

    async fn request_collection(
        &mut self,
        kind: SubResourceKind,
        identifier: &str,
    ) -> Result<Vec<FieldMap>, SessionError> {
        Ok(self.loaded_collection(kind, identifier)?)
    }

    fn loaded_holds(&self, identifier: &str) -> Vec<FieldMap> {
        match &self.loaded {
            Some(loaded) if loaded.identifier == identifier => loaded.holds.clone(),
            _ => Vec::new(),
        }
    }

    fn terminate(&mut self) {
        PortalSession::terminate(self)
    }
}

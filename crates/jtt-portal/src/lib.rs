//! Portal protocol for JTT: session strategies, challenge solving and
//! per-entity record assembly.

use std::sync::Arc;

use async_trait::async_trait;
use jtt_core::{EntityDetail, EntitySummary, FieldMap, SubResourceKind};
use jtt_storage::HttpClientConfig;
use serde::{Deserialize, Serialize};

mod cookie;
mod error;
mod fetcher;
pub mod protocol;
mod session;
mod solver;
mod transport;

#[cfg(test)]
mod test_support;

pub use cookie::CookieSession;
pub use error::{ChallengeError, EntityError, ProtocolError, RecoverableFetchError, SessionError};
pub use fetcher::EntityFetcher;
pub use session::{PortalSession, SessionPhase, SessionState, DETAIL_ATTEMPTS, MAX_CHALLENGE_ATTEMPTS};
pub use solver::{
    solution_format_is_valid, ChallengeSolver, OpenAiConfig, OpenAiSolver, SolverError, SOLUTION_LEN,
};
pub use transport::{envelope_url, EnvelopeCall, HttpPortalTransport, PortalTransport};

pub const CRATE_NAME: &str = "jtt-portal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Token-rotating API guarded by image challenges.
    #[default]
    Challenge,
    /// Older envelope API that only needs a session cookie.
    Cookie,
}

/// Where and how to talk to one portal deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: String,
    pub base_url: String,
    pub strategy: StrategyKind,
    pub page_size: usize,
}

impl TargetSpec {
    pub const DEFAULT_BASE_URL: &'static str = "https://omsweb.public-safety-cloud.com";
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    pub fn new(name: impl Into<String>, strategy: StrategyKind) -> Self {
        Self {
            name: name.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            strategy,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// One listing page as the portal returned it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub entities: Vec<EntitySummary>,
    pub total_count: Option<u64>,
    pub page_size: Option<usize>,
}

impl Listing {
    /// Listing delivered whole, without paging metadata.
    pub fn snapshot(entities: Vec<EntitySummary>) -> Self {
        Self {
            entities,
            total_count: None,
            page_size: None,
        }
    }

    /// True when the portal holds more entities than this page carries.
    pub fn exceeds_page(&self) -> bool {
        let listed = self.entities.len();
        match (self.total_count, self.page_size) {
            (Some(total), _) => total > listed as u64,
            (None, Some(page_size)) => listed >= page_size,
            (None, None) => false,
        }
    }
}

/// One authenticated conversation with a portal. Requests are strictly
/// sequential; the session owns its tokens.
#[async_trait]
pub trait SessionStrategy: Send {
    fn target(&self) -> &TargetSpec;

    fn phase(&self) -> SessionPhase;

    async fn listing(&mut self) -> Result<Listing, SessionError>;

    async fn request_detail(&mut self, identifier: &str) -> Result<EntityDetail, SessionError>;

    async fn request_collection(
        &mut self,
        kind: SubResourceKind,
        identifier: &str,
    ) -> Result<Vec<FieldMap>, SessionError>;

    /// Holds that came bundled with the detail for `identifier`, if any.
    fn loaded_holds(&self, _identifier: &str) -> Vec<FieldMap> {
        Vec::new()
    }

    fn terminate(&mut self);
}

/// Opens the session kind the target is configured for.
pub async fn connect_strategy(
    target: TargetSpec,
    transport: Arc<dyn PortalTransport>,
    solver: Arc<dyn ChallengeSolver>,
) -> Result<Box<dyn SessionStrategy>, SessionError> {
    let session: Box<dyn SessionStrategy> = match target.strategy {
        StrategyKind::Challenge => Box::new(PortalSession::connect(target, transport, solver).await?),
        StrategyKind::Cookie => Box::new(CookieSession::connect(target, transport).await?),
    };
    Ok(session)
}

/// Hands out a connected session per target.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &TargetSpec) -> Result<Box<dyn SessionStrategy>, SessionError>;
}

/// Connects over HTTP with a fresh cookie jar for every target.
#[derive(Clone)]
pub struct HttpConnector {
    http: HttpClientConfig,
    solver: Arc<dyn ChallengeSolver>,
}

impl HttpConnector {
    pub fn new(http: HttpClientConfig, solver: Arc<dyn ChallengeSolver>) -> Self {
        Self { http, solver }
    }
}

#[async_trait]
impl SessionConnector for HttpConnector {
    async fn connect(&self, target: &TargetSpec) -> Result<Box<dyn SessionStrategy>, SessionError> {
        let transport = HttpPortalTransport::new(&self.http)
            .map_err(|err| SessionError::Setup(format!("{err:#}")))?;
        connect_strategy(target.clone(), Arc::new(transport), self.solver.clone()).await
    }
}

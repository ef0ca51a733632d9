use async_trait::async_trait;
use jtt_core::SubResourceKind;
use jtt_storage::{join_url, with_query, HttpClientConfig, JsonClient, TransportError};

use crate::protocol::{BootstrapResponse, ChallengeProtocol, ChallengeResult, DetailResponse, Envelope};
use crate::TargetSpec;

/// Envelope-returning calls of the plain-cookie API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeCall<'a> {
    Listing { page_size: usize },
    Detail { identifier: &'a str },
    Collection {
        kind: SubResourceKind,
        identifier: &'a str,
    },
}

/// Raw request primitives against one portal. Implementations hold the
/// transport session (cookies), so one instance serves exactly one target.
#[async_trait]
pub trait PortalTransport: Send + Sync {
    async fn bootstrap(
        &self,
        target: &TargetSpec,
        body: &ChallengeProtocol,
    ) -> Result<BootstrapResponse, TransportError>;

    async fn fetch_challenge(&self, target: &TargetSpec) -> Result<ChallengeProtocol, TransportError>;

    async fn validate_challenge(
        &self,
        target: &TargetSpec,
        answer: &ChallengeProtocol,
    ) -> Result<ChallengeResult, TransportError>;

    async fn fetch_detail(
        &self,
        target: &TargetSpec,
        identifier: &str,
        view_key: &str,
        body: &ChallengeProtocol,
    ) -> Result<DetailResponse, TransportError>;

    /// Picks up the session cookie for the plain-cookie API.
    async fn open_cookie_session(&self, target: &TargetSpec) -> Result<(), TransportError>;

    async fn fetch_envelope(
        &self,
        target: &TargetSpec,
        call: EnvelopeCall<'_>,
    ) -> Result<Envelope, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpPortalTransport {
    http: JsonClient,
}

impl HttpPortalTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: JsonClient::new(config)?,
        })
    }
}

fn client_url(target: &TargetSpec, path: &str) -> String {
    join_url(&target.base_url, &format!("jtclientweb/{path}"))
}

fn cookie_url(target: &TargetSpec, path: &str) -> String {
    join_url(&target.base_url, &format!("jailtracker/{path}"))
}

fn client_referer(target: &TargetSpec) -> [(&'static str, String); 1] {
    [(
        "Referer",
        client_url(target, &format!("jailtracker/index/{}", target.name)),
    )]
}

fn cookie_referer(target: &TargetSpec) -> [(&'static str, String); 1] {
    [("Referer", cookie_url(target, &format!("index/{}", target.name)))]
}

/// URL for one envelope call.
pub fn envelope_url(target: &TargetSpec, call: EnvelopeCall<'_>) -> Result<String, TransportError> {
    match call {
        EnvelopeCall::Listing { page_size } => {
            let limit = page_size.to_string();
            with_query(
                &cookie_url(target, "GetInmates"),
                &[
                    ("start", "0"),
                    ("limit", limit.as_str()),
                    ("sort", "LastName"),
                    ("dir", "ASC"),
                ],
            )
        }
        EnvelopeCall::Detail { identifier } => {
            with_query(&cookie_url(target, "GetInmate"), &[("arrestNo", identifier)])
        }
        EnvelopeCall::Collection { kind, identifier } => {
            let endpoint = match kind {
                SubResourceKind::Cases => "GetCases",
                SubResourceKind::Charges => "GetCharges",
            };
            with_query(&cookie_url(target, endpoint), &[("arrestNo", identifier)])
        }
    }
}

#[async_trait]
impl PortalTransport for HttpPortalTransport {
    async fn bootstrap(
        &self,
        target: &TargetSpec,
        body: &ChallengeProtocol,
    ) -> Result<BootstrapResponse, TransportError> {
        let url = client_url(target, &format!("Offender/{}", target.name));
        self.http
            .post_json(&url, &client_referer(target), body)
            .await
    }

    async fn fetch_challenge(&self, target: &TargetSpec) -> Result<ChallengeProtocol, TransportError> {
        let url = client_url(target, "captcha/getnewcaptchaclient");
        self.http.get_json(&url, &client_referer(target)).await
    }

    async fn validate_challenge(
        &self,
        target: &TargetSpec,
        answer: &ChallengeProtocol,
    ) -> Result<ChallengeResult, TransportError> {
        let url = client_url(target, "Captcha/validatecaptcha");
        self.http
            .post_json(&url, &client_referer(target), answer)
            .await
    }

    async fn fetch_detail(
        &self,
        target: &TargetSpec,
        identifier: &str,
        view_key: &str,
        body: &ChallengeProtocol,
    ) -> Result<DetailResponse, TransportError> {
        let url = client_url(
            target,
            &format!(
                "Offender/{}/{}/offenderbucket/{}",
                target.name, identifier, view_key
            ),
        );
        self.http
            .post_json(&url, &client_referer(target), body)
            .await
    }

    async fn open_cookie_session(&self, target: &TargetSpec) -> Result<(), TransportError> {
        let url = cookie_url(target, &format!("index/{}", target.name));
        self.http.touch(&url, &[]).await
    }

    async fn fetch_envelope(
        &self,
        target: &TargetSpec,
        call: EnvelopeCall<'_>,
    ) -> Result<Envelope, TransportError> {
        let url = envelope_url(target, call)?;
        self.http.get_json(&url, &cookie_referer(target)).await
    }
}

//! Scripted portal and solver used by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use jtt_storage::TransportError;
use serde_json::{json, Value as JsonValue};

use crate::protocol::{BootstrapResponse, ChallengeProtocol, ChallengeResult, DetailResponse, Envelope};
use crate::solver::{ChallengeSolver, SolverError};
use crate::transport::{EnvelopeCall, PortalTransport};
use crate::TargetSpec;

pub fn detail_response(challenge_required: bool, key: &str, view_key: &str) -> JsonValue {
    json!({
        "captchaRequred": challenge_required,
        "captchaKey": key,
        "offenderViewKey": view_key,
        "offenderSpecialFields": [
            {"labelText": "Booking Date:", "offenderValue": "6/28/2024"}
        ],
        "cases": [{"caseNo": "24-001"}],
        "charges": [{"chargeDescription": "BURGLARY"}],
        "holds": [{"holdingAgency": "Harrison County"}]
    })
}

#[derive(Debug, Default)]
struct Script {
    listing: Vec<String>,
    demand_on_bootstrap: bool,
    drop_listing: bool,
    reject_answers: bool,
    challenge_fetches: usize,
    validations: Vec<String>,
    bootstrap_keys: Vec<String>,
    details: VecDeque<Result<JsonValue, u16>>,
    detail_requests: Vec<(String, String, String)>,
    envelopes: VecDeque<JsonValue>,
    envelope_calls: usize,
    cookie_opens: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn with_listing(ids: &[&str]) -> Self {
        let transport = Self::default();
        transport.lock().listing = ids.iter().map(|id| id.to_string()).collect();
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("script lock")
    }

    pub fn demand_challenge_on_bootstrap(&self) {
        self.lock().demand_on_bootstrap = true;
    }

    pub fn drop_bootstrap_listing(&self) {
        self.lock().drop_listing = true;
    }

    pub fn reject_all_answers(&self) {
        self.lock().reject_answers = true;
    }

    pub fn push_detail(&self, response: JsonValue) {
        self.lock().details.push_back(Ok(response));
    }

    pub fn push_detail_failure(&self, status: u16) {
        self.lock().details.push_back(Err(status));
    }

    pub fn push_envelope(&self, envelope: JsonValue) {
        self.lock().envelopes.push_back(envelope);
    }

    pub fn challenge_fetches(&self) -> usize {
        self.lock().challenge_fetches
    }

    pub fn validations(&self) -> Vec<String> {
        self.lock().validations.clone()
    }

    pub fn bootstrap_keys(&self) -> Vec<String> {
        self.lock().bootstrap_keys.clone()
    }

    /// `(identifier, view key, challenge key)` per detail request.
    pub fn detail_requests(&self) -> Vec<(String, String, String)> {
        self.lock().detail_requests.clone()
    }

    pub fn envelope_calls(&self) -> usize {
        self.lock().envelope_calls
    }

    pub fn cookie_opens(&self) -> usize {
        self.lock().cookie_opens
    }
}

#[async_trait]
impl PortalTransport for ScriptedTransport {
    async fn bootstrap(
        &self,
        _target: &TargetSpec,
        body: &ChallengeProtocol,
    ) -> Result<BootstrapResponse, TransportError> {
        let mut script = self.lock();
        script.bootstrap_keys.push(body.captcha_key.clone());
        let mut response = json!({
            "captchaRequred": script.demand_on_bootstrap,
            "captchaKey": body.captcha_key,
            "offenderViewKey": "view-0",
        });
        if !script.drop_listing {
            let rows: Vec<JsonValue> = script
                .listing
                .iter()
                .map(|id| json!({"arrestNo": id, "agencyName": "Sheriff"}))
                .collect();
            response["offenders"] = JsonValue::Array(rows);
        }
        Ok(serde_json::from_value(response).expect("bootstrap fixture"))
    }

    async fn fetch_challenge(&self, _target: &TargetSpec) -> Result<ChallengeProtocol, TransportError> {
        let mut script = self.lock();
        script.challenge_fetches += 1;
        Ok(ChallengeProtocol {
            captcha_key: format!("challenge-{}", script.challenge_fetches),
            captcha_image: Some("data:image/png;base64,AAAA".into()),
            user_code: None,
        })
    }

    async fn validate_challenge(
        &self,
        _target: &TargetSpec,
        answer: &ChallengeProtocol,
    ) -> Result<ChallengeResult, TransportError> {
        let mut script = self.lock();
        script
            .validations
            .push(answer.user_code.clone().unwrap_or_default());
        if script.reject_answers {
            return Ok(ChallengeResult::default());
        }
        Ok(ChallengeResult {
            captcha_matched: true,
            captcha_key: format!("solved-{}", script.validations.len()),
        })
    }

    async fn fetch_detail(
        &self,
        _target: &TargetSpec,
        identifier: &str,
        view_key: &str,
        body: &ChallengeProtocol,
    ) -> Result<DetailResponse, TransportError> {
        let mut script = self.lock();
        script.detail_requests.push((
            identifier.to_string(),
            view_key.to_string(),
            body.captcha_key.clone(),
        ));
        match script.details.pop_front().expect("unscripted detail request") {
            Ok(response) => Ok(serde_json::from_value(response).expect("detail fixture")),
            Err(status) => Err(TransportError::HttpStatus {
                status,
                url: format!("scripted://detail/{identifier}"),
            }),
        }
    }

    async fn open_cookie_session(&self, _target: &TargetSpec) -> Result<(), TransportError> {
        self.lock().cookie_opens += 1;
        Ok(())
    }

    async fn fetch_envelope(
        &self,
        _target: &TargetSpec,
        _call: EnvelopeCall<'_>,
    ) -> Result<Envelope, TransportError> {
        let mut script = self.lock();
        script.envelope_calls += 1;
        let envelope = script.envelopes.pop_front().expect("unscripted envelope call");
        Ok(serde_json::from_value(envelope).expect("envelope fixture"))
    }
}

/// Answers from a fixed sequence, then repeats the fallback (if any).
#[derive(Debug, Default)]
pub struct ScriptedSolver {
    answers: Mutex<VecDeque<String>>,
    fallback: Option<String>,
}

impl ScriptedSolver {
    pub fn always(answer: &str) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback: Some(answer.to_string()),
        }
    }

    pub fn sequence(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            fallback: None,
        }
    }
}

#[async_trait]
impl ChallengeSolver for ScriptedSolver {
    async fn solve(&self, _image: &str) -> Result<String, SolverError> {
        let next = self.answers.lock().expect("solver lock").pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| SolverError::Unavailable("script exhausted".into()))
    }
}

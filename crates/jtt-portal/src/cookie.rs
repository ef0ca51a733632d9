//! Plain-cookie session: older deployments that only need the index page's
//! session cookie and answer every call with a `{success, error, data}` envelope.

use std::sync::Arc;

use async_trait::async_trait;
use jtt_core::{EntityDetail, FieldMap, SubResourceKind};
use tracing::{debug, info};

use crate::error::{ChallengeError, ProtocolError, RecoverableFetchError, SessionError};
use crate::protocol::{pairs_to_detail, rows_to_field_maps, rows_to_summaries};
use crate::session::SessionPhase;
use crate::transport::{EnvelopeCall, PortalTransport};
use crate::{Listing, SessionStrategy, TargetSpec};

pub struct CookieSession {
    target: TargetSpec,
    transport: Arc<dyn PortalTransport>,
    phase: SessionPhase,
}

impl std::fmt::Debug for CookieSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSession")
            .field("target", &self.target.name)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl CookieSession {
    pub async fn connect(
        target: TargetSpec,
        transport: Arc<dyn PortalTransport>,
    ) -> Result<Self, SessionError> {
        transport.open_cookie_session(&target).await?;
        info!(jail = %target.name, "cookie session opened");
        Ok(Self {
            target,
            transport,
            phase: SessionPhase::Ready,
        })
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Terminated {
            return Err(ChallengeError::Terminated.into());
        }
        Ok(())
    }

    async fn envelope_rows(
        &mut self,
        call: EnvelopeCall<'_>,
    ) -> Result<(Vec<serde_json::Value>, Option<u64>), RecoverableFetchError> {
        self.phase = SessionPhase::RequestSent;
        let envelope = self.transport.fetch_envelope(&self.target, call).await;
        self.phase = SessionPhase::Ready;
        let envelope = envelope?;
        let total_count = envelope.total_count;
        Ok((envelope.into_rows()?, total_count))
    }
}

#[async_trait]
impl SessionStrategy for CookieSession {
    fn target(&self) -> &TargetSpec {
        &self.target
    }

    fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Nothing to iterate without a listing, so envelope failures here are fatal.
    async fn listing(&mut self) -> Result<Listing, SessionError> {
        self.ensure_live()?;
        let page_size = self.target.page_size;
        let (rows, total_count) = match self.envelope_rows(EnvelopeCall::Listing { page_size }).await {
            Ok(found) => found,
            Err(RecoverableFetchError::Transport(err)) => return Err(err.into()),
            Err(err) => return Err(ProtocolError::ListingRejected(err).into()),
        };
        let rows = rows_to_field_maps(rows).map_err(ProtocolError::ListingRejected)?;
        let entities = rows_to_summaries(rows, "listing")?;
        debug!(jail = %self.target.name, listed = entities.len(), ?total_count, "listing fetched");
        Ok(Listing {
            entities,
            total_count,
            page_size: Some(page_size),
        })
    }

    async fn request_detail(&mut self, identifier: &str) -> Result<EntityDetail, SessionError> {
        self.ensure_live()?;
        let (rows, _) = self.envelope_rows(EnvelopeCall::Detail { identifier }).await?;
        Ok(pairs_to_detail(&rows)?)
    }

    async fn request_collection(
        &mut self,
        kind: SubResourceKind,
        identifier: &str,
    ) -> Result<Vec<FieldMap>, SessionError> {
        self.ensure_live()?;
        let (rows, _) = self
            .envelope_rows(EnvelopeCall::Collection { kind, identifier })
            .await?;
        Ok(rows_to_field_maps(rows)?)
    }

    fn terminate(&mut self) {
        self.phase = SessionPhase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use crate::StrategyKind;
    use serde_json::json;

    fn target() -> TargetSpec {
        TargetSpec::new("Perry_County_MS", StrategyKind::Cookie).with_page_size(2)
    }

    #[tokio::test]
    async fn listing_and_detail_come_from_envelopes() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_envelope(json!({
            "success": true,
            "data": [{"ArrestNo": 101, "LastName": "DOE"}, {"ArrestNo": 102, "LastName": "ROE"}],
            "totalCount": 3
        }));
        transport.push_envelope(json!({
            "success": true,
            "data": [{"Field": "Last Name:", "Value": "DOE"}, {"Field": "City", "Value": "O&#39;Fallon"}]
        }));

        let mut session = CookieSession::connect(target(), transport.clone()).await.unwrap();
        let listing = session.listing().await.unwrap();
        assert_eq!(listing.entities[0].identifier, "101");
        assert!(listing.exceeds_page());

        let detail = session.request_detail("101").await.unwrap();
        assert_eq!(detail.get("Last Name"), Some("DOE"));
        assert_eq!(detail.get("City"), Some("O'Fallon"));
        assert_eq!(transport.cookie_opens(), 1);
    }

    #[tokio::test]
    async fn listing_envelope_failure_is_fatal() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_envelope(json!({"success": false, "error": "", "data": []}));
        let mut session = CookieSession::connect(target(), transport).await.unwrap();
        let err = session.listing().await.unwrap_err();
        assert!(err.is_session_fatal());
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::ListingRejected(RecoverableFetchError::Unsuccessful))
        ));
    }

    #[tokio::test]
    async fn collection_failures_are_recoverable() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_envelope(json!({"success": true, "error": "No cases", "data": []}));
        let mut session = CookieSession::connect(target(), transport).await.unwrap();
        let err = session
            .request_collection(SubResourceKind::Cases, "101")
            .await
            .unwrap_err();
        assert!(!err.is_session_fatal());
        assert!(matches!(
            err,
            SessionError::Fetch(RecoverableFetchError::PortalError(m)) if m == "No cases"
        ));
        assert_eq!(session.phase(), SessionPhase::Ready);
    }
}

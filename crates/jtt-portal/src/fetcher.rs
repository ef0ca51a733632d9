use chrono::Utc;
use jtt_core::{EntitySummary, IngestionRecord, SubResourceKind};
use tracing::warn;

use crate::error::{EntityError, SessionError};
use crate::{Listing, SessionStrategy};

/// Assembles records one entity at a time on top of a session.
#[derive(Debug, Clone)]
pub struct EntityFetcher {
    collections: Vec<SubResourceKind>,
}

impl Default for EntityFetcher {
    fn default() -> Self {
        Self {
            collections: SubResourceKind::ALL.to_vec(),
        }
    }
}

impl EntityFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts which sub-resource collections are requested.
    pub fn with_collections(mut self, collections: impl IntoIterator<Item = SubResourceKind>) -> Self {
        self.collections = collections.into_iter().collect();
        self
    }

    /// One listing page. Listings longer than a page are processed as returned
    /// and flagged, never silently cut.
    pub async fn listing(
        &self,
        session: &mut (dyn SessionStrategy + '_),
    ) -> Result<Listing, SessionError> {
        let listing = session.listing().await?;
        if listing.exceeds_page() {
            warn!(
                jail = %session.target().name,
                listed = listing.entities.len(),
                total = ?listing.total_count,
                "listing spans more than one page; only the first page is processed"
            );
        }
        Ok(listing)
    }

    /// Detail is required; sub-resource collections degrade to empty on failure.
    pub async fn fetch(
        &self,
        session: &mut (dyn SessionStrategy + '_),
        summary: &EntitySummary,
    ) -> Result<IngestionRecord, EntityError> {
        let identifier = summary.identifier.as_str();
        let detail = session
            .request_detail(identifier)
            .await
            .map_err(|source| EntityError {
                identifier: identifier.to_string(),
                source,
            })?;

        let mut record = IngestionRecord {
            target: session.target().name.clone(),
            identifier: identifier.to_string(),
            fetched_at: Utc::now(),
            detail,
            cases: Vec::new(),
            charges: Vec::new(),
            holds: session.loaded_holds(identifier),
            summary: summary.clone(),
        };
        for kind in &self.collections {
            let rows = match session.request_collection(*kind, identifier).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(
                        jail = %record.target,
                        identifier,
                        collection = %kind,
                        error = %err,
                        "sub-resource unavailable; keeping it empty"
                    );
                    Vec::new()
                }
            };
            match kind {
                SubResourceKind::Cases => record.cases = rows,
                SubResourceKind::Charges => record.charges = rows,
            }
        }
        Ok(record)
    }
}

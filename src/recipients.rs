use std::collections::HashSet;
use std::fmt::Debug;

use crate::domain::CampaignName;
use crate::domain::SubscriberEmail;
use crate::store::Store;
use crate::store::StoreError;
use crate::utils::error_chain_fmt;

#[derive(thiserror::Error)]
pub enum ResolveError {
    #[error("{0}")]
    Validation(String),
    #[error("Could not resolve campaign {campaign:?}")]
    Campaign {
        campaign: String,
        #[source]
        source: StoreError,
    },
}

impl Debug for ResolveError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Split a comma separated form field, trimming every item and dropping the
/// empty ones.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expands explicit addresses plus campaign names into the final recipient
/// list.
#[derive(Clone)]
pub struct RecipientResolver {
    store: Store,
}

impl RecipientResolver {
    pub fn new(store: Store) -> Self { Self { store } }

    /// Explicit addresses come first, then the members of each campaign in the
    /// order given. An address that appears more than once (in any case, with
    /// any surrounding whitespace) is kept only the first time.
    ///
    /// An invalid explicit address or an unknown campaign fails the whole call;
    /// nothing is dropped silently. Stored members that are no longer valid
    /// addresses are skipped with a warning.
    #[tracing::instrument(
        name = "Resolving recipients",
        skip_all,
        fields(n_explicit = explicit.len(), campaigns = ?campaigns)
    )]
    pub async fn resolve(
        &self,
        explicit: &[String],
        campaigns: &[String],
    ) -> Result<Vec<SubscriberEmail>, ResolveError> {
        let mut recipients = vec![];
        for raw in explicit {
            if raw.trim().is_empty() {
                continue;
            }
            let email = SubscriberEmail::parse(raw.clone())
                .map_err(|e| ResolveError::Validation(format!("recipients: {e}")))?;
            recipients.push(email);
        }

        for raw in campaigns {
            if raw.trim().is_empty() {
                continue;
            }
            let name = CampaignName::parse(raw.clone())
                .map_err(|e| ResolveError::Validation(format!("campaigns: {e}")))?;
            let members = self
                .store
                .resolve_list_members(&name)
                .await
                .map_err(|source| ResolveError::Campaign {
                    campaign: name.to_string(),
                    source,
                })?;
            for member in members {
                match SubscriberEmail::parse(member) {
                    Ok(email) => recipients.push(email),
                    Err(e) => tracing::warn!(
                        error.cause_chain = ?e,
                        campaign = %name,
                        "skipping invalid email"
                    ),
                }
            }
        }

        Ok(dedup(recipients))
    }
}

/// Keep the first occurrence of each address, comparing case-insensitively.
fn dedup(recipients: Vec<SubscriberEmail>) -> Vec<SubscriberEmail> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.dedup_key()))
        .collect()
}

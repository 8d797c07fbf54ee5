//! Rotating client identities.
//!
//! An [`Identity`] pairs a cookie session drawn from the session store with
//! an independently drawn fingerprint preset, rendered into a header set.
//! Sessions and fingerprints rotate separately to maximise diversity.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::modules::clock::SharedClock;
use crate::modules::rng::SharedRng;
use crate::modules::spoofing::{
    Fingerprint, FingerprintCatalog, HeaderTemplate, RenderContext, SpoofingError,
};
use crate::modules::store::{DEFAULT_STORE_ATTEMPTS, PoolRecord, PoolStore, StoreError, with_retries};

/// Stored session credentials for the upstream.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieSet {
    pub id: String,
    pub username: String,
    pub cookies: BTreeMap<String, String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

// Cookie values are credentials; keep them out of debug output.
impl fmt::Debug for CookieSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieSet")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("is_active", &self.is_active)
            .field("expires_at", &self.expires_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl CookieSet {
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            cookies: BTreeMap::new(),
            is_active: true,
            expires_at,
            last_used_at: None,
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// `name=value; name=value` rendering for the `Cookie` header.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl PoolRecord for CookieSet {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_used_at = Some(at);
    }

    fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active && self.expires_at <= now {
            self.is_active = false;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no active, unexpired session available")]
    NoIdentityAvailable,
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("header rendering failed: {0}")]
    Headers(#[from] SpoofingError),
}

/// Materials presented to the upstream for one attempt.
#[derive(Debug, Clone)]
pub struct Identity {
    pub session_id: String,
    pub username: String,
    pub fingerprint: Arc<Fingerprint>,
    pub headers: HeaderMap,
}

/// Supplies fresh identities from the session store and fingerprint catalog.
pub struct IdentityProvider {
    store: Arc<dyn PoolStore<CookieSet>>,
    catalog: FingerprintCatalog,
    template: HeaderTemplate,
    rng: SharedRng,
    clock: SharedClock,
}

impl fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("fingerprints", &self.catalog.len())
            .field("template_entries", &self.template.entries.len())
            .finish_non_exhaustive()
    }
}

impl IdentityProvider {
    pub fn new(
        store: Arc<dyn PoolStore<CookieSet>>,
        catalog: FingerprintCatalog,
        template: HeaderTemplate,
        rng: SharedRng,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            catalog,
            template,
            rng,
            clock,
        }
    }

    /// Draw a session and fingerprint, avoiding session `previous` when
    /// another eligible one exists.
    pub async fn next_identity(&self, previous: Option<&str>) -> Result<Identity, IdentityError> {
        let now = self.clock.now();
        let eligible: Vec<CookieSet> =
            with_retries(DEFAULT_STORE_ATTEMPTS, || self.store.list_active())
                .await?
                .into_iter()
                .filter(|session| session.is_eligible(now))
                .collect();

        if eligible.is_empty() {
            log::warn!("no eligible cookie sessions");
            return Err(IdentityError::NoIdentityAvailable);
        }

        let avoid = previous.and_then(|id| eligible.iter().position(|s| s.id == id));
        let mut session = eligible[self.rng.index_avoiding(eligible.len(), avoid)].clone();

        with_retries(DEFAULT_STORE_ATTEMPTS, || self.store.mark_used(&session.id, now)).await?;
        session.last_used_at = Some(now);

        let fingerprint = self.catalog.draw();
        let cookie_header = session.header_value();
        let headers = self.template.render(
            &fingerprint,
            &RenderContext {
                cookie_header: Some(&cookie_header),
            },
            &self.rng,
        )?;

        log::debug!(
            "drew identity session={} fingerprint={}",
            session.id,
            fingerprint.id
        );

        Ok(Identity {
            session_id: session.id,
            username: session.username,
            fingerprint,
            headers,
        })
    }

    /// Flip expired sessions to inactive in the backing store.
    pub async fn deactivate_expired(&self) -> Result<usize, IdentityError> {
        let now = self.clock.now();
        let changed =
            with_retries(DEFAULT_STORE_ATTEMPTS, || self.store.deactivate_expired(now)).await?;
        if changed > 0 {
            log::info!("deactivated {changed} expired sessions");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::{Clock, ManualClock};
    use crate::modules::store::MemoryStore;
    use std::time::Duration;

    fn provider(
        sessions: Vec<CookieSet>,
        clock: &ManualClock,
    ) -> (IdentityProvider, MemoryStore<CookieSet>) {
        let store = MemoryStore::with_records(sessions);
        let rng = SharedRng::from_seed(9);
        let provider = IdentityProvider::new(
            Arc::new(store.clone()),
            FingerprintCatalog::builtin(rng.clone()),
            HeaderTemplate::builtin(),
            rng,
            Arc::new(clock.clone()),
        );
        (provider, store)
    }

    #[tokio::test]
    async fn skips_expired_and_inactive_sessions() {
        let clock = ManualClock::default();
        let now = clock.now();
        let (provider, _) = provider(
            vec![
                CookieSet::new("expired", "a", now - chrono::Duration::seconds(1)),
                CookieSet::new("off", "b", now + chrono::Duration::hours(1)).inactive(),
                CookieSet::new("good", "c", now + chrono::Duration::hours(1))
                    .with_cookie("sessionid", "xyz"),
            ],
            &clock,
        );
        for _ in 0..10 {
            let identity = provider.next_identity(None).await.unwrap();
            assert_eq!(identity.session_id, "good");
            assert_eq!(identity.headers["cookie"], "sessionid=xyz");
        }
    }

    #[tokio::test]
    async fn session_is_not_reused_past_expiry() {
        let clock = ManualClock::default();
        let expires = clock.now() + chrono::Duration::minutes(5);
        let (provider, _) = provider(vec![CookieSet::new("s", "u", expires)], &clock);
        assert!(provider.next_identity(None).await.is_ok());

        clock.advance(Duration::from_secs(5 * 60));
        assert!(matches!(
            provider.next_identity(None).await,
            Err(IdentityError::NoIdentityAvailable)
        ));
    }

    #[tokio::test]
    async fn draw_updates_last_used() {
        let clock = ManualClock::default();
        let (provider, store) = provider(
            vec![CookieSet::new("s", "u", clock.now() + chrono::Duration::hours(1))],
            &clock,
        );
        provider.next_identity(None).await.unwrap();
        assert_eq!(store.get("s").unwrap().last_used_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn rotates_sessions_and_fingerprints() {
        let clock = ManualClock::default();
        let later = clock.now() + chrono::Duration::hours(1);
        let (provider, _) = provider(
            vec![CookieSet::new("s1", "u1", later), CookieSet::new("s2", "u2", later)],
            &clock,
        );
        let first = provider.next_identity(None).await.unwrap();
        let second = provider.next_identity(Some(&first.session_id)).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_ne!(first.fingerprint.id, second.fingerprint.id);
    }

    #[tokio::test]
    async fn deactivates_expired_sessions_in_store() {
        let clock = ManualClock::default();
        let now = clock.now();
        let (provider, store) = provider(
            vec![
                CookieSet::new("old", "a", now - chrono::Duration::minutes(1)),
                CookieSet::new("new", "b", now + chrono::Duration::minutes(1)),
            ],
            &clock,
        );
        assert_eq!(provider.deactivate_expired().await.unwrap(), 1);
        assert!(!store.get("old").unwrap().is_active);
        assert!(store.get("new").unwrap().is_active);
    }

    #[test]
    fn debug_output_hides_cookie_values() {
        let set = CookieSet::new("s", "u", Utc::now()).with_cookie("sessionid", "secret");
        let rendered = format!("{set:?}");
        assert!(rendered.contains("sessionid"));
        assert!(!rendered.contains("secret"));
    }
}

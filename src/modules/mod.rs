//! Cross-cutting services module
//!
//! Supplies the dispatcher with identities, proxies, pacing, health control,
//! caching, persistence, and observability.

pub mod cache;
pub mod clock;
pub mod events;
pub mod governor;
pub mod identity;
pub mod metrics;
pub mod pacing;
pub mod proxy;
pub mod rng;
pub mod spoofing;
pub mod store;

// Re-export commonly used types
pub use cache::{DEFAULT_CACHE_TTL, ResponseCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use events::{
    AttemptEvent, AttemptStatus, CompletedEvent, DispatchEvent, EventDispatcher, EventHandler,
    FallbackEvent, LoggingHandler, MetricsHandler, RejectReason, RejectedEvent, RetryEvent,
    SubmittedEvent,
};
pub use governor::{
    GovernorConfig, GovernorError, GovernorState, HealthGovernor, HealthSnapshot, HistoryEntry,
};
pub use identity::{CookieSet, Identity, IdentityError, IdentityProvider};
pub use metrics::{GlobalStats, HostStats, MetricsCollector, MetricsSnapshot};
pub use pacing::{Pacer, PacingConfig};
pub use proxy::{
    ProxyDescriptor, ProxyError, ProxyHealthReport, ProxyLease, ProxyProtocol, ProxySelector,
    ProxyStats, RotationStrategy,
};
pub use rng::SharedRng;
pub use spoofing::{
    Fingerprint, FingerprintCatalog, HeaderTemplate, RenderContext, SpoofingError, looks_automated,
};
pub use store::{
    DEFAULT_STORE_ATTEMPTS, MemoryStore, PoolRecord, PoolStore, RedbStore, StoreError, with_retries,
};

//! # egress-dispatch
//!
//! A resilient outbound-request dispatcher for upstreams that actively
//! detect and throttle automated clients.
//!
//! Every logical request is driven through a bounded worker pool that
//! rotates egress proxies, cookie sessions, and browser fingerprints between
//! attempts, paces itself like a human, and backs off globally when the
//! upstream starts refusing.
//!
//! ## Features
//!
//! - Bounded worker pool with FIFO draining
//! - Retry with identity and proxy rotation on 403/429 and block pages
//! - Direct fallback when a proxy fails at connection level
//! - Health governor with cooldown circuit and throughput throttle
//! - Buffered JSON/text/bytes or streamed response bodies
//! - TTL response cache for de-duplicating logical requests
//! - In-memory and `redb` backed proxy/session pools
//! - Injectable clock and seedable randomness for deterministic tests
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use egress_dispatch::{CookieSet, Dispatcher, MemoryStore, ProxyDescriptor, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let expires = chrono::Utc::now() + chrono::Duration::days(7);
//!     let sessions = MemoryStore::with_records([
//!         CookieSet::new("s1", "alice", expires).with_cookie("sessionid", "abc"),
//!     ]);
//!     let proxies = MemoryStore::with_records([ProxyDescriptor::new("p1", "10.0.0.1", 8080)]);
//!
//!     let dispatcher = Dispatcher::builder()
//!         .with_session_store(Arc::new(sessions))
//!         .with_proxy_store(Arc::new(proxies))
//!         .build()?;
//!
//!     let response = dispatcher
//!         .submit("https://example.com/api/users/alice", RequestOptions::json())
//!         .await?;
//!     println!("{:?}", response.json());
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```

mod dispatcher;

pub mod config;
pub mod modules;
pub mod transport;

pub use crate::dispatcher::{
    DispatchError,
    DispatchResponse,
    DispatchResult,
    Dispatcher,
    DispatcherBuilder,
    DispatcherConfig,
    QueuedRequest,
    RequestOptions,
    ResponseMode,
};

pub use crate::config::{ConfigError, DispatchSettings};

pub use crate::transport::{
    BodyStream,
    ReqwestTransport,
    ResponseBody,
    Transport,
    TransportConfig,
    TransportError,
    TransportRequest,
    TransportResponse,
};

pub use crate::modules::{
    Clock,
    CookieSet,
    DispatchEvent,
    EventDispatcher,
    EventHandler,
    Fingerprint,
    FingerprintCatalog,
    GovernorConfig,
    GovernorError,
    GovernorState,
    HeaderTemplate,
    HealthGovernor,
    HealthSnapshot,
    Identity,
    IdentityProvider,
    LoggingHandler,
    ManualClock,
    MemoryStore,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    Pacer,
    PacingConfig,
    PoolRecord,
    PoolStore,
    ProxyDescriptor,
    ProxyHealthReport,
    ProxyProtocol,
    ProxySelector,
    RedbStore,
    ResponseCache,
    RotationStrategy,
    SharedClock,
    SharedRng,
    StoreError,
    SystemClock,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

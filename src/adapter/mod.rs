//! Tool adapters: the uniform contract between the pipeline and upstreams.
//!
//! An adapter translates `(action, params, credential)` into one upstream
//! call. Adapters never retry internally (retries belong to the pipeline)
//! and must respect the deadline they are handed; overrunning it surfaces
//! as a retryable timeout. Failure classification rides on the error type:
//! [`Error::Upstream`]/[`Error::UpstreamTimeout`] are retryable,
//! [`Error::UpstreamTerminal`] is not.
//!
//! Two operating modes exist: **live** adapters call the real providers,
//! **mock** adapters synthesize deterministic responses so tests and chaos
//! runs cover the full pipeline. The two are registered under identical
//! route keys; only the upstream leg differs.

pub mod live;
pub mod mock;

pub use mock::{MockAdapter, MockBehavior, MockOutcome};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;

use crate::{Error, Result};

/// The adapter contract.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Perform one upstream call.
    ///
    /// `credential` is the decrypted upstream credential for the tool; it is
    /// borrowed from a scoped acquisition and must not be copied out or
    /// logged. The call must complete before `deadline`.
    async fn invoke(
        &self,
        action: &str,
        params: &Value,
        credential: &[u8],
        deadline: Instant,
    ) -> Result<Bytes>;
}

/// Dispatch table from (tool, action) to an adapter.
///
/// Populated once at process init; lookups are lock-free reads.
pub struct AdapterRegistry {
    routes: DashMap<(String, String), Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Register an adapter for a route. Later registrations win.
    pub fn register(&self, tool: &str, action: &str, adapter: Arc<dyn ToolAdapter>) {
        self.routes
            .insert((tool.to_string(), action.to_string()), adapter);
    }

    /// Look up the adapter for a route.
    pub fn get(&self, tool: &str, action: &str) -> Result<Arc<dyn ToolAdapter>> {
        self.routes
            .get(&(tool.to_string(), action.to_string()))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Validation(format!("unknown route {tool}:{action}")))
    }

    /// Registered (tool, action) routes.
    #[must_use]
    pub fn routes(&self) -> Vec<(String, String)> {
        let mut routes: Vec<(String, String)> =
            self.routes.iter().map(|entry| entry.key().clone()).collect();
        routes.sort();
        routes
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The built-in routes every deployment carries.
pub const BUILTIN_ROUTES: &[(&str, &str)] = &[
    ("serpapi", "search"),
    ("http_fetch", "get"),
    ("openai", "chat"),
    ("gmail_send", "send"),
];

/// Register mock adapters for every built-in route.
///
/// `chaos_fraction` forces that share of calls to a retryable failure to
/// exercise breakers and retries.
#[must_use]
pub fn register_builtin_mocks(registry: &AdapterRegistry, chaos_fraction: f64) -> Vec<Arc<MockAdapter>> {
    let mut mocks = Vec::new();
    for (tool, action) in BUILTIN_ROUTES {
        let mock = Arc::new(MockAdapter::new(
            tool,
            action,
            MockBehavior {
                fail_fraction: chaos_fraction,
                ..MockBehavior::default()
            },
        ));
        registry.register(tool, action, Arc::clone(&mock) as Arc<dyn ToolAdapter>);
        mocks.push(mock);
    }
    mocks
}

/// Register live adapters for every built-in route.
pub fn register_builtin_live(registry: &AdapterRegistry, client: reqwest::Client, max_fetch_bytes: u64) {
    registry.register(
        "serpapi",
        "search",
        Arc::new(live::SerpApiAdapter::new(client.clone())),
    );
    registry.register(
        "http_fetch",
        "get",
        Arc::new(live::HttpFetchAdapter::new(client.clone(), max_fetch_bytes)),
    );
    registry.register(
        "openai",
        "chat",
        Arc::new(live::OpenAiChatAdapter::new(client.clone())),
    );
    registry.register(
        "gmail_send",
        "send",
        Arc::new(live::GmailSendAdapter::new(client)),
    );
}

// HTTP server.
//
// All collaborators (providers, store, audit, mail, pass-throughs) are
// constructed here and injected; handlers reach them through shared state
// rather than module-level singletons, so tests can swap in doubles.

mod handlers;
mod middleware;
mod passthrough;

pub use middleware::RateLimiter;
pub use passthrough::PassThroughClient;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::AuditSink;
use crate::config::{Config, FeaturesConfig};
use crate::dispatch::DispatchTable;
use crate::errors::EngineResult;
use crate::mail::{LoggingMailer, MailTransport, RelayMailer};
use crate::providers::{GeminiProvider, LlmProvider, OpenAiProvider, SpeechProvider};
use crate::store::FileStore;
use crate::stream::StreamCoordinator;

/// Request body cap. Generous for natural-language payloads while blocking
/// oversized uploads.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct EngineServer {
    pub(crate) dispatch: DispatchTable,
    pub(crate) store: FileStore,
    pub(crate) audit: AuditSink,
    pub(crate) coordinator: StreamCoordinator,
    /// Cloud providers, looked up by name for the proxy endpoints.
    pub(crate) providers: Vec<Arc<dyn LlmProvider>>,
    pub(crate) speech: Arc<dyn SpeechProvider>,
    pub(crate) mailer: Arc<dyn MailTransport>,
    pub(crate) analytics: PassThroughClient,
    pub(crate) payments: PassThroughClient,
    pub(crate) limiter: RateLimiter,
    pub(crate) features: FeaturesConfig,
    bind_address: String,
}

impl EngineServer {
    pub fn new(config: Config) -> EngineResult<Self> {
        let gemini = Arc::new(GeminiProvider::new(config.providers.google_api_key.clone())?);
        let openai = Arc::new(OpenAiProvider::new(config.providers.openai_api_key.clone())?);

        let streaming_provider: Arc<dyn LlmProvider> = match config.providers.preferred.as_str() {
            "openai" => openai.clone(),
            _ => gemini.clone(),
        };

        let mailer: Arc<dyn MailTransport> = match &config.mail.relay_url {
            Some(relay) => Arc::new(RelayMailer::new(
                relay.clone(),
                config
                    .mail
                    .from_address
                    .clone()
                    .unwrap_or_else(|| "noreply@nobleworld.example".to_string()),
            )?),
            None => Arc::new(LoggingMailer),
        };

        Ok(Self {
            dispatch: DispatchTable::standard()?,
            store: FileStore::new(config.data_dir.clone())?,
            audit: AuditSink::new(config.audit_dir.clone()),
            coordinator: StreamCoordinator::new(streaming_provider),
            providers: vec![gemini.clone(), openai],
            speech: gemini,
            mailer,
            analytics: PassThroughClient::new(
                "analytics",
                config.collaborators.analytics_url.clone(),
            )?,
            payments: PassThroughClient::new(
                "payments",
                config.collaborators.payments_url.clone(),
            )?,
            limiter: RateLimiter::new(config.server.requests_per_second, config.server.burst),
            features: config.features,
            bind_address: config.server.bind_address,
        })
    }

    /// Swap the mail transport (tests).
    pub fn with_mailer(mut self, mailer: Arc<dyn MailTransport>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Swap the providers backing the proxy endpoints (tests).
    pub fn with_providers(mut self, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        self.providers = providers;
        self
    }

    /// Resolve a proxy provider by name.
    pub(crate) fn provider_for_name(&self, name: &str) -> Option<&Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Build the axum application. Every request goes through the dispatch
    /// table; axum's own path routing is deliberately unused.
    pub fn app(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(handlers::dispatch_request)
            .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self)
    }

    /// Bind and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = self.bind_address.parse()?;
        let server = Arc::new(self);

        // Idle rate-limiter buckets are purged in the background so the
        // actor map cannot grow without bound.
        let limiter = server.limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tick.tick().await;
                limiter.purge_idle(600);
            }
        });

        let app = server.app();
        tracing::info!("Clarity engine listening on {addr}");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

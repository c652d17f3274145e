//! One chat turn: route, dispatch, assemble, complete, record.
//!
//! The session lock is taken before routing and released after the reply is
//! appended, so turns on one session never interleave. Nothing is appended
//! until the completion step has produced a reply; a cancelled turn leaves
//! the session untouched.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::assembler::ContextAssembler;
use super::completion::CompletionService;
use super::error::ChatError;
use super::event::TurnEvent;
use super::router::{build_router, select_invocations, IntentRouter};
use super::session::{ConversationSession, RetentionPolicy, SessionStore, SharedSession};
use crate::adapters::metrics_handler::MetricsCollector;
use crate::config::{BusyPolicy, ConfigGeneration, RouterStrategy, SettingsHandle};
use crate::domain::{ChatMessage, ContextBundle};
use crate::mcp::dispatcher::{DispatchLimits, Dispatcher};
use crate::mcp::registry::ProviderRegistry;

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub reply: ChatMessage,
    pub context: ContextBundle,
}

pub struct TurnPipeline {
    settings: Arc<SettingsHandle>,
    registry: Arc<ProviderRegistry>,
    dispatcher: Arc<Dispatcher>,
    completion: CompletionService,
    sessions: Arc<SessionStore>,
    metrics: Arc<MetricsCollector>,
    router: RwLock<(RouterStrategy, Arc<dyn IntentRouter>)>,
}

/// Keeps the in-flight gauge accurate whichever way a turn ends
struct InFlight<'a>(&'a MetricsCollector);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a MetricsCollector) -> Self {
        metrics.turns_in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.turns_in_flight.dec();
    }
}

impl TurnPipeline {
    pub fn new(
        settings: Arc<SettingsHandle>,
        registry: Arc<ProviderRegistry>,
        completion: CompletionService,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let generation = settings.current();
        let strategy = generation.settings.chat.router;
        let router = build_router(strategy, Some(completion.llm().clone()), metrics.clone());
        Self {
            sessions: Arc::new(SessionStore::with_retention(
                generation.settings.chat.history_capacity,
                RetentionPolicy {
                    max_sessions: generation.settings.chat.max_sessions,
                    idle_ttl: generation.settings.chat.session_idle_ttl(),
                },
            )),
            dispatcher: Arc::new(Dispatcher::new(registry.clone(), metrics.clone())),
            router: RwLock::new((strategy, router)),
            settings,
            registry,
            completion,
            metrics,
        }
    }

    /// Replace the routing strategy, e.g. with a scripted one in tests
    pub fn with_router(self, router: Arc<dyn IntentRouter>) -> Self {
        let strategy = self.router.read().0;
        *self.router.write() = (strategy, router);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn settings(&self) -> &Arc<SettingsHandle> {
        &self.settings
    }

    /// Router for the strategy of the current generation
    fn router_for(&self, strategy: RouterStrategy) -> Arc<dyn IntentRouter> {
        {
            let current = self.router.read();
            if current.0 == strategy {
                return current.1.clone();
            }
        }
        info!(strategy = ?strategy, "Switching intent router");
        let router = build_router(strategy, Some(self.completion.llm().clone()), self.metrics.clone());
        *self.router.write() = (strategy, router.clone());
        router
    }

    async fn acquire(
        &self,
        session_id: &str,
        session: SharedSession,
        policy: BusyPolicy,
    ) -> Result<OwnedMutexGuard<ConversationSession>, ChatError> {
        match policy {
            BusyPolicy::Queue => Ok(session.lock_owned().await),
            BusyPolicy::Reject => session.try_lock_owned().map_err(|_| {
                self.metrics.turns_total.with_label_values(&["busy"]).inc();
                ChatError::SessionBusy(session_id.to_string())
            }),
        }
    }

    /// Route, dispatch and assemble the context for one message
    async fn gather(
        &self,
        generation: &ConfigGeneration,
        message: &str,
        history: &[ChatMessage],
    ) -> ContextBundle {
        let turn_id = Uuid::new_v4().to_string();
        let settings = &generation.settings;

        let available = self.registry.available_capabilities();
        let router = self.router_for(settings.chat.router);
        let invocations = select_invocations(router.as_ref(), message, history, &available).await;
        if invocations.is_empty() {
            debug!(turn_id = %turn_id, "No tools selected");
            return ContextBundle::empty(turn_id);
        }

        let limits = DispatchLimits {
            invocation_timeout: settings.chat.invocation_timeout(),
            turn_timeout: settings.chat.turn_timeout(),
        };
        let results = self.dispatcher.dispatch(invocations, limits).await;
        let bundle = ContextAssembler::new(settings.context.max_bytes).assemble(&turn_id, &results);
        if bundle.truncated() {
            self.metrics
                .context_truncations
                .with_label_values(&["size_cap"])
                .inc();
        }
        bundle
    }

    /// Run a turn and return the full reply
    #[instrument(skip(self, message), fields(session = session_id.unwrap_or("new")))]
    pub async fn submit_turn(
        &self,
        session_id: Option<&str>,
        message: &str,
    ) -> Result<TurnOutcome, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            self.metrics.turns_total.with_label_values(&["empty"]).inc();
            return Err(ChatError::EmptyMessage);
        }

        let started = Instant::now();
        let _in_flight = InFlight::enter(&self.metrics);
        let generation = self.settings.current();
        let (session_id, session) = self.sessions.get_or_create(session_id);
        let mut session = self
            .acquire(&session_id, session, generation.settings.chat.busy_policy)
            .await?;

        let history = session.snapshot();
        // Stamped at turn start, appended only once a reply exists
        let question = ChatMessage::user(message);
        let bundle = self.gather(&generation, message, &history).await;
        let reply = self
            .completion
            .complete(&generation.settings.chat, &history, &bundle, message)
            .await
            .with_context(bundle.clone());

        session.append(question);
        session.append(reply.clone());
        drop(session);

        self.finish("sync", &reply, started);
        Ok(TurnOutcome {
            session_id,
            reply,
            context: bundle,
        })
    }

    /// Run a turn, streaming frames into `sink`.
    ///
    /// Every turn that gets to run ends with `Done`; turns refused up front
    /// emit `Error` then `Done`. Dropping the receiver cancels the turn.
    pub async fn run_turn_streaming(
        &self,
        session_id: Option<&str>,
        message: &str,
        sink: mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome, ChatError> {
        let result = self.stream_turn(session_id, message, &sink).await;
        match &result {
            Ok(_) => {
                let _ = sink.send(TurnEvent::Done).await;
            }
            Err(ChatError::Cancelled) => {
                self.metrics.turns_total.with_label_values(&["cancelled"]).inc();
                info!("Turn cancelled by client, session left unchanged");
            }
            Err(e) => {
                let _ = sink.send(TurnEvent::error(e)).await;
                let _ = sink.send(TurnEvent::Done).await;
            }
        }
        result
    }

    #[instrument(skip(self, message, sink), fields(session = session_id.unwrap_or("new")))]
    async fn stream_turn(
        &self,
        session_id: Option<&str>,
        message: &str,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            self.metrics.turns_total.with_label_values(&["empty"]).inc();
            return Err(ChatError::EmptyMessage);
        }

        let started = Instant::now();
        let _in_flight = InFlight::enter(&self.metrics);
        let generation = self.settings.current();
        let (session_id, session) = self.sessions.get_or_create(session_id);
        let mut session = tokio::select! {
            _ = sink.closed() => return Err(ChatError::Cancelled),
            guard = self.acquire(&session_id, session, generation.settings.chat.busy_policy) => guard?,
        };

        let history = session.snapshot();
        let question = ChatMessage::user(message);
        let bundle = self.gather(&generation, message, &history).await;
        if sink
            .send(TurnEvent::Context {
                bundle: bundle.summary(),
            })
            .await
            .is_err()
        {
            return Err(ChatError::Cancelled);
        }

        let reply = self
            .completion
            .complete_streaming(&generation.settings.chat, &history, &bundle, message, sink)
            .await?
            .with_context(bundle.clone());

        session.append(question);
        session.append(reply.clone());
        drop(session);

        self.finish("stream", &reply, started);
        Ok(TurnOutcome {
            session_id,
            reply,
            context: bundle,
        })
    }

    fn finish(&self, mode: &str, reply: &ChatMessage, started: Instant) {
        let outcome = if reply.degraded { "degraded" } else { "ok" };
        self.metrics.turns_total.with_label_values(&[outcome]).inc();
        self.metrics
            .turn_duration
            .with_label_values(&[mode])
            .observe(started.elapsed().as_secs_f64());
        debug!(
            outcome,
            mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn finished"
        );
    }
}

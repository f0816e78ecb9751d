//! Agent runtime.
//!
//! Wires one transport session to the dispatcher and queue engine, routes
//! inbound traffic, and runs the background sweeps.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use control_link_core::{EventStore, LinkConfig, Operation, SharedClock, SystemClock};
use control_link_executor::{
    CommandDispatcher, OperationRegistry, ParamValidator, QueueEngine, TaskHistory,
    register_queue_commands,
};
use control_link_transport::{
    AccessPolicy, Connector, TokenIssuer, TransportError, TransportSession, protocol::message_type,
};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

/// Interval of the history and queue sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Agent error.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Agent already started")]
    AlreadyStarted,
}

/// Builder for an [`Agent`].
pub struct AgentBuilder {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    policy: Option<Arc<dyn AccessPolicy>>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    clock: SharedClock,
    events: Arc<EventStore>,
    sweep_interval: Duration,
}

impl AgentBuilder {
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = Some(issuer);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<EventStore>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the agent. The built-in queue commands are registered.
    #[must_use]
    pub fn build(self) -> Agent {
        let command_timeout = self.config.command_timeout();

        let mut session = TransportSession::builder(self.config, self.connector)
            .clock(Arc::clone(&self.clock))
            .events(Arc::clone(&self.events));
        if let Some(policy) = self.policy {
            session = session.policy(policy);
        }
        if let Some(issuer) = self.token_issuer {
            session = session.token_issuer(issuer);
        }
        let (session, inbound) = session.build();

        let sink = Arc::new(session.clone());
        let registry = Arc::new(OperationRegistry::new());
        let history = Arc::new(
            TaskHistory::new(Arc::clone(&self.clock)).with_events(Arc::clone(&self.events)),
        );
        let queues = Arc::new(
            QueueEngine::new(Arc::clone(&registry), sink.clone(), Arc::clone(&self.clock))
                .with_events(Arc::clone(&self.events))
                .with_default_timeout(command_timeout),
        );
        register_queue_commands(&registry, &queues);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&history),
            sink,
            self.clock,
        ));

        Agent {
            session,
            registry,
            history,
            dispatcher,
            queues,
            events: self.events,
            inbound: Mutex::new(Some(inbound)),
            shutdown: CancellationToken::new(),
            sweep_interval: self.sweep_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// The agent: one session, one dispatcher, one queue engine.
pub struct Agent {
    session: TransportSession,
    registry: Arc<OperationRegistry>,
    history: Arc<TaskHistory>,
    dispatcher: Arc<CommandDispatcher>,
    queues: Arc<QueueEngine>,
    events: Arc<EventStore>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    shutdown: CancellationToken,
    sweep_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Start building an agent.
    #[must_use]
    pub fn builder(config: LinkConfig, connector: Arc<dyn Connector>) -> AgentBuilder {
        AgentBuilder {
            config,
            connector,
            policy: None,
            token_issuer: None,
            clock: SystemClock::shared(),
            events: Arc::new(EventStore::new()),
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    /// Register an operation.
    pub fn register(&self, command_type: impl Into<String>, operation: Arc<dyn Operation>) {
        self.registry.register(command_type, operation);
    }

    /// Register an operation guarded by a parameter validator.
    pub fn register_validated(
        &self,
        command_type: impl Into<String>,
        operation: Arc<dyn Operation>,
        validator: impl ParamValidator + 'static,
    ) {
        self.registry
            .register_validated(command_type, operation, validator);
    }

    /// Start routing and sweeping, then connect.
    ///
    /// Routing keeps running when the first connection attempt fails;
    /// reconnection is already scheduled where applicable.
    ///
    /// # Errors
    /// Returns error if already started, or if the first connection attempt
    /// failed.
    pub async fn start(&self) -> Result<(), AgentError> {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AgentError::AlreadyStarted)?;

        let router = tokio::spawn(route(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.registry),
            inbound,
            self.shutdown.clone(),
        ));
        let sweeper = tokio::spawn(sweep(
            Arc::clone(&self.history),
            Arc::clone(&self.queues),
            self.sweep_interval,
            self.shutdown.clone(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([router, sweeper]);

        tracing::info!(operations = ?self.registry.types(), "Agent started");
        self.session.connect().await?;
        Ok(())
    }

    /// Disconnect and stop background work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.session.disconnect();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Agent task ended abnormally: {e}");
            }
        }
        tracing::info!("Agent stopped");
    }

    #[must_use]
    pub const fn session(&self) -> &TransportSession {
        &self.session
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn history(&self) -> &Arc<TaskHistory> {
        &self.history
    }

    #[must_use]
    pub const fn queues(&self) -> &Arc<QueueEngine> {
        &self.queues
    }

    #[must_use]
    pub const fn events(&self) -> &Arc<EventStore> {
        &self.events
    }
}

/// Route inbound messages. Each command runs on its own task so a slow
/// operation never holds up the next message.
async fn route(
    dispatcher: Arc<CommandDispatcher>,
    registry: Arc<OperationRegistry>,
    mut inbound: mpsc::UnboundedReceiver<Value>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // Anything naming a registered type is answered, even without a
        // command id, so the controller learns it was malformed.
        let is_command = message.get("command_id").is_some()
            || message_type(&message).is_some_and(|t| registry.contains(t));
        if is_command {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(message).await });
        } else {
            tracing::debug!(message_type = ?message_type(&message), "Ignoring non-command message");
        }
    }
    tracing::debug!("Router stopped");
}

async fn sweep(
    history: Arc<TaskHistory>,
    queues: Arc<QueueEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let tasks = history.prune();
                let finished = queues.sweep();
                tracing::trace!(tasks, finished, "Sweep complete");
            }
        }
    }
}

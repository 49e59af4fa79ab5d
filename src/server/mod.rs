//! Server module - the GenServer behaviour and the handle used to drive it.

pub(crate) mod contract;
mod envelope;
pub(crate) mod observer;
pub(crate) mod reply;
mod runner;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

pub use contract::{ContractRole, JsonShape, TypeContract};
pub use observer::{LogObserver, NoopObserver, Observer};
pub use reply::CorrelationToken;

use crate::config::ServerConfig;
use envelope::{Envelope, MailboxSender};
use reply::{ReplyRouter, ReplySlot};
use runner::ServerRunner;

/// What a caller receives for a call the server accepted: the handler's reply, or the
/// failure that replaced it.
pub type CallResult<R> = Result<R, HandlerFailure>;

/// The callbacks of a server definition.
///
/// A definition is moved into its worker task on `start` and only ever touched from
/// there. Handlers see the current state by reference and return the next one; when a
/// handler fails, the state it was given stays current.
#[async_trait]
pub trait GenServer: TypeContract + Send + 'static {
    /// Passed from `start` to `init`.
    type InitArgs: Send + 'static;
    /// Returned to callers of `call`.
    type Reply: Send + 'static;

    /// Produces the initial state. A failure here stops the server for good.
    async fn init(&mut self, args: Self::InitArgs) -> anyhow::Result<Self::State>;

    /// Handles a fire-and-forget message.
    async fn handle_cast(
        &mut self,
        msg: Self::Cast,
        _state: &Self::State,
    ) -> anyhow::Result<Self::State> {
        Err(anyhow::anyhow!("unhandled cast message: {:?}", msg))
    }

    /// Handles a request and returns the reply together with the next state.
    async fn handle_call(
        &mut self,
        msg: Self::Call,
        _state: &Self::State,
    ) -> anyhow::Result<(Self::Reply, Self::State)> {
        Err(anyhow::anyhow!("unhandled call message: {:?}", msg))
    }

    /// Runs once on a graceful shutdown, with the last state.
    async fn terminate(&mut self, _state: Self::State) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Cast,
    Call,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Cast => write!(f, "handle_cast"),
            HandlerKind::Call => write!(f, "handle_call"),
        }
    }
}

/// A handler returned an error or panicked.
///
/// For calls this is handed back to the caller as the reply; the server itself keeps
/// running.
#[derive(Error, Debug)]
#[error("{kind} failed: {error:#}")]
pub struct HandlerFailure {
    kind: HandlerKind,
    error: anyhow::Error,
}

impl HandlerFailure {
    pub fn new(kind: HandlerKind, error: anyhow::Error) -> Self {
        HandlerFailure { kind, error }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn into_error(self) -> anyhow::Error {
        self.error
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Server has already run to completion")]
    Finished,

    #[error("Expected a valid {role}, got {value}")]
    TypeMismatch { role: ContractRole, value: String },

    #[error("No reply received within {0:?}")]
    CallTimeout(Duration),

    #[error("Server did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("Server worker could not be spawned: {0}")]
    SpawnError(String),
}

impl ServerError {
    pub(crate) fn mismatch<T: fmt::Debug>(role: ContractRole, value: &T) -> Self {
        ServerError::TypeMismatch {
            role,
            value: format!("{value:?}"),
        }
    }
}

/// Lifecycle of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Constructed, never started.
    Idle,
    Running,
    /// Terminate enqueued, worker still draining.
    Stopping,
    /// Worker exited. Final.
    Stopped,
}

impl Status {
    pub(crate) fn is_live(self) -> bool {
        matches!(self, Status::Running | Status::Stopping)
    }
}

struct Control<G: GenServer> {
    status: Status,
    server: Option<G>,
    sender: Option<MailboxSender<G>>,
    worker: Option<JoinHandle<()>>,
}

/// Everything the handles and the worker share. Lifecycle changes and enqueueing both
/// happen under the `control` lock, so a message is either ahead of `Terminate` in the
/// mailbox or rejected.
struct Shared<G: GenServer> {
    name: String,
    config: ServerConfig,
    observer: Arc<dyn Observer>,
    router: Arc<ReplyRouter<G::Reply>>,
    control: Mutex<Control<G>>,
}

impl<G: GenServer> Shared<G> {
    fn control(&self) -> MutexGuard<'_, Control<G>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> Status {
        self.control().status
    }

    /// Called by the worker on its way out, however it leaves.
    fn finish(&self) {
        let mut control = self.control();
        control.status = Status::Stopped;
        control.sender = None;
        control.worker = None;
        self.router.abandon_all();
    }
}

/// Configures a server before it is wrapped in a [`ServerRef`].
pub struct ServerBuilder<G: GenServer> {
    server: G,
    name: Option<String>,
    config: ServerConfig,
    observer: Arc<dyn Observer>,
}

impl<G: GenServer> ServerBuilder<G> {
    pub fn new(server: G) -> Self {
        ServerBuilder {
            server,
            name: None,
            config: ServerConfig::default(),
            observer: Arc::new(LogObserver),
        }
    }

    /// Name used in log lines and observer reports.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> ServerRef<G> {
        let name = self.name.unwrap_or_else(default_name::<G>);
        let router = Arc::new(ReplyRouter::new(name.clone(), self.observer.clone()));
        let shared = Shared {
            name,
            config: self.config,
            observer: self.observer,
            router,
            control: Mutex::new(Control {
                status: Status::Idle,
                server: Some(self.server),
                sender: None,
                worker: None,
            }),
        };
        ServerRef {
            shared: Arc::new(shared),
        }
    }
}

fn default_name<G>() -> String {
    let full = std::any::type_name::<G>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

/// A clonable handle to one server instance.
pub struct ServerRef<G: GenServer> {
    shared: Arc<Shared<G>>,
}

impl<G: GenServer> Clone for ServerRef<G> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<G: GenServer> ServerRef<G> {
    /// Wraps a definition with the default name, config and observer. The server is idle
    /// until [`start`](Self::start).
    pub fn new(server: G) -> Self {
        ServerBuilder::new(server).build()
    }

    pub fn builder(server: G) -> ServerBuilder<G> {
        ServerBuilder::new(server)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.router.pending()
    }

    /// Spawns the worker on the current tokio runtime. The worker runs `init` before
    /// taking any message; `start` itself does not wait for it.
    pub fn start(&self, args: G::InitArgs) -> Result<(), ServerError> {
        let mut control = self.shared.control();
        match control.status {
            Status::Idle => {}
            Status::Running | Status::Stopping => return Err(ServerError::AlreadyRunning),
            Status::Stopped => return Err(ServerError::Finished),
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| ServerError::SpawnError(error.to_string()))?;
        let Some(server) = control.server.take() else {
            return Err(ServerError::Finished);
        };

        let (sender, receiver) = envelope::mailbox();
        let runner = ServerRunner::new(server, receiver, self.shared.clone());
        control.status = Status::Running;
        control.sender = Some(sender);
        control.worker = Some(runtime.spawn(runner.run(args)));
        Ok(())
    }

    /// Stops the server, waiting for the configured stop timeout (forever by default).
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.stop_inner(self.shared.config.stop_timeout).await
    }

    /// Stops the server, waiting at most `timeout` for the worker to exit. On
    /// [`ServerError::StopTimeout`] the worker keeps shutting down in the background.
    pub async fn stop_timeout(&self, timeout: Duration) -> Result<(), ServerError> {
        self.stop_inner(Some(timeout)).await
    }

    async fn stop_inner(&self, timeout: Option<Duration>) -> Result<(), ServerError> {
        let worker = self.begin_stop()?;
        log::debug!("Stopping server '{}'...", self.name());

        let Some(worker) = worker else {
            return Ok(());
        };
        let joined = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, worker)
                .await
                .map_err(|_| ServerError::StopTimeout(timeout))?,
            None => worker.await,
        };
        if let Err(error) = joined {
            log::error!("Server '{}' worker ended abnormally: {}", self.name(), error);
        }
        Ok(())
    }

    fn begin_stop(&self) -> Result<Option<JoinHandle<()>>, ServerError> {
        let mut control = self.shared.control();
        if control.status != Status::Running {
            return Err(ServerError::NotRunning);
        }
        control.status = Status::Stopping;
        if let Some(sender) = &control.sender {
            if let Err(error) = sender.send(Envelope::Terminate) {
                log::error!("Failed to send terminate to '{}'! {}", self.name(), error);
            }
        }
        Ok(control.worker.take())
    }

    /// Fire and forget. Returns once the message is in the mailbox.
    pub fn cast(&self, msg: G::Cast) -> Result<(), ServerError> {
        let control = self.shared.control();
        if control.status != Status::Running {
            return Err(ServerError::NotRunning);
        }
        if !G::is_valid_cast(&msg) {
            return Err(ServerError::mismatch(ContractRole::Cast, &msg));
        }
        let sender = control.sender.as_ref().ok_or(ServerError::NotRunning)?;
        sender.send(Envelope::Cast(msg)).map_err(|error| {
            log::error!("Failed to cast message to '{}'! {}", self.name(), error);
            ServerError::NotRunning
        })
    }

    /// Sends a request and waits for its reply, for the configured call timeout (forever
    /// by default).
    pub async fn call(&self, msg: G::Call) -> Result<CallResult<G::Reply>, ServerError> {
        let slot = self.enqueue_call(msg)?;
        slot.wait(self.shared.config.call_timeout).await
    }

    /// Sends a request and waits at most `timeout` for its reply. A reply that arrives
    /// after the deadline is discarded.
    pub async fn call_timeout(
        &self,
        msg: G::Call,
        timeout: Duration,
    ) -> Result<CallResult<G::Reply>, ServerError> {
        let slot = self.enqueue_call(msg)?;
        slot.wait(Some(timeout)).await
    }

    fn enqueue_call(&self, msg: G::Call) -> Result<ReplySlot<G::Reply>, ServerError> {
        let control = self.shared.control();
        if control.status != Status::Running {
            return Err(ServerError::NotRunning);
        }
        if !G::is_valid_call(&msg) {
            return Err(ServerError::mismatch(ContractRole::Call, &msg));
        }
        let sender = control.sender.as_ref().ok_or(ServerError::NotRunning)?;

        let token = CorrelationToken::new();
        let slot = self.shared.router.register(token);
        let envelope = Envelope::Call {
            payload: msg,
            token: slot.token(),
        };
        sender.send(envelope).map_err(|error| {
            log::error!("Failed to call '{}'! {}", self.name(), error);
            ServerError::NotRunning
        })?;
        Ok(slot)
    }
}

impl<G: GenServer> fmt::Debug for ServerRef<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.shared.name, self.status())
    }
}

//! Server runner - the single worker that owns a server's state.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;

use super::{
    ContractRole, GenServer, HandlerFailure, HandlerKind, ServerError, Shared,
    envelope::{Envelope, MailboxReceiver},
    reply::CorrelationToken,
};

/// The current state. Every write is checked against the contract.
struct StateCell<G: GenServer> {
    state: G::State,
}

impl<G: GenServer> StateCell<G> {
    fn new(state: G::State) -> anyhow::Result<Self> {
        Self::check(&state)?;
        Ok(StateCell { state })
    }

    fn get(&self) -> &G::State {
        &self.state
    }

    /// Leaves the current state in place when `next` fails the check.
    fn set(&mut self, next: G::State) -> anyhow::Result<()> {
        Self::check(&next)?;
        self.state = next;
        Ok(())
    }

    fn into_inner(self) -> G::State {
        self.state
    }

    // The check and the `Debug` rendering are user code, so a panic in either is
    // contained like a handler panic.
    fn check(state: &G::State) -> anyhow::Result<()> {
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            if G::is_valid_state(state) {
                Ok(())
            } else {
                Err(ServerError::mismatch(ContractRole::State, state))
            }
        }))
        .map_err(panic_error)??;
        Ok(())
    }
}

/// Marks the server stopped when the worker leaves, even by unwinding.
struct ExitGuard<G: GenServer> {
    shared: Arc<Shared<G>>,
}

impl<G: GenServer> Drop for ExitGuard<G> {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

pub(super) struct ServerRunner<G: GenServer> {
    server: G,
    receiver: MailboxReceiver<G>,
    shared: Arc<Shared<G>>,
}

impl<G: GenServer> ServerRunner<G> {
    pub(super) fn new(server: G, receiver: MailboxReceiver<G>, shared: Arc<Shared<G>>) -> Self {
        ServerRunner {
            server,
            receiver,
            shared,
        }
    }

    pub(super) async fn run(mut self, args: G::InitArgs) {
        let _exit = ExitGuard {
            shared: self.shared.clone(),
        };
        log::debug!("Starting server '{}'...", self.shared.name);

        let mut state = match self.init(args).await {
            Ok(state) => state,
            Err(error) => {
                self.shared.observer.init_failed(&self.shared.name, &error);
                return;
            }
        };
        log::debug!("Server '{}' has started successfully.", self.shared.name);

        self.process(&mut state).await;
        self.terminate(state).await;

        log::debug!("Server '{}' stopped.", self.shared.name);
    }

    async fn init(&mut self, args: G::InitArgs) -> anyhow::Result<StateCell<G>> {
        let state = AssertUnwindSafe(self.server.init(args))
            .catch_unwind()
            .await
            .map_err(panic_error)??;
        StateCell::new(state)
    }

    async fn process(&mut self, state: &mut StateCell<G>) {
        let poll_interval = self.shared.config.poll_interval;

        // The bounded wait only exists so the status gets re-checked.
        while self.shared.status().is_live() {
            let envelope = match tokio::time::timeout(poll_interval, self.receiver.recv()).await {
                Ok(Some(envelope)) => envelope,
                // Unreachable while `Control` holds the sender. Breaking keeps a closed
                // mailbox from spinning the loop.
                Ok(None) => {
                    self.shared
                        .observer
                        .loop_fault(&self.shared.name, "mailbox closed while running");
                    break;
                }
                Err(_) => continue,
            };

            match envelope {
                Envelope::Terminate => {
                    log::debug!("Server '{}' received terminate.", self.shared.name);
                    break;
                }
                Envelope::Call { payload, token } => self.process_call(payload, token, state).await,
                Envelope::Cast(payload) => self.process_cast(payload, state).await,
            }
        }
    }

    async fn process_call(
        &mut self,
        payload: G::Call,
        token: CorrelationToken,
        state: &mut StateCell<G>,
    ) {
        let outcome = AssertUnwindSafe(self.server.handle_call(payload, state.get()))
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok((reply, next))) => state.set(next).map(|()| reply),
            Ok(Err(error)) => Err(error),
            Err(panic) => Err(panic_error(panic)),
        };
        let reply = reply.map_err(|error| {
            let failure = HandlerFailure::new(HandlerKind::Call, error);
            self.shared.observer.handler_failed(&self.shared.name, &failure);
            failure
        });

        self.shared.router.deliver(token, reply);
    }

    async fn process_cast(&mut self, payload: G::Cast, state: &mut StateCell<G>) {
        let outcome = AssertUnwindSafe(self.server.handle_cast(payload, state.get()))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(next)) => state.set(next),
            Ok(Err(error)) => Err(error),
            Err(panic) => Err(panic_error(panic)),
        };
        if let Err(error) = result {
            let failure = HandlerFailure::new(HandlerKind::Cast, error);
            self.shared.observer.handler_failed(&self.shared.name, &failure);
        }
    }

    async fn terminate(&mut self, state: StateCell<G>) {
        let outcome = AssertUnwindSafe(self.server.terminate(state.into_inner()))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(panic_error(panic)),
        };
        if let Err(error) = result {
            self.shared
                .observer
                .terminate_failed(&self.shared.name, &error);
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    anyhow::anyhow!("panicked: {}", message)
}

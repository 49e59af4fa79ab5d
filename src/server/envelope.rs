//! Server envelopes - what travels through a server's mailbox.

use std::fmt;

use tokio::sync::mpsc;

use super::{GenServer, reply::CorrelationToken};

pub(crate) enum Envelope<G: GenServer> {
    Cast(G::Cast),
    Call {
        payload: G::Call,
        token: CorrelationToken,
    },
    Terminate,
}

impl<G: GenServer> fmt::Debug for Envelope<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Cast(payload) => f.debug_tuple("Cast").field(payload).finish(),
            Envelope::Call { payload, token } => f
                .debug_struct("Call")
                .field("payload", payload)
                .field("token", token)
                .finish(),
            Envelope::Terminate => write!(f, "Terminate"),
        }
    }
}

pub(crate) type MailboxReceiver<G> = mpsc::UnboundedReceiver<Envelope<G>>;
pub(crate) type MailboxSender<G> = mpsc::UnboundedSender<Envelope<G>>;

pub(crate) fn mailbox<G: GenServer>() -> (MailboxSender<G>, MailboxReceiver<G>) {
    mpsc::unbounded_channel()
}

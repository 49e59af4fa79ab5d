//! tokio-genserver - an Erlang/OTP style GenServer on top of tokio.
//!
//! A server owns private state and handles its messages one at a time, in the order they
//! were sent. Messages are either casts (fire-and-forget) or calls (request/reply, with an
//! optional deadline on the caller's side). Handler failures and panics are contained per
//! message: a failing call hands a [`HandlerFailure`] back to its caller and the server
//! carries on.
//!
//! Implement [`TypeContract`] to declare the message and state types, [`GenServer`] for
//! the callbacks, then drive the server through a [`ServerRef`].

pub mod config;
mod server;

pub use config::ServerConfig;
pub use server::{
    CallResult, ContractRole, CorrelationToken, GenServer, HandlerFailure, HandlerKind,
    JsonShape, LogObserver, NoopObserver, Observer, ServerBuilder, ServerError, ServerRef,
    Status, TypeContract,
};

pub use async_trait::async_trait;

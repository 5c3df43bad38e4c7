// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The seam between the session router and whatever carries invocations
//!
//! The router never frames or dispatches calls itself; it decides *whether* and
//! *where* an invocation may go, and hands it to an [InvocationTransport].

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{ops::Deref, sync::Arc};

use super::session::{ConnectionId, SessionId};

/// Where an invocation is headed; for client calls this names a backend
pub type RouteAddress = String;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
  pub target: RouteAddress,
  pub operation: String,
  #[serde(default)]
  pub payload: Vec<u8>,
}

impl Invocation {
  pub fn new<T: Into<RouteAddress>, O: Into<String>>(target: T, operation: O, payload: Vec<u8>) -> Self {
    Self {
      target: target.into(),
      operation: operation.into(),
      payload,
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationReply {
  #[serde(default)]
  pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  #[error("Target {0} is unreachable")]
  Unreachable(RouteAddress),
  #[error("Connection closed before delivery completed")]
  ConnectionClosed,
  #[error("Delivery timed out")]
  TimedOut,
  #[error("Peer refused the invocation: {0}")]
  Refused(String),
  #[error("Peer broke protocol: {0}")]
  Protocol(String),
  #[error("Peer is not keeping up with deliveries")]
  Backlogged,
}

/// Delivers invocations on behalf of the router.
///
/// Invocations reaching this trait have already been authorized; implementations
/// only move them. Calls toward backends carry the originating session so a
/// backend may address callbacks to it.
#[cfg_attr(test, mockall::automock)]
pub trait InvocationTransport: Send + Sync {
  /// Forwards a client-originated invocation to the backend named by its target
  fn send_to_backend(
    &self,
    origin: SessionId,
    invocation: Invocation,
  ) -> BoxFuture<'static, Result<InvocationReply, TransportError>>;

  /// Forwards a backend callback to the client on the given connection
  fn send_to_client(
    &self,
    connection: ConnectionId,
    invocation: Invocation,
  ) -> BoxFuture<'static, Result<(), TransportError>>;
}

pub type ArcTransport = Arc<dyn InvocationTransport + 'static>;

impl<T> InvocationTransport for T
where
  T: Deref + Send + Sync,
  <T as Deref>::Target: InvocationTransport,
{
  fn send_to_backend(
    &self,
    origin: SessionId,
    invocation: Invocation,
  ) -> BoxFuture<'static, Result<InvocationReply, TransportError>> {
    self.deref().send_to_backend(origin, invocation)
  }

  fn send_to_client(
    &self,
    connection: ConnectionId,
    invocation: Invocation,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    self.deref().send_to_client(connection, invocation)
  }
}

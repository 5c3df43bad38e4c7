// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Session routing: authentication, per-connection session lifetime, and forwarding

use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::broadcast::{channel as event_channel, Sender as Broadcaster};
use tracing_futures::Instrument;

use crate::common::{
  authentication::{ArcVerifier, VerificationDenied},
  session::{
    table::{AdmissionError, InsertionError},
    ConnectionId, ForwardingTarget, Session, SessionGrant, SessionId, SessionTable,
  },
  transport::{ArcTransport, Invocation, InvocationReply, RouteAddress, TransportError},
};

pub const DEFAULT_ROUTER_IDENTITY: &str = "Warden/router";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOptions {
  /// Name under which clients address the router itself
  pub identity: String,
  /// Server-facing endpoint advertised in callback targets; `None` disables callbacks
  pub server_endpoint: Option<String>,
  /// Backends clients may invoke; targets outside this set are refused
  pub backends: BTreeSet<RouteAddress>,
}

impl Default for RouterOptions {
  fn default() -> Self {
    Self {
      identity: DEFAULT_ROUTER_IDENTITY.to_string(),
      server_endpoint: None,
      backends: BTreeSet::new(),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
  #[error(transparent)]
  Denied(#[from] VerificationDenied),
  #[error("Connection already holds a session")]
  AlreadyAuthenticated,
  #[error("Authentication already in progress")]
  AuthenticationInProgress,
  #[error("Connection closed during authentication")]
  Cancelled,
  #[error("Router is shutting down")]
  ShuttingDown,
  #[error("Conflicting sessions were found for the connection and destroyed")]
  SessionConflict,
}

impl AuthenticationError {
  /// Returns `true` if the credentials themselves were refused, or could not be checked
  #[must_use]
  pub fn is_denial(&self) -> bool {
    matches!(self, Self::Denied(_))
  }
}

impl From<AdmissionError> for AuthenticationError {
  fn from(e: AdmissionError) -> Self {
    match e {
      AdmissionError::AlreadyAuthenticated => Self::AlreadyAuthenticated,
      AdmissionError::InProgress => Self::AuthenticationInProgress,
      AdmissionError::Closed => Self::ShuttingDown,
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
  #[error("Session not found")]
  SessionNotFound,
  #[error("Callbacks are disabled without a server endpoint")]
  CallbacksDisabled,
  #[error("Target {0} is not a configured backend")]
  UnknownBackend(RouteAddress),
  #[error("Forwarding failed: {0}")]
  Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
  ConnectionClosed,
  Logout,
  Shutdown,
  /// A second session was found for one connection; both were discarded
  Conflict,
}

#[derive(Debug, Clone)]
pub struct SessionDestroyed {
  pub session_id: SessionId,
  pub connection: ConnectionId,
  pub user_id: String,
  pub reason: DestroyReason,
}

/// Grants sessions to authenticated connections and routes invocations through them.
///
/// The router owns the live session table. Verification runs outside the table lock;
/// only its outcome is committed under it. Connection closure is reported through
/// [SessionRouter::connection_closed], which also aborts any verification still in
/// flight for that connection.
pub struct SessionRouter {
  options: RouterOptions,
  verifier: ArcVerifier,
  transport: ArcTransport,
  table: SessionTable,

  // event hooks
  pub session_created: Broadcaster<Arc<Session>>,
  pub session_destroyed: Broadcaster<SessionDestroyed>,
}

impl SessionRouter {
  pub fn new(options: RouterOptions, verifier: ArcVerifier, transport: ArcTransport) -> Self {
    Self {
      options,
      verifier,
      transport,
      table: SessionTable::new(),

      // Receivers are created on demand through Sender::subscribe
      session_created: event_channel(32).0,
      session_destroyed: event_channel(32).0,
    }
  }

  pub fn identity(&self) -> &str {
    &self.options.identity
  }

  pub fn options(&self) -> &RouterOptions {
    &self.options
  }

  /// Authenticates a connection and grants it a session.
  ///
  /// Fails without side effects if the connection already has a session or another
  /// attempt for it is still being verified.
  pub async fn create_session(
    &self,
    connection: ConnectionId,
    user_id: &str,
    secret: &str,
  ) -> Result<SessionGrant, AuthenticationError> {
    let span = tracing::debug_span!("authentication", ?connection, user_id);
    self
      .authenticate(connection, user_id, secret)
      .instrument(span)
      .await
  }

  async fn authenticate(
    &self,
    connection: ConnectionId,
    user_id: &str,
    secret: &str,
  ) -> Result<SessionGrant, AuthenticationError> {
    let attempt = self.table.begin_authentication(connection).map_err(|e| {
      tracing::debug!(reason = ?e, "Authentication attempt refused");
      AuthenticationError::from(e)
    })?;

    let verdict = tokio::select! {
      biased;
      _ = attempt.cancelled() => {
        tracing::debug!("Connection closed while awaiting verification");
        return Err(AuthenticationError::Cancelled);
      }
      verdict = self.verifier.verify(user_id, secret) => verdict,
    };
    if let Err(denied) = verdict {
      tracing::info!(reason = denied.reason(), "Authentication denied");
      return Err(denied.into());
    }

    let session = Session::new(connection, user_id, self.options.server_endpoint.as_deref());
    match attempt.complete(session) {
      Ok(session) => {
        tracing::info!(session = ?session.id(), "Session created");
        let grant = SessionGrant {
          session_id: session.id(),
          router_identity: self.options.identity.clone(),
          callback_target: session.client_forwarding_target().cloned(),
        };
        // Ignore error as it occurs only when no receivers exist to read the event
        let _ = self.session_created.send(session);
        Ok(grant)
      }
      Err(InsertionError::Cancelled) => {
        tracing::debug!("Connection closed before the session could be stored");
        Err(AuthenticationError::Cancelled)
      }
      Err(InsertionError::Closed) => Err(AuthenticationError::ShuttingDown),
      Err(InsertionError::Conflict { evicted }) => {
        tracing::error!(
          evicted = ?evicted.id(),
          "Connection already held a session at insertion; destroying it"
        );
        self.announce_destroyed(&evicted, DestroyReason::Conflict);
        Err(AuthenticationError::SessionConflict)
      }
    }
  }

  /// Forwards a client's invocation toward the backend it names.
  ///
  /// Only configured backends are reachable; any other target is refused before
  /// the transport sees it.
  pub async fn forward_from_client(
    &self,
    connection: ConnectionId,
    invocation: Invocation,
  ) -> Result<InvocationReply, RoutingError> {
    let session = self
      .table
      .lookup(connection)
      .ok_or(RoutingError::SessionNotFound)?;
    if !self.options.backends.contains(&invocation.target) {
      tracing::warn!(
        session = ?session.id(),
        target = %invocation.target,
        "Refusing to forward to an unconfigured backend"
      );
      return Err(RoutingError::UnknownBackend(invocation.target));
    }
    let span = tracing::trace_span!(
      "forward",
      session = ?session.id(),
      target = %invocation.target,
      operation = %invocation.operation,
    );
    let reply = self
      .transport
      .send_to_backend(session.id(), invocation)
      .instrument(span)
      .await;
    reply.map_err(|e| {
      tracing::debug!(error = ?e, "Forwarding to backend failed");
      RoutingError::from(e)
    })
  }

  /// Forwards a backend callback to the client owning the addressed session
  pub async fn forward_to_client(
    &self,
    category: &SessionId,
    invocation: Invocation,
  ) -> Result<(), RoutingError> {
    if self.options.server_endpoint.is_none() {
      return Err(RoutingError::CallbacksDisabled);
    }
    let session = self
      .table
      .lookup_by_id(category)
      .ok_or(RoutingError::SessionNotFound)?;
    let span = tracing::trace_span!(
      "callback",
      session = ?session.id(),
      operation = %invocation.operation,
    );
    self
      .transport
      .send_to_client(session.connection(), invocation)
      .instrument(span)
      .await
      .map_err(RoutingError::from)
  }

  /// Returns the callback target backends should use to reach this connection's client
  pub fn server_target(
    &self,
    connection: ConnectionId,
  ) -> Result<Option<ForwardingTarget>, RoutingError> {
    let session = self
      .table
      .lookup(connection)
      .ok_or(RoutingError::SessionNotFound)?;
    Ok(session.client_forwarding_target().cloned())
  }

  /// Explicit logout; a no-op for connections without a live session
  pub fn destroy_session(&self, connection: ConnectionId) -> Option<SessionId> {
    let session = self.table.remove(connection)?;
    self.announce_destroyed(&session, DestroyReason::Logout);
    Some(session.id())
  }

  /// Transport notification that a connection is gone.
  ///
  /// Aborts any authentication in flight for it and destroys its session, if any.
  pub fn connection_closed(&self, connection: ConnectionId) -> Option<SessionId> {
    let session = self.table.close_connection(connection)?;
    self.announce_destroyed(&session, DestroyReason::ConnectionClosed);
    Some(session.id())
  }

  /// Destroys every live session and refuses new ones; returns how many were destroyed
  pub fn shutdown(&self) -> usize {
    let destroyed = self.table.close();
    for session in destroyed.iter() {
      self.announce_destroyed(session, DestroyReason::Shutdown);
    }
    tracing::info!(count = destroyed.len(), "Session router shut down");
    destroyed.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.table.is_closed()
  }

  pub fn session(&self, connection: ConnectionId) -> Option<Arc<Session>> {
    self.table.lookup(connection)
  }

  pub fn session_count(&self) -> usize {
    self.table.len()
  }

  pub fn sessions(&self) -> Vec<Arc<Session>> {
    self.table.snapshot()
  }

  fn announce_destroyed(&self, session: &Session, reason: DestroyReason) {
    tracing::info!(
      session = ?session.id(),
      connection = ?session.connection(),
      ?reason,
      "Session destroyed"
    );
    // Ignore error as it occurs only when no receivers exist to read the event
    let _ = self.session_destroyed.send(SessionDestroyed {
      session_id: session.id(),
      connection: session.connection(),
      user_id: session.user_id().to_string(),
      reason,
    });
  }
}

impl std::fmt::Debug for SessionRouter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionRouter")
      .field("options", &self.options)
      .field("verifier", &self.verifier)
      .field("table", &self.table)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests;

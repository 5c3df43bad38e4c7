// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::{BTreeMap, HashMap},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{ConnectionId, Session, SessionId};
use crate::util::dropkick::{Dropkick, DropkickSync};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
  #[error("Connection already holds a session")]
  AlreadyAuthenticated,
  #[error("Authentication already in progress for this connection")]
  InProgress,
  #[error("Session table is closed")]
  Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum InsertionError {
  #[error("Authentication attempt was cancelled before its session could be stored")]
  Cancelled,
  #[error("Session table closed while authentication was in progress")]
  Closed,
  #[error("Connection already held session {:?}", .evicted.id())]
  Conflict { evicted: Arc<Session> },
}

#[derive(Default)]
struct TableState {
  sessions: BTreeMap<ConnectionId, Arc<Session>>,
  by_id: HashMap<SessionId, ConnectionId>,
  /// Connections with a verification in flight, keyed to the attempt that owns the slot
  authenticating: BTreeMap<ConnectionId, (u64, CancellationToken)>,
  last_attempt: u64,
  closed: bool,
}

impl TableState {
  fn detach(&mut self, connection: ConnectionId) -> Option<Arc<Session>> {
    let session = self.sessions.remove(&connection)?;
    self.by_id.remove(&session.id());
    if !session.mark_destroyed() {
      tracing::error!(
        session = ?session.id(),
        ?connection,
        "Live session table held a session that was already destroyed"
      );
    }
    Some(session)
  }
}

/// The live session table, mapping each connection to at most one [Session].
///
/// Every access happens under a single lock which is never held across an await.
/// Sessions enter only through [AuthenticationAttempt::complete] and leave only
/// through removal, and removal flags them destroyed within the same critical
/// section, so no reader can observe a removed session as live.
#[derive(Default)]
pub struct SessionTable {
  state: Mutex<TableState>,
}

impl SessionTable {
  pub fn new() -> Self {
    Self::default()
  }

  // Critical sections never panic midway, so a poisoned lock still guards consistent state
  fn state(&self) -> MutexGuard<'_, TableState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Reserves the right to create a session for `connection`.
  ///
  /// The reservation is released if the returned attempt is dropped without completing,
  /// and is cancelled if the connection closes before completion.
  pub fn begin_authentication(
    &self,
    connection: ConnectionId,
  ) -> Result<AuthenticationAttempt<'_>, AdmissionError> {
    let mut state = self.state();
    if state.closed {
      return Err(AdmissionError::Closed);
    }
    if state.sessions.contains_key(&connection) {
      return Err(AdmissionError::AlreadyAuthenticated);
    }
    if state.authenticating.contains_key(&connection) {
      return Err(AdmissionError::InProgress);
    }
    state.last_attempt += 1;
    let attempt = state.last_attempt;
    let cancellation = CancellationToken::new();
    state
      .authenticating
      .insert(connection, (attempt, cancellation.clone()));
    Ok(AuthenticationAttempt {
      release: Dropkick::new(ReleaseAttempt {
        table: self,
        connection,
        attempt,
      }),
      cancellation,
    })
  }

  fn release(&self, connection: ConnectionId, attempt: u64) {
    let mut state = self.state();
    if matches!(state.authenticating.get(&connection), Some((owner, _)) if *owner == attempt) {
      state.authenticating.remove(&connection);
    }
  }

  fn insert(
    &self,
    connection: ConnectionId,
    attempt: u64,
    session: Session,
  ) -> Result<Arc<Session>, InsertionError> {
    let mut state = self.state();
    let owns_slot = matches!(
      state.authenticating.get(&connection),
      Some((owner, cancellation)) if *owner == attempt && !cancellation.is_cancelled()
    );
    if !owns_slot {
      return Err(InsertionError::Cancelled);
    }
    state.authenticating.remove(&connection);
    if state.closed {
      return Err(InsertionError::Closed);
    }
    if let Some(evicted) = state.detach(connection) {
      return Err(InsertionError::Conflict { evicted });
    }
    let session = Arc::new(session);
    state.by_id.insert(session.id(), connection);
    state.sessions.insert(connection, Arc::clone(&session));
    Ok(session)
  }

  pub fn lookup(&self, connection: ConnectionId) -> Option<Arc<Session>> {
    let state = self.state();
    state
      .sessions
      .get(&connection)
      .filter(|session| !session.is_destroyed())
      .cloned()
  }

  pub fn lookup_by_id(&self, session_id: &SessionId) -> Option<Arc<Session>> {
    let state = self.state();
    state
      .by_id
      .get(session_id)
      .and_then(|connection| state.sessions.get(connection))
      .filter(|session| !session.is_destroyed())
      .cloned()
  }

  /// Removes and destroys the connection's session, if it has one
  pub fn remove(&self, connection: ConnectionId) -> Option<Arc<Session>> {
    self.state().detach(connection)
  }

  /// Cancels any authentication in flight for the connection, then removes its session
  pub fn close_connection(&self, connection: ConnectionId) -> Option<Arc<Session>> {
    let mut state = self.state();
    if let Some((_, cancellation)) = state.authenticating.remove(&connection) {
      cancellation.cancel();
    }
    state.detach(connection)
  }

  /// Refuses all further authentication and destroys every live session
  pub fn close(&self) -> Vec<Arc<Session>> {
    let mut state = self.state();
    state.closed = true;
    for (_, (_, cancellation)) in std::mem::take(&mut state.authenticating) {
      cancellation.cancel();
    }
    let connections: Vec<ConnectionId> = state.sessions.keys().copied().collect();
    connections
      .into_iter()
      .filter_map(|connection| state.detach(connection))
      .collect()
  }

  pub fn is_closed(&self) -> bool {
    self.state().closed
  }

  pub fn len(&self) -> usize {
    self.state().sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state().sessions.is_empty()
  }

  pub fn authenticating_count(&self) -> usize {
    self.state().authenticating.len()
  }

  pub fn snapshot(&self) -> Vec<Arc<Session>> {
    self.state().sessions.values().cloned().collect()
  }
}

impl std::fmt::Debug for SessionTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state();
    f.debug_struct("SessionTable")
      .field("sessions", &state.sessions.len())
      .field("authenticating", &state.authenticating.len())
      .field("closed", &state.closed)
      .finish()
  }
}

struct ReleaseAttempt<'a> {
  table: &'a SessionTable,
  connection: ConnectionId,
  attempt: u64,
}

impl DropkickSync for ReleaseAttempt<'_> {
  fn dropkick(self) {
    self.table.release(self.connection, self.attempt);
  }
}

/// A reserved authentication slot for one connection
pub struct AuthenticationAttempt<'a> {
  release: Dropkick<ReleaseAttempt<'a>>,
  cancellation: CancellationToken,
}

impl<'a> AuthenticationAttempt<'a> {
  /// Resolves when the connection closes or the table shuts down
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.cancellation.cancelled()
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancellation.is_cancelled()
  }

  /// Stores the session, unless the attempt was cancelled in the meantime
  pub fn complete(self, session: Session) -> Result<Arc<Session>, InsertionError> {
    let reservation = match self.release.counter_take() {
      Some(reservation) => reservation,
      None => return Err(InsertionError::Cancelled),
    };
    let ReleaseAttempt {
      table,
      connection,
      attempt,
    } = reservation;
    table.insert(connection, attempt, session)
  }
}

impl std::fmt::Debug for AuthenticationAttempt<'_> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut d = f.debug_struct("AuthenticationAttempt");
    if let Some(reservation) = self.release.get() {
      d.field("connection", &reservation.connection)
        .field("attempt", &reservation.attempt);
    }
    d.field("cancelled", &self.is_cancelled()).finish()
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection authenticated state

use serde::{Deserialize, Serialize};
use std::{
  sync::atomic::{AtomicBool, Ordering},
  time::SystemTime,
};

pub mod id;
pub mod table;

pub use self::id::{ConnectionId, ConnectionIdGenerator, MonotonicAtomicGenerator, SessionId};
pub use self::table::SessionTable;

/// An address through which backends reach one specific session's client.
///
/// `endpoint` is the router's server-facing endpoint, and `category` selects the session.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardingTarget {
  pub endpoint: String,
  pub category: SessionId,
}

impl std::fmt::Display for ForwardingTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}@{}", self.category, self.endpoint)
  }
}

impl std::fmt::Debug for ForwardingTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ForwardingTarget")
      .field(&format_args!("{}", self))
      .finish()
  }
}

/// The authenticated state of a single connection.
///
/// A session is created once, bound to the connection that authenticated it, and
/// destroyed at most once. Destroyed sessions are never revived; holders of an
/// `Arc<Session>` must check [Session::is_destroyed] before relying on it.
pub struct Session {
  id: SessionId,
  connection: ConnectionId,
  user_id: String,
  client_forwarding_target: Option<ForwardingTarget>,
  created_at: SystemTime,
  destroyed: AtomicBool,
}

impl Session {
  pub(crate) fn new(connection: ConnectionId, user_id: &str, server_endpoint: Option<&str>) -> Self {
    let id = SessionId::generate();
    Self {
      id,
      connection,
      user_id: user_id.to_string(),
      client_forwarding_target: server_endpoint.map(|endpoint| ForwardingTarget {
        endpoint: endpoint.to_string(),
        category: id,
      }),
      created_at: SystemTime::now(),
      destroyed: AtomicBool::new(false),
    }
  }

  pub fn id(&self) -> SessionId {
    self.id
  }

  pub fn connection(&self) -> ConnectionId {
    self.connection
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  pub fn client_forwarding_target(&self) -> Option<&ForwardingTarget> {
    self.client_forwarding_target.as_ref()
  }

  pub fn created_at(&self) -> SystemTime {
    self.created_at
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::Acquire)
  }

  /// Flags the session as destroyed; returns `false` if it already was.
  pub(crate) fn mark_destroyed(&self) -> bool {
    !self.destroyed.swap(true, Ordering::AcqRel)
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.id)
      .field("connection", &self.connection)
      .field("user_id", &self.user_id)
      .field("client_forwarding_target", &self.client_forwarding_target)
      .field("destroyed", &self.is_destroyed())
      .finish_non_exhaustive()
  }
}

/// What a client receives after a successful authentication
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
  pub session_id: SessionId,
  pub router_identity: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub callback_target: Option<ForwardingTarget>,
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle for a transport-level connection, assigned by whoever accepts it
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ConnectionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<ConnectionId> for u64 {
  fn from(id: ConnectionId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ConnectionId").field(&self.0).finish()
  }
}

pub trait ConnectionIdGenerator {
  fn next(&self) -> ConnectionId;
}

pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl ConnectionIdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> ConnectionId {
    MonotonicAtomicGenerator::next(self)
  }
}

/// Process-unique session identifier; backends use it as the category of callback targets
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4())
  }

  pub fn as_uuid(&self) -> &uuid::Uuid {
    &self.0
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0.as_hyphenated(), f)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "SessionId({})", self)
  }
}

impl std::str::FromStr for SessionId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    uuid::Uuid::parse_str(s).map(Self)
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::BoxFuture;
use std::{ops::Deref, sync::Arc};

/// Reason reported for unknown users and mismatched secrets alike
pub const INVALID_CREDENTIALS: &str = "invalid credentials";
/// Reason reported when a remote verifier cannot produce a usable answer
pub const VERIFIER_UNAVAILABLE: &str = "verifier unavailable";

/// A refusal to grant a session, with a reason safe to show to the remote
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Permission denied: {reason}")]
pub struct VerificationDenied {
  reason: String,
}

impl VerificationDenied {
  pub fn new<T: Into<String>>(reason: T) -> Self {
    Self {
      reason: reason.into(),
    }
  }

  pub fn invalid_credentials() -> Self {
    Self::new(INVALID_CREDENTIALS)
  }

  pub fn verifier_unavailable() -> Self {
    Self::new(VERIFIER_UNAVAILABLE)
  }

  pub fn reason(&self) -> &str {
    &self.reason
  }

  /// Returns `true` if the denial came from a verifier failure rather than a refusal
  #[must_use]
  pub fn is_unavailable(&self) -> bool {
    self.reason == VERIFIER_UNAVAILABLE
  }
}

/// Checks a user's secret, granting or refusing permission to open a session.
///
/// Implementations must not create sessions or retain state per attempt;
/// each call is an independent check. Any failure to reach a decision must
/// resolve as a denial, never as a grant.
pub trait PermissionsVerifier: std::fmt::Debug + Send + Sync {
  fn verify<'a>(
    &'a self,
    user_id: &'a str,
    secret: &'a str,
  ) -> BoxFuture<'a, Result<(), VerificationDenied>>;
}

pub type ArcVerifier = Arc<dyn PermissionsVerifier + 'static>;

impl<T> PermissionsVerifier for T
where
  T: Deref + std::fmt::Debug + Send + Sync,
  <T as Deref>::Target: PermissionsVerifier,
{
  fn verify<'a>(
    &'a self,
    user_id: &'a str,
    secret: &'a str,
  ) -> BoxFuture<'a, Result<(), VerificationDenied>> {
    self.deref().verify(user_id, secret)
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{self, BoxFuture, FutureExt};

use super::{CredentialStore, PermissionsVerifier, VerificationDenied};

/// Verifies secrets against an in-process [CredentialStore]
pub struct LocalPermissionsVerifier {
  store: CredentialStore,
}

impl LocalPermissionsVerifier {
  pub fn new(store: CredentialStore) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &CredentialStore {
    &self.store
  }

  fn check(&self, user_id: &str, secret: &str) -> Result<(), VerificationDenied> {
    match self.store.secret_for(user_id) {
      Some(expected) if secrets_match(expected, secret) => Ok(()),
      // Unknown users and wrong secrets are indistinguishable to the caller
      _ => Err(VerificationDenied::invalid_credentials()),
    }
  }
}

fn secrets_match(expected: &str, provided: &str) -> bool {
  let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
  expected.len() == provided.len()
    && expected
      .iter()
      .zip(provided)
      .fold(0u8, |acc, (a, b)| acc | (a ^ b))
      == 0
}

impl std::fmt::Debug for LocalPermissionsVerifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({} {:?})", std::any::type_name::<Self>(), &self.store)
  }
}

impl PermissionsVerifier for LocalPermissionsVerifier {
  fn verify<'a>(
    &'a self,
    user_id: &'a str,
    secret: &'a str,
  ) -> BoxFuture<'a, Result<(), VerificationDenied>> {
    let result = self.check(user_id, secret);
    if result.is_err() {
      tracing::debug!(user_id, "Local verification refused");
    }
    future::ready(result).boxed()
  }
}

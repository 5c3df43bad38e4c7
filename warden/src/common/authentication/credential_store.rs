// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::{hash_map::Entry, HashMap},
  path::{Path, PathBuf},
};

#[derive(thiserror::Error, Debug)]
#[error("Cannot open `{}` for reading: {source}", .path.display())]
pub struct CredentialStoreError {
  path: PathBuf,
  #[source]
  source: std::io::Error,
}

impl CredentialStoreError {
  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// An immutable mapping of user IDs to their secrets.
///
/// The source format is a whitespace-separated sequence of `user secret` pairs; pairs
/// may share a line or span several. A trailing user without a secret is discarded.
/// When a user appears more than once, the first pairing is kept.
#[derive(Clone, Default)]
pub struct CredentialStore {
  secrets: HashMap<String, String>,
}

impl CredentialStore {
  pub fn parse(source: &str) -> Self {
    let mut tokens = source.split_whitespace();
    let mut secrets = HashMap::new();
    while let (Some(user_id), Some(secret)) = (tokens.next(), tokens.next()) {
      match secrets.entry(user_id.to_string()) {
        Entry::Vacant(vacant) => {
          vacant.insert(secret.to_string());
        }
        Entry::Occupied(_) => {
          tracing::debug!(user_id, "Ignoring repeated credential entry");
        }
      }
    }
    Self { secrets }
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CredentialStoreError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| CredentialStoreError {
      path: path.to_path_buf(),
      source,
    })?;
    let store = Self::parse(&source);
    tracing::info!(path = ?path, users = store.len(), "Loaded credential store");
    Ok(store)
  }

  pub fn secret_for(&self, user_id: &str) -> Option<&str> {
    self.secrets.get(user_id).map(String::as_str)
  }

  pub fn contains_user(&self, user_id: &str) -> bool {
    self.secrets.contains_key(user_id)
  }

  pub fn len(&self) -> usize {
    self.secrets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.secrets.is_empty()
  }
}

impl<U: Into<String>, S: Into<String>> FromIterator<(U, S)> for CredentialStore {
  fn from_iter<I: IntoIterator<Item = (U, S)>>(iter: I) -> Self {
    let mut secrets = HashMap::new();
    for (user_id, secret) in iter {
      secrets.entry(user_id.into()).or_insert_with(|| secret.into());
    }
    Self { secrets }
  }
}

// Secrets stay out of logs
impl std::fmt::Debug for CredentialStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CredentialStore")
      .field("users", &self.secrets.len())
      .finish_non_exhaustive()
  }
}

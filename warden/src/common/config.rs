// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Startup configuration for a session router
//!
//! Configuration problems are reported before any endpoint is opened; a router
//! never starts with a verifier it could not confirm.

use std::{
  collections::BTreeSet,
  net::SocketAddr,
  path::{Path, PathBuf},
  sync::Arc,
};

use super::{
  authentication::{
    ArcVerifier, CredentialStore, CredentialStoreError, LocalPermissionsVerifier,
    RemotePermissionsVerifier, RemoteVerifierError,
  },
  router::{RouterOptions, DEFAULT_ROUTER_IDENTITY},
  transport::RouteAddress,
};
use crate::util::validators::{parse_backend_address, parse_router_identity};

pub const DEFAULT_CREDENTIAL_FILE: &str = "passwords";

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
  #[error("A client endpoint is required")]
  MissingClientEndpoint,
  #[error("A verifier reference and a credential file were both configured; choose one")]
  ConflictingVerifiers,
  #[error("Credential file could not be read: {0}")]
  UnreadableCredentialFile(#[from] CredentialStoreError),
  #[error("Permissions verifier at {reference} is invalid: {source}")]
  InvalidVerifier {
    reference: SocketAddr,
    #[source]
    source: RemoteVerifierError,
  },
  #[error("Invalid router identity {identity:?}: {reason}")]
  InvalidRouterIdentity { identity: String, reason: String },
  #[error("Invalid backend address {backend:?}: {reason}")]
  InvalidBackend { backend: String, reason: String },
}

/// How permission checks will be performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierSelection {
  Local(PathBuf),
  Remote(SocketAddr),
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
  pub client_endpoint: Option<SocketAddr>,
  pub server_endpoint: Option<SocketAddr>,
  pub verifier_reference: Option<SocketAddr>,
  pub credential_file: Option<PathBuf>,
  pub router_identity: Option<String>,
  pub backends: Vec<String>,
}

impl RouterConfig {
  pub fn client_endpoint(&self) -> Result<SocketAddr, ConfigurationError> {
    self
      .client_endpoint
      .ok_or(ConfigurationError::MissingClientEndpoint)
  }

  pub fn router_identity(&self) -> Result<String, ConfigurationError> {
    let identity = self
      .router_identity
      .as_deref()
      .unwrap_or(DEFAULT_ROUTER_IDENTITY);
    parse_router_identity(identity).map_err(|e| ConfigurationError::InvalidRouterIdentity {
      identity: identity.to_string(),
      reason: e.to_string(),
    })
  }

  /// Backends clients may reach; with none configured, every invocation is refused
  pub fn backends(&self) -> Result<BTreeSet<RouteAddress>, ConfigurationError> {
    self
      .backends
      .iter()
      .map(|backend| {
        parse_backend_address(backend).map_err(|e| ConfigurationError::InvalidBackend {
          backend: backend.clone(),
          reason: e.to_string(),
        })
      })
      .collect()
  }

  /// A remote reference takes the place of the credential file, which otherwise
  /// defaults to [DEFAULT_CREDENTIAL_FILE] in the working directory.
  pub fn verifier_selection(&self) -> Result<VerifierSelection, ConfigurationError> {
    match (&self.verifier_reference, &self.credential_file) {
      (Some(_), Some(_)) => Err(ConfigurationError::ConflictingVerifiers),
      (Some(reference), None) => Ok(VerifierSelection::Remote(*reference)),
      (None, Some(path)) => Ok(VerifierSelection::Local(path.clone())),
      (None, None) => Ok(VerifierSelection::Local(PathBuf::from(
        DEFAULT_CREDENTIAL_FILE,
      ))),
    }
  }

  pub fn router_options(&self) -> Result<RouterOptions, ConfigurationError> {
    Ok(RouterOptions {
      identity: self.router_identity()?,
      server_endpoint: self.server_endpoint.map(|endpoint| endpoint.to_string()),
      backends: self.backends()?,
    })
  }

  /// Checks everything that can be checked without touching the filesystem or network
  pub fn validate(&self) -> Result<(), ConfigurationError> {
    self.client_endpoint()?;
    self.verifier_selection()?;
    self.router_options()?;
    Ok(())
  }

  /// Builds the configured verifier, confirming a remote reference answers as a verifier
  pub async fn build_verifier(&self) -> Result<ArcVerifier, ConfigurationError> {
    match self.verifier_selection()? {
      VerifierSelection::Local(path) => Ok(Arc::new(load_local_verifier(&path)?)),
      VerifierSelection::Remote(reference) => {
        let verifier = RemotePermissionsVerifier::checked(reference)
          .await
          .map_err(|source| ConfigurationError::InvalidVerifier { reference, source })?;
        Ok(Arc::new(verifier))
      }
    }
  }
}

fn load_local_verifier(path: &Path) -> Result<LocalPermissionsVerifier, ConfigurationError> {
  let store = CredentialStore::load(path)?;
  if store.is_empty() {
    tracing::warn!(?path, "Credential file grants no users; every login will be denied");
  }
  Ok(LocalPermissionsVerifier::new(store))
}

#[cfg(test)]
mod tests {
  use super::{ConfigurationError, RouterConfig, VerifierSelection, DEFAULT_CREDENTIAL_FILE};
  use crate::common::authentication::PermissionsVerifier;
  use std::{io::Write, net::SocketAddr, path::PathBuf};

  fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
  }

  fn base() -> RouterConfig {
    RouterConfig {
      client_endpoint: Some(addr("127.0.0.1:4063")),
      ..Default::default()
    }
  }

  #[test]
  fn client_endpoint_is_required() {
    let config = RouterConfig::default();
    assert!(matches!(
      config.validate(),
      Err(ConfigurationError::MissingClientEndpoint)
    ));
    assert!(base().validate().is_ok());
  }

  #[test]
  fn credential_file_defaults_when_no_verifier_is_named() {
    assert_eq!(
      base().verifier_selection().unwrap(),
      VerifierSelection::Local(PathBuf::from(DEFAULT_CREDENTIAL_FILE))
    );
    let remote = RouterConfig {
      verifier_reference: Some(addr("127.0.0.1:4070")),
      ..base()
    };
    assert_eq!(
      remote.verifier_selection().unwrap(),
      VerifierSelection::Remote(addr("127.0.0.1:4070"))
    );
  }

  #[test]
  fn conflicting_verifiers_are_refused() {
    let config = RouterConfig {
      verifier_reference: Some(addr("127.0.0.1:4070")),
      credential_file: Some(PathBuf::from("creds")),
      ..base()
    };
    assert!(matches!(
      config.validate(),
      Err(ConfigurationError::ConflictingVerifiers)
    ));
  }

  #[test]
  fn options_carry_identity_and_server_endpoint() {
    let options = base().router_options().unwrap();
    assert_eq!(options.identity, "Warden/router");
    assert!(options.server_endpoint.is_none());

    let config = RouterConfig {
      server_endpoint: Some(addr("127.0.0.1:4064")),
      router_identity: Some(String::from("Edge/gateway")),
      ..base()
    };
    let options = config.router_options().unwrap();
    assert_eq!(options.identity, "Edge/gateway");
    assert_eq!(options.server_endpoint.as_deref(), Some("127.0.0.1:4064"));
  }

  #[test]
  fn malformed_identities_are_refused() {
    let config = RouterConfig {
      router_identity: Some(String::from("has space")),
      ..base()
    };
    assert!(matches!(
      config.validate(),
      Err(ConfigurationError::InvalidRouterIdentity { .. })
    ));
  }

  #[test]
  fn backends_are_collected_and_checked() {
    assert!(base().router_options().unwrap().backends.is_empty());

    let config = RouterConfig {
      backends: vec![
        String::from("10.0.0.5:7000"),
        String::from("inventory:80"),
        String::from("10.0.0.5:7000"),
      ],
      ..base()
    };
    let backends = config.router_options().unwrap().backends;
    assert_eq!(backends.len(), 2);
    assert!(backends.contains("inventory:80"));

    let config = RouterConfig {
      backends: vec![String::from("inventory")],
      ..base()
    };
    match config.validate() {
      Err(ConfigurationError::InvalidBackend { backend, .. }) => assert_eq!(backend, "inventory"),
      other => panic!("Expected an invalid backend error, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn missing_credential_file_fails_startup() {
    let config = RouterConfig {
      credential_file: Some(PathBuf::from("/nonexistent/warden/passwords")),
      ..base()
    };
    assert!(matches!(
      config.build_verifier().await,
      Err(ConfigurationError::UnreadableCredentialFile(_))
    ));
  }

  #[tokio::test]
  async fn credential_file_builds_a_local_verifier() {
    let path = std::env::temp_dir().join(format!("warden-config-{}", uuid::Uuid::new_v4()));
    std::fs::File::create(&path)
      .and_then(|mut file| file.write_all(b"alice secret1\n"))
      .unwrap();
    let config = RouterConfig {
      credential_file: Some(path.clone()),
      ..base()
    };
    let verifier = config.build_verifier().await.unwrap();
    assert!(verifier.verify("alice", "secret1").await.is_ok());
    assert!(verifier.verify("alice", "secret2").await.is_err());
    std::fs::remove_file(path).unwrap();
  }

  #[tokio::test]
  async fn unreachable_verifier_fails_startup() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reference = listener.local_addr().unwrap();
    drop(listener);
    let config = RouterConfig {
      verifier_reference: Some(reference),
      ..base()
    };
    match config.build_verifier().await {
      Err(ConfigurationError::InvalidVerifier { reference: r, .. }) => assert_eq!(r, reference),
      other => panic!("Expected an invalid verifier error, got {other:?}"),
    }
  }
}

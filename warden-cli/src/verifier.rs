// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use warden::common::authentication::{CredentialStore, LocalPermissionsVerifier, VerifierService};

/// Parameters used to serve a credential file to remote routers
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct VerifierArgs {
  pub bind: SocketAddr,
  pub passwords: PathBuf,
}

#[tracing::instrument(skip(args), fields(bind = ?args.bind, passwords = ?args.passwords), err)]
pub async fn verifier_main(args: VerifierArgs) -> Result<()> {
  let store = CredentialStore::load(&args.passwords).context("Failed loading credential file")?;
  let service = Arc::new(VerifierService::new(Arc::new(LocalPermissionsVerifier::new(
    store,
  ))));
  let listener = TcpListener::bind(args.bind)
    .await
    .with_context(|| format!("Failed binding verifier endpoint {}", args.bind))?;

  let (shutdown, sigint_handler_task) = crate::ctrl_c_cancellation();
  service.serve(listener, shutdown).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  Ok(())
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use warden::common::{config::RouterConfig, router::SessionRouter};

use crate::wire::{
  tcp_transport::DEFAULT_BACKEND_TIMEOUT, ClientEndpoint, ServerEndpoint, TcpTransport,
};

/// Parameters used to run a session router
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RouterArgs {
  pub client: SocketAddr,
  pub server: Option<SocketAddr>,
  pub verifier: Option<SocketAddr>,
  pub passwords: Option<PathBuf>,
  pub identity: Option<String>,
  pub backends: Vec<String>,
}

impl From<RouterArgs> for RouterConfig {
  fn from(args: RouterArgs) -> Self {
    RouterConfig {
      client_endpoint: Some(args.client),
      server_endpoint: args.server,
      verifier_reference: args.verifier,
      credential_file: args.passwords,
      router_identity: args.identity,
      backends: args.backends,
    }
  }
}

/// Run a session router until interrupted, destroying all sessions on the way out
#[tracing::instrument(
  skip(args),
  fields(
    client = ?args.client,
    server = ?args.server,
  ),
  err
)]
pub async fn router_main(args: RouterArgs) -> Result<()> {
  let config = RouterConfig::from(args);
  config.validate()?;
  let verifier = config.build_verifier().await?;
  let options = config.router_options()?;
  if options.backends.is_empty() {
    tracing::warn!("No backends are configured; every client invocation will be refused");
  }

  let client_addr = config.client_endpoint()?;
  let client_listener = TcpListener::bind(client_addr)
    .await
    .with_context(|| format!("Failed binding client endpoint {}", client_addr))?;
  let server_listener = match config.server_endpoint {
    Some(server_addr) => Some(
      TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("Failed binding server endpoint {}", server_addr))?,
    ),
    None => None,
  };

  let (shutdown, sigint_handler_task) = crate::ctrl_c_cancellation();

  let transport = Arc::new(TcpTransport::new(DEFAULT_BACKEND_TIMEOUT));
  let router = Arc::new(SessionRouter::new(options, verifier, transport.clone()));
  tracing::info!(identity = router.identity(), "Session router started");

  let clients =
    Arc::new(ClientEndpoint::new(router.clone(), transport)).serve(client_listener, shutdown.clone());
  let callbacks = {
    let router = router.clone();
    let shutdown = shutdown.clone();
    async move {
      if let Some(listener) = server_listener {
        Arc::new(ServerEndpoint::new(router))
          .serve(listener, shutdown)
          .await
      }
    }
  };
  let stop_router = {
    let router = router.clone();
    let shutdown = shutdown.clone();
    async move {
      shutdown.cancelled().await;
      tracing::info!("Shutting down session router");
      router.shutdown();
    }
  };
  futures::future::join3(clients, callbacks, stop_router).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  Ok(())
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::StreamExt;
use std::sync::Arc;
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use warden::{
  common::{router::SessionRouter, transport::Invocation},
  util::framed::{
    read_message, write_message, MessageReadError, MessageWriteError, DEFAULT_MAX_FRAME_LENGTH,
  },
};

use super::{ServerMessage, ServerReply};

#[derive(thiserror::Error, Debug)]
pub enum BackendConnectionError {
  #[error("Failure reading callback: {0}")]
  Read(#[from] MessageReadError),
  #[error("Failure acknowledging callback: {0}")]
  Write(#[from] MessageWriteError),
}

/// Accepts backend connections carrying callbacks addressed to client sessions
pub struct ServerEndpoint {
  router: Arc<SessionRouter>,
}

impl ServerEndpoint {
  pub fn new(router: Arc<SessionRouter>) -> Self {
    Self { router }
  }

  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "Server endpoint listening");
    tokio_stream::wrappers::TcpListenerStream::new(listener)
      .take_until({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
      })
      .for_each_concurrent(None, |accepted| {
        let this = Arc::clone(&self);
        let shutdown = shutdown.clone();
        async move {
          match accepted {
            Ok(stream) => {
              let peer = stream.peer_addr().ok();
              if let Err(e) = this
                .handle_connection(stream, shutdown)
                .instrument(tracing::debug_span!("backend", ?peer))
                .await
              {
                tracing::debug!(error = ?e, "Backend connection ended with error");
              }
            }
            Err(e) => tracing::warn!(error = ?e, "Failure accepting backend connection"),
          }
        }
      })
      .await;
    tracing::info!(addr = ?local_addr, "Server endpoint stopped");
  }

  /// Delivers callbacks one at a time, acknowledging each, until the backend hangs up
  pub async fn handle_connection<S>(
    &self,
    mut stream: S,
    shutdown: CancellationToken,
  ) -> Result<(), BackendConnectionError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    loop {
      let message = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        message = read_message::<_, ServerMessage>(&mut stream, DEFAULT_MAX_FRAME_LENGTH) => message?,
      };
      let ServerMessage::Callback {
        category,
        operation,
        payload,
      } = match message {
        Some(message) => message,
        None => return Ok(()),
      };
      let reply = match self
        .router
        .forward_to_client(&category, Invocation::new("", operation, payload))
        .await
      {
        Ok(()) => ServerReply::Delivered,
        Err(e) => {
          tracing::debug!(?category, error = ?e, "Callback not delivered");
          ServerReply::Failed {
            reason: e.to_string(),
          }
        }
      };
      write_message(&mut stream, &reply).await?;
    }
  }
}

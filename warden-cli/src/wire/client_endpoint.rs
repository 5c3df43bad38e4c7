// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpListener,
  sync::mpsc,
  task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use warden::{
  common::{
    router::SessionRouter,
    session::{ConnectionId, MonotonicAtomicGenerator},
    transport::Invocation,
  },
  util::framed::{read_message, write_message, DEFAULT_MAX_FRAME_LENGTH},
};

use super::{tcp_transport::CLIENT_QUEUE_DEPTH, ClientMessage, ClientReply, TcpTransport};

const WRITER_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Accepts client connections and feeds their messages to the router
pub struct ClientEndpoint {
  router: Arc<SessionRouter>,
  transport: Arc<TcpTransport>,
  connection_ids: MonotonicAtomicGenerator,
}

impl ClientEndpoint {
  pub fn new(router: Arc<SessionRouter>, transport: Arc<TcpTransport>) -> Self {
    Self {
      router,
      transport,
      connection_ids: MonotonicAtomicGenerator::new(1),
    }
  }

  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "Client endpoint listening");
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
              this
                .handle_connection(stream)
                .await_or_cancel(shutdown)
                .instrument(tracing::debug_span!("client", ?peer))
                .await
            }
            Err(e) => tracing::warn!(error = ?e, "Failure accepting client connection"),
          }
        }
      })
      .await;
    tracing::info!(addr = ?local_addr, "Client endpoint stopped");
  }

  /// Serves one client until it disconnects, then destroys whatever session it held
  pub fn handle_connection<S>(self: Arc<Self>, stream: S) -> ConnectionHandler<S>
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    ConnectionHandler {
      endpoint: self,
      stream,
    }
  }

  async fn dispatch(&self, connection: ConnectionId, message: ClientMessage) -> ClientReply {
    match message {
      ClientMessage::CreateSession { user_id, secret } => {
        match self.router.create_session(connection, &user_id, &secret).await {
          Ok(grant) => ClientReply::SessionCreated { grant },
          Err(e) => ClientReply::AuthenticationFailed {
            reason: e.to_string(),
          },
        }
      }
      ClientMessage::Invoke {
        request_id,
        target,
        operation,
        payload,
      } => {
        let invocation = Invocation::new(target, operation, payload);
        match self.router.forward_from_client(connection, invocation).await {
          Ok(reply) => ClientReply::InvocationResult {
            request_id,
            payload: reply.payload,
          },
          Err(e) => ClientReply::InvocationFailed {
            request_id,
            reason: e.to_string(),
          },
        }
      }
      ClientMessage::DestroySession => ClientReply::SessionDestroyed {
        session_id: self.router.destroy_session(connection),
      },
    }
  }
}

/// One client connection being served; see [ClientEndpoint::handle_connection]
pub struct ConnectionHandler<S> {
  endpoint: Arc<ClientEndpoint>,
  stream: S,
}

impl<S> ConnectionHandler<S>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  #[cfg(test)]
  pub async fn run(self) {
    self.await_or_cancel(CancellationToken::new()).await
  }

  /// Serves until the client disconnects or `shutdown` is cancelled
  pub async fn await_or_cancel(self, shutdown: CancellationToken) {
    let Self { endpoint, stream } = self;
    let connection = endpoint.connection_ids.next();
    tracing::debug!(?connection, "Client connected");
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (outbound, mut queue) = mpsc::channel::<ClientReply>(CLIENT_QUEUE_DEPTH);
    endpoint.transport.register(connection, outbound.clone());
    let mut writer_task = tokio::spawn(async move {
      while let Some(reply) = queue.recv().await {
        if let Err(e) = write_message(&mut writer, &reply).await {
          tracing::debug!(error = ?e, "Client stopped accepting replies");
          break;
        }
      }
    });

    // Reading happens on its own task so a partially-read frame is never dropped
    let (inbound_sender, mut inbound) = mpsc::channel::<ClientMessage>(16);
    let reader_task = tokio::spawn(async move {
      loop {
        match read_message::<_, ClientMessage>(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await {
          Ok(Some(message)) => {
            if inbound_sender.send(message).await.is_err() {
              break;
            }
          }
          Ok(None) => break,
          Err(e) => {
            tracing::debug!(error = ?e, "Dropping client after an unreadable message");
            break;
          }
        }
      }
    });

    // Invocations run concurrently; session lifecycle messages are handled in arrival order
    let mut handlers = JoinSet::new();
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        message = inbound.recv() => match message {
          Some(message @ ClientMessage::Invoke { .. }) => {
            let endpoint = Arc::clone(&endpoint);
            let outbound = outbound.clone();
            handlers.spawn(
              async move {
                let reply = endpoint.dispatch(connection, message).await;
                // The client may already be gone, in which case the reply has no reader
                let _ = outbound.send(reply).await;
              }
              .instrument(tracing::debug_span!("client_request", ?connection)),
            );
          }
          Some(message) => {
            let reply = tokio::select! {
              _ = shutdown.cancelled() => break,
              reply = endpoint.dispatch(connection, message) => reply,
            };
            let queued = tokio::select! {
              _ = shutdown.cancelled() => break,
              queued = outbound.send(reply) => queued,
            };
            if queued.is_err() {
              break;
            }
          }
          None => break,
        },
        Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
          if let Err(e) = finished {
            if e.is_panic() {
              tracing::error!(?connection, error = ?e, "Client request handler panicked");
            }
          }
        }
      }
    }

    reader_task.abort();
    // Stop every handler before destroying the session, so none forwards for it afterward
    handlers.shutdown().await;
    endpoint.transport.unregister(connection);
    endpoint.router.connection_closed(connection);
    drop(outbound);

    // Replies still queued get a grace period, unless the router is going away
    if shutdown.is_cancelled() {
      writer_task.abort();
    }
    match tokio::time::timeout(WRITER_GRACE_PERIOD, &mut writer_task).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) if e.is_cancelled() => {}
      Ok(Err(e)) => tracing::warn!(?connection, error = ?e, "Client reply writer failed"),
      Err(_elapsed) => {
        tracing::debug!(?connection, "Discarding replies the client never read");
        writer_task.abort();
      }
    }
    tracing::debug!(?connection, "Client disconnected");
  }
}

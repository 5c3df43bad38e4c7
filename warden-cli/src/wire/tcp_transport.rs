// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;
use tokio::{
  net::TcpStream,
  sync::mpsc::{error::TrySendError, Sender},
};
use warden::{
  common::{
    session::{ConnectionId, SessionId},
    transport::{Invocation, InvocationReply, InvocationTransport, TransportError},
  },
  util::framed::{read_message, write_message, DEFAULT_MAX_FRAME_LENGTH},
};

use super::{BackendMessage, BackendReply, ClientReply};

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Replies and callbacks a client may leave unread before deliveries are refused
pub const CLIENT_QUEUE_DEPTH: usize = 64;

/// Delivers invocations over TCP.
///
/// Backend calls open one connection per invocation to the `host:port` target.
/// Client deliveries go through the outbound queue each client connection
/// registers while it is open. Those queues are bounded; a client that stops
/// reading gets its callbacks refused rather than buffered.
pub struct TcpTransport {
  clients: DashMap<ConnectionId, Sender<ClientReply>>,
  backend_timeout: Duration,
}

impl TcpTransport {
  pub fn new(backend_timeout: Duration) -> Self {
    Self {
      clients: DashMap::new(),
      backend_timeout,
    }
  }

  pub fn register(&self, connection: ConnectionId, outbound: Sender<ClientReply>) {
    if self.clients.insert(connection, outbound).is_some() {
      tracing::warn!(?connection, "Replaced an outbound queue for a reused connection id");
    }
  }

  pub fn unregister(&self, connection: ConnectionId) {
    self.clients.remove(&connection);
  }

  #[cfg(test)]
  pub fn client_count(&self) -> usize {
    self.clients.len()
  }
}

impl Default for TcpTransport {
  fn default() -> Self {
    Self::new(DEFAULT_BACKEND_TIMEOUT)
  }
}

impl std::fmt::Debug for TcpTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TcpTransport")
      .field("clients", &self.clients.len())
      .field("backend_timeout", &self.backend_timeout)
      .finish()
  }
}

async fn exchange_with_backend(
  origin: SessionId,
  invocation: Invocation,
) -> Result<InvocationReply, TransportError> {
  let Invocation {
    target,
    operation,
    payload,
  } = invocation;
  let mut stream = TcpStream::connect(target.as_str()).await.map_err(|e| {
    tracing::debug!(%target, error = ?e, "Backend connection failed");
    TransportError::Unreachable(target.clone())
  })?;
  let request = BackendMessage::Invoke {
    origin,
    operation,
    payload,
  };
  write_message(&mut stream, &request)
    .await
    .map_err(|e| TransportError::Protocol(e.to_string()))?;
  match read_message::<_, BackendReply>(&mut stream, DEFAULT_MAX_FRAME_LENGTH).await {
    Ok(Some(BackendReply::Result { payload })) => Ok(InvocationReply { payload }),
    Ok(Some(BackendReply::Error { reason })) => Err(TransportError::Refused(reason)),
    Ok(None) => Err(TransportError::ConnectionClosed),
    Err(e) => Err(TransportError::Protocol(e.to_string())),
  }
}

impl InvocationTransport for TcpTransport {
  fn send_to_backend(
    &self,
    origin: SessionId,
    invocation: Invocation,
  ) -> BoxFuture<'static, Result<InvocationReply, TransportError>> {
    let timeout = self.backend_timeout;
    async move {
      tokio::time::timeout(timeout, exchange_with_backend(origin, invocation))
        .await
        .map_err(|_| TransportError::TimedOut)?
    }
    .boxed()
  }

  fn send_to_client(
    &self,
    connection: ConnectionId,
    invocation: Invocation,
  ) -> BoxFuture<'static, Result<(), TransportError>> {
    let outbound = self
      .clients
      .get(&connection)
      .map(|entry| entry.value().clone());
    let callback = ClientReply::Callback {
      operation: invocation.operation,
      payload: invocation.payload,
    };
    let delivered = outbound
      .ok_or(TransportError::ConnectionClosed)
      .and_then(|outbound| {
        outbound.try_send(callback).map_err(|e| match e {
          TrySendError::Full(_) => {
            tracing::debug!(?connection, "Refusing a callback for a client with a full queue");
            TransportError::Backlogged
          }
          TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
      });
    futures::future::ready(delivered).boxed()
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Delegation of permission checks to a verifier running in another process
//!
//! The verifier protocol is a sequence of framed JSON requests on a TCP stream, each
//! answered by exactly one response. A `Hello` exchange confirms that the peer is a
//! verifier speaking a compatible protocol version.

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{ArcVerifier, PermissionsVerifier, VerificationDenied};
use crate::util::framed::{read_message, write_message, MessageReadError, MessageWriteError};

pub const VERIFIER_PROTOCOL_VERSION: u8 = 1;

/// Verifier messages are tiny; anything larger is a protocol violation
const MAX_VERIFIER_FRAME: usize = 16 * 1024;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierRequest {
  Hello { protocol: u8 },
  Verify { user_id: String, secret: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierResponse {
  Welcome {
    protocol: u8,
  },
  Verdict {
    allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum RemoteVerifierError {
  #[error("Verifier at {0} is unreachable: {1}")]
  Unreachable(SocketAddr, #[source] std::io::Error),
  #[error("Verifier did not answer within {0:?}")]
  TimedOut(Duration),
  #[error("Failure sending to verifier: {0}")]
  Write(#[from] MessageWriteError),
  #[error("Failure reading from verifier: {0}")]
  Read(#[from] MessageReadError),
  #[error("Verifier closed the connection without answering")]
  NoResponse,
  #[error("Verifier answered with an unexpected message: {0:?}")]
  UnexpectedResponse(VerifierResponse),
  #[error("Verifier speaks protocol version {remote}, expected {expected}")]
  ProtocolMismatch { expected: u8, remote: u8 },
}

/// A [PermissionsVerifier] that asks a remote verifier service for each decision.
///
/// Every check opens its own connection, so a verifier restart costs at most the
/// requests in flight at the time. Any failure to get a well-formed verdict is a
/// denial with the "verifier unavailable" reason.
#[derive(Debug, Clone)]
pub struct RemotePermissionsVerifier {
  reference: SocketAddr,
  request_timeout: Duration,
}

impl RemotePermissionsVerifier {
  /// Creates a verifier for the reference without contacting it
  pub fn unchecked(reference: SocketAddr) -> Self {
    Self {
      reference,
      request_timeout: DEFAULT_REQUEST_TIMEOUT,
    }
  }

  /// Creates a verifier only if the reference answers the verifier handshake
  pub async fn checked(reference: SocketAddr) -> Result<Self, RemoteVerifierError> {
    let verifier = Self::unchecked(reference);
    verifier.handshake().await?;
    tracing::info!(?reference, "Remote permissions verifier confirmed");
    Ok(verifier)
  }

  pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
    self.request_timeout = request_timeout;
    self
  }

  pub fn reference(&self) -> SocketAddr {
    self.reference
  }

  pub async fn handshake(&self) -> Result<(), RemoteVerifierError> {
    let hello = VerifierRequest::Hello {
      protocol: VERIFIER_PROTOCOL_VERSION,
    };
    match self.exchange(&hello).await? {
      VerifierResponse::Welcome { protocol } if protocol == VERIFIER_PROTOCOL_VERSION => Ok(()),
      VerifierResponse::Welcome { protocol } => Err(RemoteVerifierError::ProtocolMismatch {
        expected: VERIFIER_PROTOCOL_VERSION,
        remote: protocol,
      }),
      other => Err(RemoteVerifierError::UnexpectedResponse(other)),
    }
  }

  async fn exchange(&self, request: &VerifierRequest) -> Result<VerifierResponse, RemoteVerifierError> {
    let reference = self.reference;
    let exchange = async move {
      let mut stream = TcpStream::connect(reference)
        .await
        .map_err(|e| RemoteVerifierError::Unreachable(reference, e))?;
      write_message(&mut stream, request).await?;
      read_message::<_, VerifierResponse>(&mut stream, MAX_VERIFIER_FRAME)
        .await?
        .ok_or(RemoteVerifierError::NoResponse)
    };
    tokio::time::timeout(self.request_timeout, exchange)
      .await
      .map_err(|_| RemoteVerifierError::TimedOut(self.request_timeout))?
  }
}

impl PermissionsVerifier for RemotePermissionsVerifier {
  fn verify<'a>(
    &'a self,
    user_id: &'a str,
    secret: &'a str,
  ) -> BoxFuture<'a, Result<(), VerificationDenied>> {
    let request = VerifierRequest::Verify {
      user_id: user_id.to_string(),
      secret: secret.to_string(),
    };
    async move {
      match self.exchange(&request).await {
        Ok(VerifierResponse::Verdict { allowed: true, .. }) => Ok(()),
        Ok(VerifierResponse::Verdict {
          allowed: false,
          reason,
        }) => {
          // Clients see the same refusal whichever verifier turned them away
          tracing::debug!(?reason, "Remote verifier denied credentials");
          Err(VerificationDenied::invalid_credentials())
        }
        Ok(other) => {
          tracing::warn!(response = ?other, "Remote verifier answered out of protocol");
          Err(VerificationDenied::verifier_unavailable())
        }
        Err(e) => {
          tracing::warn!(
            reason = (&e as &dyn std::error::Error),
            "Remote verifier unavailable"
          );
          Err(VerificationDenied::verifier_unavailable())
        }
      }
    }
    .instrument(tracing::debug_span!("remote_verify", reference = ?self.reference, user_id))
    .boxed()
  }
}

/// Serves a [PermissionsVerifier] to [RemotePermissionsVerifier] clients
pub struct VerifierService {
  verifier: ArcVerifier,
}

impl VerifierService {
  pub fn new(verifier: ArcVerifier) -> Self {
    Self { verifier }
  }

  /// Accepts verifier clients until `shutdown` is cancelled, then waits for open
  /// connections to finish their current request.
  pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "Verifier service listening");
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
                .instrument(tracing::debug_span!("verifier_client", ?peer))
                .await
              {
                tracing::debug!(error = ?e, "Verifier client connection ended with error");
              }
            }
            Err(e) => tracing::warn!(error = ?e, "Failure accepting verifier client"),
          }
        }
      })
      .await;
    tracing::info!(addr = ?local_addr, "Verifier service stopped");
  }

  async fn handle_connection(
    &self,
    mut stream: TcpStream,
    shutdown: CancellationToken,
  ) -> Result<(), RemoteVerifierError> {
    loop {
      let request = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        request = read_message::<_, VerifierRequest>(&mut stream, MAX_VERIFIER_FRAME) => request?,
      };
      let request = match request {
        Some(request) => request,
        None => return Ok(()),
      };
      let response = self.respond(request).await;
      write_message(&mut stream, &response).await?;
    }
  }

  pub async fn respond(&self, request: VerifierRequest) -> VerifierResponse {
    match request {
      VerifierRequest::Hello { .. } => VerifierResponse::Welcome {
        protocol: VERIFIER_PROTOCOL_VERSION,
      },
      VerifierRequest::Verify { user_id, secret } => {
        match self.verifier.verify(&user_id, &secret).await {
          Ok(()) => VerifierResponse::Verdict {
            allowed: true,
            reason: None,
          },
          Err(denied) => VerifierResponse::Verdict {
            allowed: false,
            reason: Some(denied.reason().to_string()),
          },
        }
      }
    }
  }
}

impl std::fmt::Debug for VerifierService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("VerifierService")
      .field("verifier", &self.verifier)
      .finish()
  }
}

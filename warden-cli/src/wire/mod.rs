// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Framed JSON messages exchanged with clients and backends
//!
//! Every message is one length-prefixed JSON frame as written by
//! [warden::util::framed::write_message].

use serde::{Deserialize, Serialize};
use warden::common::session::{SessionGrant, SessionId};

pub mod client_endpoint;
pub mod server_endpoint;
pub mod tcp_transport;

pub use client_endpoint::ClientEndpoint;
pub use server_endpoint::ServerEndpoint;
pub use tcp_transport::TcpTransport;

/// Sent by clients on the client endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
  CreateSession {
    user_id: String,
    secret: String,
  },
  Invoke {
    request_id: u64,
    target: String,
    operation: String,
    #[serde(default)]
    payload: Vec<u8>,
  },
  DestroySession,
}

/// Sent to clients; replies and callbacks share the connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientReply {
  SessionCreated {
    grant: SessionGrant,
  },
  AuthenticationFailed {
    reason: String,
  },
  InvocationResult {
    request_id: u64,
    #[serde(default)]
    payload: Vec<u8>,
  },
  InvocationFailed {
    request_id: u64,
    reason: String,
  },
  SessionDestroyed {
    /// `None` if the connection had no session to destroy
    session_id: Option<SessionId>,
  },
  Callback {
    operation: String,
    #[serde(default)]
    payload: Vec<u8>,
  },
}

/// Sent by the router to a backend, one per backend connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMessage {
  Invoke {
    /// Category under which the backend may address callbacks to the calling client
    origin: SessionId,
    operation: String,
    #[serde(default)]
    payload: Vec<u8>,
  },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendReply {
  Result {
    #[serde(default)]
    payload: Vec<u8>,
  },
  Error {
    reason: String,
  },
}

/// Sent by backends on the server endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
  Callback {
    category: SessionId,
    operation: String,
    #[serde(default)]
    payload: Vec<u8>,
  },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
  Delivered,
  Failed { reason: String },
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::Notify;

use super::{AuthenticationError, DestroyReason, RouterOptions, RoutingError, SessionRouter};
use crate::common::{
  authentication::{
    CredentialStore, LocalPermissionsVerifier, PermissionsVerifier, RemotePermissionsVerifier,
    VerificationDenied, VerifierService, INVALID_CREDENTIALS, VERIFIER_UNAVAILABLE,
  },
  session::ConnectionId,
  transport::{Invocation, InvocationReply, MockInvocationTransport, TransportError},
};

const SERVER_ENDPOINT: &str = "127.0.0.1:4064";
const BACKENDS: [&str; 2] = ["10.0.0.5:7000", "backend:1"];

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn local_verifier() -> Arc<LocalPermissionsVerifier> {
  Arc::new(LocalPermissionsVerifier::new(CredentialStore::parse(
    "alice secret1\nbob hunter2\n",
  )))
}

fn router_with(
  verifier: Arc<dyn PermissionsVerifier>,
  transport: MockInvocationTransport,
  server_endpoint: Option<&str>,
) -> Arc<SessionRouter> {
  let options = RouterOptions {
    server_endpoint: server_endpoint.map(String::from),
    backends: BACKENDS.iter().map(|backend| backend.to_string()).collect(),
    ..Default::default()
  };
  Arc::new(SessionRouter::new(options, verifier, Arc::new(transport)))
}

fn echo_backend(transport: &mut MockInvocationTransport) {
  transport
    .expect_send_to_backend()
    .returning(|_origin, invocation| {
      futures::future::ready(Ok(InvocationReply {
        payload: invocation.payload,
      }))
      .boxed()
    });
}

/// A verifier that approves everyone, but only once the test lets it
#[derive(Debug, Default)]
struct GatedVerifier {
  entered: Notify,
  gate: Notify,
}

impl PermissionsVerifier for GatedVerifier {
  fn verify<'a>(
    &'a self,
    _user_id: &'a str,
    _secret: &'a str,
  ) -> BoxFuture<'a, Result<(), VerificationDenied>> {
    async move {
      self.entered.notify_one();
      self.gate.notified().await;
      Ok(())
    }
    .boxed()
  }
}

/// A verifier that approves everyone after a short delay
#[derive(Debug)]
struct SlowVerifier(Duration);

impl PermissionsVerifier for SlowVerifier {
  fn verify<'a>(
    &'a self,
    _user_id: &'a str,
    _secret: &'a str,
  ) -> BoxFuture<'a, Result<(), VerificationDenied>> {
    tokio::time::sleep(self.0).map(Ok).boxed()
  }
}

#[tokio::test]
async fn valid_credentials_grant_a_session() {
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(1);
  let grant = router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  assert_eq!(grant.router_identity, "Warden/router");
  assert!(grant.callback_target.is_none());
  let session = router.session(connection).unwrap();
  assert_eq!(session.id(), grant.session_id);
  assert_eq!(session.user_id(), "alice");
  assert_eq!(router.session_count(), 1);
}

#[tokio::test]
async fn invalid_credentials_leave_the_connection_unauthenticated() {
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(1);
  let error = router
    .create_session(connection, "alice", "wrong")
    .await
    .unwrap_err();
  assert_eq!(
    error,
    AuthenticationError::Denied(VerificationDenied::new(INVALID_CREDENTIALS))
  );
  assert!(error.is_denial());
  assert!(router.session(connection).is_none());

  // A denial does not consume the connection's chance to authenticate
  router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
}

#[tokio::test]
async fn second_authentication_is_refused() {
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(1);
  let grant = router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  assert_eq!(
    router
      .create_session(connection, "bob", "hunter2")
      .await
      .unwrap_err(),
    AuthenticationError::AlreadyAuthenticated
  );
  assert_eq!(router.session(connection).unwrap().id(), grant.session_id);
  assert_eq!(router.session_count(), 1);
}

#[tokio::test]
async fn concurrent_attempts_on_one_connection_create_one_session() {
  init_tracing();
  let verifier = Arc::new(GatedVerifier::default());
  let router = router_with(verifier.clone(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(1);

  let first = tokio::spawn({
    let router = Arc::clone(&router);
    async move { router.create_session(connection, "alice", "secret1").await }
  });
  verifier.entered.notified().await;
  assert_eq!(
    router
      .create_session(connection, "alice", "secret1")
      .await
      .unwrap_err(),
    AuthenticationError::AuthenticationInProgress
  );
  verifier.gate.notify_one();
  first.await.unwrap().unwrap();
  assert_eq!(router.session_count(), 1);
}

#[tokio::test]
async fn racing_attempts_on_one_connection_create_one_session() {
  let router = router_with(
    Arc::new(SlowVerifier(Duration::from_millis(20))),
    MockInvocationTransport::new(),
    None,
  );
  let connection = ConnectionId::new(1);
  let attempts: Vec<_> = (0..16)
    .map(|_| {
      let router = Arc::clone(&router);
      tokio::spawn(async move { router.create_session(connection, "alice", "secret1").await })
    })
    .collect();
  let mut granted = 0;
  for attempt in attempts {
    match attempt.await.unwrap() {
      Ok(_) => granted += 1,
      Err(
        AuthenticationError::AuthenticationInProgress | AuthenticationError::AlreadyAuthenticated,
      ) => {}
      Err(other) => panic!("Unexpected authentication failure: {other:?}"),
    }
  }
  assert_eq!(granted, 1);
  assert_eq!(router.session_count(), 1);
}

#[tokio::test]
async fn concurrent_connections_get_distinct_sessions() {
  let router = router_with(
    Arc::new(SlowVerifier(Duration::from_millis(5))),
    MockInvocationTransport::new(),
    None,
  );
  let tasks: Vec<_> = (0..32)
    .map(ConnectionId::new)
    .map(|connection| {
      let router = Arc::clone(&router);
      tokio::spawn(async move { router.create_session(connection, "alice", "secret1").await })
    })
    .collect();
  let mut ids = HashSet::new();
  for task in tasks {
    ids.insert(task.await.unwrap().unwrap().session_id);
  }
  assert_eq!(ids.len(), 32);
  assert_eq!(router.session_count(), 32);

  for connection in (0..32).map(ConnectionId::new) {
    assert!(router.destroy_session(connection).is_some());
  }
  assert_eq!(router.session_count(), 0);
  assert!(router.sessions().is_empty());
}

#[tokio::test]
async fn closing_a_connection_mid_verification_cancels_authentication() {
  init_tracing();
  let verifier = Arc::new(GatedVerifier::default());
  let router = router_with(verifier.clone(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(3);

  let attempt = tokio::spawn({
    let router = Arc::clone(&router);
    async move { router.create_session(connection, "alice", "secret1").await }
  });
  verifier.entered.notified().await;
  assert!(router.connection_closed(connection).is_none());
  let result = tokio::time::timeout(Duration::from_secs(5), attempt)
    .await
    .expect("Authentication must not outlive its connection")
    .unwrap();
  assert_eq!(result.unwrap_err(), AuthenticationError::Cancelled);
  assert_eq!(router.session_count(), 0);

  // The gate was never opened; nothing may linger in the table
  assert!(router.session(connection).is_none());
}

#[tokio::test]
async fn forwarding_reaches_the_backend_with_the_origin_session() {
  let mut transport = MockInvocationTransport::new();
  transport
    .expect_send_to_backend()
    .times(1)
    .withf(|_origin, invocation| invocation.target == "10.0.0.5:7000" && invocation.operation == "ping")
    .returning(|_origin, invocation| {
      futures::future::ready(Ok(InvocationReply {
        payload: invocation.payload,
      }))
      .boxed()
    });
  let router = router_with(local_verifier(), transport, None);
  let connection = ConnectionId::new(1);
  router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  let reply = router
    .forward_from_client(connection, Invocation::new("10.0.0.5:7000", "ping", b"hi".to_vec()))
    .await
    .unwrap();
  assert_eq!(reply.payload, b"hi");
}

#[tokio::test]
async fn unauthenticated_connections_cannot_forward() {
  // The mock panics if the transport is reached at all
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let error = router
    .forward_from_client(ConnectionId::new(9), Invocation::new("10.0.0.5:7000", "ping", vec![]))
    .await
    .unwrap_err();
  assert_eq!(error, RoutingError::SessionNotFound);
}

#[tokio::test]
async fn unconfigured_backends_are_never_dialed() {
  // No send_to_backend expectation: reaching the transport fails the test
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(1);
  router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  for target in ["127.0.0.1:4070", "10.0.0.5:7001", "backend"] {
    assert_eq!(
      router
        .forward_from_client(connection, Invocation::new(target, "ping", vec![]))
        .await
        .unwrap_err(),
      RoutingError::UnknownBackend(target.to_string())
    );
  }
  // The refusal leaves the session usable
  assert!(router.session(connection).is_some());
}

#[tokio::test]
async fn destroyed_sessions_stop_forwarding() {
  let mut transport = MockInvocationTransport::new();
  echo_backend(&mut transport);
  let router = router_with(local_verifier(), transport, None);
  let connection = ConnectionId::new(1);
  let grant = router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  router
    .forward_from_client(connection, Invocation::new("backend:1", "ping", vec![]))
    .await
    .unwrap();

  assert_eq!(router.destroy_session(connection), Some(grant.session_id));
  assert_eq!(
    router
      .forward_from_client(connection, Invocation::new("backend:1", "ping", vec![]))
      .await
      .unwrap_err(),
    RoutingError::SessionNotFound
  );
  // Logging out twice is harmless
  assert_eq!(router.destroy_session(connection), None);
  assert_eq!(router.connection_closed(connection), None);

  // Logging out returns the connection to the unauthenticated state
  router
    .create_session(connection, "bob", "hunter2")
    .await
    .unwrap();
}

#[tokio::test]
async fn transport_failures_are_reported() {
  let mut transport = MockInvocationTransport::new();
  transport
    .expect_send_to_backend()
    .returning(|_origin, invocation| {
      futures::future::ready(Err(TransportError::Unreachable(invocation.target))).boxed()
    });
  let router = router_with(local_verifier(), transport, None);
  let connection = ConnectionId::new(1);
  router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  assert_eq!(
    router
      .forward_from_client(connection, Invocation::new("backend:1", "ping", vec![]))
      .await
      .unwrap_err(),
    RoutingError::Transport(TransportError::Unreachable("backend:1".into()))
  );
  // Delivery failures do not end the session
  assert!(router.session(connection).is_some());
}

#[tokio::test]
async fn callbacks_reach_the_owning_connection() {
  let connection = ConnectionId::new(42);
  let mut transport = MockInvocationTransport::new();
  transport
    .expect_send_to_client()
    .times(1)
    .withf(move |target, invocation| *target == connection && invocation.operation == "notify")
    .returning(|_, _| futures::future::ready(Ok(())).boxed());
  let router = router_with(local_verifier(), transport, Some(SERVER_ENDPOINT));

  let grant = router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  let target = grant.callback_target.clone().unwrap();
  assert_eq!(target.endpoint, SERVER_ENDPOINT);
  assert_eq!(target.category, grant.session_id);
  assert_eq!(router.server_target(connection), Ok(Some(target.clone())));

  router
    .forward_to_client(&target.category, Invocation::new("", "notify", vec![]))
    .await
    .unwrap();

  router.connection_closed(connection);
  assert_eq!(
    router
      .forward_to_client(&target.category, Invocation::new("", "notify", vec![]))
      .await
      .unwrap_err(),
    RoutingError::SessionNotFound
  );
  assert_eq!(
    router.server_target(connection),
    Err(RoutingError::SessionNotFound)
  );
}

#[tokio::test]
async fn callbacks_require_a_server_endpoint() {
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let connection = ConnectionId::new(1);
  let grant = router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  assert_eq!(router.server_target(connection), Ok(None));
  assert_eq!(
    router
      .forward_to_client(&grant.session_id, Invocation::new("", "notify", vec![]))
      .await
      .unwrap_err(),
    RoutingError::CallbacksDisabled
  );
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let mut created = router.session_created.subscribe();
  let mut destroyed = router.session_destroyed.subscribe();
  let connection = ConnectionId::new(5);

  let grant = router
    .create_session(connection, "alice", "secret1")
    .await
    .unwrap();
  assert_eq!(created.recv().await.unwrap().id(), grant.session_id);

  router.connection_closed(connection);
  let event = destroyed.recv().await.unwrap();
  assert_eq!(event.session_id, grant.session_id);
  assert_eq!(event.connection, connection);
  assert_eq!(event.user_id, "alice");
  assert_eq!(event.reason, DestroyReason::ConnectionClosed);
}

#[tokio::test]
async fn shutdown_destroys_sessions_and_refuses_new_ones() {
  init_tracing();
  let router = router_with(local_verifier(), MockInvocationTransport::new(), None);
  let mut destroyed = router.session_destroyed.subscribe();
  let sessions: Vec<_> = futures::future::join_all(
    (0..3)
      .map(ConnectionId::new)
      .map(|connection| router.create_session(connection, "bob", "hunter2")),
  )
  .await
  .into_iter()
  .collect::<Result<_, _>>()
  .unwrap();
  let held: Vec<_> = (0..3)
    .map(|i| router.session(ConnectionId::new(i)).unwrap())
    .collect();

  assert_eq!(router.shutdown(), sessions.len());
  assert!(router.is_shutting_down());
  assert!(held.iter().all(|session| session.is_destroyed()));
  for _ in 0..3 {
    assert_eq!(destroyed.recv().await.unwrap().reason, DestroyReason::Shutdown);
  }
  assert_eq!(
    router
      .create_session(ConnectionId::new(10), "alice", "secret1")
      .await
      .unwrap_err(),
    AuthenticationError::ShuttingDown
  );
  assert_eq!(router.shutdown(), 0);
}

#[tokio::test]
async fn shutdown_cancels_pending_verification() {
  let verifier = Arc::new(GatedVerifier::default());
  let router = router_with(verifier.clone(), MockInvocationTransport::new(), None);
  let attempt = tokio::spawn({
    let router = Arc::clone(&router);
    async move {
      router
        .create_session(ConnectionId::new(1), "alice", "secret1")
        .await
    }
  });
  verifier.entered.notified().await;
  router.shutdown();
  assert_eq!(
    attempt.await.unwrap().unwrap_err(),
    AuthenticationError::Cancelled
  );
  assert_eq!(router.session_count(), 0);
}

#[tokio::test]
async fn remote_verifier_decides_admission() {
  init_tracing();
  let service = Arc::new(VerifierService::new(local_verifier()));
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let shutdown = tokio_util::sync::CancellationToken::new();
  let serving = tokio::spawn(service.serve(listener, shutdown.clone()));

  let remote = Arc::new(RemotePermissionsVerifier::checked(addr).await.unwrap());
  let router = router_with(remote, MockInvocationTransport::new(), None);
  router
    .create_session(ConnectionId::new(1), "alice", "secret1")
    .await
    .unwrap();
  assert!(router
    .create_session(ConnectionId::new(2), "alice", "nope")
    .await
    .unwrap_err()
    .is_denial());

  shutdown.cancel();
  serving.await.unwrap();

  // With the verifier gone, authentication is denied rather than hung or panicked
  let error = router
    .create_session(ConnectionId::new(3), "bob", "hunter2")
    .await
    .unwrap_err();
  assert_eq!(
    error,
    AuthenticationError::Denied(VerificationDenied::new(VERIFIER_UNAVAILABLE))
  );
  assert_eq!(router.session_count(), 1);
}

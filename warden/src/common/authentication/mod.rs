// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types supporting verification of client credentials before a session is granted
#[deny(unused_imports)]
mod traits;
pub use traits::*;

mod credential_store;
pub use credential_store::{CredentialStore, CredentialStoreError};

mod local_verifier;
pub use local_verifier::LocalPermissionsVerifier;

pub mod remote_verifier;
pub use remote_verifier::{RemotePermissionsVerifier, RemoteVerifierError, VerifierService};

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Authenticating session router
//!
//! Clients authenticate once per connection through a [PermissionsVerifier], after which
//! a [Session] bound to that connection carries their invocations to backends, and
//! carries backend callbacks back to them, until the connection goes away.
//!
//! [PermissionsVerifier]: common::authentication::PermissionsVerifier
//! [Session]: common::session::Session
#![warn(unused_imports)]

pub mod common;
pub mod util;

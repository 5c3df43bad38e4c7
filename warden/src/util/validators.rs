// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Resolves a `host:port` string, taking the first address produced
pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  let mut addresses = ToSocketAddrs::to_socket_addrs(v)?;
  addresses
    .next()
    .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

/// Router identities take the form `category/name`, or a bare name
pub fn parse_router_identity(v: &str) -> Result<String> {
  let trimmed = v.trim();
  if trimmed.is_empty() {
    return Err(AnyErr::msg("Router identity must not be empty"));
  }
  if trimmed.chars().any(char::is_whitespace) {
    return Err(AnyErr::msg("Router identity must not contain whitespace"));
  }
  match trimmed.split_once('/') {
    Some((_, name)) if name.is_empty() => {
      Err(AnyErr::msg("Router identity must have a name after its category"))
    }
    Some((_, name)) if name.contains('/') => {
      Err(AnyErr::msg("Router identity may contain at most one category separator"))
    }
    _ => Ok(trimmed.to_string()),
  }
}

pub fn validate_router_identity(v: &str) -> Result<(), String> {
  parse_router_identity(v).map(|_| ()).map_err(|e| e.to_string())
}

/// Backend addresses are `host:port`; they are checked for shape but never resolved
pub fn parse_backend_address(v: &str) -> Result<String> {
  let trimmed = v.trim();
  let (host, port) = trimmed
    .rsplit_once(':')
    .ok_or_else(|| AnyErr::msg("Backend address must take the form host:port"))?;
  if host.is_empty() || host.chars().any(char::is_whitespace) {
    return Err(AnyErr::msg("Backend address must name a host"));
  }
  match port.parse::<u16>() {
    Ok(0) | Err(_) => Err(AnyErr::msg("Backend address must end in a nonzero port")),
    Ok(_) => Ok(trimmed.to_string()),
  }
}

pub fn validate_backend_address(v: &str) -> Result<(), String> {
  parse_backend_address(v).map(|_| ()).map_err(|e| e.to_string())
}

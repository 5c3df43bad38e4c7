// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use warden::util;

use util::validators::{
  parse_socketaddr, validate_backend_address, validate_existing_file, validate_router_identity,
  validate_socketaddr,
};

mod router;
mod verifier;
mod wire;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("router")
        .alias("-r")
        .about("Authenticate clients and route their invocations to backends")
        .arg(
          Arg::new("client")
            .help("Endpoint accepting client connections")
            .long("client")
            .short('c')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("server")
            .help("Endpoint accepting backend callbacks; callbacks are disabled without it")
            .long("server")
            .short('s')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("verifier")
            .help("Address of a remote permissions verifier")
            .long("verifier")
            .short('v')
            .validator(validate_socketaddr)
            .takes_value(true)
            .conflicts_with("passwords"),
        )
        .arg(
          Arg::new("passwords")
            .help("Credential file of whitespace-separated user and secret pairs [default: passwords]")
            .long("passwords")
            .short('p')
            .validator(validate_existing_file)
            .takes_value(true),
        )
        .arg(
          Arg::new("identity")
            .help("Identity under which clients address the router [default: Warden/router]")
            .long("identity")
            .validator(validate_router_identity)
            .takes_value(true),
        )
        .arg(
          Arg::new("backend")
            .help("Backend host:port clients may invoke; repeat for each backend")
            .long("backend")
            .validator(validate_backend_address)
            .takes_value(true)
            .multiple_occurrences(true),
        ),
    )
    .subcommand(
      Command::new("verifier")
        .about("Serve a credential file to routers configured with --verifier")
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:4070")
            .takes_value(true),
        )
        .arg(
          Arg::new("passwords")
            .long("passwords")
            .short('p')
            .validator(validate_existing_file)
            .default_value("passwords")
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

/// Cancels the returned token on Ctrl-C; abort the task once the token is no longer watched
pub(crate) fn ctrl_c_cancellation() -> (CancellationToken, tokio::task::JoinHandle<()>) {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  let sigint_handler_task = tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::trace!("SIGINT detected, initiating graceful shutdown");
    shutdown_trigger.cancel();
  });
  (shutdown, sigint_handler_task)
}

pub fn router_arg_handling(args: &'_ ArgMatches) -> Result<router::RouterArgs> {
  Ok(router::RouterArgs {
    client: parse_socketaddr(args.value_of("client").unwrap())?,
    server: args.value_of("server").map(parse_socketaddr).transpose()?,
    verifier: args.value_of("verifier").map(parse_socketaddr).transpose()?,
    passwords: args.value_of("passwords").map(PathBuf::from),
    identity: args.value_of("identity").map(String::from),
    backends: args
      .values_of("backend")
      .map(|backends| backends.map(String::from).collect())
      .unwrap_or_default(),
  })
}

pub fn verifier_arg_handling(args: &'_ ArgMatches) -> Result<verifier::VerifierArgs> {
  Ok(verifier::VerifierArgs {
    bind: parse_socketaddr(args.value_of("bind").unwrap())?,
    passwords: PathBuf::from(args.value_of("passwords").unwrap()),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("router", opts) => {
      let config = router_arg_handling(opts)?;
      tracing::info!("Running as router with config {:#?}", config);
      router::router_main(config).await
    }
    ("verifier", opts) => {
      let config = verifier_arg_handling(opts)?;
      tracing::info!("Running as verifier with config {:#?}", config);
      verifier::verifier_main(config).await
    }
    (_, _) => unreachable!(),
  }
}

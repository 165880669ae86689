//! The `connet` binary.
//!
//! `connet server <file>` runs the control server with a colocated relay,
//! `connet client <file>` runs a client, `connet check <file>` validates a
//! config file. `connet <file>.toml` is shorthand for `client` when the
//! file exists.

mod config;

use std::collections::HashMap;
use std::ffi::OsString;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use connet_control::{StaticClientAuthenticator, StaticRelayAuthenticator};
use connet_core::{Forward, HostPort};
use rand::Rng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::error;

use config::{Config, ConfigError, LogFormat};

const EXIT_BAD_FLAGS: u8 = 1;
const EXIT_BAD_CONFIG: u8 = 2;
const EXIT_UNKNOWN_SUBCOMMAND: u8 = 3;
const EXIT_SERVER_ERROR: u8 = 4;
const EXIT_CLIENT_ERROR: u8 = 5;
const EXIT_INVALID_KEYS: u8 = 6;

/// Reverse proxy TCP behind NAT, over QUIC.
#[derive(Parser)]
#[command(name = "connet", version, disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control server and its colocated relay.
    Server { file: PathBuf },
    /// Run a client.
    Client { file: PathBuf },
    /// Validate that all keys in a config file are recognized.
    Check { file: PathBuf },
}

fn main() -> ExitCode {
    let mut args: Vec<OsString> = std::env::args_os().collect();

    // `connet somefile.toml` means `connet client somefile.toml`
    if args.len() == 2 {
        let candidate = Path::new(&args[1]);
        if candidate.extension().is_some_and(|ext| ext == "toml") && candidate.exists() {
            args.insert(1, OsString::from("client"));
        }
    }

    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = err.print();
                    return ExitCode::SUCCESS;
                }
                ErrorKind::InvalidSubcommand | ErrorKind::UnknownArgument => {
                    EXIT_UNKNOWN_SUBCOMMAND
                }
                _ => EXIT_BAD_FLAGS,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let file = match &cli.command {
        Command::Server { file } | Command::Client { file } | Command::Check { file } => file,
    };
    let config = match Config::load(file) {
        Ok(config) => config,
        Err(err @ ConfigError::UnknownKeys(_)) => {
            eprintln!("{err}");
            return ExitCode::from(if matches!(cli.command, Command::Check { .. }) {
                EXIT_INVALID_KEYS
            } else {
                EXIT_BAD_CONFIG
            });
        }
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };

    if let Command::Check { file } = &cli.command {
        println!("{}: ok", file.display());
        return ExitCode::SUCCESS;
    }

    init_logging(&config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("cannot start runtime: {err}");
            return ExitCode::from(EXIT_BAD_FLAGS);
        }
    };

    match cli.command {
        Command::Server { .. } => match runtime.block_on(run_server(config)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(err = %err, "server failed");
                ExitCode::from(EXIT_SERVER_ERROR)
            }
        },
        Command::Client { .. } => match runtime.block_on(run_client(config)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(err = %err, "client failed");
                ExitCode::from(EXIT_CLIENT_ERROR)
            }
        },
        Command::Check { .. } => unreachable!("handled above"),
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_str()));

    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut data.as_slice()).collect();
    let certs = certs.with_context(|| format!("parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .with_context(|| format!("parse key in {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

fn resolve(addr: &str, default_port: u16) -> anyhow::Result<(SocketAddr, String)> {
    let (host, addr_with_port) = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => (host.to_string(), addr.to_string()),
        _ => (addr.to_string(), format!("{addr}:{default_port}")),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let resolved = addr_with_port
        .to_socket_addrs()
        .with_context(|| format!("resolve {addr_with_port}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses for {addr_with_port}"))?;
    Ok((resolved, host))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let server = config.server.context("missing [server] section")?;

    let (control_cert, control_key) = server.listener_files(&server.control)?;
    let cert_chain = load_certs(&control_cert)?;
    let key = load_key(&control_key)?;
    let state_dir = server.state_dir();

    // the colocated relay authenticates over loopback with a one-shot token
    let relay_token: String = {
        let mut rng = rand::thread_rng();
        (0..32).map(|_| rng.gen_range('a'..='z')).collect()
    };

    let control = connet_control::Server::new(connet_control::Config {
        addr: server.control.bind_addr,
        cert_chain: cert_chain.clone(),
        key,
        client_auth: Arc::new(StaticClientAuthenticator::new(server.tokens.clone())),
        relay_auth: Arc::new(StaticRelayAuthenticator::new([relay_token.clone()])),
        dir: state_dir.join("control"),
    })?;

    let mut control_dial = server.control.bind_addr;
    if control_dial.ip().is_unspecified() {
        control_dial.set_ip("127.0.0.1".parse().expect("valid address"));
    }

    let relay = connet_relay::Relay::new(connet_relay::RelayConfig {
        control_addr: control_dial,
        control_host: server.hostname.clone(),
        control_cas: Some(cert_chain),
        token: relay_token,
        hostport: HostPort::new(server.hostname.clone(), server.relay.bind_addr.port()),
        bind_addr: server.relay.bind_addr,
        dir: state_dir.join("relay"),
    })?;

    tokio::try_join!(
        async { control.run().await.context("control server") },
        async { relay.run().await.context("relay") },
    )?;
    Ok(())
}

async fn run_client(config: Config) -> anyhow::Result<()> {
    let client = config.client.context("missing [client] section")?;

    let (control_addr, control_host) = resolve(&client.server_addr, 19190)?;
    let control_cas = match &client.server_cas {
        Some(path) => Some(load_certs(path)?),
        None => None,
    };

    let mut destinations = HashMap::new();
    for (name, fwd) in client.destinations {
        destinations.insert(
            Forward::new(name),
            connet_client::ForwardConfig {
                addr: fwd.addr,
                route: fwd.route,
            },
        );
    }
    let mut sources = HashMap::new();
    for (name, fwd) in client.sources {
        sources.insert(
            Forward::new(name),
            connet_client::ForwardConfig {
                addr: fwd.addr,
                route: fwd.route,
            },
        );
    }

    let client = connet_client::Client::new(connet_client::ClientConfig {
        token: client.token,
        control_addr,
        control_host,
        control_cas,
        direct_addr: client.direct_addr,
        destinations,
        sources,
    })?;

    client.run().await.context("client")?;
    Ok(())
}

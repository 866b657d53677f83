#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # leasegw-client
//!
//! Operator tooling for the tenant side of a provider gateway.
//!
//! ```text
//! leasegw-client --provider host:8443 --provider-address akash1... \
//!     --cert me.pem --key me-key.pem --registry registry.toml <command>
//! ```
//!
//! - `status`: provider status
//! - `lease-status`: status of one lease
//! - `shell`: run a command in a service replica; exits with its exit code
//! - `logs`: print service logs, optionally following them
//! - `events`: print lease events, optionally following them

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leasegw::address::{AccountAddress, DEFAULT_HRP};
use leasegw::lease::LeaseId;
use leasegw::protocol::{TerminalSize, PONG_WAIT};
use leasegw::registry::MemoryRegistry;
use leasegw::tls::verifier::CertificateFields;
use leasegw::tls::{TlsIdentity, TrustVerifier};
use leasegw_client::{LogOptions, ProviderClient, ShellError, ShellIo, ShellRequest};

/// Tenant client for a leasegw provider gateway.
#[derive(Parser)]
#[command(name = "leasegw-client", version)]
struct Cli {
    /// Provider gateway as `host:port`.
    #[arg(long)]
    provider: String,
    /// The provider's account address; its certificate must carry it.
    #[arg(long)]
    provider_address: String,
    /// PEM certificate of this tenant.
    #[arg(long)]
    cert: PathBuf,
    /// PEM private key of this tenant.
    #[arg(long)]
    key: PathBuf,
    /// Certificate registry file used to check the provider.
    #[arg(long)]
    registry: PathBuf,
    /// Bech32 prefix of account addresses.
    #[arg(long, default_value = DEFAULT_HRP)]
    prefix: String,
    /// Seconds a log or event stream may go without a provider ping. Must
    /// exceed the provider's ping period.
    #[arg(long, default_value_t = PONG_WAIT.as_secs())]
    keepalive_secs: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LeaseArgs {
    #[arg(long)]
    dseq: u64,
    #[arg(long, default_value_t = 1)]
    gseq: u32,
    #[arg(long, default_value_t = 1)]
    oseq: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the provider's status.
    Status,
    /// Show a lease's service status.
    LeaseStatus {
        #[command(flatten)]
        lease: LeaseArgs,
    },
    /// Run a command in a service replica.
    Shell {
        #[command(flatten)]
        lease: LeaseArgs,
        #[arg(long)]
        service: String,
        #[arg(long, default_value_t = 0)]
        replica: u32,
        /// Allocate a terminal; local stdin is switched to raw mode.
        #[arg(long)]
        tty: bool,
        /// Forward local stdin.
        #[arg(long)]
        stdin: bool,
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
    /// Print service logs.
    Logs {
        #[command(flatten)]
        lease: LeaseArgs,
        /// Comma-separated service names; all services when omitted.
        #[arg(long, value_delimiter = ',')]
        service: Vec<String>,
        #[arg(long)]
        follow: bool,
        /// Lines of history per source.
        #[arg(long)]
        tail: Option<u64>,
    },
    /// Print lease events.
    Events {
        #[command(flatten)]
        lease: LeaseArgs,
        #[arg(long, value_delimiter = ',')]
        service: Vec<String>,
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("leasegw-client: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let registry = Arc::new(MemoryRegistry::load(&cli.registry)?);
    let trust = Arc::new(TrustVerifier::new(registry, cli.prefix.clone()));
    let identity = TlsIdentity::load(&cli.cert, &cli.key)?;
    let owner = certificate_owner(&identity, &cli.prefix)?;
    let provider = AccountAddress::parse_with_prefix(&cli.provider_address, &cli.prefix)?;
    let client = ProviderClient::new(cli.provider, identity, trust, Some(provider.clone()))?
        .with_keepalive(Duration::from_secs(cli.keepalive_secs));
    let lease_id = |args: &LeaseArgs| LeaseId {
        owner: owner.clone(),
        dseq: args.dseq,
        gseq: args.gseq,
        oseq: args.oseq,
        provider: provider.clone(),
    };

    match cli.command {
        Commands::Status => print_json(&client.status().await?)?,
        Commands::LeaseStatus { lease } => {
            print_json(&client.lease_status(&lease_id(&lease)).await?)?;
        }
        Commands::Shell {
            lease,
            service,
            replica,
            tty,
            stdin,
            cmd,
        } => {
            let request = ShellRequest {
                service,
                pod_index: replica,
                cmd,
                tty,
            };
            return shell(&client, &lease_id(&lease), request, stdin).await;
        }
        Commands::Logs {
            lease,
            service,
            follow,
            tail,
        } => {
            let options = LogOptions {
                services: service,
                follow,
                tail,
            };
            let mut logs = client.lease_logs(&lease_id(&lease), &options).await?;
            while let Some(line) = logs.next().await? {
                println!("[{}] {}", line.name, line.message);
            }
        }
        Commands::Events {
            lease,
            service,
            follow,
        } => {
            let mut events = client
                .lease_events(&lease_id(&lease), &service, follow)
                .await?;
            while let Some(event) = events.next().await? {
                println!(
                    "{} {} {}/{}: {}",
                    event.kind, event.reason, event.object.kind, event.object.name, event.note
                );
            }
        }
    }
    Ok(0)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Owner address from the CommonName of our own certificate.
fn certificate_owner(identity: &TlsIdentity, prefix: &str) -> Result<AccountAddress, String> {
    let leaf = identity
        .chain
        .first()
        .ok_or_else(|| "certificate file holds no certificate".to_string())?;
    let fields = CertificateFields::parse(leaf.as_ref()).map_err(|e| e.to_string())?;
    let cn = fields
        .common_name
        .ok_or_else(|| "certificate has no CommonName".to_string())?;
    AccountAddress::parse_with_prefix(&cn, prefix)
        .map_err(|e| format!("certificate CommonName {cn:?}: {e}"))
}

async fn shell(
    client: &ProviderClient,
    lease: &LeaseId,
    request: ShellRequest,
    forward_stdin: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let _raw = if request.tty && forward_stdin {
        terminal::RawMode::enable()
    } else {
        None
    };
    let resize = if request.tty {
        Some(terminal::watch_size(cancel.clone()))
    } else {
        None
    };

    let io = ShellIo {
        stdin: forward_stdin.then(tokio::io::stdin),
        stdout: tokio::io::stdout(),
        stderr: tokio::io::stderr(),
        resize,
    };
    match client.lease_shell(lease, &request, io, cancel).await {
        Ok(code) => {
            debug!(code, "remote command exited");
            Ok(code)
        }
        Err(ShellError::Remote(message)) => Err(message.into()),
        Err(e) => Err(e.into()),
    }
}

mod terminal {
    use std::os::fd::AsRawFd;

    use nix::sys::termios::{self, SetArg, Termios};
    use tokio::signal::unix::{signal, SignalKind};

    use super::{mpsc, warn, CancellationToken, TerminalSize};

    /// Puts stdin into raw mode until dropped.
    pub struct RawMode {
        saved: Termios,
    }

    impl RawMode {
        pub fn enable() -> Option<Self> {
            let stdin = std::io::stdin();
            let saved = match termios::tcgetattr(&stdin) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "stdin is not a terminal, leaving it as is");
                    return None;
                }
            };
            let mut raw = saved.clone();
            termios::cfmakeraw(&mut raw);
            if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
                warn!(error = %e, "could not switch stdin to raw mode");
                return None;
            }
            Some(Self { saved })
        }
    }

    impl Drop for RawMode {
        fn drop(&mut self) {
            let _ = termios::tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.saved);
        }
    }

    fn current_size() -> Option<TerminalSize> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let fd = std::io::stdout().as_raw_fd();
        // SAFETY: TIOCGWINSZ writes one winsize into `ws`, which outlives the call.
        let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, std::ptr::addr_of_mut!(ws)) };
        (ret == 0).then(|| TerminalSize::new(ws.ws_col, ws.ws_row))
    }

    /// Current terminal size, then one entry per SIGWINCH.
    pub fn watch_size(cancel: CancellationToken) -> mpsc::Receiver<TerminalSize> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            if let Some(size) = current_size() {
                if tx.send(size).await.is_err() {
                    return;
                }
            }
            let mut winch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot watch terminal size");
                    return;
                }
            };
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    got = winch.recv() => if got.is_none() { return },
                }
                if let Some(size) = current_size() {
                    if tx.send(size).await.is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }
}

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hamlink::config::Config;
use hamlink::exchange::{ConnectionState, ExchangeArbiter, SessionFactory};
use hamlink::fbb::{
    secure_login_response, Address, Session, StatusObserver, TransferStatus,
};
use hamlink::listener::ListenerHub;
use hamlink::mailbox::SharedMailbox;
use hamlink::transport::telnet::{self, TelnetTransport};

#[derive(Parser)]
#[command(name = "hamlink", about = "Winlink 2000 client engine", version)]
struct Cli {
    /// Config file path (defaults to the per-user location).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured callsign.
    #[arg(long, global = true)]
    mycall: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dial a remote station and exchange messages as session master.
    ///
    /// TARGET is an alias from the config, or "host:port/TARGETCALL".
    Connect { target: String },
    /// Listen for incoming connections on the telnet transport.
    Listen {
        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Compute the secure login response for a challenge (diagnostic).
    SecureResponse {
        challenge: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the resolved configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config = Config::load(&config_path)?;
    if let Some(mycall) = cli.mycall {
        config.mycall = mycall;
    }

    match cli.command {
        Commands::Connect { target } => {
            require_station(&config)?;
            let target = config.resolve_alias(&target).to_string();
            let Some((addr, targetcall)) = target.rsplit_once('/') else {
                bail!("Missing target call in '{}': expected host:port/TARGETCALL", target);
            };
            let targetcall = targetcall.to_string();

            let mailbox = SharedMailbox::new();
            let arbiter = Arc::new(ExchangeArbiter::new(session_factory(
                config.clone(),
                mailbox.clone(),
            )));
            let state = arbiter.connection_state();

            info!("Connecting to {}...", target);
            let stream = {
                let (_guard, mut cancelled) = Arc::clone(&state).begin_dial(&targetcall);
                tokio::select! {
                    result = telnet::dial(addr) => result
                        .with_context(|| format!("Unable to establish connection to {}", addr))?,
                    _ = cancelled.changed() => bail!("Dial aborted"),
                    _ = tokio::signal::ctrl_c() => bail!("Dial interrupted"),
                }
            };

            spawn_interrupt_handler(Arc::clone(&state));
            match arbiter.submit(Box::new(stream), &targetcall, true).await {
                Ok(stats) => {
                    info!(
                        "Disconnected. Sent {}, received {}.",
                        stats.sent.len(),
                        stats.received.len()
                    );
                    mailbox.with(|mb| {
                        for msg in mb.received() {
                            info!("  {} {}", msg.mid, msg.title);
                        }
                    });
                }
                Err(err) => {
                    error!("Exchange failed ({:?}): {}", err.category(), err);
                    std::process::exit(1);
                }
            }
        }
        Commands::Listen { bind } => {
            require_station(&config)?;
            if let Some(bind) = bind {
                config.telnet_listen_addr = bind;
            }

            let mailbox = SharedMailbox::new();
            let arbiter = Arc::new(ExchangeArbiter::new(session_factory(
                config.clone(),
                mailbox,
            )));
            let state = arbiter.connection_state();
            let hub = ListenerHub::new(Arc::clone(&arbiter));
            hub.enable(Arc::new(TelnetTransport::new(
                config.telnet_listen_addr.clone(),
            )));
            info!("Listening on {} (telnet)", config.telnet_listen_addr);

            loop {
                tokio::signal::ctrl_c().await?;
                // First interrupt aborts any exchange in flight; the next
                // one (or an idle one) shuts the listeners down.
                let dirty = state.graceful_attempted();
                if !state.abort(dirty) {
                    break;
                }
            }
            hub.close_all();
            info!("Listeners closed");
        }
        Commands::SecureResponse {
            challenge,
            password,
        } => {
            let password = match password.or(config.secure_login_password) {
                Some(password) => password,
                None => prompt_password("the challenge")?,
            };
            println!("{}", secure_login_response(&challenge, &password));
        }
        Commands::Config => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string(&config)?);
        }
    }

    Ok(())
}

fn require_station(config: &Config) -> Result<()> {
    if config.mycall.is_empty() {
        bail!(
            "No callsign configured. Set 'mycall' in the config file or pass --mycall."
        );
    }
    Ok(())
}

/// Builds one configured session per exchange job.
fn session_factory(config: Config, mailbox: SharedMailbox) -> SessionFactory {
    Box::new(move |target, master| {
        let mut session = Session::new(
            config.mycall.clone(),
            target,
            config.locator.clone(),
            Some(Box::new(mailbox.clone())),
        );
        session.set_master(master);
        session.set_motd(config.motd.clone());
        session.add_auxiliary_address(config.aux_addrs.iter().map(|a| Address::new(a.as_str())));
        session.set_status_observer(Arc::new(ProgressPrinter));

        let per_target = config.secure_login_passwords.clone();
        let shared = config.secure_login_password.clone();
        session.set_secure_login_fn(Box::new(move |target| {
            if let Some(password) = per_target.get(target) {
                return Ok(password.clone());
            }
            if let Some(password) = shared.as_ref().filter(|p| !p.is_empty()) {
                return Ok(password.clone());
            }
            prompt_password(target)
        }));
        session
    })
}

fn prompt_password(target: &str) -> Result<String> {
    eprint!("Enter secure login password for {}: ", target);
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read password")?;
    Ok(line.trim_end().to_string())
}

/// Escalating disconnect: graceful on the first interrupt, dirty once a
/// graceful abort was already attempted on the same connection.
fn spawn_interrupt_handler(state: Arc<ConnectionState>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let dirty = state.graceful_attempted();
            if !state.abort(dirty) {
                warn!("No connection to abort, exiting");
                std::process::exit(130);
            }
        }
    });
}

/// Prints transfer progress on one console line, like a download meter.
struct ProgressPrinter;

impl StatusObserver for ProgressPrinter {
    fn update_status(&self, status: TransferStatus) {
        let percent = if status.bytes_total == 0 {
            100.0
        } else {
            status.bytes_transferred as f64 / status.bytes_total as f64 * 100.0
        };
        eprint!("\r{}: {:3.0}%", status.title, percent);
        if status.done {
            eprintln!();
        }
    }
}

//! Relaylink Node -- chat client node with task engine and device linking.
//!
//! Usage:
//!   relaylink-node                      # Run with default config
//!   relaylink-node --config path.toml   # Run with custom config
//!   relaylink-node identity show        # Show client identity
//!   relaylink-node link --role responder --listen

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use relaylink_crypto::ClientIdentity;
use relaylink_node::config::{self, LinkRole};
use relaylink_node::connection::{ConnectionConfig, ConnectionState, ServerConnection};
use relaylink_node::linking::{DeviceLinkingTask, PathMode};
use relaylink_node::processor::NodeMessageProcessor;
use relaylink_node::{expand_tilde, task_registry};
use relaylink_rendezvous::{AuthenticationKey, PathId};
use relaylink_storage::{SqliteTaskArchive, TaskArchive};
use relaylink_tasks::TaskManager;

#[derive(Parser)]
#[command(name = "relaylink-node", about = "Relaylink chat client node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.relaylink/config.toml")]
    config: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the chat server and run tasks (default)
    Run,
    /// Show or generate the client identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Link with another device over one or more TCP paths
    Link {
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
        /// Nominate the first viable path (default from config)
        #[arg(long)]
        nominator: Option<bool>,
        /// Accept connections instead of dialing
        #[arg(long)]
        listen: bool,
        /// Authentication key, hex; generated if neither given nor configured
        #[arg(long)]
        ak: Option<String>,
        /// Candidate path as `pid=host:port`, repeatable
        #[arg(long = "path")]
        paths: Vec<String>,
    },
    /// List archived persistent tasks
    Tasks,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity key pair
    Generate {
        /// 8-character identity
        identity: String,
    },
    /// Show current client identity
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Initiator,
    Responder,
}

impl From<RoleArg> for LinkRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Initiator => LinkRole::Initiator,
            RoleArg::Responder => LinkRole::Responder,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relaylink_node=info,relaylink_tasks=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = config::NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Identity { action }) => {
            let key_path = expand_tilde(&cfg.client.identity_key);
            match action {
                Some(IdentityAction::Generate { identity }) => {
                    let identity = ClientIdentity::load_or_create(&key_path, &identity)?;
                    println!("Identity: {}", identity.identity());
                    println!("Public key: {}", identity.public_key().to_hex());
                    println!("Key file: {}", key_path.display());
                }
                Some(IdentityAction::Show) | None => {
                    if key_path.exists() {
                        let identity = ClientIdentity::from_file(&key_path)?;
                        println!("Identity: {}", identity.identity());
                        println!("Public key: {}", identity.public_key().to_hex());
                    } else {
                        eprintln!("No identity found at {}", key_path.display());
                        std::process::exit(1);
                    }
                }
            }
        }
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Link {
            role,
            nominator,
            listen,
            ak,
            paths,
        }) => {
            run_link(cfg, role, nominator, listen, ak, paths).await?;
        }
        Some(Commands::Tasks) => {
            let db_path = expand_tilde(&cfg.client.archive);
            if !db_path.exists() {
                println!("No task archive at {}", db_path.display());
                return Ok(());
            }
            let archive = SqliteTaskArchive::open_readonly(&db_path)?;
            let tasks = archive.load_all()?;
            println!("{} archived task(s)", tasks.len());
            for task in tasks {
                println!(
                    "{:>6}  {}  {:<20}  {}",
                    task.id,
                    task.archived_at.format("%Y-%m-%d %H:%M:%S"),
                    task.kind,
                    task.data
                );
            }
        }
    }

    Ok(())
}

async fn run_node(cfg: config::NodeConfig) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.client.identity_key);
    let identity = ClientIdentity::from_file(&key_path).with_context(|| {
        format!(
            "no identity at {}; run `relaylink-node identity generate <IDENTITY>`",
            key_path.display()
        )
    })?;
    let identity = Arc::new(identity);

    tracing::info!(
        identity = identity.identity(),
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server.addr,
        "starting relaylink-node"
    );

    let db_path = expand_tilde(&cfg.client.archive);
    let archive: Arc<dyn TaskArchive> = Arc::new(SqliteTaskArchive::open(&db_path)?);
    tracing::info!(db = %db_path.display(), "task archive opened");

    let tasks = TaskManager::new(cfg.tasks.clone(), archive);
    tasks.load_archived(&task_registry())?;

    let processor = Arc::new(NodeMessageProcessor::new());
    let connection = ServerConnection::new(
        ConnectionConfig {
            addr: cfg.server.addr.clone(),
            server_keys: cfg.server_keys()?,
            extensions: cfg.login_extensions()?,
            backoff: cfg.backoff(),
        },
        identity,
        tasks,
        processor.clone(),
    );

    let mut states = connection.subscribe();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if state == ConnectionState::Authenticated {
                tracing::info!("ready");
            }
        }
    });

    connection.start().await;
    tracing::info!("connection started, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    connection.stop().await;
    state_log.abort();

    tracing::info!(
        incoming = processor.incoming_count(),
        reflected = processor.reflected_count(),
        "shutdown complete"
    );
    Ok(())
}

fn parse_path(arg: &str) -> anyhow::Result<(PathId, SocketAddr)> {
    let (pid, addr) = arg
        .split_once('=')
        .with_context(|| format!("path {arg:?} must look like pid=host:port"))?;
    Ok((pid.parse()?, addr.parse()?))
}

async fn run_link(
    cfg: config::NodeConfig,
    role: Option<RoleArg>,
    nominator: Option<bool>,
    listen: bool,
    ak: Option<String>,
    paths: Vec<String>,
) -> anyhow::Result<()> {
    let role: LinkRole = role.map(Into::into).unwrap_or(cfg.linking.role);
    let ak = match ak {
        Some(key) => AuthenticationKey::from_hex(&key)?,
        None => match cfg.authentication_key()? {
            Some(ak) => ak,
            None => {
                let ak = AuthenticationKey::random();
                println!("Authentication key: {}", hex::encode(ak.0));
                ak
            }
        },
    };

    let paths = if paths.is_empty() {
        cfg.linking
            .paths
            .iter()
            .map(|entry| -> anyhow::Result<(PathId, SocketAddr)> {
                Ok((entry.pid, entry.addr.parse()?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
    } else {
        paths
            .iter()
            .map(|arg| parse_path(arg))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let task = DeviceLinkingTask {
        role: role.into(),
        is_nominator: nominator.unwrap_or(cfg.linking.nominator),
        ak,
        paths,
        mode: if listen || cfg.linking.listen {
            PathMode::Listen
        } else {
            PathMode::Dial
        },
        label: cfg.linking.device_label.clone(),
        connect_timeout: Duration::from_millis(cfg.linking.connect_timeout_ms),
    };
    let outcome = task.run().await?;
    println!("Linked with {} over path {}", outcome.remote_label, outcome.pid);
    println!("Rendezvous path hash: {}", outcome.rph);
    Ok(())
}

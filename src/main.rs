//! FluxKV - An In-Memory, Redis-Style Key-Value Engine
//!
//! This is the main entry point for the FluxKV server.
//! It replays the append-only log, sets up the TCP listener and serves
//! connections until Ctrl+C, then drains the log to disk.

use fluxkv::aof::{AofConfig, FsyncPolicy, Persister};
use fluxkv::connection::{handle_connection, ConnectionStats};
use fluxkv::database::{DbEngine, Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Number of databases
    databases: usize,
    /// Whether writes go to the append-only log
    appendonly: bool,
    appendfilename: String,
    appendfsync: FsyncPolicy,
    /// Directory holding the log
    dir: PathBuf,
    /// Scratch directory for rewrites (defaults to `dir`)
    tmp_dir: Option<PathBuf>,
    log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: fluxkv::DEFAULT_HOST.to_string(),
            port: fluxkv::DEFAULT_PORT,
            databases: 16,
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            appendfsync: FsyncPolicy::EverySec,
            dir: PathBuf::from("."),
            tmp_dir: None,
            log_level: Level::INFO,
        }
    }
}

/// Exits with a message when a flag's value is missing or malformed.
fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FluxKV version {}", fluxkv::VERSION);
                    std::process::exit(0);
                }
                _ => {}
            }

            let Some(value) = args.get(i + 1) else {
                if flag.starts_with('-') {
                    fail(&format!("{} requires a value", flag));
                }
                eprintln!("Unknown argument: {}", flag);
                print_help();
                std::process::exit(1);
            };

            match flag {
                "--host" | "-h" => config.host = value.clone(),
                "--port" | "-p" => {
                    config.port = value
                        .parse()
                        .unwrap_or_else(|_| fail("invalid port number"));
                }
                "--databases" => {
                    config.databases = match value.parse() {
                        Ok(n) if n > 0 => n,
                        _ => fail("--databases must be a positive integer"),
                    };
                }
                "--appendonly" => {
                    config.appendonly = match value.to_ascii_lowercase().as_str() {
                        "yes" => true,
                        "no" => false,
                        _ => fail("--appendonly must be yes or no"),
                    };
                }
                "--appendfilename" => config.appendfilename = value.clone(),
                "--appendfsync" => {
                    config.appendfsync = value.parse().unwrap_or_else(|e| fail(&format!("{}", e)));
                }
                "--dir" => config.dir = PathBuf::from(value),
                "--tmp-dir" => config.tmp_dir = Some(PathBuf::from(value)),
                "--log-level" => {
                    config.log_level = value
                        .parse()
                        .unwrap_or_else(|_| fail("--log-level must be one of trace, debug, info, warn, error"));
                }
                _ => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 2;
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn aof_config(&self) -> AofConfig {
        AofConfig {
            filename: self.dir.join(&self.appendfilename),
            load: true,
            fsync: self.appendfsync,
            tmp_dir: self.tmp_dir.clone(),
        }
    }
}

fn print_help() {
    println!(
        r#"
FluxKV - An In-Memory, Redis-Style Key-Value Engine

USAGE:
    fluxkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>                Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>                Port to listen on (default: 6379)
        --databases <N>              Number of databases (default: 16)
        --appendonly <yes|no>        Enable the append-only log (default: no)
        --appendfilename <NAME>      Log file name (default: appendonly.aof)
        --appendfsync <POLICY>       always | everysec | no (default: everysec)
        --dir <DIR>                  Directory holding the log (default: .)
        --tmp-dir <DIR>              Scratch directory for rewrites (default: --dir)
        --log-level <LEVEL>          trace | debug | info | warn | error (default: info)
    -v, --version                    Print version information
        --help                       Print this help message

EXAMPLES:
    fluxkv                                         # Start on 127.0.0.1:6379
    fluxkv --appendonly yes --appendfsync always   # Durable every write
    fluxkv --databases 4 --dir /var/lib/fluxkv

CONNECTING:
    Use redis-cli or any Redis client to connect:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET name "Ariz" EX 60
    OK
    127.0.0.1:6379> TTL name
    (integer) 60
"#
    );
}

fn print_banner(config: &Config) {
    let persistence = if config.appendonly {
        format!(
            "AOF {} (fsync {})",
            config.dir.join(&config.appendfilename).display(),
            config.appendfsync
        )
    } else {
        "disabled".to_string()
    };
    println!(
        r#"
FluxKV v{} - In-Memory Key-Value Engine
──────────────────────────────────────────────────────────────
Server started on {}
Databases:   {}
Persistence: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        fluxkv::VERSION,
        config.bind_address(),
        config.databases,
        persistence
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_ascii_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    let server_config = ServerConfig {
        databases: config.databases,
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(server_config.clone()));
    info!(databases = config.databases, "Engine initialized");

    if config.appendonly {
        let persister = Persister::new(
            config.aof_config(),
            server.as_ref(),
            Server::tmp_db_maker(server_config),
        )?;
        server.bind_persister(Arc::new(persister));
    }

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    let engine: Arc<dyn DbEngine> = server.clone();
    tokio::select! {
        _ = accept_loop(listener, engine, Arc::clone(&stats)) => {}
        _ = shutdown => {}
    }

    // Drains the log queue and fsyncs before exit
    server.close();
    let totals = stats.snapshot();
    info!(
        connections = totals.accepted,
        commands = totals.commands,
        "Server shutdown complete"
    );
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, engine: Arc<dyn DbEngine>, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let engine = Arc::clone(&engine);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    handle_connection(stream, addr, engine, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

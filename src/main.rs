//! tiercache daemon and command-line tool
//!
//! Runs the control socket server, or performs one cache operation and exits.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tiercache::ipc::IpcServer;
use tiercache::{CacheConfig, CacheService, Category};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Serve,
    /// Store a file's contents under a key
    Put {
        category: Category,
        key: String,
        file: PathBuf,
    },
    /// Write a cached payload to stdout
    Get { category: Category, key: String },
    /// Delete one key
    Remove { category: Category, key: String },
    /// Clear a category, or everything
    Clear { category: Category },
    /// Report disk usage
    Size,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"tiercache - two-tier categorized content cache

USAGE:
    tiercache [serve]                     # Run control socket server (default)
    tiercache put <category> <key> <file>
    tiercache get <category> <key>
    tiercache rm <category> <key>
    tiercache clear <category|all>
    tiercache size
    tiercache help

CATEGORIES:
    api, data, file, image (image keys are hashed and may be any string)

COMMANDS:
    serve   Listen on the control socket; SIGUSR1 clears all caches
    put     Store the contents of <file> under <key>
    get     Write the cached payload to stdout (exit 1 on miss)
    rm      Remove one entry
    clear   Delete and recreate a category directory, or every one with 'all'
    size    Print bytes used on disk, total and per category

ENVIRONMENT:
    TIERCACHE_ROOT              Cache root directory
    TIERCACHE_MEMORY_CAPACITY   Image memory tier entries (default 100)
    TIERCACHE_IO_TIMEOUT_MS     Deadline for socket-driven disk I/O (default 5000)
    TIERCACHE_EVICT_FROM_DISK   Delete disk copies of entries evicted from memory
    TIERCACHE_ENABLED           Start with caching enabled (default true)
    TIERCACHE_SOCKET            Control socket path (default /tmp/tiercache.sock)
    RUST_LOG                    Log filter, e.g. debug or tiercache=trace
"#
    );
}

fn parse_category(raw: &str) -> Result<Category> {
    raw.parse::<Category>().map_err(|e| anyhow!(e))
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Usage: tiercache {}", usage))
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.get(1) else {
        return Ok(Command::Serve);
    };

    let arg = |index: usize, usage: &str| required(args, index, usage);

    match command.as_str() {
        "serve" => Ok(Command::Serve),
        "put" => {
            let usage = "put <category> <key> <file>";
            Ok(Command::Put {
                category: parse_category(arg(2, usage)?)?,
                key: arg(3, usage)?.to_string(),
                file: PathBuf::from(arg(4, usage)?),
            })
        }
        "get" => {
            let usage = "get <category> <key>";
            Ok(Command::Get {
                category: parse_category(arg(2, usage)?)?,
                key: arg(3, usage)?.to_string(),
            })
        }
        "rm" => {
            let usage = "rm <category> <key>";
            Ok(Command::Remove {
                category: parse_category(arg(2, usage)?)?,
                key: arg(3, usage)?.to_string(),
            })
        }
        "clear" => Ok(Command::Clear {
            category: parse_category(arg(2, "clear <category|all>")?)?,
        }),
        "size" => Ok(Command::Size),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => {
            eprintln!("Unknown command: {}", other);
            Ok(Command::Help)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is reserved for `get` payloads
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = env::args().collect();
    let command = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let config = CacheConfig::from_env().context("Failed to load configuration")?;
    let service = CacheService::new(&config);

    match command {
        Command::Serve => serve(service, config.socket_path).await?,
        Command::Put {
            category,
            key,
            file,
        } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            match category {
                Category::Image => service.cache_image(&key, &payload),
                other => service.store(&payload, &key, other),
            }
            println!("Stored {} bytes under {}/{}", payload.len(), category, key);
        }
        Command::Get { category, key } => {
            let found = match category {
                Category::Image => service.retrieve_image(&key),
                other => service.retrieve(&key, other),
            };
            match found {
                Some(payload) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&payload)?;
                    stdout.flush()?;
                }
                None => {
                    eprintln!("Not found: {}/{}", category, key);
                    std::process::exit(1);
                }
            }
        }
        Command::Remove { category, key } => {
            match category {
                Category::Image => service.remove_image(&key),
                other => service.remove(&key, other),
            }
            println!("Removed {}/{}", category, key);
        }
        Command::Clear { category } => {
            service.clear(category);
            println!("Cleared {}", category);
        }
        Command::Size => {
            println!("total\t{}", service.total_disk_size());
            for category in Category::STORAGE {
                println!("{}\t{}", category, service.category_disk_size(category));
            }
        }
        Command::Help => print_help(),
    }

    Ok(())
}

async fn serve(service: CacheService, socket_path: PathBuf) -> Result<()> {
    info!("Starting tiercache daemon in IPC server mode");

    let mut ipc_server = IpcServer::new(service.clone(), socket_path);
    if let Err(e) = ipc_server.start().await {
        error!(error = %e, "Failed to start IPC server");
        return Err(e);
    }
    let ipc_server = std::sync::Arc::new(ipc_server);

    let ipc_handle = {
        let server = std::sync::Arc::clone(&ipc_server);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "IPC server error");
            }
        })
    };

    let mut memory_pressure =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    info!("Daemon ready. Send SIGUSR1 to clear caches, Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            Some(()) = memory_pressure.recv() => {
                service.handle_memory_pressure_bounded().await;
            }
        }
    }

    info!("Received shutdown signal, stopping...");
    ipc_handle.abort();
    ipc_server.stop().await?;
    info!("Shutdown complete.");
    Ok(())
}

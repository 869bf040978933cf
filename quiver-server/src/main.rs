use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use libquiver::{Engine, EngineOptions};
use quiver_core::{Reply, TracingNotifier, parse_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 7878;

async fn handle_client(mut stream: tokio::net::TcpStream, engine: Arc<Engine>) {
    // pre-allocating a higher value may lead to
    // the tokio worker overflowing it's stack
    let mut buffer = [0; 1024];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&buffer[..n]),
            Err(e) => {
                warn!(target: "quiver::server", error = %e, "read failed");
                break;
            }
        }

        // A single read may carry several pipelined requests.
        loop {
            let (reply, used) = match parse_frame(&pending) {
                Ok(None) => break,
                Ok(Some((frame, used))) => match frame.into_args() {
                    Ok(argv) => (engine.execute(argv).await, used),
                    Err(e) => (Reply::from(e), used),
                },
                Err(e) => (Reply::from(e), pending.len()),
            };
            pending.drain(..used);

            if let Err(e) = stream.write_all(&reply.encode()).await {
                warn!(target: "quiver::server", error = %e, "write failed");
                return;
            }
        }
    }
}

#[derive(Debug, Parser)]
struct Cli {
    #[arg(short = 'p', long = "port", help = "Run server in a custom port")]
    port: Option<u16>,
    #[arg(short = 'r', long = "readers", help = "Number of pinned reader threads")]
    readers: Option<usize>,
    #[arg(long = "writer-cpu", help = "Core the writer thread is pinned to")]
    writer_cpu: Option<usize>,
    #[arg(long = "first-reader-cpu", help = "Core of the first reader thread")]
    first_reader_cpu: Option<usize>,
    #[arg(long = "expire-interval-ms", help = "Idle time before an active expire cycle")]
    expire_interval_ms: Option<u64>,
    #[arg(long = "log", help = "Log filter, overrides RUST_LOG")]
    log: Option<String>,
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn engine_options(args: &Cli) -> EngineOptions {
    let mut options = EngineOptions::default();
    if let Some(readers) = args.readers {
        options = options.readers(readers);
    }
    if let Some(cpu) = args.writer_cpu {
        options = options.writer_cpu(cpu);
    }
    if let Some(cpu) = args.first_reader_cpu {
        options = options.first_reader_cpu(cpu);
    }
    if let Some(ms) = args.expire_interval_ms {
        options = options.expire_interval(Duration::from_millis(ms));
    }
    options
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.log.as_deref());
    let port: u16 = args.port.unwrap_or(DEFAULT_PORT);

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "quiver::server", %addr, "listening");

    let engine = Arc::new(Engine::start(
        engine_options(&args),
        Arc::new(TracingNotifier),
        None,
    )?);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let shutdown_sig = shutdown_tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await?;
        let _ = shutdown_sig.send(());
        Ok::<(), std::io::Error>(())
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(target: "quiver::server", "received shutdown signal");
                break;
            },
            Ok((socket, _)) = listener.accept() => {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    handle_client(socket, engine).await;
                });
            }
        }
    }

    info!(target: "quiver::server", stats = %engine.stats(), "final stats");
    // Connections still holding the engine stop it when they close.
    if let Ok(engine) = Arc::try_unwrap(engine) {
        engine.shutdown();
    }

    Ok(())
}

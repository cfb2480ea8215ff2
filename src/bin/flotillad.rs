use anyhow::{Context, Result};
use clap::Parser;
use flotilla::{
    config::Config, driver::Driver, proto::driver_server::DriverServer, security::Security,
    server::DriverService,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    select,
    signal::unix::{signal, SignalKind},
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs the application registry and the masters of submitted applications.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on. Port 0 picks a free port.
    #[arg(long, default_value = "127.0.0.1:0")]
    address: SocketAddr,

    /// Directory holding the certificate and key. Defaults to the per-user
    /// directory, created on first use.
    #[arg(long)]
    security_dir: Option<PathBuf>,

    /// Path to the config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shut down once stdin is closed.
    #[arg(long)]
    watch_stdin: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let security = match &cli.security_dir {
        Some(directory) => Security::from_directory(directory)
            .with_context(|| format!("loading credentials from {}", directory.display()))?,
        None => Security::from_default()?,
    };

    let config = match &cli.config {
        Some(file) => Config::from_file(file).await?,
        None => Config::default(),
    };

    let listener = TcpListener::bind(cli.address).await?;
    let address = listener.local_addr()?;

    let driver = Arc::new(Driver::new(security.clone(), config));

    info!(%address, "starting driver server");

    // A starting client reads the address from the first line.
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{address}\n").as_bytes()).await?;
    stdout.flush().await?;

    Server::builder()
        .tls_config(security.server_tls_config())?
        .add_service(DriverServer::new(DriverService::new(Arc::clone(&driver))))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown_signal(cli.watch_stdin),
        )
        .await?;

    driver.shutdown().await;

    info!("driver stopped");

    Ok(())
}

async fn shutdown_signal(watch_stdin: bool) {
    let stdin_closed = async {
        if !watch_stdin {
            return std::future::pending::<()>().await;
        }

        let mut stdin = tokio::io::stdin();
        let mut buffer = [0_u8; 64];
        loop {
            match stdin.read(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(?error, "unable to listen for SIGTERM");
                std::future::pending::<()>().await
            }
        }
    };

    select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
        _ = stdin_closed => info!("stdin closed"),
    }
}

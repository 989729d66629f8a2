//! Broker process entrypoint.
//!
//! ```text
//! mdp-broker [-v] [tcp://host:port]
//! ```
//!
//! Binds the given endpoint (default [`mdp::config::DEFAULT_ENDPOINT`]) and
//! runs the event loop until `Ctrl+C`, at which point every worker is sent
//! `W_DISCONNECT` and the process exits cleanly.

use futures::{select, FutureExt};
use tracing::{error, info};

use mdp::config::{BrokerConfig, DEFAULT_ENDPOINT};
use mdp::Broker;

/// Process exit code for a bind failure, matching a typical Unix `EX_`-style
/// convention for "could not acquire a resource".
const EXIT_BIND_FAILED: i32 = 1;
/// Process exit code for a failure to install the signal handler.
const EXIT_SIGNAL_FAILED: i32 = 2;

#[compio::main]
async fn main() -> std::io::Result<()> {
    let mut args = std::env::args().skip(1);
    let mut verbose = false;
    let mut endpoint = None;

    for arg in &mut args {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => endpoint = Some(other.to_string()),
        }
    }

    if verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    mdp::dev_tracing::init_tracing();

    let endpoint = endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let mut broker = Broker::new(BrokerConfig::default());

    if let Err(e) = broker.bind(&endpoint).await {
        error!(error = %e, %endpoint, "failed to bind broker");
        std::process::exit(EXIT_BIND_FAILED);
    }
    info!(%endpoint, "mdp-broker ready");

    let (shutdown_tx, shutdown_rx) = flume::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    }) {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::process::exit(EXIT_SIGNAL_FAILED);
    }

    select! {
        () = broker.mediate().fuse() => {}
        _ = shutdown_rx.recv_async().fuse() => {
            info!("shutdown signal received, disconnecting workers");
        }
    }

    broker.destroy();
    Ok(())
}

fn print_usage() {
    println!("mdp-broker [-v|--verbose] [tcp://host:port]");
    println!();
    println!("Defaults to {DEFAULT_ENDPOINT} when no endpoint is given.");
}

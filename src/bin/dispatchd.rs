//! dispatchd binary.
//!
//! Usage: dispatchd [OPTIONS]
//!
//! Options:
//!   -d, --data-dir <DIR>   Where the SQLite store lives (default: data)
//!   -w, --web-port <PORT>  Admin port saved to the store on first run
//!   -h, --help             Print help information
//!
//! All other configuration (listen address, tunnel mode, egress set, source
//! rules) lives in the store and is managed through the admin surface.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use dispatchd::server::Settings;
use dispatchd::store::Store;
use dispatchd::{Core, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut data_dir = PathBuf::from("data");
    let mut web_port: Option<u16> = None;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-d" | "--data-dir" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--data-dir requires a path"))?;
                data_dir = PathBuf::from(value);
            }
            "-w" | "--web-port" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--web-port requires a port"))?;
                web_port = Some(value.parse()?);
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                return Ok(());
            }
        }
        i += 1;
    }

    run(data_dir, web_port).await
}

fn print_usage() {
    println!(
        r#"dispatchd - multi-egress TCP dispatch proxy

USAGE:
    dispatchd [OPTIONS]

OPTIONS:
    -d, --data-dir <DIR>    Directory for the SQLite store (default: data)
    -w, --web-port <PORT>   Admin port, saved to the store on first run
    -h, --help              Print help information

EXAMPLES:
    Start with the default store:
        dispatchd

    Start against a dedicated state directory:
        dispatchd --data-dir /var/lib/dispatchd
"#
    );
}

async fn run(data_dir: PathBuf, web_port: Option<u16>) -> anyhow::Result<()> {
    let store = Store::open(&data_dir.join("dispatchd.db"))?;

    // RUST_LOG wins; otherwise the stored debug/quiet flags pick the level.
    let settings = store.load_settings()?;
    let default_filter = if settings.quiet_mode {
        "warn"
    } else if settings.debug_mode {
        "dispatchd=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    // First-run bootstrap: a non-default --web-port is written into the
    // settings row once, then the store owns it.
    if let Some(port) = web_port {
        let defaults = Settings::default();
        let mut settings = store.load_settings()?;
        if port != defaults.web_port && settings.web_port == defaults.web_port {
            settings.web_port = port;
            store.save_settings(&settings)?;
            tracing::info!(port, "saved initial web port to store");
        }
    }

    let core = Arc::new(Core::new(store)?);
    match core.import_rules_file() {
        Ok(0) => {}
        Ok(applied) => tracing::info!(applied, "imported source rules"),
        Err(err) => tracing::warn!(error = %err, "rules file import failed"),
    }

    tracing::info!(
        listen = %core.settings.listen_addr(),
        web_port = core.settings.web_port,
        tunnel = core.settings.tunnel_mode,
        gateway = core.gateway.enabled,
        "dispatchd starting"
    );

    let (stop_tx, stop_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            let _ = stop_tx.send(()).await;
        }
    });

    let server = Server::new(core);
    server.run(stop_rx).await?;
    Ok(())
}

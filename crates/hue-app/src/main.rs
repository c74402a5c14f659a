use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use hue_api::{build_router, AppState};
use hue_core::config::{load_config, ConfigError, RawFlags};
use hue_core::identity::{derive_identity, resolve_local_ipv4, IdentityError};
use hue_deconz::{DeconzAdapter, UpstreamError};
use hue_pairing::{
    IndicatorController, PairingSessionManager, PairingSettings, SystemClock, TracingLedOutput,
};
use hue_storage::FileStorage;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hue-emulator", version, about = "Hue bridge emulator")]
struct Cli {
    /// Bridge MAC address, XX:XX:XX:XX:XX:XX
    #[arg(long, env = "MAC")]
    mac: Option<String>,

    #[arg(long, env = "CONFIG_PATH", default_value = "/opt/hue-emulator/config")]
    config_path: PathBuf,

    #[arg(long, env = "DEBUG", default_value_t = false, action = ArgAction::Set)]
    debug: bool,

    #[arg(long, env = "NO_SERVE_HTTPS")]
    no_serve_https: bool,

    /// deCONZ gateway address (host or host:port)
    #[arg(long, env = "DECONZ")]
    deconz: Option<String>,

    #[arg(long, env = "DECONZ_API_KEY")]
    deconz_api_key: Option<String>,

    /// Require three confirmations instead of one
    #[arg(long, env = "BUTTON_SECURITY", default_value_t = true, action = ArgAction::Set)]
    button_security: bool,

    /// Pairing window in seconds
    #[arg(long, env = "BUTTON_TIMEOUT")]
    button_timeout: Option<String>,

    /// off, on or auto
    #[arg(long, env = "LED_INDICATOR")]
    led_indicator: Option<String>,

    /// Address to advertise; detected from the default route when absent
    #[arg(long, env = "IP")]
    ip: Option<Ipv4Addr>,

    #[arg(long, env = "BIND")]
    bind: Option<String>,

    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,
}

impl Cli {
    fn into_raw(self) -> RawFlags {
        RawFlags {
            mac: self.mac,
            config_path: self.config_path,
            debug: self.debug,
            no_serve_https: self.no_serve_https,
            deconz: self.deconz,
            deconz_api_key: self.deconz_api_key,
            button_security: self.button_security,
            button_timeout: self.button_timeout,
            led_indicator: self.led_indicator,
            host_address: self.ip,
            bind: self.bind,
            http_port: self.http_port,
        }
    }
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli.into_raw()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(1)
        }
    }
}

async fn run(raw: RawFlags) -> Result<(), StartupError> {
    let config = load_config(raw)?;
    let host = config.host_address.or_else(resolve_local_ipv4);
    let identity = derive_identity(&config.mac, host)?;

    tracing::info!(
        bridge_id = %identity.bridge_id,
        mac = %identity.mac,
        ip = %identity.advertised_address,
        config_path = %config.config_path.display(),
        "Bridge identity"
    );
    tracing::info!(
        security = config.security_mode,
        timeout_secs = config.button_timeout_secs,
        leds = ?config.led_indicator_mode,
        "Link button settings"
    );
    if config.https_disabled {
        tracing::info!("HTTPS disabled");
    } else {
        tracing::info!("HTTPS enabled; TLS is expected to be terminated in front of the HTTP listener");
    }

    let indicators_enabled = config.indicators_enabled();
    let (indicator, _indicator_task) =
        IndicatorController::spawn(Arc::new(TracingLedOutput), indicators_enabled);
    let pairing = Arc::new(PairingSessionManager::new(
        PairingSettings::from_config(&config),
        Arc::new(SystemClock),
        Arc::new(indicator),
    ));

    let storage = FileStorage::new(config.config_path.clone());
    let mut state = AppState::new(storage, pairing, identity).with_indicators(indicators_enabled);
    if let Some(adapter) = DeconzAdapter::from_config(&config)? {
        tracing::info!(address = %adapter.client.address, "deCONZ forwarding enabled");
        state = state.with_upstream(Arc::new(adapter));
    }
    let app = build_router(state);

    let addr = SocketAddr::new(config.bind_address, config.http_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    tracing::info!("Starting API server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

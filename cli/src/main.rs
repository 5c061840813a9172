use std::time::Duration;

use clap::builder::NonEmptyStringValueParser;
use clap::{Args, Parser, Subcommand};
use dronelink::{AuthState, Observers, SessionConfig, SessionHandle, TransportState};
use frames::{ChannelOverrides, HomeLocation, Parameters};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;


#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Transport(#[from] dronelink::TransportError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("password rejected by server")]
    AuthRejected,
    #[error("connection closed before {0}")]
    Closed(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "dronelink-cli", about = "Vehicle session client: watch telemetry and send commands")]
struct Cli {
    #[arg(
        long,
        env = dronelink::config::ENV_URL,
        default_value = dronelink::config::DEFAULT_ENDPOINT,
        value_parser = NonEmptyStringValueParser::new()
    )]
    url: String,

    #[arg(
        long,
        env = dronelink::config::ENV_PASSWORD,
        hide_env_values = true,
        value_parser = NonEmptyStringValueParser::new()
    )]
    password: String,

    /// Telemetry listener period in milliseconds.
    #[arg(
        long,
        env = dronelink::config::ENV_LISTENER_MS,
        default_value_t = dronelink::config::DEFAULT_LISTENER_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    listener_ms: u64,

    /// Log every frame sent and received.
    #[arg(long, env = dronelink::config::ENV_DEBUG, value_parser = clap::builder::BoolishValueParser::new())]
    debug: bool,

    /// Seconds to wait for the handshake and for telemetry.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print telemetry as JSON lines until interrupted or the link closes.
    Watch {
        #[arg(long, help = "Stop after this many updates")]
        count: Option<usize>,
    },
    /// Print one session snapshot once telemetry has arrived.
    Status,
    /// Change flight mode.
    Mode { name: String },
    Arm,
    Disarm,
    Home(HomeArgs),
    /// Set RC channel overrides as `CHANNEL=PWM` pairs. No pairs clears them.
    Overrides { pairs: Vec<String> },
    Groundspeed { speed: f64 },
    Airspeed { speed: f64 },
    /// Set vehicle parameters as `NAME=VALUE` pairs.
    Param {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Ask the server to stop the periodic telemetry listener.
    Unsubscribe,
}

#[derive(Args, Debug)]
struct HomeArgs {
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    #[arg(long, allow_hyphen_values = true)]
    alt: f64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let wait = Duration::from_secs(cli.timeout_secs);
    let config = SessionConfig::new(cli.url, cli.listener_ms, cli.password).with_debug(cli.debug);

    let (handle, task) = dronelink::connect(config, Observers::default()).await?;
    match timeout(wait, handle.wait_for_auth()).await {
        Err(_) => return Err(CliError::Timeout("server verdict")),
        Ok(Err(_)) => return Err(CliError::Closed("server verdict")),
        Ok(Ok(AuthState::Rejected)) => return Err(CliError::AuthRejected),
        Ok(Ok(AuthState::Validated)) => info!("cli: session validated"),
        Ok(Ok(state)) => {
            debug!(?state, "cli: transport closed during handshake");
            return Err(CliError::Closed("server verdict"));
        }
    }

    let result = run_command(&handle, cli.command, wait).await;

    handle.close();
    if let Err(error) = task.await {
        debug!(%error, "cli: session task join failed");
    }
    result
}

async fn run_command(handle: &SessionHandle, command: Command, wait: Duration) -> Result<(), CliError> {
    let sent = match command {
        Command::Watch { count } => return watch(handle, count).await,
        Command::Status => return status(handle, wait).await,
        Command::Mode { name } => handle.set_mode(&name),
        Command::Arm => handle.set_armed(true),
        Command::Disarm => handle.set_armed(false),
        Command::Home(args) => handle.set_home_location(HomeLocation {
            lat: finite("lat", args.lat)?,
            lon: finite("lon", args.lon)?,
            alt: finite("alt", args.alt)?,
            frame: None,
        }),
        Command::Overrides { pairs } => handle.set_channel_overrides(parse_overrides(&pairs)?),
        Command::Groundspeed { speed } => handle.set_groundspeed(finite("groundspeed", speed)?),
        Command::Airspeed { speed } => handle.set_airspeed(finite("airspeed", speed)?),
        Command::Param { pairs } => handle.set_parameters(parse_parameters(&pairs)?),
        Command::Unsubscribe => handle.cancel_listener(),
    };

    if sent {
        eprintln!("sent");
        Ok(())
    } else {
        Err(CliError::Closed("command was sent"))
    }
}

async fn watch(handle: &SessionHandle, count: Option<usize>) -> Result<(), CliError> {
    let mut state = handle.subscribe();
    let mut printed = 0_usize;
    let mut last = None;

    loop {
        let snapshot = state.borrow_and_update().clone();
        if snapshot.telemetry.is_some() && snapshot.telemetry != last {
            print_json_line(&snapshot)?;
            last = snapshot.telemetry;
            printed = printed.saturating_add(1);
            if count.is_some_and(|limit| printed >= limit) {
                return Ok(());
            }
        }
        if snapshot.transport == TransportState::Closed {
            return Ok(());
        }
        if state.changed().await.is_err() {
            return Ok(());
        }
    }
}

async fn status(handle: &SessionHandle, wait: Duration) -> Result<(), CliError> {
    let mut state = handle.subscribe();
    let snapshot = match timeout(
        wait,
        state.wait_for(|s| s.telemetry.is_some() || s.transport == TransportState::Closed),
    )
    .await
    {
        Err(_) => return Err(CliError::Timeout("telemetry")),
        Ok(Err(_)) => return Err(CliError::Closed("telemetry arrived")),
        Ok(Ok(snapshot)) => snapshot.clone(),
    };
    if snapshot.telemetry.is_none() {
        return Err(CliError::Closed("telemetry arrived"));
    }
    print_json_pretty(&snapshot)
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

fn finite(name: &str, value: f64) -> Result<f64, CliError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CliError::InvalidArgument(format!("{name} must be a finite number, got {value}")))
    }
}

fn split_pair(pair: &str) -> Result<(&str, &str), CliError> {
    pair.split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .ok_or_else(|| CliError::InvalidArgument(format!("expected KEY=VALUE, got {pair:?}")))
}

fn parse_overrides(pairs: &[String]) -> Result<ChannelOverrides, CliError> {
    let mut overrides = ChannelOverrides::new();
    for pair in pairs {
        let (channel, pwm) = split_pair(pair)?;
        let channel = channel
            .parse::<u32>()
            .map_err(|error| CliError::InvalidArgument(format!("channel {channel:?}: {error}")))?;
        let pwm = pwm
            .parse::<u16>()
            .map_err(|error| CliError::InvalidArgument(format!("pwm {pwm:?}: {error}")))?;
        overrides.insert(channel, pwm);
    }
    Ok(overrides)
}

fn parse_parameters(pairs: &[String]) -> Result<Parameters, CliError> {
    let mut parameters = Parameters::new();
    for pair in pairs {
        let (name, value) = split_pair(pair)?;
        let value = value
            .parse::<f64>()
            .map_err(|error| CliError::InvalidArgument(format!("{name}={value:?}: {error}")))?;
        parameters.insert(name.to_owned(), finite(name, value)?);
    }
    Ok(parameters)
}

// =============================================================================
// OUTPUT
// =============================================================================

fn print_json_line(value: &impl Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

fn print_json_pretty(value: &impl Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

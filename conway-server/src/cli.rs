//! Command-line configuration.
//!
//! Every flag can also come from a `CONWAY_*` environment variable.

use clap::Parser;
use conway_core::{GameSettings, MAX_DIMENSION};
use conway_sync::ServerConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "conway-server", version, about = "Shared Game of Life board over WebSocket")]
pub struct CliArgs {
    /// Address to listen on
    #[arg(short, long, env = "CONWAY_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Board width in cells
    #[arg(long, env = "CONWAY_WIDTH", default_value_t = 50, value_parser = parse_dimension)]
    pub width: usize,

    /// Board height in cells
    #[arg(long, env = "CONWAY_HEIGHT", default_value_t = 50, value_parser = parse_dimension)]
    pub height: usize,

    /// Milliseconds between generations (0 = board only changes on input)
    #[arg(long = "tick-ms", env = "CONWAY_TICK_MS", default_value_t = 1000)]
    pub tick_ms: u64,

    /// Initially live cell as `x,y` (repeatable)
    #[arg(long = "seed", value_parser = parse_cell)]
    pub seed: Vec<(usize, usize)>,

    /// Updates buffered per client before the oldest are dropped (rounded up to a power of two)
    #[arg(long, env = "CONWAY_BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Maximum concurrent clients (unbounded if omitted)
    #[arg(long, env = "CONWAY_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Seconds between heartbeat pings (0 = disabled)
    #[arg(long = "heartbeat-secs", env = "CONWAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Log filter, e.g. `debug` or `conway_sync=trace` (overrides RUST_LOG)
    #[arg(short, long)]
    pub log_level: Option<String>,
}

impl CliArgs {
    pub fn game_settings(&self) -> GameSettings {
        GameSettings {
            width: self.width,
            height: self.height,
            tick_interval_ms: self.tick_ms,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity,
            max_sessions: self.max_sessions,
            heartbeat_interval_secs: self.heartbeat_secs,
            tick_interval_ms: self.tick_ms,
        }
    }
}

fn parse_dimension(raw: &str) -> Result<usize, String> {
    let value: usize = raw.trim().parse().map_err(|e| format!("{raw:?}: {e}"))?;
    if (1..=MAX_DIMENSION).contains(&value) {
        Ok(value)
    } else {
        Err(format!("must be between 1 and {MAX_DIMENSION}, got {value}"))
    }
}

fn parse_cell(raw: &str) -> Result<(usize, usize), String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected `x,y`, got {raw:?}"))?;
    let x = x.trim().parse().map_err(|e| format!("bad x in {raw:?}: {e}"))?;
    let y = y.trim().parse().map_err(|e| format!("bad y in {raw:?}: {e}"))?;
    Ok((x, y))
}

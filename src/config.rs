//! Process configuration, loaded from the environment (spec §6).
//!
//! Mirrors the teacher's `env::var` + `OnceCell` pattern in `lib.rs`: a
//! `.env` file is loaded once via `dotenvy` if present, then every field
//! is read from the process environment with the defaults the spec states.

use crate::error::{PlcError, PlcResult};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_PORT: u16 = 502;
const DEFAULT_SLAVE_ID: u8 = 1;
const DEFAULT_REPLAY_INTERVAL_S: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Abcd,
    Badc,
    Cdab,
    Dcba,
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::Badc
    }
}

impl std::str::FromStr for ByteOrder {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abcd" => Ok(ByteOrder::Abcd),
            "badc" => Ok(ByteOrder::Badc),
            "cdab" => Ok(ByteOrder::Cdab),
            "dcba" => Ok(ByteOrder::Dcba),
            other => Err(PlcError::fatal(format!("unknown byte order: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcConnectMode {
    /// Connect to a static IP address.
    Static,
    /// Resolve a hostname, falling back to discovery on failure.
    Hostname,
    /// Subnet sweep for a responding PLC, caching the result.
    AutoDiscover,
}

impl std::str::FromStr for PlcConnectMode {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(PlcConnectMode::Static),
            "hostname" => Ok(PlcConnectMode::Hostname),
            "auto" | "auto_discover" | "discover" => Ok(PlcConnectMode::AutoDiscover),
            other => Err(PlcError::fatal(format!("unknown plc connect mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Terminal {
    Logger,
    Recipe,
    Commands,
}

impl std::str::FromStr for Terminal {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "logger" => Ok(Terminal::Logger),
            "2" | "recipe" => Ok(Terminal::Recipe),
            "3" | "commands" => Ok(Terminal::Commands),
            other => Err(PlcError::fatal(format!("unknown terminal: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub plc_mode: PlcConnectMode,
    pub plc_ip: Option<String>,
    pub plc_port: u16,
    pub plc_hostname: Option<String>,
    pub plc_byte_order: ByteOrder,
    pub plc_slave_id: u8,
    pub machine_id: String,
    pub terminal: Terminal,
    pub essentials_only: bool,
    pub dlq_dir: String,
    pub dlq_replay_interval: Duration,
    pub database_url: String,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Loads configuration from the process environment, having first
    /// loaded a `.env` file if one exists in the working directory.
    pub fn load() -> PlcResult<Self> {
        dotenvy::dotenv().ok();

        let plc_mode = env_var("PLC_MODE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(PlcConnectMode::Static);

        let plc_port = env_var("PLC_PORT")
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| PlcError::fatal(format!("invalid PLC_PORT: {e}")))?
            .unwrap_or(DEFAULT_PORT);

        let plc_byte_order = env_var("PLC_BYTE_ORDER")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        let plc_slave_id = env_var("PLC_SLAVE_ID")
            .map(|v| v.parse::<u8>())
            .transpose()
            .map_err(|e| PlcError::fatal(format!("invalid PLC_SLAVE_ID: {e}")))?
            .unwrap_or(DEFAULT_SLAVE_ID);

        let machine_id = env_var("MACHINE_ID")
            .ok_or_else(|| PlcError::fatal("MACHINE_ID is required"))?;

        let terminal = env_var("TERMINAL")
            .ok_or_else(|| PlcError::fatal("TERMINAL is required"))?
            .parse()?;

        let essentials_only = env_var("ESSENTIALS_ONLY")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let dlq_dir = env_var("DLQ_DIR").unwrap_or_else(|| "/var/lib/aldctl/dlq".to_owned());

        let dlq_replay_interval = env_var("DLQ_REPLAY_INTERVAL_S")
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| PlcError::fatal(format!("invalid DLQ_REPLAY_INTERVAL_S: {e}")))?
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_REPLAY_INTERVAL_S));

        let database_url = env_var("DATABASE_URL")
            .ok_or_else(|| PlcError::fatal("DATABASE_URL is required"))?;

        if plc_mode == PlcConnectMode::Static && env_var("PLC_IP").is_none() {
            return Err(PlcError::fatal("PLC_IP is required when PLC_MODE=static"));
        }
        if plc_mode == PlcConnectMode::Hostname && env_var("PLC_HOSTNAME").is_none() {
            return Err(PlcError::fatal(
                "PLC_HOSTNAME is required when PLC_MODE=hostname",
            ));
        }

        Ok(Config {
            plc_mode,
            plc_ip: env_var("PLC_IP"),
            plc_port,
            plc_hostname: env_var("PLC_HOSTNAME"),
            plc_byte_order,
            plc_slave_id,
            machine_id,
            terminal,
            essentials_only,
            dlq_dir,
            dlq_replay_interval,
            database_url,
        })
    }
}

static VERBOSE: OnceCell<bool> = OnceCell::new();

/// Whether `VERBOSE=1` was set at process start. Cached the first time
/// it's read, matching the teacher's `OnceCell`-backed globals.
pub fn verbose() -> bool {
    *VERBOSE.get_or_init(|| env_var("VERBOSE").map(|v| v == "1").unwrap_or(false))
}

pub fn syslog_enabled() -> bool {
    env_var("SYSLOG").map(|v| v == "1").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_order_parses_case_insensitively() {
        assert_eq!("BADC".parse::<ByteOrder>().unwrap(), ByteOrder::Badc);
        assert_eq!("cdab".parse::<ByteOrder>().unwrap(), ByteOrder::Cdab);
        assert!("xyz".parse::<ByteOrder>().is_err());
    }

    #[test]
    fn terminal_accepts_numeric_and_named_forms() {
        assert_eq!("1".parse::<Terminal>().unwrap(), Terminal::Logger);
        assert_eq!("recipe".parse::<Terminal>().unwrap(), Terminal::Recipe);
    }
}

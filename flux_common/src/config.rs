//! Readout process configuration.
//!
//! One TOML file describes the whole process: a `[readout]` global
//! section, `[[bank]]` memory banks, `[[equipment]]` producer sections and
//! an optional `[dispatcher]` section. Byte quantities are strings with
//! `k/M/G/T/P` suffixes (see [`crate::units`]).
//!
//! ```toml
//! [readout]
//! rate = -1.0
//! run_number = 505000
//!
//! [[bank]]
//! name = "bank-a"
//! size = "64M"
//!
//! [[equipment]]
//! name = "emu-0"
//! equipment_type = "emulator"
//! memory_pool_page_size = "128k"
//! memory_pool_number_of_pages = 64
//!
//! [dispatcher]
//! threads = 2
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::consts::DEFAULT_TF_PERIOD_ORBITS;
use crate::units::parse_byte_size;

/// Error type for configuration loading.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

fn default_rate() -> f64 {
    -1.0
}

fn default_exit_timeout() -> f64 {
    5.0
}

/// `[readout]` global section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Data rate limit per equipment, in Hz. -1 for unlimited.
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Run number stamped into every page.
    #[serde(default)]
    pub run_number: u64,

    /// Seconds to wait at shutdown for in-flight transport messages.
    #[serde(default = "default_exit_timeout")]
    pub exit_timeout_s: f64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            run_number: 0,
            exit_timeout_s: default_exit_timeout(),
        }
    }
}

/// `[[bank]]` memory bank declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BankConfig {
    /// Bank name, referenced by pool requests.
    pub name: String,
    /// Bank size, byte string (`"64M"`).
    pub size: String,
}

fn default_idle_sleep() -> u32 {
    200
}

fn default_minus_one() -> i64 {
    -1
}

fn default_block_align() -> String {
    "2M".to_string()
}

fn default_first_page_offset() -> String {
    "0".to_string()
}

fn default_tf_period() -> u32 {
    DEFAULT_TF_PERIOD_ORBITS
}

fn default_true() -> bool {
    true
}

/// `[[equipment]]` producer section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EquipmentConfig {
    /// Name used in logs. Defaults to `equipment-<index>`.
    #[serde(default)]
    pub name: Option<String>,

    /// Equipment id used to tag produced data. 0 leaves the id undefined
    /// (an RDH stream may set it from CRU/endpoint).
    #[serde(default)]
    pub id: u16,

    /// Source kind: `dummy`, `player` or `emulator`.
    pub equipment_type: String,

    /// Per-equipment rate limit override, Hz. Falls back to
    /// `[readout].rate` when absent.
    #[serde(default)]
    pub rate: Option<f64>,

    /// Readout thread idle sleep, microseconds.
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep_time_us: u32,

    /// Output FIFO size in pages; -1 matches the pool size so the FIFO
    /// can never stall the equipment while free pages remain.
    #[serde(default = "default_minus_one")]
    pub output_fifo_size: i64,

    /// Bank to carve the page pool from. Empty picks the first bank with
    /// room.
    #[serde(default)]
    pub memory_bank_name: String,

    /// Page size, byte string.
    pub memory_pool_page_size: String,

    /// Number of pages in this equipment's pool.
    pub memory_pool_number_of_pages: usize,

    /// Discard produced data instead of pushing it to the FIFO
    /// (testing; byte accounting still runs).
    #[serde(default)]
    pub disable_output: bool,

    /// Offset of the first page within the pool slice, byte string.
    /// "0" keeps the automatic alignment (payload of the first page
    /// starts one header size into the slice).
    #[serde(default = "default_first_page_offset")]
    pub first_page_offset: String,

    /// Alignment of the pool slice within its bank, byte string.
    #[serde(default = "default_block_align")]
    pub block_align: String,

    /// Walk and validate the full RDH chain of every page.
    #[serde(default)]
    pub rdh_check_enabled: bool,

    /// Dump the first failing RDHs to the log.
    #[serde(default)]
    pub rdh_dump_enabled: bool,

    /// Tag pages from the first RDH in each page.
    #[serde(default = "default_true")]
    pub rdh_use_first_in_page_enabled: bool,

    /// Timeframe length in orbits.
    #[serde(default = "default_tf_period")]
    pub tf_period: u32,

    /// Stop the readout thread on the first source error.
    #[serde(default)]
    pub stop_on_error: bool,

    /// Log details of the first N pages produced.
    #[serde(default)]
    pub debug_first_pages: u64,

    /// Seconds between console statistics updates, 0 disables.
    #[serde(default)]
    pub console_stats_update_time_s: f64,

    // ── source-specific knobs ──
    /// dummy: payload bytes per page (defaults to the full page).
    #[serde(default)]
    pub dummy_payload_size: Option<String>,

    /// player: file to replay.
    #[serde(default)]
    pub player_file: Option<String>,

    /// player: restart from the beginning at end of file.
    #[serde(default)]
    pub player_loop: bool,

    /// emulator: link ids to generate, round-robin.
    #[serde(default)]
    pub emulator_links: Vec<u8>,

    /// emulator: CRU id feeding the derived equipment id.
    #[serde(default)]
    pub emulator_cru_id: u16,

    /// emulator: detector system id stamped into RDHs.
    #[serde(default)]
    pub emulator_system_id: u8,

    /// emulator: payload bytes per packet (RDH excluded).
    #[serde(default)]
    pub emulator_packet_payload: Option<String>,

    /// emulator: heartbeat frames per page.
    #[serde(default)]
    pub emulator_hbf_per_page: Option<u32>,
}

fn default_dispatcher_pool_page_size() -> String {
    "128k".to_string()
}

fn default_dispatcher_pool_pages() -> usize {
    100
}

fn default_session_name() -> String {
    "default".to_string()
}

/// Subtimeframe output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// 1 STF header + 1 part per heartbeat frame (default).
    StfHbf,
    /// 1 message per source page, no STF header.
    Raw,
    /// 1 STF header + 1 part per source page.
    StfSuperpage,
    /// 1 DataBlock header part + 1 payload part per source page.
    RawDatablock,
}

impl OutputFormat {
    /// Decode the numeric `enable_raw_format` configuration value.
    pub fn from_raw_format(v: u8) -> Result<Self, ConfigError> {
        match v {
            0 => Ok(Self::StfHbf),
            1 => Ok(Self::Raw),
            2 => Ok(Self::StfSuperpage),
            3 => Ok(Self::RawDatablock),
            _ => Err(ConfigError::ValidationError(format!(
                "enable_raw_format must be 0..=3, got {v}"
            ))),
        }
    }
}

/// `[dispatcher]` consumer section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Output format selector, 0..=3 (see [`OutputFormat`]).
    #[serde(default)]
    pub enable_raw_format: u8,

    /// Reuse one scratch page for several repacked heartbeat frames.
    #[serde(default = "default_true")]
    pub enable_packed_copy: bool,

    /// Formatter thread count. 0 formats and sends inline.
    #[serde(default)]
    pub threads: usize,

    /// Size of the transport memory region to create, byte string.
    /// Absent or zero: no region, messages carry cleanup callbacks.
    #[serde(default)]
    pub unmanaged_memory_size: Option<String>,

    /// Comma-separated resources to verify before creating the region
    /// (filesystem paths and /proc/meminfo keys).
    #[serde(default)]
    pub check_resources: String,

    /// Bank to carve the header/repack pool from. Empty picks the first
    /// bank with room (the transport region bank when one is created).
    #[serde(default)]
    pub memory_bank_name: String,

    /// Page size of the header/repack pool, byte string.
    #[serde(default = "default_dispatcher_pool_page_size")]
    pub memory_pool_page_size: String,

    /// Number of pages in the header/repack pool.
    #[serde(default = "default_dispatcher_pool_pages")]
    pub memory_pool_number_of_pages: usize,

    /// Transport session name.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Transport kind: `drop` (count and discard) or `loopback`
    /// (in-process consumer draining messages).
    #[serde(default)]
    pub transport: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enable_raw_format: 0,
            enable_packed_copy: true,
            threads: 0,
            unmanaged_memory_size: None,
            check_resources: String::new(),
            memory_bank_name: String::new(),
            memory_pool_page_size: default_dispatcher_pool_page_size(),
            memory_pool_number_of_pages: default_dispatcher_pool_pages(),
            session_name: default_session_name(),
            transport: None,
        }
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadoutConfig {
    #[serde(default)]
    pub readout: GlobalConfig,

    #[serde(default)]
    pub bank: Vec<BankConfig>,

    #[serde(default)]
    pub equipment: Vec<EquipmentConfig>,

    #[serde(default)]
    pub dispatcher: Option<DispatcherConfig>,
}

impl ReadoutConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation beyond TOML syntax.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for bank in &self.bank {
            if bank.name.is_empty() {
                return Err(ConfigError::ValidationError("bank name is empty".into()));
            }
            let size = parse_byte_size(&bank.size).ok_or_else(|| {
                ConfigError::ValidationError(format!("bank {}: bad size '{}'", bank.name, bank.size))
            })?;
            if size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "bank {}: size is zero",
                    bank.name
                )));
            }
        }

        for (ix, eq) in self.equipment.iter().enumerate() {
            let name = eq.name.clone().unwrap_or_else(|| format!("equipment-{ix}"));
            match eq.equipment_type.as_str() {
                "dummy" | "player" | "emulator" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "{name}: unknown equipment_type '{other}'"
                    )))
                }
            }
            let page_size = parse_byte_size(&eq.memory_pool_page_size).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "{name}: bad memory_pool_page_size '{}'",
                    eq.memory_pool_page_size
                ))
            })?;
            if page_size == 0 || eq.memory_pool_number_of_pages == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}: wrong memory pool settings"
                )));
            }
            if eq.tf_period == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}: tf_period must be nonzero"
                )));
            }
            if eq.equipment_type == "player" && eq.player_file.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "{name}: player_file is required for equipment_type 'player'"
                )));
            }
        }

        if let Some(d) = &self.dispatcher {
            OutputFormat::from_raw_format(d.enable_raw_format)?;
            if let Some(s) = &d.unmanaged_memory_size {
                parse_byte_size(s).ok_or_else(|| {
                    ConfigError::ValidationError(format!("dispatcher: bad unmanaged_memory_size '{s}'"))
                })?;
            }
            if d.memory_pool_number_of_pages == 0 {
                return Err(ConfigError::ValidationError(
                    "dispatcher: memory_pool_number_of_pages is zero".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
        [[bank]]
        name = "bank-a"
        size = "16M"

        [[equipment]]
        equipment_type = "dummy"
        memory_pool_page_size = "64k"
        memory_pool_number_of_pages = 16
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = ReadoutConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(cfg.readout.rate, -1.0);
        assert_eq!(cfg.bank.len(), 1);
        let eq = &cfg.equipment[0];
        assert_eq!(eq.idle_sleep_time_us, 200);
        assert_eq!(eq.output_fifo_size, -1);
        assert_eq!(eq.block_align, "2M");
        assert_eq!(eq.tf_period, DEFAULT_TF_PERIOD_ORBITS);
        assert!(eq.rdh_use_first_in_page_enabled);
        assert!(cfg.dispatcher.is_none());
    }

    #[test]
    fn load_from_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(MINIMAL.as_bytes()).unwrap();
        let cfg = ReadoutConfig::load(f.path()).unwrap();
        assert_eq!(cfg.equipment.len(), 1);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = ReadoutConfig::load(Path::new("/nonexistent/readout.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound));
    }

    #[test]
    fn bad_equipment_type_fails_validation() {
        let toml = MINIMAL.replace("dummy", "rocket");
        let err = ReadoutConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn bad_page_size_fails_validation() {
        let toml = MINIMAL.replace("64k", "notasize");
        let err = ReadoutConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn player_requires_file() {
        let toml = MINIMAL.replace("\"dummy\"", "\"player\"");
        let err = ReadoutConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn raw_format_range_is_checked() {
        let toml = format!("{MINIMAL}\n[dispatcher]\nenable_raw_format = 4\n");
        let err = ReadoutConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert_eq!(OutputFormat::from_raw_format(2).unwrap(), OutputFormat::StfSuperpage);
    }
}

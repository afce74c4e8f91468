//! Station and device configuration.
//!
//! Uses `heapless` collections for `no_std` compatibility while remaining
//! ergonomic to use on desktop with `std`. With the `toml` feature a
//! complete [`Config`] can be loaded from a TOML document; every section and
//! field is optional and falls back to its default.
//!
//! # Example
//!
//! ```rust
//! use twpc_rail::config::{BusConfig, Config, ScanConfig};
//!
//! // Use defaults: checksummed frames, 3-byte identity, 2 contact lines
//! let config = Config::default();
//! assert!(config.validate().is_ok());
//!
//! // Or customize
//! let config = Config::default()
//!     .with_bus(BusConfig::default().with_checksum(false).with_identity_len(0))
//!     .with_scan(ScanConfig::default().with_lines(4));
//! assert!(config.validate().is_ok());
//! ```

use heapless::String as HString;
use heapless::Vec;

use crate::error::ConfigError;
use crate::packet::{DeviceType, Opcode, PacketFormat, BROADCAST_ID};
use crate::scan::MAX_CONTACT_LINES;

/// Maximum length for short config strings (device names)
pub const MAX_SHORT_STRING: usize = 32;

/// Maximum number of pre-seeded device ids
pub const MAX_INITIAL_DEVICES: usize = 16;

/// Maximum number of contact-scan rules
pub const MAX_SCAN_RULES: usize = 16;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

// ============================================================================
// Helper for creating heapless strings
// ============================================================================

/// Create a ShortString from a &str, truncating at a character boundary
pub fn short_string(s: &str) -> ShortString {
    let mut hs = ShortString::new();
    for c in s.chars() {
        if hs.push(c).is_err() {
            break;
        }
    }
    hs
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete application configuration
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// TWPC bus configuration
    pub bus: BusConfig,
    /// Contact-scan configuration
    pub scan: ScanConfig,
    /// Host link configuration
    pub host: HostConfig,
    /// Slave device profile
    pub device: DeviceConfig,
}

impl Config {
    /// Set bus configuration
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Set contact-scan configuration
    pub fn with_scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    /// Set host link configuration
    pub fn with_host(mut self, host: HostConfig) -> Self {
        self.host = host;
        self
    }

    /// Set slave device profile
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Check every section for values the engines cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        self.scan.validate()?;
        self.device.validate()
    }

    /// Parse and validate a TOML document
    ///
    /// ```rust
    /// use twpc_rail::config::Config;
    /// use twpc_rail::packet::Opcode;
    ///
    /// let config = Config::from_toml_str(r#"
    ///     [bus]
    ///     checksum = false
    ///     fault_threshold = 80
    ///
    ///     [scan]
    ///     lines = 3
    ///     rules = [{ line = 2, command = "stop" }]
    /// "#).unwrap();
    ///
    /// assert!(!config.bus.checksum);
    /// assert_eq!(config.bus.fault_threshold, Some(80));
    /// assert_eq!(config.scan.rules[0].command, Opcode::Stop);
    /// ```
    #[cfg(feature = "toml")]
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Bus Config
// ============================================================================

/// TWPC bus configuration
///
/// Master and every slave on one bus must share `checksum` and
/// `identity_len`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BusConfig {
    /// Transmit and validate the checksum byte (32-bit frames, else 24-bit)
    pub checksum: bool,
    /// Identity bytes collected during the handshake (0 or 3)
    pub identity_len: u8,
    /// Sample ticks a receiver waits for a start pair (`None` = forever)
    pub fault_threshold: Option<u16>,
    /// Ids known to be on the bus at start-up
    pub initial_devices: Vec<u8, MAX_INITIAL_DEVICES>,
    /// Scheduler tick period in microseconds (hosted runner only)
    pub tick_period_us: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            checksum: true,
            identity_len: 3,
            fault_threshold: Some(64),
            initial_devices: Vec::new(),
            tick_period_us: 500,
        }
    }
}

impl BusConfig {
    /// Enable or disable the checksum byte
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Set the identity length
    pub fn with_identity_len(mut self, len: u8) -> Self {
        self.identity_len = len;
        self
    }

    /// Set (or disable with `None`) the receive fault threshold
    pub fn with_fault_threshold(mut self, threshold: Option<u16>) -> Self {
        self.fault_threshold = threshold;
        self
    }

    /// Add a pre-seeded device id (ignored once the list is full)
    pub fn with_initial_device(mut self, id: u8) -> Self {
        let _ = self.initial_devices.push(id);
        self
    }

    /// Set the scheduler tick period
    pub fn with_tick_period_us(mut self, us: u32) -> Self {
        self.tick_period_us = us;
        self
    }

    /// Frame layout implied by `checksum`
    pub fn format(&self) -> PacketFormat {
        PacketFormat {
            checksum: self.checksum,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_len != 0 && self.identity_len != 3 {
            return Err(ConfigError::IdentityLength(self.identity_len));
        }
        if self.fault_threshold == Some(0) {
            return Err(ConfigError::ZeroThreshold);
        }
        match self
            .initial_devices
            .iter()
            .find(|&&id| id == 0 || id == BROADCAST_ID)
        {
            Some(&id) => Err(ConfigError::DeviceId(id)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Scan Config
// ============================================================================

/// Command queued on a device reported by one contact line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanRule {
    /// Contact line index
    pub line: u8,
    /// Command to queue on the reported device
    pub command: Opcode,
    /// Command argument
    #[cfg_attr(feature = "serde", serde(default))]
    pub arg: u8,
}

impl ScanRule {
    /// Rule without an argument
    pub const fn new(line: u8, command: Opcode) -> Self {
        Self {
            line,
            command,
            arg: 0,
        }
    }

    /// Set the argument
    pub const fn with_arg(mut self, arg: u8) -> Self {
        self.arg = arg;
        self
    }
}

/// Contact-scan configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanConfig {
    /// Whether the scanner runs
    pub enabled: bool,
    /// Number of contact lines, scanned as `Contact(0)..Contact(lines - 1)`
    pub lines: u8,
    /// Line-to-command rules
    pub rules: Vec<ScanRule, MAX_SCAN_RULES>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let mut rules = Vec::new();
        let _ = rules.push(ScanRule::new(0, Opcode::LightOn));
        let _ = rules.push(ScanRule::new(1, Opcode::LightOff));
        Self {
            enabled: true,
            lines: 2,
            rules,
        }
    }
}

impl ScanConfig {
    /// Enable or disable scanning
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the number of scanned lines
    pub fn with_lines(mut self, lines: u8) -> Self {
        self.lines = lines;
        self
    }

    /// Drop every rule
    pub fn without_rules(mut self) -> Self {
        self.rules.clear();
        self
    }

    /// Add a rule, replacing any rule for the same line
    pub fn with_rule(mut self, rule: ScanRule) -> Self {
        self.rules.retain(|r| r.line != rule.line);
        let _ = self.rules.push(rule);
        self
    }

    /// Rule for `line`, if any
    pub fn rule_for(&self, line: u8) -> Option<&ScanRule> {
        self.rules.iter().find(|r| r.line == line)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lines as usize > MAX_CONTACT_LINES {
            return Err(ConfigError::TooManyLines(self.lines as usize));
        }
        match self.rules.iter().find(|r| r.line >= self.lines) {
            Some(rule) => Err(ConfigError::RuleLine {
                line: rule.line,
                lines: self.lines,
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Host Config
// ============================================================================

/// Host link configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HostConfig {
    /// Forward contact-scan reports to the host as event lines
    pub forward_reports: bool,
    /// Forward connects and disconnects to the host as event lines
    pub forward_connections: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            forward_reports: true,
            forward_connections: false,
        }
    }
}

impl HostConfig {
    /// Enable or disable contact report forwarding
    pub fn with_forward_reports(mut self, enabled: bool) -> Self {
        self.forward_reports = enabled;
        self
    }

    /// Enable or disable connection event forwarding
    pub fn with_forward_connections(mut self, enabled: bool) -> Self {
        self.forward_connections = enabled;
        self
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Profile of a slave device
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceConfig {
    /// Human-readable device name
    pub name: ShortString,
    /// Type code reported during enumeration
    pub device_type: DeviceType,
    /// Identity bytes reported during the handshake
    pub identity: [u8; 3],
    /// Fixed bus id; the device skips enumeration when set
    pub static_id: Option<u8>,
    /// Answer contact-scan pulses with the bus id
    pub contact_responder: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: short_string("train"),
            device_type: DeviceType::Train,
            identity: *b"ASD",
            static_id: None,
            contact_responder: true,
        }
    }
}

impl DeviceConfig {
    /// Set the device name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = short_string(name);
        self
    }

    /// Set the device type
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Set the identity bytes
    pub fn with_identity(mut self, identity: [u8; 3]) -> Self {
        self.identity = identity;
        self
    }

    /// Set (or clear) a static bus id
    pub fn with_static_id(mut self, id: Option<u8>) -> Self {
        self.static_id = id;
        self
    }

    /// Enable or disable the contact responder
    pub fn with_contact_responder(mut self, enabled: bool) -> Self {
        self.contact_responder = enabled;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.static_id {
            Some(id) if id == 0 || id == BROADCAST_ID => Err(ConfigError::DeviceId(id)),
            _ => Ok(()),
        }
    }
}

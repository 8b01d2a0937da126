//! System-wide constants for the EGM I/O workspace.
//!
//! Single source of truth for all numeric limits and default paths.
//! Imported by all crates; do not duplicate these values elsewhere.

use static_assertions::const_assert;

/// Canonical service name (used for logging and the default config).
pub const IO_SERVICE_NAME: &str = "egm_io";

/// Maximum width of the physical bit image read from the I/O board.
pub const MAX_PHYSICAL_BITS: usize = 64;

/// Default poll period of the physical I/O loop in milliseconds.
pub const DEFAULT_POLL_PERIOD_MS: u64 = 10;

/// Default interval between meter health probes in milliseconds.
pub const DEFAULT_HEALTH_PROBE_INTERVAL_MS: u64 = 1000;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/egm/io.toml";

/// Property key toggling the mechanical meter bank.
pub const METERS_ENABLED_PROPERTY: &str = "MechanicalMeters.Enabled";

// The bit image is carried in a single u64.
const_assert!(MAX_PHYSICAL_BITS <= u64::BITS as usize);

/// Mask covering the low `width` bits of the physical image.
pub const fn width_mask(width: u8) -> u64 {
    if width as usize >= MAX_PHYSICAL_BITS {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

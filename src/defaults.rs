//! Default values and derived names for managed services.

use crate::size::Size;
use std::env;

pub const PHYSICAL_BLOCK_SIZE: u64 = 4096;
pub const BLOCK_MAP_CACHE_SIZE: &str = "128M";
pub const BLOCK_MAP_PAGE_SIZE: u64 = 32768;
pub const READ_CACHE_SIZE: &str = "0";
pub const RESERVE_SIZE: &str = "0";
pub const RECOVERY_SCAN_RATE: u64 = 640;
pub const RECOVERY_SWEEP_RATE: u64 = 40;
pub const MD_RAID5_MODE: &str = "on";

/// Write policy recorded in the configuration when none was given; the
/// target reads the effective policy back from its superblock.
pub const CONFIGURED_WRITE_POLICY: &str = "read_from_superblock";
/// Write policy offered as the command-line default.
pub const EXTERNAL_WRITE_POLICY: &str = "sync";

pub const INDEX_ADDRESS: &str = "localhost";
pub const INDEX_PORT: u16 = 8000;
pub const INDEX_DIR: &str = "/mnt/dedupe-index";
pub const CHECKPOINT_FREQUENCY: u64 = 0;
pub const VOLUME_GROUP: &str = "dedupevg";

/// Retry budget for wait-until-success command polling.
pub const WAIT_FOR_RETRIES: u32 = 20;

fn conf_dir() -> String {
    env::var("DEDUPDOG_CONF_DIR").unwrap_or_else(|_| "/etc".to_string())
}

/// Path of the configuration file unless overridden on the command line.
pub fn conf_file() -> String {
    format!("{}/dedupdog.conf", conf_dir())
}

/// Path of the process lock file unless overridden on the command line.
pub fn lock_file() -> String {
    format!("{}/dedupdog.lock", conf_dir())
}

/// Index directory for a named target: a per-service suffix on the base dir.
pub fn index_dir_for(name: &str) -> String {
    format!("{}-{}", INDEX_DIR, name)
}

/// Default logical volume names derived from the target name.
pub fn lv_names_for(name: &str) -> (String, String) {
    (format!("{}-index", name), format!("{}-backing", name))
}

/// Default on-disk index size, derived from the index memory setting: 20G
/// per gigabyte of index memory, ten times that for a sparse index.
pub fn index_size(memory: &str, sparse: bool) -> Size {
    let mem: f64 = memory.parse().unwrap_or(0.0);
    let mem = if mem == 0.0 { 1.0 } else { mem };
    let mut gigabytes = 20.0 * mem;
    if sparse {
        gigabytes *= 10.0;
    }
    Size::from_bytes((gigabytes * (1u64 << 30) as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_lv_names() {
        let (index, backing) = lv_names_for("vol1");
        assert_eq!(index, "vol1-index");
        assert_eq!(backing, "vol1-backing");
    }

    #[test]
    fn index_size_scales_with_memory() {
        assert_eq!(index_size("0", false).to_string(), "20G");
        assert_eq!(index_size("2", false).to_string(), "40G");
        assert_eq!(index_size("1", true).to_string(), "200G");
        assert_eq!(index_size("0.5", false).to_string(), "10G");
    }
}

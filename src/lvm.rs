//! Handles to LVM logical volumes backing the managed services.
//!
//! A `LogicalVolume` may or may not correspond to an actual volume on the
//! system; construction only checks the path shape. All queries and
//! mutations go through the LVM command-line tools.

use crate::command::{Command, RunnerConfig};
use crate::error::{self, Error, Result};
use crate::size::Size;
use crate::{LVCHANGE_BIN, LVCREATE_BIN, LVEXTEND_BIN, LVREDUCE_BIN, LVREMOVE_BIN, LVS_BIN, VGS_BIN};
use log::{debug, error};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Retry budget for deactivate/remove, which can fail transiently while
/// udev still holds the device open.
const REMOVE_RETRIES: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalVolume {
    full_path: String,
    volume_group: String,
    name: String,
    // The vg/lv form the LVM tools take.
    lvm_path: String,
    // Last size set by create/extend/reduce; only consulted in no-run mode,
    // where the real size cannot be queried.
    last_size: Size,
    /// If set, create and extend refuse to grow the volume past this size.
    pub maximum_size: Option<Size>,
}

impl LogicalVolume {
    /// The full device path, `/dev/<vg>/<lv>`. This is the persisted form
    /// and parses back to an equal handle.
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn volume_group(&self) -> &str {
        &self.volume_group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks that this volume could be created: the volume group must
    /// exist and the volume must not.
    pub fn can_create(&self, cfg: &RunnerConfig) -> Result<()> {
        if Command::new(cfg, &[VGS_BIN, &self.volume_group]).run().is_err() {
            return error::VolumeGroupMissingSnafu {
                volume_group: &self.volume_group,
            }
            .fail();
        }
        if self.exists(cfg) && !cfg.no_run {
            return error::VolumeExistsSnafu {
                path: &self.full_path,
            }
            .fail();
        }
        Ok(())
    }

    /// Creates this volume at the requested size, or over all remaining
    /// free space in the volume group when no size is given. Returns the
    /// realized size, rounded down to a multiple of `block_size`.
    pub fn create(
        &mut self,
        cfg: &RunnerConfig,
        block_size: u64,
        physical_size: Option<Size>,
    ) -> Result<Size> {
        self.check_size(cfg, physical_size, false)?;
        let mut cmd = Command::new(cfg, &[LVCREATE_BIN, "--name", &self.lvm_path]);
        match physical_size {
            Some(size) => {
                self.last_size = size;
                cmd.arg("--size");
                cmd.arg(size.to_string());
            }
            None => {
                cmd.arg("--extents");
                cmd.arg("100%FREE");
            }
        }
        cmd.arg(&self.volume_group);
        cmd.run()?;
        self.round_size(cfg, block_size, physical_size)
    }

    /// Extends this volume, with the same size and return contract as
    /// `create`.
    pub fn extend(
        &mut self,
        cfg: &RunnerConfig,
        block_size: u64,
        physical_size: Option<Size>,
    ) -> Result<Size> {
        self.check_size(cfg, physical_size, true)?;
        let mut cmd = Command::new(cfg, &[LVEXTEND_BIN]);
        match physical_size {
            Some(size) => {
                self.last_size = size;
                cmd.arg("--size");
                cmd.arg(size.to_string());
            }
            None => {
                cmd.arg("--extents");
                cmd.arg("+100%FREE");
            }
        }
        cmd.arg(&self.lvm_path);
        cmd.run()?;
        self.round_size(cfg, block_size, physical_size)
    }

    /// Shrinks this volume to the given size. Best-effort: every step
    /// swallows failures, and the volume is reactivated afterwards.
    pub fn reduce(&mut self, cfg: &RunnerConfig, physical_size: Size) {
        let size = physical_size.to_string();
        Command::new(cfg, &[LVCHANGE_BIN, "-an", &self.lvm_path]).ignore_failure();
        Command::new(cfg, &[LVREDUCE_BIN, "--size", &size, "--force", &self.lvm_path])
            .ignore_failure();
        Command::new(cfg, &[LVCHANGE_BIN, "-ay", &self.lvm_path]).ignore_failure();
        self.last_size = physical_size;
    }

    /// Deactivates and removes this volume, waiting out transient holds.
    pub fn remove(&mut self, cfg: &RunnerConfig) -> Result<()> {
        Command::new(cfg, &[LVCHANGE_BIN, "-an", &self.lvm_path]).wait_for(REMOVE_RETRIES)?;
        Command::new(cfg, &[LVREMOVE_BIN, "-f", &self.lvm_path]).wait_for(REMOVE_RETRIES)?;
        self.last_size = Size::default();
        Ok(())
    }

    pub fn exists(&self, cfg: &RunnerConfig) -> bool {
        if !cfg.no_run && !Path::new(&self.full_path).exists() {
            return false;
        }
        Command::new(cfg, &[LVS_BIN, &self.lvm_path]).run().is_ok()
    }

    /// Activates or deactivates the volume. Failure is logged, not
    /// returned; callers that care query `exists` afterwards.
    pub fn set_available(&self, cfg: &RunnerConfig, available: bool) {
        let arg = if available { "-ay" } else { "-an" };
        if let Err(e) = Command::new(cfg, &[LVCHANGE_BIN, arg, &self.lvm_path]).run() {
            error!("Could not change availability of {}: {}", self.full_path, e);
        }
    }

    /// The current size of this volume. In no-run mode, the value recorded
    /// at the last create/extend/reduce. Zero if the query fails.
    pub fn size(&self, cfg: &RunnerConfig) -> Size {
        if cfg.no_run {
            return self.last_size;
        }
        let kbytes = Command::new(
            cfg,
            &[
                LVS_BIN,
                "--units",
                "k",
                "--noheadings",
                "--nosuffix",
                "-o",
                "lv_size",
                &self.lvm_path,
            ],
        )
        .output_or_empty();
        let kbytes = kbytes.trim();
        if kbytes.is_empty() {
            return Size::default();
        }
        format!("{}K", kbytes).parse().unwrap_or_default()
    }

    /// Raw `lvs` line for status output.
    pub fn status(&self, cfg: &RunnerConfig) -> String {
        let out = Command::new(cfg, &[LVS_BIN, "--noheadings", &self.lvm_path]).output_or_empty();
        let out = out.trim();
        if out.is_empty() {
            "(not available)".to_string()
        } else {
            out.to_string()
        }
    }

    /// Raw `vgs` line for the containing volume group.
    pub fn vg_status(&self, cfg: &RunnerConfig) -> String {
        let out =
            Command::new(cfg, &[VGS_BIN, "--noheadings", &self.volume_group]).output_or_empty();
        let out = out.trim();
        if out.is_empty() {
            "(not available)".to_string()
        } else {
            out.to_string()
        }
    }

    /// Free space remaining in the containing volume group. Zero if the
    /// query fails.
    pub fn vg_free(&self, cfg: &RunnerConfig) -> Size {
        let kbytes = Command::new(
            cfg,
            &[
                VGS_BIN,
                "-o",
                "vg_free",
                "--noheadings",
                "--units",
                "k",
                "--nosuffix",
                &self.volume_group,
            ],
        )
        .output_or_empty();
        let kbytes = kbytes.trim();
        if kbytes.is_empty() {
            return Size::default();
        }
        format!("{}K", kbytes).parse().unwrap_or_default()
    }

    // Finishes a create or extend by rounding the realized size down to a
    // block-size multiple, reducing away any slop LVM added when it rounded
    // the request up to its extent size.
    fn round_size(
        &mut self,
        cfg: &RunnerConfig,
        block_size: u64,
        expected: Option<Size>,
    ) -> Result<Size> {
        let mut lv_size = self.size(cfg);
        if expected != Some(lv_size) {
            debug!("LVM set physical size to {}", lv_size);
        }
        let slop = lv_size.to_bytes() % block_size;
        if slop != 0 {
            lv_size = Size::from_bytes(lv_size.to_bytes() - slop);
            self.reduce(cfg, lv_size);
            debug!("Rounded physical size to {}", lv_size);
        }
        Ok(lv_size)
    }

    // Checks a requested create/extend size against the supported maximum.
    // A missing size means "all free space in the volume group", which is
    // what gets checked instead. No check in no-run mode.
    fn check_size(
        &self,
        cfg: &RunnerConfig,
        physical_size: Option<Size>,
        for_extend: bool,
    ) -> Result<()> {
        let maximum = match self.maximum_size {
            Some(max) if !cfg.no_run => max,
            _ => return Ok(()),
        };
        let requested = match physical_size {
            Some(size) => size,
            None => {
                let mut bytes = self.vg_free(cfg).to_bytes();
                if for_extend {
                    bytes += self.size(cfg).to_bytes();
                }
                Size::from_bytes(bytes)
            }
        };
        if requested > maximum {
            return error::SizeTooLargeSnafu {
                requested: requested.to_string(),
                maximum: maximum.to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

impl FromStr for LogicalVolume {
    type Err = Error;

    /// Accepts only full device paths of the form `/dev/<vg>/<lv>`.
    fn from_str(path: &str) -> Result<Self> {
        let invalid = || error::InvalidVolumePathSnafu { path }.build();
        let mut parts = path.split('/');
        // A leading '/' yields an empty first component.
        if parts.next() != Some("") || parts.next() != Some("dev") {
            return Err(invalid());
        }
        let volume_group = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            full_path: path.to_string(),
            volume_group: volume_group.to_string(),
            name: name.to_string(),
            lvm_path: format!("{}/{}", volume_group, name),
            last_size: Size::default(),
            maximum_size: None,
        })
    }
}

impl fmt::Display for LogicalVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path)
    }
}

impl Serialize for LogicalVolume {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full_path)
    }
}

impl<'de> Deserialize<'de> for LogicalVolume {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_RUN: RunnerConfig = RunnerConfig {
        no_run: true,
        verbose: false,
    };

    #[test]
    fn parses_well_formed_paths() {
        let lv: LogicalVolume = "/dev/dedupevg/vol1-backing".parse().unwrap();
        assert_eq!(lv.volume_group(), "dedupevg");
        assert_eq!(lv.name(), "vol1-backing");
        assert_eq!(lv.full_path(), "/dev/dedupevg/vol1-backing");
        assert_eq!(lv.to_string(), "/dev/dedupevg/vol1-backing");
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in [
            "",
            "vg/lv",
            "/dev/vg",
            "/dev/vg/lv/extra",
            "/tmp/vg/lv",
            "/dev//lv",
            "/dev/vg/",
        ] {
            assert!(
                path.parse::<LogicalVolume>().is_err(),
                "accepted '{}'",
                path
            );
        }
    }

    #[test]
    fn path_round_trips() {
        let lv: LogicalVolume = "/dev/vg0/data".parse().unwrap();
        let again: LogicalVolume = lv.to_string().parse().unwrap();
        assert_eq!(lv, again);
    }

    #[test]
    fn no_run_create_returns_rounded_request() {
        let mut lv: LogicalVolume = "/dev/dedupevg/vol1-backing".parse().unwrap();
        let size = lv
            .create(&NO_RUN, 4096, Some("20G".parse().unwrap()))
            .unwrap();
        assert_eq!(size.to_string(), "20G");
        assert_eq!(lv.size(&NO_RUN), size);
    }

    #[test]
    fn no_run_skips_maximum_size_check() {
        let mut lv: LogicalVolume = "/dev/dedupevg/huge".parse().unwrap();
        lv.maximum_size = Some("1G".parse().unwrap());
        lv.create(&NO_RUN, 4096, Some("2G".parse().unwrap()))
            .unwrap();
    }
}

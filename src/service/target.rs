//! Manages a deduplicating device-mapper target and its backing volume.

use crate::command::{Command, RunnerConfig};
use crate::defaults;
use crate::error::{self, Result};
use crate::lvm::LogicalVolume;
use crate::service::{
    print_command_status, KernelModuleService, Outcome, Service, StartOptions,
};
use crate::size::Size;
use crate::{DMSETUP_BIN, DM_TARGET_TYPE, FORMAT_BIN, STATS_BIN};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::net::IpAddr;
use std::thread::sleep;
use std::time::Duration;

/// The largest backing volume the on-disk format supports.
const MAXIMUM_PHYSICAL_SIZE: &str = "256T";

/// A deduplicated block device built on a backing logical volume. The
/// device appears as `/dev/mapper/<name>` while started.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetService {
    #[serde(skip)]
    name: String,

    /// Block map cache size passed to the formatter when non-default.
    pub block_map_cache_size: Size,
    /// Block map page size passed to the formatter when non-default.
    pub block_map_page_size: u64,
    /// Whether the compression extension is invoked on start.
    pub enable_compression: bool,
    /// Reserved for a future table flag; always passed through as stored.
    pub enable_deduplication: bool,
    /// Whether `start` should bring this device up.
    pub enabled: bool,
    /// Block size the device advertises, 512 or 4096.
    pub logical_block_size: u64,
    /// Size of the device presented to users.
    pub logical_size: Size,
    /// The backing volume.
    pub logical_volume: LogicalVolume,
    /// "on" or "off"; passed through to the device table.
    pub md_raid5_mode: String,
    /// Block size of the backing store, normally 4096.
    pub physical_block_size: u64,
    /// Realized size of the backing volume.
    pub physical_size: Size,
    pub read_cache_size: Size,
    pub recovery_scan_rate: u64,
    pub recovery_sweep_rate: u64,
    /// Space withheld from the formatter for recovery metadata.
    pub reserve_size: Size,
    /// The index server URI this device deduplicates against.
    pub server: String,
    pub write_policy: String,
}

impl TargetService {
    pub fn new(name: &str, logical_volume: LogicalVolume, enable_512e: bool) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            block_map_cache_size: defaults::BLOCK_MAP_CACHE_SIZE.parse()?,
            block_map_page_size: defaults::BLOCK_MAP_PAGE_SIZE,
            enable_compression: false,
            enable_deduplication: true,
            enabled: true,
            logical_block_size: if enable_512e { 512 } else { 4096 },
            logical_size: Size::default(),
            logical_volume,
            md_raid5_mode: defaults::MD_RAID5_MODE.to_string(),
            physical_block_size: defaults::PHYSICAL_BLOCK_SIZE,
            physical_size: Size::default(),
            read_cache_size: defaults::READ_CACHE_SIZE.parse()?,
            recovery_scan_rate: defaults::RECOVERY_SCAN_RATE,
            recovery_sweep_rate: defaults::RECOVERY_SWEEP_RATE,
            reserve_size: defaults::RESERVE_SIZE.parse()?,
            server: String::new(),
            write_policy: defaults::CONFIGURED_WRITE_POLICY.to_string(),
        })
    }

    /// Restores state lost in serialization; the name is the record's key
    /// in the configuration file.
    pub fn restore(&mut self, name: &str) {
        self.name = name.to_string();
        // Clamp future resizes to what the on-disk format can address.
        self.logical_volume.maximum_size = MAXIMUM_PHYSICAL_SIZE.parse().ok();
    }

    /// The device path users see while the target is started.
    pub fn device_path(&self) -> String {
        format!("/dev/mapper/{}", self.name)
    }

    /// Grows the backing volume and tells a running target to take up the
    /// new space, or all remaining free space in the volume group when no
    /// size is given.
    ///
    /// The volume is grown first so the reconfigure has space to take; if
    /// the device then cannot be suspended or refuses the new size, the
    /// volume is shrunk back so no space leaks.
    pub fn grow_physical(&mut self, cfg: &RunnerConfig, new_size: Option<Size>) -> Result<()> {
        let old_size = self.physical_size;
        let grown = self
            .logical_volume
            .extend(cfg, self.physical_block_size, new_size)
            .map_err(|e| {
                error!("Can't grow logical volume {}: {}", self.logical_volume, e);
                e
            })?;

        if let Err(e) = Command::new(cfg, &[DMSETUP_BIN, "suspend", &self.name]).run() {
            error!("Could not suspend {}: {}", self.name, e);
            self.logical_volume.reduce(cfg, old_size);
            return Err(e);
        }

        let logical_blocks =
            (self.logical_size.to_bytes() / self.physical_block_size).to_string();
        let physical_blocks = (grown.to_bytes() / self.physical_block_size).to_string();
        let reconfigured = Command::new(
            cfg,
            &[
                DMSETUP_BIN,
                "message",
                &self.name,
                "0",
                "reconfigure",
                &self.physical_block_size.to_string(),
                &logical_blocks,
                &physical_blocks,
            ],
        )
        .run();
        match &reconfigured {
            Ok(()) => self.physical_size = grown,
            Err(e) => error!("Device {} refused new physical size: {}", self.name, e),
        }

        if let Err(e) = Command::new(cfg, &[DMSETUP_BIN, "resume", &self.name]).run() {
            // The device is wedged; leave the volume alone for inspection.
            error!("Could not resume {}: {}", self.name, e);
            return Err(e);
        }
        if reconfigured.is_err() {
            self.logical_volume.reduce(cfg, old_size);
        }
        reconfigured
    }

    // The device-mapper table line for this target.
    fn table(&self, numeric_server: &str) -> String {
        format!(
            "0 {sectors} {target} {device} {pbs} {lbs} {cache_blocks} {scan} {sweep} {raid5} {policy} {name} {server}",
            sectors = self.logical_size.to_sectors(),
            target = DM_TARGET_TYPE,
            device = self.logical_volume.full_path(),
            pbs = self.physical_block_size,
            lbs = self.logical_block_size,
            cache_blocks = self.read_cache_size.to_bytes() / self.physical_block_size,
            scan = self.recovery_scan_rate,
            sweep = self.recovery_sweep_rate,
            raid5 = self.md_raid5_mode,
            policy = self.write_policy,
            name = self.name,
            server = numeric_server,
        )
    }

    // Resolves a host:port spec to numeric form for the device table; the
    // kernel does not do name lookups.
    fn resolve_spec(&self, spec: &str) -> Result<String> {
        let (host, port) = spec
            .split_once(':')
            .ok_or_else(|| error::InvalidNetworkSpecSnafu { spec }.build())?;
        if host.parse::<IpAddr>().is_ok() {
            return Ok(spec.to_string());
        }
        let addrs =
            dns_lookup::lookup_host(host).context(error::ResolveHostSnafu { host })?;
        let addr = addrs
            .first()
            .ok_or_else(|| error::InvalidNetworkSpecSnafu { spec }.build())?;
        Ok(format!("{}:{}", addr, port))
    }

    // Runs the formatter over the backing volume. Only non-default tuning
    // values are passed; the formatter's own defaults match ours.
    fn format_device(&self, cfg: &RunnerConfig, extra: &[&str]) -> Result<()> {
        let mut format = Command::new(
            cfg,
            &[
                FORMAT_BIN,
                &format!("--logical-size={}", self.logical_size),
                &format!("--physical-size={}", self.physical_size),
            ],
        );
        for arg in extra {
            format.arg(arg);
        }
        if self.block_map_cache_size.to_string() != defaults::BLOCK_MAP_CACHE_SIZE {
            format.arg(format!(
                "--block-map-cache-size={}",
                self.block_map_cache_size
            ));
        }
        if self.block_map_page_size != defaults::BLOCK_MAP_PAGE_SIZE {
            format.arg(format!("--block-map-page-size={}", self.block_map_page_size));
        }
        if !self.reserve_size.is_zero() {
            format.arg(format!("--recovery-reserve-size={}", self.reserve_size));
        }
        format.arg(self.logical_volume.full_path());
        format.run()
    }

    fn running_now(&self, cfg: &RunnerConfig) -> bool {
        Command::new(cfg, &[DMSETUP_BIN, "status", &self.name])
            .run()
            .is_ok()
    }

    // True if anything is mounted from this device. Listed through the
    // mount command so stacked devices are reported the way users see them.
    fn has_mounts(&self, cfg: &RunnerConfig) -> bool {
        let device = self.device_path();
        Command::new(cfg, &["mount"])
            .output_or_empty()
            .lines()
            .any(|line| line.split_whitespace().next() == Some(device.as_str()))
    }
}

impl Service for TargetService {
    fn name(&self) -> &str {
        &self.name
    }

    /// Creates the backing volume and formats it. A format failure removes
    /// the volume again.
    fn create(&mut self, cfg: &RunnerConfig) -> Outcome {
        info!("Creating dedup device {}", self.name);
        let requested = (!self.physical_size.is_zero()).then_some(self.physical_size);
        self.physical_size = match self
            .logical_volume
            .create(cfg, self.physical_block_size, requested)
        {
            Ok(size) => size,
            Err(e) => {
                error!(
                    "Can't create logical volume {}: {}",
                    self.logical_volume, e
                );
                return Outcome::Error;
            }
        };
        if self.logical_size.is_zero() {
            self.logical_size = self.physical_size;
        }
        self.logical_size.round_down(self.physical_block_size);
        debug!(
            "Sizes for {}: physical {}, logical {}",
            self.name, self.physical_size, self.logical_size
        );

        if let Err(e) = self.format_device(cfg, &[]) {
            error!("Could not format {}: {}", self.logical_volume, e);
            if let Err(e) = self.logical_volume.remove(cfg) {
                error!("Could not remove {}: {}", self.logical_volume, e);
            }
            return Outcome::Error;
        }
        Outcome::Success
    }

    /// Removes the backing volume. The device must be stopped first.
    fn remove(&mut self, cfg: &RunnerConfig) -> Outcome {
        info!("Removing dedup device {}", self.name);
        match self.logical_volume.remove(cfg) {
            Ok(()) => Outcome::Success,
            Err(e) => {
                error!("Could not remove {}: {}", self.logical_volume, e);
                Outcome::Error
            }
        }
    }

    fn exists(&self, cfg: &RunnerConfig) -> bool {
        self.logical_volume.exists(cfg)
    }

    /// Sets up the device-mapper table, loading the kernel module and
    /// activating the backing volume on the way.
    ///
    /// A compression-extension failure is reported as an error but the
    /// started device is left in place; the device works without it.
    fn start(&mut self, cfg: &RunnerConfig, opts: &StartOptions<'_>) -> Outcome {
        info!("Starting dedup device {}", self.name);
        if !self.enabled {
            info!("Dedup device {} not enabled", self.name);
            return Outcome::Success;
        }
        if self.running_now(cfg) && !cfg.no_run {
            info!("Dedup device {} already started", self.name);
            return Outcome::Already;
        }

        let mut kmod = KernelModuleService::new();
        if kmod.start(cfg, opts) == Outcome::Error {
            error!("Could not load kernel module");
            return Outcome::Error;
        }
        self.logical_volume.set_available(cfg, true);

        let spec = match opts.network_spec {
            Some(spec) => spec,
            None => {
                error!("No index server known for dedup device {}", self.name);
                return Outcome::Error;
            }
        };
        let numeric_spec = match self.resolve_spec(spec) {
            Ok(numeric) => numeric,
            Err(e) => {
                error!("Bad index server address for {}: {}", self.name, e);
                return Outcome::Error;
            }
        };

        if opts.rebuild_statistics {
            if let Err(e) = self.format_device(cfg, &["--rebuild-statistics"]) {
                error!("Could not rebuild statistics of {}: {}", self.name, e);
                return Outcome::Error;
            }
        } else if opts.force_rebuild {
            if let Err(e) = self.format_device(cfg, &["--force-rebuild"]) {
                error!("Device {} not read-only: {}", self.name, e);
                return Outcome::Error;
            }
        }

        let table = self.table(&numeric_spec);
        debug!("Table line for {}: {}", self.name, table);
        if let Err(e) = Command::new(
            cfg,
            &[DMSETUP_BIN, "create", &self.name, "--table", &table],
        )
        .run()
        {
            error!("Could not set up device mapper for {}: {}", self.name, e);
            return Outcome::Error;
        }

        if self.enable_compression {
            if let Err(e) = opts
                .extensions
                .invoke(cfg, &self.name, "compression", "on")
            {
                error!("Could not enable compression on {}: {}", self.name, e);
                return Outcome::Error;
            }
        }
        Outcome::Success
    }

    /// Tears down the device-mapper table. Refused while filesystems are
    /// mounted from the device unless `force` unmounts them first.
    fn stop(&mut self, cfg: &RunnerConfig, force: bool) -> Outcome {
        info!("Stopping dedup device {}", self.name);
        if !self.running_now(cfg) && !cfg.no_run {
            info!("Dedup device {} already stopped", self.name);
            return Outcome::Already;
        }
        if self.has_mounts(cfg) {
            if force {
                Command::new(cfg, &["umount", "-f", &self.device_path()]).ignore_failure();
            } else {
                error!("Dedup device {} is mounted", self.name);
                return Outcome::Error;
            }
        }
        // Give udev a beat to let go of the device node.
        sleep(Duration::from_secs(1));
        if let Err(e) = Command::new(cfg, &[DMSETUP_BIN, "remove", &self.name]).run() {
            error!("Could not stop dedup device {}: {}", self.name, e);
            return Outcome::Error;
        }
        Outcome::Success
    }

    fn running(&self, cfg: &RunnerConfig) -> bool {
        self.running_now(cfg)
    }

    fn status(&self, cfg: &RunnerConfig, prefix: &str) {
        println!("{}- {}:", prefix, self.name);
        println!(
            "{}  Block map cache size: {}",
            prefix, self.block_map_cache_size
        );
        println!(
            "{}  Block map page size: {}",
            prefix, self.block_map_page_size
        );
        println!("{}  Compression: {}", prefix, self.enable_compression);
        println!("{}  Deduplication: {}", prefix, self.enable_deduplication);
        println!("{}  Enabled: {}", prefix, self.enabled);
        println!("{}  Logical block size: {}", prefix, self.logical_block_size);
        println!("{}  Logical size: {}", prefix, self.logical_size);
        println!("{}  Logical volume: {}", prefix, self.logical_volume);
        println!("{}  MD RAID5 mode: {}", prefix, self.md_raid5_mode);
        println!(
            "{}  Physical block size: {}",
            prefix, self.physical_block_size
        );
        println!("{}  Physical size: {}", prefix, self.physical_size);
        println!("{}  Read cache size: {}", prefix, self.read_cache_size);
        println!(
            "{}  Recovery scan rate: {}",
            prefix, self.recovery_scan_rate
        );
        println!(
            "{}  Recovery sweep rate: {}",
            prefix, self.recovery_sweep_rate
        );
        println!("{}  Reserve size: {}", prefix, self.reserve_size);
        println!("{}  Index server: {}", prefix, self.server);
        println!("{}  Write policy: {}", prefix, self.write_policy);
        if unsafe { libc::geteuid() } == 0 {
            println!(
                "{}  System logical volume info: {}",
                prefix,
                self.logical_volume.status(cfg)
            );
            println!(
                "{}  System volume group info: {}",
                prefix,
                self.logical_volume.vg_status(cfg)
            );
            print_command_status(
                cfg,
                &[DMSETUP_BIN, "status", &self.name],
                &format!("{}  Device mapper status: ", prefix),
            );
            print_command_status(
                cfg,
                &[STATS_BIN, self.logical_volume.full_path()],
                &format!("{}  Statistics: ", prefix),
            );
        }
    }

    fn keys() -> &'static [&'static str] {
        &[
            "block_map_cache_size",
            "block_map_page_size",
            "enable_compression",
            "enable_deduplication",
            "enabled",
            "logical_block_size",
            "logical_size",
            "logical_volume",
            "md_raid5_mode",
            "physical_block_size",
            "physical_size",
            "read_cache_size",
            "recovery_scan_rate",
            "recovery_sweep_rate",
            "reserve_size",
            "server",
            "write_policy",
        ]
    }
}

//! Manages a dedup index server and the volume its index lives on.

use crate::command::{kill_process, Command, RunnerConfig};
use crate::defaults;
use crate::lvm::LogicalVolume;
use crate::service::{mounted_at, print_command_status, Outcome, Service, StartOptions};
use crate::size::Size;
use crate::{INDEX_CREATE_BIN, INDEX_PING_BIN, INDEX_SERVER_BIN};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const KILL_RETRIES: u32 = 20;
const UNMOUNT_RETRIES: u32 = 5;

/// An index server and its on-disk index. Named by convention with the URI
/// `dedupe://host:port`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexService {
    #[serde(skip)]
    name: String,

    /// Index checkpoint frequency.
    pub checkpoint_frequency: u64,
    /// Whether `start` should bring this service up.
    pub enabled: bool,
    /// Directory the index volume is mounted on.
    pub index_dir: String,
    /// The volume holding the index.
    pub logical_volume: LogicalVolume,
    /// Index server main-memory setting; "0" takes the server default.
    pub memory: String,
    /// The server address, in the form host:port.
    pub network_spec: String,
    /// Worker parallelism; 0 takes the server default.
    pub parallel_factor: u64,
    /// On-disk index size.
    pub size: Size,
    /// Whether the index is sparse.
    pub sparse: bool,
}

impl IndexService {
    pub fn new(
        name: &str,
        logical_volume: LogicalVolume,
        index_dir: String,
        network_spec: String,
        size: Size,
    ) -> Self {
        Self {
            name: name.to_string(),
            checkpoint_frequency: defaults::CHECKPOINT_FREQUENCY,
            enabled: true,
            index_dir,
            logical_volume,
            memory: "0".to_string(),
            network_spec,
            parallel_factor: 0,
            size,
            sparse: false,
        }
    }

    /// Restores state lost in serialization; the name is the record's key
    /// in the configuration file.
    pub fn restore(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// The directory actually holding index data, below the mount point.
    pub fn index_data_dir(&self) -> String {
        format!("{}/index-data", self.index_dir)
    }

    fn pid_file_path(&self) -> String {
        let port = self.network_spec.split(':').nth(1).unwrap_or("0");
        format!(
            "/run/{server}/{server}.{port}.pid",
            server = INDEX_SERVER_BIN
        )
    }

    /// The server's process ID, or 0 when there is no live server.
    fn pid(&self) -> u32 {
        let contents = match fs::read_to_string(self.pid_file_path()) {
            Ok(contents) => contents,
            Err(_) => return 0,
        };
        let pid: u32 = match contents.trim().parse() {
            Ok(pid) => pid,
            Err(_) => return 0,
        };
        // A stale pid file does not count.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            pid
        } else {
            0
        }
    }

    // Creates the backing volume, filesystem, and mounted directory the
    // index will live in. Each failure removes the volume again.
    fn create_index_dir(&mut self, cfg: &RunnerConfig) -> Outcome {
        let requested = (!self.size.is_zero()).then_some(self.size);
        if let Err(e) = self.logical_volume.create(cfg, 4096, requested) {
            error!(
                "Can't create index logical volume {}: {}",
                self.logical_volume, e
            );
            return Outcome::Error;
        }

        let dev = self.logical_volume.full_path().to_string();
        if let Err(e) = Command::new(cfg, &["mkfs", "-t", "ext3", &dev]).run() {
            error!("Could not make filesystem on {}: {}", dev, e);
            self.remove_volume(cfg);
            return Outcome::Error;
        }

        let mount = || -> crate::error::Result<()> {
            Command::new(cfg, &["mkdir", "-p", &self.index_dir]).run()?;
            Command::new(cfg, &["mount", "-t", "ext3", &dev, &self.index_dir]).run()
        };
        if let Err(e) = mount() {
            error!("Could not mount {} on {}: {}", dev, self.index_dir, e);
            self.remove_volume(cfg);
            return Outcome::Error;
        }

        Command::new(cfg, &["chmod", "777", &self.index_dir]).ignore_failure();
        Outcome::Success
    }

    fn remove_volume(&mut self, cfg: &RunnerConfig) {
        if let Err(e) = self.logical_volume.remove(cfg) {
            warn!("Could not remove {}: {}", self.logical_volume, e);
        }
    }

    /// Starts the index server.
    ///
    /// When `ready_command` is given it is passed to the server, which runs
    /// it once the index is ready; only a launch failure is an error then.
    /// Without one, the server is polled until it answers pings, so a fresh
    /// index that needs a long rebuild should use a ready command.
    fn start_server(&mut self, cfg: &RunnerConfig, ready_command: Option<&str>) -> Outcome {
        info!("Starting index server {}", self.name);
        if !self.enabled {
            info!("Index server {} not enabled", self.name);
            return Outcome::Success;
        }
        if self.running_now() && !cfg.no_run {
            info!("Index server {} already started", self.name);
            return Outcome::Already;
        }
        let index_spec = format!("{}:{}", self.network_spec, self.index_data_dir());

        let mut did_mount = false;
        if !mounted_at(&self.index_dir) {
            self.logical_volume.set_available(cfg, true);
            let dev = self.logical_volume.full_path();
            if let Err(e) =
                Command::new(cfg, &["mount", "-t", "ext3", dev, &self.index_dir]).run()
            {
                error!("Could not mount {} on {}: {}", dev, self.index_dir, e);
                return Outcome::Error;
            }
            did_mount = true;
        }

        let mut server = Command::new(
            cfg,
            &[
                INDEX_SERVER_BIN,
                &format!("--index={}", index_spec),
                "--daemon",
                &format!("--pid-file={}", self.pid_file_path()),
            ],
        );
        if let Some(ready) = ready_command {
            server.arg(format!("--when-ready={}", ready));
        }
        let parallel = self.parallel_factor.to_string();
        let mut server = if self.parallel_factor != 0 {
            server.env("INDEX_PARALLEL_FACTOR", parallel.as_str())
        } else {
            server
        };
        if let Err(e) = server.run() {
            error!("Could not start index server {}: {}", self.name, e);
            if did_mount {
                Command::new(cfg, &["umount", "-f", &self.index_dir]).ignore_failure();
            }
            return Outcome::Error;
        }

        if ready_command.is_none() {
            let mut ping = Command::new(
                cfg,
                &[INDEX_PING_BIN, &format!("--index={}", self.network_spec)],
            );
            if let Err(e) = ping.wait_for(defaults::WAIT_FOR_RETRIES) {
                error!("Error starting index server {}: {}", self.name, e);
                return Outcome::Error;
            }
        }
        Outcome::Success
    }

    fn running_now(&self) -> bool {
        self.pid() != 0
    }
}

impl Service for IndexService {
    fn name(&self) -> &str {
        &self.name
    }

    /// Creates the index: backing volume, filesystem, directory, and the
    /// on-disk index structure. A failed index creation removes everything
    /// again.
    fn create(&mut self, cfg: &RunnerConfig) -> Outcome {
        info!("Creating dedup index {}", self.name);
        let outcome = self.create_index_dir(cfg);
        if outcome != Outcome::Success {
            return outcome;
        }

        let index_dir = self.index_data_dir();
        let mut create = Command::new(cfg, &[INDEX_CREATE_BIN, &format!("--index={}", index_dir)]);
        if !self.memory.is_empty() && self.memory != "0" {
            create.arg(format!("--mem={}", self.memory));
        }
        if self.sparse {
            create.arg("--sparse");
        }
        create.arg(format!("--cfreq={}", self.checkpoint_frequency));
        if let Err(e) = create.run() {
            error!("Could not create dedup index {}: {}", index_dir, e);
            self.remove(cfg);
            return Outcome::Error;
        }
        Outcome::Success
    }

    /// Unmounts and deletes the index directory and its volume.
    fn remove(&mut self, cfg: &RunnerConfig) -> Outcome {
        info!("Removing dedup index {}", self.name);
        if mounted_at(&self.index_dir) {
            let mut umount = Command::new(cfg, &["umount", "-f", &self.index_dir]);
            if let Err(e) = umount.wait_for(UNMOUNT_RETRIES) {
                error!("Could not unmount dedup index: {}", e);
                return Outcome::Error;
            }
        }
        let removed = Command::new(cfg, &["rm", "-rf", &self.index_dir]).run();
        match removed.and_then(|()| self.logical_volume.remove(cfg)) {
            Ok(()) => Outcome::Success,
            Err(e) => {
                error!("Could not remove dedup index: {}", e);
                Outcome::Error
            }
        }
    }

    fn exists(&self, _cfg: &RunnerConfig) -> bool {
        Path::new(&self.index_data_dir()).exists()
    }

    fn start(&mut self, cfg: &RunnerConfig, opts: &StartOptions<'_>) -> Outcome {
        self.start_server(cfg, opts.ready_command)
    }

    /// Stops the server by pid with an escalating kill, then best-effort
    /// unmounts the index volume.
    fn stop(&mut self, cfg: &RunnerConfig, _force: bool) -> Outcome {
        info!("Stopping index server {}", self.name);
        let pid = self.pid();
        if pid == 0 && !cfg.no_run {
            info!("Index server {} already stopped", self.name);
            return Outcome::Already;
        }
        kill_process(cfg, pid, KILL_RETRIES);
        let mut umount = Command::new(cfg, &["umount", "-f", &self.index_dir]);
        if let Err(e) = umount.wait_for(UNMOUNT_RETRIES) {
            info!("Index volume unmount failed: {}", e);
        }
        Outcome::Success
    }

    fn running(&self, _cfg: &RunnerConfig) -> bool {
        self.running_now()
    }

    fn status(&self, cfg: &RunnerConfig, prefix: &str) {
        println!("{}- {}:", prefix, self.name);
        println!(
            "{}  Checkpoint frequency: {}",
            prefix, self.checkpoint_frequency
        );
        println!("{}  Enabled: {}", prefix, self.enabled);
        println!("{}  Index directory: {}", prefix, self.index_dir);
        println!("{}  Index logical volume: {}", prefix, self.logical_volume);
        println!("{}  Server memory setting: {}", prefix, self.memory);
        println!("{}  Network spec: {}", prefix, self.network_spec);
        println!("{}  Index size: {}", prefix, self.size);
        println!("{}  Sparse: {}", prefix, self.sparse);
        println!("{}  Server parallel factor: {}", prefix, self.parallel_factor);
        if unsafe { libc::geteuid() } == 0 {
            println!(
                "{}  System logical volume info: {}",
                prefix,
                self.logical_volume.status(cfg)
            );
        }
        let pid = self.pid();
        if pid != 0 {
            println!("{}  Server process ID: {}", prefix, pid);
            print_command_status(
                cfg,
                &[INDEX_PING_BIN, &format!("--index={}", self.network_spec)],
                &format!("{}  Server status: ", prefix),
            );
        } else {
            println!("{}  Server process ID: (not running)", prefix);
        }
    }

    fn keys() -> &'static [&'static str] {
        &[
            "checkpoint_frequency",
            "enabled",
            "index_dir",
            "logical_volume",
            "memory",
            "network_spec",
            "parallel_factor",
            "size",
            "sparse",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::Extensions;

    const NO_RUN: RunnerConfig = RunnerConfig {
        no_run: true,
        verbose: false,
    };

    fn service() -> IndexService {
        IndexService::new(
            "dedupe://localhost:8000",
            "/dev/dedupevg/vol1-index".parse().unwrap(),
            "/mnt/dedupe-index-vol1".to_string(),
            "localhost:8000".to_string(),
            "20G".parse().unwrap(),
        )
    }

    #[test]
    fn pid_file_path_derives_from_port() {
        assert_eq!(
            service().pid_file_path(),
            format!(
                "/run/{server}/{server}.8000.pid",
                server = INDEX_SERVER_BIN
            )
        );
    }

    #[test]
    fn index_data_dir_below_mount_point() {
        assert_eq!(
            service().index_data_dir(),
            "/mnt/dedupe-index-vol1/index-data"
        );
    }

    #[test]
    fn create_in_no_run_mode_succeeds() {
        let mut svc = service();
        assert_eq!(svc.create(&NO_RUN), Outcome::Success);
    }

    #[test]
    fn start_attempts_the_action_in_no_run_mode() {
        // No-run mode cannot observe real state, so start assumes the
        // pessimistic non-running case and goes through the motions.
        let extensions = Extensions::new();
        let opts = StartOptions::new(&extensions);
        let mut svc = service();
        assert_eq!(svc.start(&NO_RUN, &opts), Outcome::Success);
        assert_eq!(svc.start(&NO_RUN, &opts), Outcome::Success);
    }

    #[test]
    fn disabled_service_start_is_a_no_op() {
        let extensions = Extensions::new();
        let opts = StartOptions::new(&extensions);
        let mut svc = service();
        svc.enabled = false;
        assert_eq!(svc.start(&NO_RUN, &opts), Outcome::Success);
    }

    #[test]
    fn keys_match_serialized_fields() {
        let svc = service();
        let toml = toml::to_string(&svc).unwrap();
        for key in IndexService::keys() {
            assert!(
                toml.contains(&format!("{} = ", key)),
                "missing '{}' in {}",
                key,
                toml
            );
        }
    }
}

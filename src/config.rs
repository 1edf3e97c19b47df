//! The durable record of managed services.
//!
//! One TOML file holds every target and index this host manages. Opening
//! the store takes the process lock for the whole open-mutate-persist
//! window, so concurrent invocations of the tool serialize on it. Writes
//! replace the file atomically and leave the previous contents in a `.bak`
//! sibling.

use crate::command::RunnerConfig;
use crate::error::{self, Result};
use crate::lock::{LockMode, ProcessLock};
use crate::service::{IndexService, TargetService};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SUPPORTED_VERSIONS: &[&str] = &["1.0"];
const CURRENT_VERSION: &str = "1.0";

/// The file's on-disk shape. Service names are the map keys, so records
/// sort and list deterministically.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    targets: BTreeMap<String, TargetService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    indexes: BTreeMap<String, IndexService>,
}

/// How to open the configuration store.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Take the shared lock and refuse to persist.
    pub readonly: bool,
    /// Fail if the file does not exist yet.
    pub must_exist: bool,
    /// Delete the file on persist when the last record is removed.
    pub delete_empty: bool,
}

/// An open, locked configuration store.
#[derive(Debug)]
pub struct Configuration<'a> {
    cfg: &'a RunnerConfig,
    path: PathBuf,
    lock: ProcessLock,
    readonly: bool,
    delete_empty: bool,
    dirty: bool,
    version: String,
    targets: BTreeMap<String, TargetService>,
    indexes: BTreeMap<String, IndexService>,
}

impl<'a> Configuration<'a> {
    /// Opens the store, taking the process lock and loading the file if it
    /// exists. The lock is held until the `Configuration` is dropped.
    pub fn open<P: AsRef<Path>>(
        cfg: &'a RunnerConfig,
        path: P,
        lock_path: P,
        options: OpenOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure!(
            !options.must_exist || path.exists(),
            error::ConfigMissingSnafu { path: &path }
        );

        let mode = if options.readonly {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let mut lock = ProcessLock::new(lock_path, mode);
        lock.acquire()?;

        let mut config = Self {
            cfg,
            path,
            lock,
            readonly: options.readonly,
            delete_empty: options.delete_empty,
            dirty: false,
            version: CURRENT_VERSION.to_string(),
            targets: BTreeMap::new(),
            indexes: BTreeMap::new(),
        };
        config.load()?;
        Ok(config)
    }

    fn load(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&self.path)
            .context(error::ConfigReadSnafu { path: &self.path })?;
        if contents.trim().is_empty() {
            return Ok(());
        }

        // The version gate comes before full decoding so an unsupported
        // file is reported as such, not as a parse error.
        let value: toml::Value = contents
            .parse()
            .context(error::ConfigParseSnafu { path: &self.path })?;
        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        ensure!(
            SUPPORTED_VERSIONS.contains(&version.as_str()),
            error::ConfigVersionUnsupportedSnafu { version }
        );

        let file: ConfigFile = value
            .try_into()
            .context(error::ConfigParseSnafu { path: &self.path })?;
        self.version = file.version;
        self.targets = file.targets;
        self.indexes = file.indexes;
        for (name, target) in self.targets.iter_mut() {
            target.restore(name);
        }
        for (name, index) in self.indexes.iter_mut() {
            index.restore(name);
        }
        debug!(
            "Read configuration {} with {} targets, {} indexes",
            self.path.display(),
            self.targets.len(),
            self.indexes.len()
        );
        Ok(())
    }

    /// Adds or replaces a target record. Returns false, changing nothing,
    /// if the name is taken and `replace` was not given.
    pub fn add_target(&mut self, name: &str, target: TargetService, replace: bool) -> bool {
        if !replace && self.targets.contains_key(name) {
            return false;
        }
        self.targets.insert(name.to_string(), target);
        self.dirty = true;
        true
    }

    pub fn add_index(&mut self, name: &str, index: IndexService, replace: bool) -> bool {
        if !replace && self.indexes.contains_key(name) {
            return false;
        }
        self.indexes.insert(name.to_string(), index);
        self.dirty = true;
        true
    }

    pub fn have_target(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn have_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    pub fn target(&self, name: &str) -> Result<&TargetService> {
        self.targets
            .get(name)
            .context(error::UnknownTargetSnafu { name })
    }

    pub fn index(&self, name: &str) -> Result<&IndexService> {
        self.indexes
            .get(name)
            .context(error::UnknownIndexSnafu { name })
    }

    /// Removes a target record. Missing names are fine; removal happens
    /// during teardown paths that must make progress regardless.
    pub fn remove_target(&mut self, name: &str) {
        if self.targets.remove(name).is_some() {
            self.dirty = true;
        }
    }

    pub fn remove_index(&mut self, name: &str) {
        if self.indexes.remove(name).is_some() {
            self.dirty = true;
        }
    }

    /// Target names in sorted order.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    /// Index service names in sorted order.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// True when some other target also deduplicates against this index.
    pub fn index_in_use(&self, index_name: &str, excluding_target: &str) -> bool {
        self.targets
            .iter()
            .any(|(name, target)| name != excluding_target && target.server == index_name)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.indexes.is_empty()
    }

    /// Writes the store back to disk if anything changed.
    ///
    /// The new contents go to a temporary file in the same directory which
    /// then replaces the original, so readers never see a partial file. In
    /// no-run mode the would-be contents are printed instead.
    pub fn persist(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        if !self.dirty {
            debug!("Configuration unchanged, not writing");
            return Ok(());
        }

        if self.is_empty() && self.delete_empty {
            if self.path.exists() && !self.cfg.no_run {
                fs::remove_file(&self.path)
                    .context(error::ConfigRemoveSnafu { path: &self.path })?;
                let _ = fs::remove_file(self.backup_path());
            }
            self.dirty = false;
            return Ok(());
        }

        let file = ConfigFile {
            version: self.version.clone(),
            targets: self.targets.clone(),
            indexes: self.indexes.clone(),
        };
        let contents = toml::to_string(&file).context(error::ConfigSerializeSnafu)?;

        if self.cfg.no_run {
            println!("New configuration (not written):");
            println!("{}", contents);
            self.dirty = false;
            return Ok(());
        }

        if self.path.exists() {
            let _ = fs::copy(&self.path, self.backup_path());
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)
            .context(error::ConfigTempfileSnafu { dir })?;
        temp.write_all(contents.as_bytes())
            .context(error::ConfigTempfileSnafu { dir })?;
        temp.persist(&self.path)
            .context(error::ConfigPersistSnafu { path: &self.path })?;
        debug!("Wrote configuration {}", self.path.display());
        self.dirty = false;
        Ok(())
    }

    /// Releases the process lock early; also happens on drop.
    pub fn unlock(&mut self) {
        self.lock.release();
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lvm::LogicalVolume;
    use crate::service::Service;

    const RUN: RunnerConfig = RunnerConfig {
        no_run: false,
        verbose: false,
    };
    const NO_RUN: RunnerConfig = RunnerConfig {
        no_run: true,
        verbose: false,
    };

    fn target(name: &str) -> TargetService {
        let lv: LogicalVolume = format!("/dev/dedupevg/{}-backing", name).parse().unwrap();
        let mut svc = TargetService::new(name, lv, false).unwrap();
        svc.restore(name);
        svc.server = "dedupe://localhost:8000".to_string();
        svc
    }

    fn index(name: &str) -> IndexService {
        IndexService::new(
            name,
            "/dev/dedupevg/vol1-index".parse().unwrap(),
            "/mnt/dedupe-index-vol1".to_string(),
            "localhost:8000".to_string(),
            "20G".parse().unwrap(),
        )
    }

    #[test]
    fn round_trips_services() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        {
            let mut config =
                Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
            assert!(config.add_target("vol1", target("vol1"), false));
            assert!(config.add_index("dedupe://localhost:8000", index("dedupe://localhost:8000"), false));
            config.persist().unwrap();
        }

        let config = Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
        assert_eq!(config.target("vol1").unwrap(), &target("vol1"));
        assert_eq!(
            config.index("dedupe://localhost:8000").unwrap().name(),
            "dedupe://localhost:8000"
        );
        assert_eq!(config.target_names(), ["vol1"]);
    }

    #[test]
    fn add_without_replace_keeps_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let mut config =
            Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
        assert!(config.add_target("vol1", target("vol1"), false));
        let mut changed = target("vol1");
        changed.enabled = false;
        assert!(!config.add_target("vol1", changed.clone(), false));
        assert!(config.target("vol1").unwrap().enabled);
        assert!(config.add_target("vol1", changed, true));
        assert!(!config.target("vol1").unwrap().enabled);
    }

    #[test]
    fn must_exist_refuses_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let options = OpenOptions {
            must_exist: true,
            ..OpenOptions::default()
        };
        let err = Configuration::open(&RUN, &conf, &lock, options).unwrap_err();
        assert!(matches!(err, crate::error::Error::ConfigMissing { .. }));
    }

    #[test]
    fn unsupported_version_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");
        fs::write(&conf, "version = \"9.9\"\n").unwrap();

        let err =
            Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::ConfigVersionUnsupported { .. }
        ));
    }

    #[test]
    fn clean_store_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let mut config =
            Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
        config.persist().unwrap();
        assert!(!conf.exists());
    }

    #[test]
    fn readonly_store_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let options = OpenOptions {
            readonly: true,
            ..OpenOptions::default()
        };
        let mut config = Configuration::open(&RUN, &conf, &lock, options).unwrap();
        config.add_target("vol1", target("vol1"), false);
        config.persist().unwrap();
        assert!(!conf.exists());
    }

    #[test]
    fn delete_empty_removes_the_file_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        {
            let mut config =
                Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
            config.add_target("vol1", target("vol1"), false);
            config.persist().unwrap();
        }
        {
            // The second write leaves a backup of the first behind.
            let mut config =
                Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
            config.add_target("vol2", target("vol2"), false);
            config.persist().unwrap();
        }
        assert!(conf.exists());

        let options = OpenOptions {
            delete_empty: true,
            ..OpenOptions::default()
        };
        let mut config = Configuration::open(&RUN, &conf, &lock, options).unwrap();
        config.remove_target("vol1");
        config.remove_target("vol2");
        config.persist().unwrap();
        assert!(!conf.exists());
        assert!(!conf.with_extension("conf.bak").exists());
    }

    #[test]
    fn no_run_mode_prints_instead_of_writing() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let mut config =
            Configuration::open(&NO_RUN, &conf, &lock, OpenOptions::default()).unwrap();
        config.add_target("vol1", target("vol1"), false);
        config.persist().unwrap();
        assert!(!conf.exists());
    }

    #[test]
    fn index_in_use_ignores_the_named_target() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let mut config =
            Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
        config.add_target("vol1", target("vol1"), false);
        config.add_target("vol2", target("vol2"), false);
        assert!(config.index_in_use("dedupe://localhost:8000", "vol1"));
        config.remove_target("vol2");
        assert!(!config.index_in_use("dedupe://localhost:8000", "vol1"));
    }

    #[test]
    fn concurrent_opens_serialize_on_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("dedupdog.conf");
        let lock = dir.path().join("dedupdog.lock");

        let mut config =
            Configuration::open(&RUN, &conf, &lock, OpenOptions::default()).unwrap();
        config.add_target("vol1", target("vol1"), false);

        let conf2 = conf.clone();
        let lock2 = lock.clone();
        let handle = std::thread::spawn(move || {
            let config =
                Configuration::open(&RUN, &conf2, &lock2, OpenOptions::default()).unwrap();
            config.have_target("vol1")
        });
        std::thread::sleep(std::time::Duration::from_millis(1500));
        config.persist().unwrap();
        config.unlock();
        // The second opener waited for the lock, so it sees the write.
        assert!(handle.join().unwrap());
    }
}

//! Manages the kernel module providing the deduplicating target type.

use crate::command::{Command, RunnerConfig};
use crate::defaults;
use crate::service::{Outcome, Service, StartOptions};
use crate::{DM_TARGET_TYPE, KERNEL_MODULE};

pub struct KernelModuleService {
    name: String,
}

impl KernelModuleService {
    pub fn new() -> Self {
        Self {
            name: KERNEL_MODULE.to_string(),
        }
    }

    /// The module is considered running only when it is loaded *and* its
    /// device-mapper target type is registered; the second can lag the
    /// first, so `wait` polls both conditions.
    pub fn running_check(&self, cfg: &RunnerConfig, wait: bool) -> bool {
        let mut lsmod =
            Command::new(cfg, &[format!("lsmod | grep -q '{}'", self.name)]).shell();
        let mut targets = Command::new(
            cfg,
            &[format!("dmsetup targets | grep -q {}", DM_TARGET_TYPE)],
        )
        .shell();
        if wait {
            lsmod.wait_for(defaults::WAIT_FOR_RETRIES).is_ok()
                && targets.wait_for(defaults::WAIT_FOR_RETRIES).is_ok()
        } else {
            lsmod.run().is_ok() && targets.run().is_ok()
        }
    }

    /// The module version line from modinfo.
    pub fn version(&self, cfg: &RunnerConfig) -> String {
        let modinfo = Command::new(cfg, &["modinfo", &self.name]).output_or_empty();
        let version = modinfo
            .lines()
            .find(|line| line.starts_with("version"))
            .unwrap_or("");
        format!("{} {}", self.name, version)
    }
}

impl Default for KernelModuleService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for KernelModuleService {
    fn name(&self) -> &str {
        &self.name
    }

    // The module is installed with the package; there is nothing to
    // provision or tear down.
    fn create(&mut self, _cfg: &RunnerConfig) -> Outcome {
        Outcome::Success
    }

    fn remove(&mut self, _cfg: &RunnerConfig) -> Outcome {
        Outcome::Success
    }

    fn exists(&self, cfg: &RunnerConfig) -> bool {
        self.running_check(cfg, false)
    }

    /// Loads the module if necessary.
    fn start(&mut self, cfg: &RunnerConfig, _opts: &StartOptions<'_>) -> Outcome {
        match Command::new(cfg, &["modprobe", &self.name]).run() {
            Ok(()) => Outcome::Success,
            Err(_) => Outcome::Error,
        }
    }

    /// Unloads the module.
    fn stop(&mut self, cfg: &RunnerConfig, _force: bool) -> Outcome {
        match Command::new(cfg, &["modprobe", "-r", &self.name]).run() {
            Ok(()) => Outcome::Success,
            Err(_) => Outcome::Error,
        }
    }

    fn running(&self, cfg: &RunnerConfig) -> bool {
        self.running_check(cfg, false)
    }

    fn status(&self, cfg: &RunnerConfig, prefix: &str) {
        println!("{}Kernel module:", prefix);
        println!("{}  Name: {}", prefix, self.name);
        println!("{}  Loaded: {}", prefix, self.running_check(cfg, false));
        println!("{}  Version information:", prefix);
        println!("{}    {}", prefix, self.version(cfg));
    }

    fn keys() -> &'static [&'static str] {
        &[]
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

    #[test]
    fn start_and_stop_in_no_run_mode() {
        let extensions = Extensions::new();
        let opts = StartOptions::new(&extensions);
        let mut kms = KernelModuleService::new();
        assert_eq!(kms.start(&NO_RUN, &opts), Outcome::Success);
        assert_eq!(kms.stop(&NO_RUN, false), Outcome::Success);
        // All commands succeed in no-run mode, so both conditions hold.
        assert!(kms.running(&NO_RUN));
    }

    #[test]
    fn module_name_is_fixed() {
        assert_eq!(KernelModuleService::new().name(), KERNEL_MODULE);
        assert!(KernelModuleService::keys().is_empty());
    }
}

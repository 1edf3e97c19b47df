//! The uniform lifecycle contract shared by every managed service.
//!
//! Create/remove are one-time operations paired with a durable record in
//! the configuration store; start/stop/running control availability and are
//! idempotent, returning LSB-style codes usable from init scripts.

pub mod index;
pub mod kmod;
pub mod target;

pub use index::IndexService;
pub use kmod::KernelModuleService;
pub use target::TargetService;

use crate::command::{Command, RunnerConfig};
use crate::extensions::Extensions;
use std::fs;

/// Result of an idempotent lifecycle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The operation did its work.
    Success,
    /// The operation had nothing to do.
    Already,
    /// Something went wrong; the system may still have been changed.
    Error,
}

impl Outcome {
    /// LSB init-script exit code.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Already => 1,
            Outcome::Error => 2,
        }
    }

    /// Combines outcomes of multi-service operations; the more severe code
    /// wins.
    pub fn worst(self, other: Outcome) -> Outcome {
        if other.exit_code() > self.exit_code() {
            other
        } else {
            self
        }
    }
}

/// Options for `Service::start`; each variant reads the fields that apply
/// to it and ignores the rest.
pub struct StartOptions<'a> {
    /// `host:port` of the index service a target should connect to.
    pub network_spec: Option<&'a str>,
    /// Rebuild target statistics before starting.
    pub rebuild_statistics: bool,
    /// Force a metadata rebuild of a read-only target before starting.
    pub force_rebuild: bool,
    /// Command the index server should run once it is ready; when absent,
    /// readiness is verified by polling instead.
    pub ready_command: Option<&'a str>,
    pub extensions: &'a Extensions,
}

impl<'a> StartOptions<'a> {
    pub fn new(extensions: &'a Extensions) -> Self {
        Self {
            network_spec: None,
            rebuild_statistics: false,
            force_rebuild: false,
            ready_command: None,
            extensions,
        }
    }
}

/// Common lifecycle interface implemented by every service variant.
pub trait Service {
    fn name(&self) -> &str;

    /// One-time provisioning, paired with `remove`. Calling this on a
    /// service that already exists is a caller error.
    fn create(&mut self, cfg: &RunnerConfig) -> Outcome;

    /// Tears down the service's resources. The caller deletes the
    /// configuration entry afterwards regardless of the outcome.
    fn remove(&mut self, cfg: &RunnerConfig) -> Outcome;

    fn exists(&self, cfg: &RunnerConfig) -> bool;

    fn start(&mut self, cfg: &RunnerConfig, opts: &StartOptions<'_>) -> Outcome;

    fn stop(&mut self, cfg: &RunnerConfig, force: bool) -> Outcome;

    fn running(&self, cfg: &RunnerConfig) -> bool;

    /// Prints the status of this service to stdout, each line prefixed.
    fn status(&self, cfg: &RunnerConfig, prefix: &str);

    /// Names of the attributes persisted in the configuration file.
    fn keys() -> &'static [&'static str]
    where
        Self: Sized;
}

/// True if a filesystem is mounted at exactly this path. Checked directly
/// rather than through a command so no-run mode still sees real state.
pub(crate) fn mounted_at(path: &str) -> bool {
    let mounts = match fs::read_to_string("/proc/self/mounts") {
        Ok(mounts) => mounts,
        Err(_) => return false,
    };
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| target == path)
}

/// Prints `tag` followed by a command's output, or "not available" when the
/// command fails or prints nothing.
pub(crate) fn print_command_status(cfg: &RunnerConfig, argv: &[&str], tag: &str) {
    let out = Command::new(cfg, argv).output_or_empty();
    let out = out.trim();
    if out.is_empty() {
        println!("{}not available", tag);
    } else {
        println!("{}{}", tag, out.replace('"', ""));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_lsb() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::Already.exit_code(), 1);
        assert_eq!(Outcome::Error.exit_code(), 2);
    }

    #[test]
    fn worst_prefers_severity() {
        assert_eq!(Outcome::Success.worst(Outcome::Already), Outcome::Already);
        assert_eq!(Outcome::Already.worst(Outcome::Success), Outcome::Already);
        assert_eq!(Outcome::Error.worst(Outcome::Success), Outcome::Error);
        assert_eq!(Outcome::Success.worst(Outcome::Success), Outcome::Success);
    }

    #[test]
    fn root_is_mounted() {
        assert!(mounted_at("/"));
        assert!(!mounted_at("/no/such/mount/point"));
    }
}

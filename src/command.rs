//! Runs external tools and manages their results.
//!
//! Every invocation is logged at info level before it runs and its outcome
//! at debug level after. When `RunnerConfig::no_run` is set, commands are
//! logged but never executed and always succeed; `mock` lets a caller
//! synthesize output in that mode so a dependent conditional path can still
//! be previewed.

use crate::error::{self, Result};
use log::{debug, info, trace};
use std::os::unix::process::ExitStatusExt;
use std::process::{self, ExitStatus};
use std::thread::sleep;
use std::time::Duration;

/// Shared runner settings, passed by reference to every `Command`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunnerConfig {
    /// Log commands without executing them; every run succeeds.
    pub no_run: bool,
    /// Print each command line to stdout before executing it.
    pub verbose: bool,
}

/// A single external command invocation and its captured result.
pub struct Command<'a> {
    cfg: &'a RunnerConfig,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    shell: bool,
    sudo: bool,
    remote_host: Option<String>,
    remote_options: Vec<String>,

    /// Exit code from the last run; `None` before the first run or when the
    /// process was killed by a signal or could not be spawned.
    pub exit_code: Option<i32>,
    /// Status summary from the last run, a la the shell.
    pub exit_status: String,
    pub stdout: String,
    pub stderr: String,
}

impl<'a> Command<'a> {
    pub fn new<S: AsRef<str>>(cfg: &'a RunnerConfig, argv: &[S]) -> Self {
        Self {
            cfg,
            argv: argv.iter().map(|s| s.as_ref().to_string()).collect(),
            env: Vec::new(),
            shell: false,
            sudo: false,
            remote_host: None,
            remote_options: Vec::new(),
            exit_code: None,
            exit_status: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Run the command line through `sh -c` instead of spawning it directly.
    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    /// Prefix the command with `sudo` unless already running as root.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Run the command on a remote host through ssh.
    pub fn remote<S: AsRef<str>>(mut self, host: S, options: &[S]) -> Self {
        self.remote_host = Some(host.as_ref().to_string());
        self.remote_options = options.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn env<S: AsRef<str>>(mut self, var: S, value: S) -> Self {
        self.env
            .push((var.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn arg<S: AsRef<str>>(&mut self, arg: S) {
        self.argv.push(arg.as_ref().to_string());
    }

    /// An identifier (argv[0]) for error messages.
    pub fn name(&self) -> &str {
        &self.argv[0]
    }

    /// The argument vector decorated with the sudo and ssh prefixes.
    pub fn real_argv(&self) -> Vec<String> {
        let mut argv = self.argv.clone();
        if self.sudo && unsafe { libc::geteuid() } != 0 {
            argv.insert(0, "sudo".to_string());
        }
        if let Some(host) = &self.remote_host {
            let mut ssh = vec!["ssh".to_string(), host.clone()];
            ssh.extend(self.remote_options.iter().cloned());
            ssh.extend(argv);
            argv = ssh;
        }
        argv
    }

    /// Runs this command, capturing its output. Fails with `CommandFailed`
    /// on a nonzero exit, carrying the first line of stderr if there was
    /// one and the exit-status text otherwise.
    pub fn run(&mut self) -> Result<()> {
        let argv = self.real_argv();
        let line = argv.join(" ");

        if self.cfg.verbose {
            println!("    {}", line);
        }
        info!("{}", line);
        if self.cfg.no_run {
            return Ok(());
        }

        let mut cmd = if self.shell {
            let mut cmd = process::Command::new("sh");
            cmd.arg("-c").arg(&line);
            cmd
        } else {
            let mut cmd = process::Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        };
        for (var, value) in &self.env {
            cmd.env(var, value);
        }

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                // Spawn failure still produces a consistent status.
                self.exit_code = None;
                self.stdout.clear();
                self.stderr = format!("{}: {}", self.name(), e);
                self.exit_status = format!("{}: command failed: {}", self.name(), e);
                debug!("exit status: {}", self.exit_status);
                return error::CommandFailedSnafu {
                    message: self.exit_status.clone(),
                }
                .fail();
            }
        };

        self.stdout = String::from_utf8_lossy(&output.stdout).to_string();
        self.stderr = String::from_utf8_lossy(&output.stderr).to_string();
        self.exit_code = output.status.code();
        self.exit_status = self.describe_status(&output.status);
        debug!("exit status: {}", self.exit_status);
        trace!("stdout: {}", self.stdout.trim_end());
        trace!("stderr: {}", self.stderr.trim_end());

        if output.status.success() {
            return Ok(());
        }
        let message = match self.stderr.lines().next() {
            Some(first) if !first.trim().is_empty() => first.to_string(),
            _ => self.exit_status.clone(),
        };
        error::CommandFailedSnafu { message }.fail()
    }

    fn describe_status(&self, status: &ExitStatus) -> String {
        if let Some(signal) = status.signal() {
            format!("{}: command failed, signal {}", self.name(), signal)
        } else {
            match status.code() {
                Some(0) => format!("{}: command succeeded", self.name()),
                Some(code) => {
                    format!("{}: command failed, exit status {}", self.name(), code)
                }
                None => format!("{}: command failed", self.name()),
            }
        }
    }

    /// Artificially sets the result values of this command. Used to make
    /// no-run mode do something other than succeed with no output.
    pub fn mock<S: AsRef<str>>(&mut self, exit_code: i32, stdout: S, stderr: S) {
        self.exit_code = Some(exit_code);
        self.exit_status = if exit_code < 0 {
            format!("{}: command failed, signal {}", self.name(), -exit_code)
        } else if exit_code == 0 {
            format!("{}: command succeeded", self.name())
        } else {
            format!("{}: command failed, exit status {}", self.name(), exit_code)
        };
        self.stdout = stdout.as_ref().to_string();
        self.stderr = stderr.as_ref().to_string();
    }

    /// Runs this command and returns its standard output, or an empty
    /// string on any failure. For purely informational queries, like
    /// `command ...` in the shell.
    pub fn output_or_empty(&mut self) -> String {
        match self.run() {
            Ok(()) => self.stdout.clone(),
            Err(_) => String::new(),
        }
    }

    /// Runs this command repeatedly at one-second intervals until it
    /// succeeds or the retry budget is exhausted.
    pub fn wait_for(&mut self, retries: u32) -> Result<()> {
        debug!("Waiting for '{}'", self.real_argv().join(" "));
        if self.cfg.no_run {
            return Ok(());
        }
        for count in 0..retries {
            debug!("  ... {}/{}", count, retries);
            if self.run().is_ok() {
                return Ok(());
            }
            sleep(Duration::from_secs(1));
        }
        error::CommandTimeoutSnafu {
            command: self.name().to_string(),
            seconds: retries,
        }
        .fail()
    }

    /// Runs this command, swallowing failures. For cleanup paths.
    pub fn ignore_failure(&mut self) {
        if let Err(e) = self.run() {
            debug!("{}: swallowed error: {}", self.name(), e);
        }
    }
}

/// Kills a process with an escalating signal strategy: a graceful kill, an
/// alive-poll at one-second intervals, then `kill -9` as a last resort.
pub fn kill_process(cfg: &RunnerConfig, pid: u32, retries: u32) {
    let pid = pid.to_string();
    if Command::new(cfg, &["kill", &pid]).run().is_err() {
        return;
    }
    if cfg.no_run {
        return;
    }
    for _ in 0..retries {
        if Command::new(cfg, &["kill", "-0", &pid]).run().is_err() {
            return;
        }
        sleep(Duration::from_secs(1));
    }
    Command::new(cfg, &["kill", "-9", &pid]).ignore_failure();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Instant;

    const RUN: RunnerConfig = RunnerConfig {
        no_run: false,
        verbose: false,
    };
    const NO_RUN: RunnerConfig = RunnerConfig {
        no_run: true,
        verbose: false,
    };

    #[test]
    fn run_success() {
        let mut cmd = Command::new(&RUN, &["true"]);
        cmd.run().unwrap();
        assert_eq!(cmd.exit_code, Some(0));
        assert_eq!(cmd.exit_status, "true: command succeeded");
    }

    #[test]
    fn run_failure_uses_exit_status() {
        let mut cmd = Command::new(&RUN, &["false"]);
        let err = cmd.run().unwrap_err();
        assert_eq!(cmd.exit_code, Some(1));
        assert_eq!(err.to_string(), "false: command failed, exit status 1");
    }

    #[test]
    fn run_failure_surfaces_first_stderr_line() {
        let mut cmd = Command::new(&RUN, &["echo boom >&2; echo more >&2; exit 3"]).shell();
        let err = cmd.run().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn spawn_failure_synthesizes_status() {
        let mut cmd = Command::new(&RUN, &["/no/such/binary/exists"]);
        cmd.run().unwrap_err();
        assert!(cmd
            .exit_status
            .starts_with("/no/such/binary/exists: command failed:"));
    }

    #[test]
    fn output_or_empty() {
        let mut cmd = Command::new(&RUN, &["echo", "hello"]);
        assert_eq!(cmd.output_or_empty(), "hello\n");
        let mut cmd = Command::new(&RUN, &["false"]);
        assert_eq!(cmd.output_or_empty(), "");
    }

    #[test]
    fn no_run_always_succeeds() {
        let mut cmd = Command::new(&NO_RUN, &["false"]);
        cmd.run().unwrap();
        cmd.wait_for(3).unwrap();
    }

    #[test]
    fn mock_fills_in_results() {
        let mut cmd = Command::new(&NO_RUN, &["lvs"]);
        cmd.run().unwrap();
        cmd.mock(0, "20971520.00\n", "");
        assert_eq!(cmd.stdout, "20971520.00\n");
        assert_eq!(cmd.exit_status, "lvs: command succeeded");
        cmd.mock(2, "", "oops");
        assert_eq!(cmd.exit_status, "lvs: command failed, exit status 2");
    }

    #[test]
    fn wait_for_retries_then_times_out() {
        let mut cmd = Command::new(&RUN, &["false"]);
        let start = Instant::now();
        let err = cmd.wait_for(3).unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(
            err,
            Error::CommandTimeout { seconds: 3, .. }
        ));
        assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10), "elapsed {:?}", elapsed);
    }

    #[test]
    fn remote_decoration() {
        let cmd = Command::new(&RUN, &["lvs", "vg/lv"]).remote("storage1", &["-q"]);
        assert_eq!(cmd.real_argv(), ["ssh", "storage1", "-q", "lvs", "vg/lv"]);
    }
}

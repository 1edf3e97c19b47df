//! Extension points for separately shipped features.
//!
//! Extensions are registered explicitly at startup from a fixed table and
//! threaded down to the call sites; there is no runtime discovery. The only
//! extension point today is the compression enable/disable hook invoked
//! when a target starts.

use crate::command::RunnerConfig;
use crate::error::Result;

pub trait Extension {
    fn name(&self) -> &'static str;

    /// Invoked at an extension point: `protocol` names the point (for
    /// example "compression") and `op` the requested operation ("on",
    /// "off").
    fn invoke(&self, cfg: &RunnerConfig, service: &str, protocol: &str, op: &str) -> Result<()>;
}

/// The set of registered extensions, in registration order.
#[derive(Default)]
pub struct Extensions {
    registered: Vec<Box<dyn Extension>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Box<dyn Extension>) {
        self.registered.push(extension);
    }

    /// Drops extensions named in a comma-separated list, or all of them
    /// for the special value "all". Unknown names are silently ignored.
    pub fn disable(&mut self, names: &str) {
        if names == "all" {
            self.registered.clear();
            return;
        }
        let disabled: Vec<&str> = names.split(',').collect();
        self.registered.retain(|e| !disabled.contains(&e.name()));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.registered.iter().map(|e| e.name()).collect()
    }

    /// Calls every registered extension at the given point, stopping at
    /// the first failure.
    pub fn invoke(
        &self,
        cfg: &RunnerConfig,
        service: &str,
        protocol: &str,
        op: &str,
    ) -> Result<()> {
        for extension in &self.registered {
            extension.invoke(cfg, service, protocol, op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Recorder {
        calls: Rc<Cell<u32>>,
        fail: bool,
    }

    impl Extension for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn invoke(&self, _: &RunnerConfig, _: &str, _: &str, _: &str) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return error::CommandFailedSnafu {
                    message: "extension failed".to_string(),
                }
                .fail();
            }
            Ok(())
        }
    }

    #[test]
    fn invokes_registered_extensions() {
        let calls = Rc::new(Cell::new(0));
        let mut extensions = Extensions::new();
        extensions.register(Box::new(Recorder {
            calls: calls.clone(),
            fail: false,
        }));

        let cfg = RunnerConfig::default();
        extensions
            .invoke(&cfg, "vol1", "compression", "on")
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let cfg = RunnerConfig::default();
        Extensions::new()
            .invoke(&cfg, "vol1", "compression", "on")
            .unwrap();
    }

    #[test]
    fn first_failure_stops_the_chain() {
        let calls = Rc::new(Cell::new(0));
        let mut extensions = Extensions::new();
        extensions.register(Box::new(Recorder {
            calls: calls.clone(),
            fail: true,
        }));
        extensions.register(Box::new(Recorder {
            calls: calls.clone(),
            fail: false,
        }));

        let cfg = RunnerConfig::default();
        extensions
            .invoke(&cfg, "vol1", "compression", "on")
            .unwrap_err();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn disable_by_name_and_all() {
        let calls = Rc::new(Cell::new(0));
        let mut extensions = Extensions::new();
        extensions.register(Box::new(Recorder {
            calls,
            fail: false,
        }));
        assert_eq!(extensions.names(), ["recorder"]);

        extensions.disable("other,recorder");
        assert!(extensions.names().is_empty());

        let mut extensions = Extensions::new();
        extensions.register(Box::new(Recorder {
            calls: Rc::new(Cell::new(0)),
            fail: false,
        }));
        extensions.disable("all");
        assert!(extensions.names().is_empty());
    }
}

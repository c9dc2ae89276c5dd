// Driver configuration
//
// Loads jdwp-driver.toml; a missing file means defaults.

use crate::driver::DriverOptions;
use crate::eventrequest::{RequestKind, RequestTarget};
use crate::process::LaunchSpec;
use crate::protocol::{CoordError, CoordResult};
use crate::types::SuspendPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// One checkpoint the driver expects the controlled process to reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,

    /// Binary class name, e.g. "demo.Target"
    pub class: String,

    pub method: String,

    /// Breakpoint on this line when set, method entry otherwise
    #[serde(default)]
    pub line: Option<u32>,

    #[serde(default)]
    pub suspend_policy: SuspendPolicy,

    #[serde(default = "default_expected_hits")]
    pub expected_hits: u32,

    /// Pop the trapped frame and verify the stack afterwards
    #[serde(default)]
    pub pop: bool,
}

fn default_expected_hits() -> u32 {
    1
}

impl TestCase {
    pub fn new(
        name: impl Into<String>,
        class: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            method: method.into(),
            line: None,
            suspend_policy: SuspendPolicy::default(),
            expected_hits: default_expected_hits(),
            pop: false,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn policy(mut self, policy: SuspendPolicy) -> Self {
        self.suspend_policy = policy;
        self
    }

    pub fn hits(mut self, expected: u32) -> Self {
        self.expected_hits = expected;
        self
    }

    pub fn popping(mut self) -> Self {
        self.pop = true;
        self
    }

    pub fn kind(&self) -> RequestKind {
        if self.line.is_some() {
            RequestKind::Breakpoint
        } else {
            RequestKind::MethodEntry
        }
    }

    pub fn target(&self) -> RequestTarget {
        match self.line {
            Some(line) => RequestTarget::line(self.class.clone(), line),
            None => RequestTarget::method(self.class.clone(), self.method.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DriverConfig {
    /// JDWP listener of the controlled JVM.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Budget for every blocking wait, in minutes.
    #[serde(default = "default_wait_minutes")]
    pub wait_minutes: u64,

    /// Exit status on success; failure adds 2.
    #[serde(default = "default_base_status")]
    pub base_status: i32,

    /// The JVM was started with suspend=y and reports VM_START first.
    #[serde(default = "default_vm_start_suspended")]
    pub vm_start_suspended: bool,

    /// Command line of the controlled process.
    #[serde(default)]
    pub launch: Option<LaunchSpec>,

    #[serde(default, rename = "case")]
    pub cases: Vec<TestCase>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5005
}

fn default_wait_minutes() -> u64 {
    2
}

fn default_base_status() -> i32 {
    95
}

fn default_vm_start_suspended() -> bool {
    true
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            wait_minutes: default_wait_minutes(),
            base_status: default_base_status(),
            vm_start_suspended: default_vm_start_suspended(),
            launch: None,
            cases: Vec::new(),
        }
    }
}

impl DriverConfig {
    /// Missing file means defaults; an unreadable or malformed one is an error
    pub fn load(path: &Path) -> CoordResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => toml::from_str::<DriverConfig>(&s).map_err(|err| {
                CoordError::Config(format!("failed to parse {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(CoordError::Config(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.wait_minutes * 60)
    }

    pub fn options(&self) -> DriverOptions {
        DriverOptions {
            budget: self.budget(),
            base_status: self.base_status,
            vm_start_suspended: self.vm_start_suspended,
        }
    }

    pub fn validate(&self) -> CoordResult<()> {
        if self.cases.is_empty() {
            return Err(CoordError::Config("no test cases configured".to_string()));
        }
        if self.wait_minutes == 0 {
            return Err(CoordError::Config("wait_minutes must be at least 1".to_string()));
        }
        for case in &self.cases {
            if case.class.is_empty() || case.method.is_empty() {
                return Err(CoordError::Config(format!(
                    "case {} needs a class and a method",
                    case.name
                )));
            }
            if case.expected_hits == 0 {
                return Err(CoordError::Config(format!("case {} expects no hits", case.name)));
            }
            // a pop needs the trapped thread still stopped
            if case.pop && case.suspend_policy == SuspendPolicy::None {
                return Err(CoordError::Config(format!(
                    "case {} pops a frame but suspends nothing",
                    case.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DriverConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.port, 5005);
        assert_eq!(cfg.base_status, 95);
        assert_eq!(cfg.budget(), Duration::from_secs(120));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cases_parse_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
port = 8000
wait_minutes = 1

[launch]
program = "java"
args = ["-cp", "out", "demo.Target"]

[[case]]
name = "entry"
class = "demo.Target"
method = "compute"
pop = true

[[case]]
name = "line"
class = "demo.Target"
method = "run"
line = 12
suspend_policy = "all"
expected_hits = 2
"#
        )
        .unwrap();

        let cfg = DriverConfig::load(file.path()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.launch.as_ref().map(|l| l.args.len()), Some(3));
        assert_eq!(cfg.cases.len(), 2);

        let entry = &cfg.cases[0];
        assert_eq!(entry.kind(), RequestKind::MethodEntry);
        assert_eq!(entry.suspend_policy, SuspendPolicy::EventThread);
        assert_eq!(entry.expected_hits, 1);
        assert!(entry.pop);

        let line = &cfg.cases[1];
        assert_eq!(line.kind(), RequestKind::Breakpoint);
        assert_eq!(line.target(), RequestTarget::line("demo.Target", 12));
        assert_eq!(line.suspend_policy, SuspendPolicy::All);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = \"not a number\"").unwrap();
        assert!(matches!(DriverConfig::load(file.path()), Err(CoordError::Config(_))));
    }

    #[test]
    fn test_zero_hits_rejected() {
        let cfg = DriverConfig {
            cases: vec![TestCase::new("never", "demo.Target", "run").hits(0)],
            ..DriverConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CoordError::Config(_))));
    }

    #[test]
    fn test_pop_without_suspension_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[case]]
name = "pop-free"
class = "demo.Target"
method = "compute"
pop = true
suspend_policy = "none"
"#
        )
        .unwrap();

        let cfg = DriverConfig::load(file.path()).unwrap();
        assert!(cfg.cases[0].pop);
        assert!(matches!(cfg.validate(), Err(CoordError::Config(msg)) if msg.contains("pop-free")));

        let stopping = DriverConfig {
            cases: vec![TestCase::new("pop", "demo.Target", "compute")
                .policy(SuspendPolicy::EventThread)
                .popping()],
            ..DriverConfig::default()
        };
        assert!(stopping.validate().is_ok());
    }
}

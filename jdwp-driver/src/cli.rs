// Command line and its merge onto jdwp-driver.toml

use anyhow::{bail, Result};
use clap::Parser;
use jdwp_coord::process::LaunchSpec;
use jdwp_coord::{DriverConfig, SuspendPolicy, TestCase};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "jdwp-driver",
    version,
    about = "Drive breakpoint and frame-pop test cases against a controlled JVM"
)]
pub struct Args {
    /// Config file; missing means defaults
    #[arg(short, long, default_value = "jdwp-driver.toml")]
    pub config: PathBuf,

    /// Class of a single case given on the command line
    #[arg(long)]
    pub target: Option<String>,

    #[arg(long, requires = "target")]
    pub method: Option<String>,

    /// Trap this line instead of the method entry
    #[arg(long, requires = "target")]
    pub line: Option<u32>,

    /// Pop the trapped frame and verify the caller
    #[arg(long, requires = "target")]
    pub pop: bool,

    #[arg(long, requires = "target")]
    pub hits: Option<u32>,

    /// Stop every thread on a hit, not just the one that hit
    #[arg(long, requires = "target")]
    pub suspend_all: bool,

    /// Budget for each blocking wait, in minutes
    #[arg(long)]
    pub wait: Option<u64>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// Run against the built-in simulated VM instead of launching a JVM
    #[arg(long)]
    pub simulate: bool,

    /// Print the session report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Log filter, e.g. "jdwp_coord=debug"
    #[arg(long)]
    pub log: Option<String>,

    /// Controlled process command line
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl Args {
    pub fn load_config(&self) -> Result<DriverConfig> {
        let mut config = DriverConfig::load(&self.config)?;

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(wait) = self.wait {
            config.wait_minutes = wait;
        }
        if let Some(launch) = LaunchSpec::from_argv(&self.command) {
            config.launch = Some(launch);
        }

        // a case on the command line replaces the configured ones
        if let Some(class) = &self.target {
            let method = self.method.clone().unwrap_or_else(|| "main".to_string());
            let mut case = TestCase::new(format!("{}.{}", class, method), class.clone(), method);
            if let Some(line) = self.line {
                case = case.at_line(line);
            }
            if let Some(hits) = self.hits {
                case = case.hits(hits);
            }
            if self.suspend_all {
                case = case.policy(SuspendPolicy::All);
            }
            if self.pop {
                case = case.popping();
            }
            config.cases = vec![case];
        }

        if self.simulate {
            // the simulated VM always reports VM_START
            config.vm_start_suspended = true;
        } else if config.launch.is_none() {
            bail!("nothing to launch: pass the command after -- or set [launch] in the config");
        }

        config.validate()?;
        Ok(config)
    }
}

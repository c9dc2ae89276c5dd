// Controlled-process bootstrap
//
// Launching is the constructor of the implementing type; the session only
// needs to wait for exit or kill.

use crate::protocol::{CoordError, CoordResult};
use crate::rendezvous::Rendezvous;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

#[allow(async_fn_in_trait)]
pub trait Debuggee {
    /// Wait for the process to finish and return its exit code
    async fn wait_for_exit(&mut self) -> CoordResult<i32>;

    async fn kill(&mut self) -> CoordResult<()>;
}

/// Command line of the controlled process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// First element is the program, the rest are its arguments
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

pub type ChildRendezvous = Rendezvous<BufReader<ChildStdout>, ChildStdin>;

/// Operating-system child process; its stdio carries the rendezvous tokens
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn launch(spec: &LaunchSpec) -> CoordResult<(Self, ChildRendezvous)> {
        info!("Launching {} {}", spec.program, spec.args.join(" "));

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoordError::Protocol("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordError::Protocol("child stdout not captured".to_string()))?;

        Ok((Self { child }, Rendezvous::new(BufReader::new(stdout), stdin)))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Debuggee for ChildProcess {
    async fn wait_for_exit(&mut self) -> CoordResult<i32> {
        let status = self.child.wait().await?;
        info!("Controlled process exited: {}", status);
        // killed by a signal: no code
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> CoordResult<()> {
        warn!("Killing controlled process {:?}", self.child.id());
        self.child.kill().await?;
        Ok(())
    }
}

// jdwp-driver - runs coordination test cases against a controlled JVM
//
// Launches the controlled process, attaches over JDWP, drives the configured
// cases and exits with the base status on success, base + 2 on failure.
// Logs go to stderr; stdout only carries the --json report.

use anyhow::{Context, Result};
use clap::Parser;
use jdwp_coord::{
    ChildProcess, DriverConfig, JdwpConnection, Program, Session, SessionDriver, SessionReport, SimLaunch, SimVm,
};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Args;

const DEFAULT_LOG: &str = "jdwp_driver=info,jdwp_coord=info";

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return exit_code(DriverConfig::default().base_status + 2);
        }
    };
    let failed = config.base_status + 2;

    match run(&args, config).await {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("{:#}", e);
            exit_code(failed)
        }
    }
}

async fn run(args: &Args, config: DriverConfig) -> Result<i32> {
    let options = config.options();
    let cases = config.cases.clone();

    let report = if args.simulate {
        let program = Program::demo(&cases[0].class, &cases[0].method);
        let SimLaunch {
            vm,
            process,
            rendezvous,
        } = SimVm::launch(program);
        let session = Session::attach(vm)?;
        SessionDriver::new(session, process, rendezvous, cases, options).run().await
    } else {
        let launch = config.launch.as_ref().context("no launch command")?;
        let (process, rendezvous) = ChildProcess::launch(launch)
            .with_context(|| format!("failed to launch {}", launch.program))?;
        let connection = JdwpConnection::connect_with_retry(&config.host, config.port, options.budget)
            .await
            .with_context(|| format!("failed to attach to {}:{}", config.host, config.port))?;
        let session = Session::attach(connection)?;
        SessionDriver::new(session, process, rendezvous, cases, options).run().await
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        summarize(&report);
    }
    Ok(report.exit_status(config.base_status))
}

fn summarize(report: &SessionReport) {
    for case in &report.cases {
        let verdict = if case.passed() { "ok" } else { "FAILED" };
        info!(
            "{}: {} ({} hit(s), {} pop(s))",
            case.name, verdict, case.hits, case.pops
        );
        for failure in &case.failures {
            info!("  {}", failure);
        }
    }
    for e in &report.errors {
        error!("{}", e);
    }
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from(u8::try_from(status).unwrap_or(u8::MAX))
}

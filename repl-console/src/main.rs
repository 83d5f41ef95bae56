// Interactive console over the remote execution bridge
//
// Spawns the evaluation VM, pumps its forwarded output, and drives a
// snippet session from stdin. Ctrl-C interrupts the running snippet
// rather than the console.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use exec_client::{LaunchConfig, PipeReader};

mod console;
mod session;
mod wrap;

use session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries the remote program's output
    // and console results.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("repl_console=info".parse().unwrap())
                .add_directive("exec_client=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match parse_args(std::env::args().skip(1))? {
        Some(config) => config,
        None => return Ok(()), // --help
    };

    info!("launching remote evaluation VM");
    let bridge = Arc::new(exec_client::launch(&config).await.context("launch failed")?);
    info!(
        vm = %bridge.target_spec().vm_name,
        version = %bridge.target_spec().vm_version,
        "connected"
    );

    spawn_output_pump(bridge.stdout_reader(), OutputSink::Stdout);
    spawn_output_pump(bridge.stderr_reader(), OutputSink::Stderr);

    // Ctrl-C targets the in-flight snippet, not the console process.
    let interrupt_target = Arc::clone(&bridge);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt requested");
            interrupt_target.stop().await;
        }
    });

    let session = Session::new(Arc::clone(&bridge));
    let outcome = console::run(session, bridge.terminated()).await;

    bridge.close().await;
    outcome
}

const USAGE: &str = "\
usage: repl-console [options]
  --java <path>         java executable (default: java)
  --cp <entry>          classpath entry, repeatable; must include the agent
  --agent-class <name>  remote agent class (default: replbridge.RemoteAgent)
  -J<option>            extra VM option, repeatable
  --timeout <seconds>   connect-back timeout (default: 30)
  --help                print this help";

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<LaunchConfig>> {
    let mut config = LaunchConfig::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--java" => {
                let value = args.next().context("--java needs a path")?;
                config = config.java_command(value);
            }
            "--cp" => {
                let value = args.next().context("--cp needs an entry")?;
                config = config.classpath_entry(value);
            }
            "--agent-class" => {
                let value = args.next().context("--agent-class needs a class name")?;
                config = config.agent_class(value);
            }
            "--timeout" => {
                let value = args.next().context("--timeout needs seconds")?;
                let seconds: u64 = value.parse().context("--timeout needs a number")?;
                config = config.accept_timeout(Duration::from_secs(seconds));
            }
            option if option.starts_with("-J") => {
                let vm_option = &option[2..];
                if vm_option.is_empty() {
                    bail!("-J needs a VM option, e.g. -J-Xmx512m");
                }
                config = config.vm_option(vm_option);
            }
            other => bail!("unknown argument {other}\n{USAGE}"),
        }
    }

    Ok(Some(config))
}

enum OutputSink {
    Stdout,
    Stderr,
}

/// Blocking pump on its own thread: pipe reads park until the remote side
/// produces output or the stream closes.
fn spawn_output_pump(mut reader: PipeReader, sink: OutputSink) {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let result = match sink {
                OutputSink::Stdout => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(&chunk[..n]).and_then(|_| out.flush())
                }
                OutputSink::Stderr => {
                    let mut err = std::io::stderr().lock();
                    err.write_all(&chunk[..n]).and_then(|_| err.flush())
                }
            };
            if result.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_build_a_launch_config() {
        let config = parse_args(
            [
                "--java",
                "/usr/lib/jvm/bin/java",
                "--cp",
                "/opt/agent.jar",
                "--cp",
                "/opt/extra",
                "-J-Xmx256m",
                "--timeout",
                "5",
            ]
            .iter()
            .map(|s| s.to_string()),
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            config.java_command.to_string_lossy(),
            "/usr/lib/jvm/bin/java"
        );
        assert_eq!(config.classpath.len(), 2);
        assert_eq!(config.vm_options, vec!["-Xmx256m".to_string()]);
        assert_eq!(config.accept_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        assert!(parse_args(["--bogus".to_string()].into_iter()).is_err());
    }

    #[test]
    fn help_short_circuits() {
        let parsed = parse_args(["--help".to_string()].into_iter()).unwrap();
        assert!(parsed.is_none());
    }
}

//! Spawns and supervises the postmaster.
//!
//! On POSIX platforms the server is launched directly and stopped with
//! SIGINT (fast shutdown). Windows refuses to run `postgres` as an
//! administrator, so there `pg_ctl` performs the restricted-user dance for
//! both start and stop. Readiness is the conjunction of `pg_ctl status`
//! reporting our child's PID and the postmaster status row in
//! `postmaster.pid` reading `ready`.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logger::LogBuffer;
use crate::observability::PROCESS;
#[cfg(not(windows))]
use crate::prepare::apply_run_as_user;

/// Poll interval for the readiness loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exact content of the postmaster status row once queries are served.
/// Seven characters, trailing spaces preserved; stable from version 10 on.
const READY_ROW: &str = "ready   ";

/// Line number (1-based) of the status row in `postmaster.pid`.
const READY_ROW_LINE: usize = 8;

/// Everything needed to launch the server process.
#[derive(Debug)]
pub(crate) struct SpawnSpec<'a> {
    pub(crate) binaries: &'a Utf8Path,
    pub(crate) data: &'a Utf8Path,
    pub(crate) port: u16,
    pub(crate) start_parameters: &'a BTreeMap<String, String>,
    pub(crate) own_process_group: bool,
    pub(crate) run_as_user: Option<&'a str>,
}

/// Handle to a spawned postmaster, exclusively owned by its controller.
#[derive(Debug)]
pub(crate) struct Postmaster {
    child: tokio::process::Child,
    /// PID used for the `pg_ctl status` cross-check; absent on Windows
    /// where `pg_ctl` detaches the real server from our child.
    expected_pid: Option<u32>,
    pg_ctl: Utf8PathBuf,
    data: Utf8PathBuf,
}

impl Postmaster {
    /// Launches the server and wires its output into the log buffer.
    #[cfg(not(windows))]
    pub(crate) fn spawn(spec: &SpawnSpec<'_>, log: &LogBuffer) -> Result<Self> {
        let program = spec.binaries.join("bin/postgres");
        let mut args = vec![
            "-D".to_owned(),
            spec.data.to_string(),
            "-p".to_owned(),
            spec.port.to_string(),
        ];
        for (name, value) in spec.start_parameters {
            args.push("-c".to_owned());
            args.push(format!("{name}={value}"));
        }
        let command_line = render_command(&program, &args);

        let mut command = std::process::Command::new(program.as_std_path());
        command.args(&args).stdout(log.stdio()?).stderr(log.stdio()?);
        apply_run_as_user(&mut command, spec.run_as_user)?;
        if spec.own_process_group {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|_| Error::StartFailed(command_line.clone()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::StartFailed(command_line.clone()))?;
        info!(target: PROCESS, command = %command_line, pid, "postgres spawned");

        Ok(Self {
            child,
            expected_pid: Some(pid),
            pg_ctl: spec.binaries.join("bin/pg_ctl"),
            data: spec.data.to_path_buf(),
        })
    }

    /// Launches the server through `pg_ctl`, which handles the restricted
    /// user Windows requires.
    #[cfg(windows)]
    pub(crate) fn spawn(spec: &SpawnSpec<'_>, log: &LogBuffer) -> Result<Self> {
        let pg_ctl = spec.binaries.join("bin/pg_ctl");
        let mut options = format!("-p {}", spec.port);
        for (name, value) in spec.start_parameters {
            options.push_str(&format!(" -c {name}={value}"));
        }
        let args = vec![
            "start".to_owned(),
            "-w".to_owned(),
            "-D".to_owned(),
            spec.data.to_string(),
            "-o".to_owned(),
            options,
        ];
        let command_line = render_command(&pg_ctl, &args);

        let mut command = std::process::Command::new(pg_ctl.as_std_path());
        command.args(&args).stdout(log.stdio()?).stderr(log.stdio()?);

        let child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|_| Error::StartFailed(command_line))?;
        info!(target: PROCESS, "postgres starting via pg_ctl");

        Ok(Self {
            child,
            expected_pid: None,
            pg_ctl,
            data: spec.data.to_path_buf(),
        })
    }

    /// Polls until the postmaster serves queries or the timeout elapses.
    ///
    /// The log buffer is flushed between polls so the caller's sink keeps
    /// pace with startup output. A child that exits during the wait is
    /// reported with its exit status and the log tail.
    pub(crate) async fn wait_until_ready(
        &mut self,
        timeout: Duration,
        log: &mut LogBuffer,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            log.flush()?;

            if let Some(status) = self.child.try_wait().ok().flatten() {
                // pg_ctl on Windows exits once the server is up; only a
                // directly-spawned postmaster dying here is fatal.
                if self.expected_pid.is_some() {
                    return Err(Error::Exited {
                        status: status.to_string(),
                        log_tail: log.read_tail(),
                    });
                }
            }

            if self.ready().await? {
                debug!(target: PROCESS, "postmaster is ready");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// One readiness check: `pg_ctl status` agrees on the PID and the
    /// postmaster status row reads ready.
    async fn ready(&self) -> Result<bool> {
        let Some(reported) = self.pg_ctl_reports_running().await else {
            return Ok(false);
        };
        if let Some(expected) = self.expected_pid {
            if reported != expected {
                return Err(Error::WrongProcess {
                    expected,
                    actual: reported,
                });
            }
        }
        Ok(self.pid_file_ready())
    }

    /// Runs `pg_ctl status -D <data>`; returns the reported PID when the
    /// server is up, `None` while it is still starting.
    async fn pg_ctl_reports_running(&self) -> Option<u32> {
        let output = tokio::process::Command::new(self.pg_ctl.as_std_path())
            .args(["status", "-D", self.data.as_str()])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_status_line(stdout.lines().next().unwrap_or_default())
    }

    /// Checks the postmaster status row in `postmaster.pid`.
    fn pid_file_ready(&self) -> bool {
        let pid_file = self.data.join("postmaster.pid");
        match std::fs::read_to_string(pid_file.as_std_path()) {
            Ok(contents) => pid_file_reports_ready(&contents),
            Err(_) => false,
        }
    }

    /// Stops the server and reaps the child, flushing buffered logs.
    #[cfg(not(windows))]
    pub(crate) async fn stop(&mut self, log: &mut LogBuffer) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = self.expected_pid {
            // Delivery fails when the process is already gone; that is a
            // successful stop, not an error.
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
        }
        let _ = self.child.wait().await;
        info!(target: PROCESS, "postgres stopped");
        log.flush()
    }

    /// Stops the server through `pg_ctl stop -w` and reaps both children.
    #[cfg(windows)]
    pub(crate) async fn stop(&mut self, log: &mut LogBuffer) -> Result<()> {
        let _ = tokio::process::Command::new(self.pg_ctl.as_std_path())
            .args(["stop", "-w", "-D", self.data.as_str()])
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .status()
            .await;
        let _ = self.child.wait().await;
        info!(target: PROCESS, "postgres stopped");
        log.flush()
    }
}

/// Parses the first line of `pg_ctl status` output.
fn parse_status_line(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("pg_ctl: server is running (PID: ")?;
    let digits = rest.strip_suffix(')')?;
    digits.trim().parse().ok()
}

/// Applies the postmaster status row rule to `postmaster.pid` content.
fn pid_file_reports_ready(contents: &str) -> bool {
    let lines: Vec<&str> = contents.split('\n').collect();
    lines.len() >= READY_ROW_LINE && lines[READY_ROW_LINE - 1] == READY_ROW
}

fn render_command(program: &Utf8Path, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parses_the_reported_pid() {
        assert_eq!(
            parse_status_line("pg_ctl: server is running (PID: 27823)"),
            Some(27_823)
        );
        assert_eq!(parse_status_line("pg_ctl: no server running"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[test]
    fn status_row_requires_eight_lines_and_exact_content() {
        let ready = "27823\n/data\n1700000000\n5432\n/tmp\nlocalhost\n 5432001  \nready   ";
        assert!(pid_file_reports_ready(ready));

        let starting = "27823\n/data\n1700000000\n5432\n/tmp\nlocalhost\n 5432001  \nstarting";
        assert!(!pid_file_reports_ready(starting));

        let truncated = "27823\n/data\n1700000000\n5432";
        assert!(!pid_file_reports_ready(truncated));

        // Trailing spaces are part of the row; a trimmed copy must fail.
        let trimmed = "27823\n/data\n1700000000\n5432\n/tmp\nlocalhost\n 5432001  \nready";
        assert!(!pid_file_reports_ready(trimmed));
    }

    #[test]
    fn status_row_tolerates_a_trailing_newline_block() {
        let contents = "27823\n/data\n1700000000\n5432\n/tmp\nlocalhost\n 5432001  \nready   \n";
        assert!(pid_file_reports_ready(contents));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::{Postmaster, SpawnSpec};
        use crate::logger::LogBuffer;
        use camino::{Utf8Path, Utf8PathBuf};
        use std::collections::BTreeMap;
        use std::fs;
        use std::time::Duration;
        use tempfile::tempdir;

        fn fake_binaries(dir: &std::path::Path, script: &str) -> Utf8PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let root = Utf8PathBuf::from_path_buf(dir.to_path_buf()).expect("utf8 path");
            let bin = root.join("bin");
            fs::create_dir_all(bin.as_std_path()).expect("create bin dir");
            let postgres = bin.join("postgres");
            fs::write(postgres.as_std_path(), script).expect("write fake postgres");
            fs::set_permissions(
                postgres.as_std_path(),
                fs::Permissions::from_mode(0o755),
            )
            .expect("make fake postgres executable");
            root
        }

        fn spec<'a>(binaries: &'a Utf8Path, data: &'a Utf8Path) -> SpawnSpec<'a> {
            SpawnSpec {
                binaries,
                data,
                port: 54_329,
                start_parameters: &EMPTY,
                own_process_group: false,
                run_as_user: None,
            }
        }

        static EMPTY: BTreeMap<String, String> = BTreeMap::new();

        #[tokio::test]
        async fn spawn_failure_reports_the_command_line() {
            let temp = tempdir().expect("tempdir");
            let binaries = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
                .expect("utf8 path");
            let data = binaries.join("data");
            let log = LogBuffer::new(None).expect("log buffer");

            let err = Postmaster::spawn(&spec(&binaries, &data), &log)
                .expect_err("missing binary must fail");

            let message = err.to_string();
            assert!(
                message.starts_with("could not start postgres using "),
                "unexpected error: {message}"
            );
            assert!(message.contains("bin/postgres -D"), "unexpected error: {message}");
            assert!(message.contains("-p 54329"), "unexpected error: {message}");
        }

        #[tokio::test]
        async fn stop_reaps_a_live_child() {
            let temp = tempdir().expect("tempdir");
            let binaries = fake_binaries(temp.path(), "#!/bin/sh\nsleep 30\n");
            let data = binaries.join("data");
            fs::create_dir_all(data.as_std_path()).expect("create data dir");
            let mut log = LogBuffer::new(None).expect("log buffer");

            let mut postmaster =
                Postmaster::spawn(&spec(&binaries, &data), &log).expect("spawn fake postgres");
            postmaster.stop(&mut log).await.expect("stop fake postgres");

            let status = postmaster.child.try_wait().expect("query child status");
            assert!(status.is_some(), "child must be reaped after stop");
        }

        #[tokio::test]
        async fn dead_child_is_reported_with_its_exit_status() {
            let temp = tempdir().expect("tempdir");
            let binaries = fake_binaries(temp.path(), "#!/bin/sh\necho boom\nexit 3\n");
            let data = binaries.join("data");
            fs::create_dir_all(data.as_std_path()).expect("create data dir");
            let mut log = LogBuffer::new(None).expect("log buffer");

            let mut postmaster =
                Postmaster::spawn(&spec(&binaries, &data), &log).expect("spawn fake postgres");
            // Give the script a moment to exit.
            tokio::time::sleep(Duration::from_millis(200)).await;

            let err = postmaster
                .wait_until_ready(Duration::from_secs(2), &mut log)
                .await
                .expect_err("dead child must surface");

            let message = err.to_string();
            assert!(
                message.starts_with("postgres exited with "),
                "unexpected error: {message}"
            );
            assert!(message.contains("boom"), "log tail missing: {message}");
        }
    }
}

//! Cluster initialisation and first-start database creation.
//!
//! `initdb` runs with a scrubbed password file: the password is written to
//! `pwfile` with owner-only permissions, handed over via `--pwfile`, and
//! deleted again before the server starts. Database creation and health
//! checking share one probe connection shape so the orchestrator treats
//! both TCP and Unix-socket clusters uniformly.

use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::{Instant, sleep};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logger::LogBuffer;
use crate::observability::PREPARE;

/// Interval between health probe attempts.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Connections raised in socket mode; parallel test suites burn through the
/// stock limit of 100.
const SOCKET_MODE_MAX_CONNECTIONS: u32 = 300;

/// How `initdb` authenticates local connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMethod {
    /// Password authentication; the default for TCP clusters.
    Password,
    /// Trust authentication; used for socket-only clusters.
    Trust,
}

impl AuthMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Trust => "trust",
        }
    }
}

/// Everything `initdb` needs to create a cluster.
#[derive(Debug)]
pub(crate) struct InitSpec<'a> {
    pub(crate) binaries: &'a Utf8Path,
    pub(crate) runtime: &'a Utf8Path,
    pub(crate) data: &'a Utf8Path,
    pub(crate) username: &'a str,
    pub(crate) password: &'a str,
    pub(crate) locale: Option<&'a str>,
    pub(crate) auth: AuthMethod,
    /// `Some` when the cluster serves a Unix socket instead of TCP; the
    /// directory is written into `postgresql.conf` after `initdb` runs.
    pub(crate) socket_dir: Option<&'a Utf8Path>,
    pub(crate) run_as_user: Option<&'a str>,
}

/// Where and how the probe connection reaches the server.
#[derive(Debug, Clone)]
pub(crate) enum ProbeHost {
    /// TCP on localhost.
    Tcp,
    /// Unix domain socket in the given directory.
    Socket(Utf8PathBuf),
}

/// Connection coordinates for the probe.
#[derive(Debug, Clone)]
pub(crate) struct ConnectSpec<'a> {
    pub(crate) host: ProbeHost,
    pub(crate) port: u16,
    pub(crate) username: &'a str,
    pub(crate) password: &'a str,
    pub(crate) database: &'a str,
}

impl ConnectSpec<'_> {
    /// Renders a libpq-style connection string.
    fn connection_string(&self) -> String {
        let host = match &self.host {
            ProbeHost::Tcp => "localhost",
            ProbeHost::Socket(dir) => dir.as_str(),
        };
        format!(
            "host={host} port={port} user={user} password={password} dbname={dbname} \
             connect_timeout=5",
            port = self.port,
            user = self.username,
            password = self.password,
            dbname = self.database,
        )
    }
}

/// Capability covering cluster initialisation and database creation.
///
/// The controller holds one implementation; tests substitute stubs.
#[async_trait]
pub(crate) trait ClusterPrep: Send + Sync {
    /// Initialises a fresh data directory.
    async fn init_database(&self, spec: &InitSpec<'_>, log: &LogBuffer) -> Result<()>;

    /// Creates the configured database when it is not the default one.
    async fn create_database(&self, spec: &ConnectSpec<'_>) -> Result<()>;
}

/// The production implementation backed by `initdb` and a probe connection.
#[derive(Debug, Default)]
pub(crate) struct DefaultPrep;

#[async_trait]
impl ClusterPrep for DefaultPrep {
    async fn init_database(&self, spec: &InitSpec<'_>, log: &LogBuffer) -> Result<()> {
        let pwfile = write_password_file(spec.runtime, spec.password)?;
        grant_to_run_as_user(spec, &pwfile)?;

        let initdb = spec.binaries.join("bin/initdb");
        let args = initdb_args(spec, &pwfile);
        let command_line = render_command(&initdb, &args);
        info!(target: PREPARE, command = %command_line, "initialising cluster");

        let mut command = std::process::Command::new(initdb.as_std_path());
        command.args(&args).stdout(log.stdio()?).stderr(log.stdio()?);
        apply_run_as_user(&mut command, spec.run_as_user)?;

        let status = tokio::process::Command::from(command)
            .status()
            .await
            .map_err(|err| Error::InitFailed {
                command: command_line.clone(),
                output: err.to_string(),
            })?;
        if !status.success() {
            return Err(Error::InitFailed {
                command: command_line,
                output: log.read_tail(),
            });
        }

        remove_password_file(&pwfile)?;

        if let Some(socket_dir) = spec.socket_dir {
            append_socket_config(spec.data, socket_dir)?;
        }

        Ok(())
    }

    async fn create_database(&self, spec: &ConnectSpec<'_>) -> Result<()> {
        if spec.database == "postgres" {
            return Ok(());
        }

        let admin = ConnectSpec {
            database: "postgres",
            ..spec.clone()
        };
        let (client, connection) = tokio_postgres::connect(&admin.connection_string(), NoTls)
            .await
            .map_err(|err| create_error(spec.database, &err))?;
        let driver = tokio::spawn(async move {
            let _ = connection.await;
        });

        // Simple-query protocol: CREATE DATABASE refuses to run inside a
        // transaction block, which rules out the prepared path.
        let statement = format!("CREATE DATABASE {}", quote_identifier(spec.database));
        let result = client.batch_execute(statement.as_str()).await;
        drop(client);
        driver.abort();

        result.map_err(|err| create_error(spec.database, &err))?;
        info!(target: PREPARE, database = %spec.database, "database created");
        Ok(())
    }
}

/// Probes the server with `SELECT 1` until it answers or the deadline
/// passes.
pub(crate) async fn health_check(spec: &ConnectSpec<'_>, deadline: Instant) -> Result<()> {
    loop {
        match probe(spec).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!(target: PREPARE, error = %err, "health probe not ready");
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        sleep(PROBE_INTERVAL).await;
    }
}

async fn probe(spec: &ConnectSpec<'_>) -> std::result::Result<(), tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(&spec.connection_string(), NoTls).await?;
    let driver = tokio::spawn(async move {
        let _ = connection.await;
    });
    let result = client.simple_query("SELECT 1").await.map(|_| ());
    drop(client);
    driver.abort();
    result
}

/// Quotes an SQL identifier, doubling any embedded quotes, so database
/// names containing hyphens or mixed case survive `CREATE DATABASE`.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn create_error(database: &str, err: &impl std::fmt::Display) -> Error {
    Error::CreateFailed {
        database: database.to_owned(),
        cause: err.to_string(),
    }
}

fn initdb_args(spec: &InitSpec<'_>, pwfile: &Utf8Path) -> Vec<String> {
    let mut args = vec![
        "-A".to_owned(),
        spec.auth.as_str().to_owned(),
        "-U".to_owned(),
        spec.username.to_owned(),
        "-D".to_owned(),
        spec.data.to_string(),
        format!("--pwfile={pwfile}"),
    ];
    if let Some(locale) = spec.locale {
        args.push(format!("--locale={locale}"));
    }
    args
}

fn render_command(program: &Utf8Path, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Writes the password file with owner-only permissions.
fn write_password_file(runtime: &Utf8Path, password: &str) -> Result<Utf8PathBuf> {
    let pwfile = runtime.join("pwfile");
    std::fs::write(pwfile.as_std_path(), password).map_err(|err| Error::PathPreparation {
        path: pwfile.clone(),
        cause: err.to_string(),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            pwfile.as_std_path(),
            std::fs::Permissions::from_mode(0o600),
        )
        .map_err(|err| Error::PathPreparation {
            path: pwfile.clone(),
            cause: err.to_string(),
        })?;
    }
    Ok(pwfile)
}

/// Deleting the scrubbed password file must succeed; a leftover file would
/// leak the password into the runtime directory.
fn remove_password_file(pwfile: &Utf8Path) -> Result<()> {
    std::fs::remove_file(pwfile.as_std_path()).map_err(|err| Error::PathPreparation {
        path: pwfile.to_path_buf(),
        cause: err.to_string(),
    })
}

/// Appends the socket-only settings `initdb` cannot be told about.
fn append_socket_config(data: &Utf8Path, socket_dir: &Utf8Path) -> Result<()> {
    use std::io::Write;

    let conf = data.join("postgresql.conf");
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(conf.as_std_path())
        .map_err(|err| Error::PathPreparation {
            path: conf.clone(),
            cause: err.to_string(),
        })?;
    writeln!(
        file,
        "unix_socket_directories = '{socket_dir}'\nlisten_addresses = ''\n\
         max_connections = {SOCKET_MODE_MAX_CONNECTIONS}"
    )
    .map_err(|err| Error::PathPreparation {
        path: conf,
        cause: err.to_string(),
    })
}

/// Hands the runtime directory and password file to the run-as user so
/// `initdb` can read them after dropping privileges.
#[cfg(unix)]
fn grant_to_run_as_user(spec: &InitSpec<'_>, pwfile: &Utf8Path) -> Result<()> {
    let Some(user) = spec.run_as_user else {
        return Ok(());
    };
    let (uid, gid) = lookup_user(user)?;
    for path in [spec.runtime, pwfile] {
        std::os::unix::fs::chown(path.as_std_path(), Some(uid), Some(gid)).map_err(|err| {
            Error::PathPreparation {
                path: path.to_path_buf(),
                cause: format!("chown to '{user}': {err}"),
            }
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn grant_to_run_as_user(_spec: &InitSpec<'_>, _pwfile: &Utf8Path) -> Result<()> {
    Ok(())
}

/// Applies uid/gid credentials to a child command.
#[cfg(unix)]
pub(crate) fn apply_run_as_user(
    command: &mut std::process::Command,
    run_as_user: Option<&str>,
) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let Some(user) = run_as_user else {
        return Ok(());
    };
    let (uid, gid) = lookup_user(user)?;
    command.uid(uid).gid(gid);
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn apply_run_as_user(
    _command: &mut std::process::Command,
    _run_as_user: Option<&str>,
) -> Result<()> {
    Ok(())
}

/// Resolves an OS user name to its uid/gid pair.
#[cfg(unix)]
fn lookup_user(name: &str) -> Result<(u32, u32)> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|err| Error::PathPreparation {
            path: Utf8PathBuf::from(name),
            cause: format!("unable to lookup run-as user: {err}"),
        })?
        .ok_or_else(|| Error::PathPreparation {
            path: Utf8PathBuf::from(name),
            cause: "run-as user not found".to_owned(),
        })?;
    Ok((user.uid.as_raw(), user.gid.as_raw()))
}

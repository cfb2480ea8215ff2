use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::{sleep, timeout},
};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::{
    application::{ApplicationReport, ApplicationState},
    application_client::ApplicationClient,
    definition::ApplicationSpec,
    error::{Error, Result},
    proto::{self, driver_client::DriverClient, ApplicationId, ApplicationsRequest, Empty},
    security::Security,
};

/// Overrides the daemon binary a client starts.
pub const DAEMON_ENV: &str = "FLOTILLA_DAEMON";

const DAEMON_BINARY: &str = "flotillad";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct ClientBuilder {
    security: Option<Security>,
    address: Option<String>,
    log: Option<PathBuf>,
    daemon_binary: Option<PathBuf>,
    config: Option<PathBuf>,
    startup_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials for the connection. Defaults to the per-user pair.
    pub fn security(mut self, security: Security) -> Self {
        self.security = Some(security);
        self
    }

    /// Attach to an already running daemon instead of starting one.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// File the daemon's output is appended to. Discarded when unset.
    pub fn log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }

    pub fn daemon_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.daemon_binary = Some(path.into());
        self
    }

    /// Configuration file handed to a started daemon.
    pub fn config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    pub fn startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = Some(startup_timeout);
        self
    }

    /// How often [`Client::connect`] polls while waiting for an application.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    #[tracing::instrument(name = "ClientBuilder::build", skip_all)]
    pub async fn build(self) -> Result<Client> {
        let security = match self.security {
            Some(v) => v,
            None => Security::from_default()?,
        };

        let (daemon, address) = match self.address {
            Some(address) => (None, address),
            None => {
                let binary = self.daemon_binary.unwrap_or_else(daemon_binary);

                let (daemon, address) = Daemon::spawn(
                    &binary,
                    &security,
                    self.config.as_deref(),
                    self.log,
                    self.startup_timeout.unwrap_or(STARTUP_TIMEOUT),
                )
                .await?;

                (Some(daemon), address)
            }
        };

        let channel = security.connect(&address).await?;
        let mut driver = DriverClient::new(channel);

        // Fails here rather than on the first call when the daemon does not
        // accept our certificate.
        driver.ping(Empty {}).await?;

        info!(%address, "connected to daemon");

        Ok(Client {
            address,
            security,
            driver,
            daemon,
            closed: false,
            poll_interval: self.poll_interval.unwrap_or(POLL_INTERVAL),
        })
    }
}

/// Handle on a daemon's application registry.
///
/// A client that started its daemon owns it: [`Client::close`] or dropping
/// the client stops the daemon, which kills every application it still runs.
#[derive(Debug)]
pub struct Client {
    address: String,
    security: Security,
    driver: DriverClient<Channel>,
    daemon: Option<Daemon>,
    closed: bool,
    poll_interval: Duration,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Starts a daemon with the per-user credentials and connects to it.
    pub async fn start() -> Result<Self> {
        ClientBuilder::new().build().await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    /// Process id of the daemon this client started, if it is still owned.
    pub fn daemon_pid(&self) -> Option<u32> {
        self.daemon.as_ref().and_then(Daemon::pid)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn driver(&self) -> Result<DriverClient<Channel>> {
        if self.closed {
            return Err(Error::Connection("client is closed".to_owned()));
        }
        Ok(self.driver.clone())
    }

    #[tracing::instrument(name = "Client::submit", skip_all, fields(
        name = %spec.name
    ))]
    pub async fn submit(&self, spec: &ApplicationSpec) -> Result<String> {
        spec.validate()?;

        let response = self
            .driver()?
            .submit(proto::ApplicationSpec::from(spec))
            .await?;

        Ok(response.into_inner().id)
    }

    /// Reports of applications in any of `states`. An empty slice selects
    /// the active ones.
    pub async fn get_applications(
        &self,
        states: &[ApplicationState],
    ) -> Result<Vec<ApplicationReport>> {
        let request = ApplicationsRequest {
            states: states
                .iter()
                .map(|state| proto::ApplicationState::from(*state).into())
                .collect(),
        };

        self.driver()?
            .get_applications(request)
            .await?
            .into_inner()
            .reports
            .into_iter()
            .map(ApplicationReport::try_from)
            .collect()
    }

    pub async fn application_report(&self, id: &str) -> Result<ApplicationReport> {
        let report = self
            .driver()?
            .application_report(ApplicationId { id: id.to_owned() })
            .await?
            .into_inner();

        ApplicationReport::try_from(report)
    }

    #[tracing::instrument(name = "Client::kill_application", skip(self))]
    pub async fn kill_application(&self, id: &str) -> Result<()> {
        self.driver()?
            .kill_application(ApplicationId { id: id.to_owned() })
            .await?;

        Ok(())
    }

    /// Connects to the master of application `id`.
    ///
    /// With `wait` the call polls until the application is running. It fails
    /// once the application has terminated.
    #[tracing::instrument(name = "Client::connect", skip(self))]
    pub async fn connect(&self, id: &str, wait: bool) -> Result<ApplicationClient> {
        loop {
            let report = self.application_report(id).await?;

            if report.state.is_terminal() {
                return Err(Error::Connection(format!(
                    "application {id} has terminated: {}",
                    report.state
                )));
            }

            match (report.state, report.address.as_deref()) {
                (ApplicationState::Running, Some(address)) => {
                    match ApplicationClient::connect(id, address, &self.security).await {
                        Ok(v) => return Ok(v),
                        Err(error) if wait && error.is_connection() => {
                            debug!(?error, "application master not reachable yet");
                        }
                        Err(error) => return Err(error),
                    }
                }
                (state, _) if !wait => {
                    return Err(Error::Connection(format!(
                        "application {id} is not running yet: {state}"
                    )));
                }
                _ => {}
            }

            sleep(self.poll_interval).await;
        }
    }

    /// Stops the owned daemon and marks the client closed. Idempotent.
    #[tracing::instrument(name = "Client::close", skip_all)]
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;

        if let Some(daemon) = self.daemon.as_mut() {
            daemon.terminate().await?;
        }

        Ok(())
    }
}

/// A daemon process started by a client.
#[derive(Debug)]
struct Daemon {
    child: Option<Child>,
    // The daemon watches its stdin and shuts down when this closes.
    stdin: Option<ChildStdin>,
}

impl Daemon {
    #[tracing::instrument(name = "Daemon::spawn", skip_all, fields(
        binary = ?binary
    ))]
    async fn spawn(
        binary: &Path,
        security: &Security,
        config: Option<&Path>,
        log: Option<PathBuf>,
        startup_timeout: Duration,
    ) -> Result<(Self, String)> {
        let mut command = Command::new(binary);
        command
            .arg("--security-dir")
            .arg(security.directory())
            .arg("--watch-stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());

        if let Some(config) = config {
            command.arg("--config").arg(config);
        }

        match &log {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                command.stderr(Stdio::from(file));
            }
            None => {
                command.stderr(Stdio::null());
            }
        }

        let mut child = command.spawn().map_err(|error| {
            Error::Connection(format!(
                "unable to start daemon {}: {error}",
                binary.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("daemon stdout is not captured".to_owned()))?;

        let mut daemon = Daemon {
            stdin: child.stdin.take(),
            child: Some(child),
        };

        let mut lines = BufReader::new(stdout).lines();

        let address = match timeout(startup_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) if !line.trim().is_empty() => line.trim().to_owned(),
            Ok(_) => {
                daemon.terminate().await?;
                return Err(Error::Connection(
                    "daemon exited before reporting its address".to_owned(),
                ));
            }
            Err(_) => {
                daemon.terminate().await?;
                return Err(Error::Connection(format!(
                    "daemon did not report its address within {startup_timeout:?}"
                )));
            }
        };

        tokio::spawn(forward_output(lines, log));

        info!(%address, pid = ?daemon.pid(), "daemon started");

        Ok((daemon, address))
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Asks the daemon to stop and waits for it, killing it if it lingers.
    async fn terminate(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        self.stdin.take();
        request_stop(&child);

        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(?status, "daemon exited");
            }
            Err(_) => {
                warn!("daemon did not stop in time, killing it");
                child.kill().await?;
            }
        }

        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            self.stdin.take();
            request_stop(&child);
        }
    }
}

/// `$FLOTILLA_DAEMON`, then a `flotillad` next to the running executable,
/// then whatever `flotillad` is on the `PATH`.
fn daemon_binary() -> PathBuf {
    if let Some(path) = std::env::var_os(DAEMON_ENV) {
        return PathBuf::from(path);
    }

    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY))
}

fn request_stop(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };

    let Ok(pid) = i32::try_from(pid) else {
        return;
    };

    if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(?error, pid, "unable to signal daemon");
    }
}

/// Copies whatever the daemon prints after its address into the log.
async fn forward_output(mut lines: Lines<BufReader<ChildStdout>>, log: Option<PathBuf>) {
    let mut file = match log {
        Some(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .ok(),
        None => None,
    };

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(file) = file.as_mut() {
            if file.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

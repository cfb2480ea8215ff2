use chrono::{DateTime, Utc};
use std::{collections::BTreeSet, fmt, str::FromStr};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApplicationState {
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl ApplicationState {
    pub const ACTIVE: [ApplicationState; 3] = [
        ApplicationState::Submitted,
        ApplicationState::Accepted,
        ApplicationState::Running,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationState::Finished | ApplicationState::Failed | ApplicationState::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationState::Submitted => "SUBMITTED",
            ApplicationState::Accepted => "ACCEPTED",
            ApplicationState::Running => "RUNNING",
            ApplicationState::Finished => "FINISHED",
            ApplicationState::Failed => "FAILED",
            ApplicationState::Killed => "KILLED",
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationState {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "SUBMITTED" => Ok(ApplicationState::Submitted),
            "ACCEPTED" => Ok(ApplicationState::Accepted),
            "RUNNING" => Ok(ApplicationState::Running),
            "FINISHED" => Ok(ApplicationState::Finished),
            "FAILED" => Ok(ApplicationState::Failed),
            "KILLED" => Ok(ApplicationState::Killed),
            _ => Err(Error::InvalidArgument(format!(
                "unknown application state {input:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalStatus {
    Undefined,
    Succeeded,
    Failed,
    Killed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Undefined => "UNDEFINED",
            FinalStatus::Succeeded => "SUCCEEDED",
            FinalStatus::Failed => "FAILED",
            FinalStatus::Killed => "KILLED",
        }
    }

    /// The application state an application ends up in with this status.
    fn terminal_state(&self) -> Option<ApplicationState> {
        match self {
            FinalStatus::Undefined => None,
            FinalStatus::Succeeded => Some(ApplicationState::Finished),
            FinalStatus::Failed => Some(ApplicationState::Failed),
            FinalStatus::Killed => Some(ApplicationState::Killed),
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalStatus {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "UNDEFINED" => Ok(FinalStatus::Undefined),
            "SUCCEEDED" => Ok(FinalStatus::Succeeded),
            "FAILED" => Ok(FinalStatus::Failed),
            "KILLED" => Ok(FinalStatus::Killed),
            _ => Err(Error::InvalidArgument(format!(
                "unknown final status {input:?}"
            ))),
        }
    }
}

/// Registry view of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationReport {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub tags: BTreeSet<String>,
    pub state: ApplicationState,
    pub final_status: FinalStatus,
    /// Where the application master listens while the application runs.
    pub address: Option<String>,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub diagnostics: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationStatus {
    pub state: ApplicationState,
    pub final_status: FinalStatus,
    pub address: Option<String>,
    pub finish_time: Option<DateTime<Utc>>,
    pub diagnostics: String,
}

/// Current state of one application, observable by the master, its server and
/// the registry alike.
#[derive(Debug)]
pub struct StateTracker {
    status: watch::Sender<ApplicationStatus>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ApplicationStatus {
            state: ApplicationState::Submitted,
            final_status: FinalStatus::Undefined,
            address: None,
            finish_time: None,
            diagnostics: String::new(),
        });

        Self { status }
    }

    pub fn status(&self) -> ApplicationStatus {
        self.status.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.borrow().state.is_terminal()
    }

    pub fn subscribe(&self) -> watch::Receiver<ApplicationStatus> {
        self.status.subscribe()
    }

    pub fn accepted(&self) {
        self.status.send_if_modified(|status| {
            if status.state != ApplicationState::Submitted {
                return false;
            }
            status.state = ApplicationState::Accepted;
            true
        });
    }

    /// Marks the master as serving on `address`.
    pub fn running(&self, address: &str) {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            status.state = ApplicationState::Running;
            status.address = Some(address.to_owned());
            true
        });
        info!(%address, "application running");
    }

    /// Moves the application to the terminal state matching `final_status`.
    ///
    /// Only the first call wins. Returns whether this call made the
    /// transition.
    #[tracing::instrument(name = "StateTracker::finish", skip_all, fields(
        final_status = %final_status
    ))]
    pub fn finish(&self, final_status: FinalStatus, diagnostics: &str) -> Result<bool> {
        let state = final_status.terminal_state().ok_or_else(|| {
            Error::InvalidArgument("an application cannot finish as UNDEFINED".to_owned())
        })?;

        let transitioned = self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            status.state = state;
            status.final_status = final_status;
            status.address = None;
            status.finish_time = Some(Utc::now());
            status.diagnostics = diagnostics.to_owned();
            true
        });

        if transitioned {
            info!(%state, %diagnostics, "application finished");
        }

        Ok(transitioned)
    }
}

/// Resolves once `receiver` observes a terminal state, or the tracker is gone.
pub async fn terminated(mut receiver: watch::Receiver<ApplicationStatus>) {
    // An error means the tracker was dropped, which only happens on teardown.
    let _ = receiver.wait_for(|status| status.state.is_terminal()).await;
}

use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContainerState {
    Requested,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerState::Succeeded | ContainerState::Failed | ContainerState::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Requested => "REQUESTED",
            ContainerState::Running => "RUNNING",
            ContainerState::Succeeded => "SUCCEEDED",
            ContainerState::Failed => "FAILED",
            ContainerState::Killed => "KILLED",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "REQUESTED" => Ok(ContainerState::Requested),
            "RUNNING" => Ok(ContainerState::Running),
            "SUCCEEDED" => Ok(ContainerState::Succeeded),
            "FAILED" => Ok(ContainerState::Failed),
            "KILLED" => Ok(ContainerState::Killed),
            _ => Err(Error::InvalidArgument(format!(
                "unknown container state {input:?}"
            ))),
        }
    }
}

/// `<service>_<instance>`. Service names may contain underscores, the
/// instance is whatever follows the last one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId {
    pub service: String,
    pub instance: u32,
}

impl ContainerId {
    pub fn new(service: impl Into<String>, instance: u32) -> Self {
        Self {
            service: service.into(),
            instance,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.service, self.instance)
    }
}

impl FromStr for ContainerId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidArgument(format!("invalid container id {input:?}"));

        let (service, instance) = input.rsplit_once('_').ok_or_else(invalid)?;
        if service.is_empty() || instance.is_empty() || !instance.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let instance = instance.parse::<u32>().map_err(|_| invalid())?;

        Ok(ContainerId::new(service, instance))
    }
}

/// Snapshot of one container of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub service_name: String,
    pub instance: u32,
    pub state: ContainerState,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub exit_message: String,
}

impl Container {
    pub(crate) fn requested(service_name: &str, instance: u32) -> Self {
        Self {
            service_name: service_name.to_owned(),
            instance,
            state: ContainerState::Requested,
            start_time: None,
            finish_time: None,
            exit_message: String::new(),
        }
    }

    pub fn id(&self) -> ContainerId {
        ContainerId::new(self.service_name.clone(), self.instance)
    }

    pub(crate) fn finish(&mut self, state: ContainerState, exit_message: impl Into<String>) {
        self.state = state;
        self.finish_time = Some(Utc::now());
        self.exit_message = exit_message.into();
    }
}

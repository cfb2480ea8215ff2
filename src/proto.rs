//! Wire types for the `flotilla.Driver` and `flotilla.Master` services.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

use crate::{
    application, container, definition,
    error::{Error, Result},
};

include!(concat!(env!("OUT_DIR"), "/flotilla.Driver.rs"));
include!(concat!(env!("OUT_DIR"), "/flotilla.Master.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resources {
    #[prost(uint64, tag = "1")]
    pub memory: u64,
    #[prost(uint32, tag = "2")]
    pub vcores: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Service {
    #[prost(uint32, tag = "1")]
    pub instances: u32,
    #[prost(message, optional, tag = "2")]
    pub resources: Option<Resources>,
    #[prost(string, repeated, tag = "3")]
    pub commands: Vec<String>,
    #[prost(map = "string, string", tag = "4")]
    pub env: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationSpec {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub queue: String,
    #[prost(string, repeated, tag = "3")]
    pub tags: Vec<String>,
    #[prost(map = "string, message", tag = "4")]
    pub services: HashMap<String, Service>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationId {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ApplicationState {
    Submitted = 0,
    Accepted = 1,
    Running = 2,
    Finished = 3,
    Failed = 4,
    Killed = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FinalStatus {
    Undefined = 0,
    Succeeded = 1,
    Failed = 2,
    Killed = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ContainerState {
    Requested = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Killed = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationsRequest {
    #[prost(enumeration = "ApplicationState", repeated, tag = "1")]
    pub states: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationReport {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub queue: String,
    #[prost(string, repeated, tag = "4")]
    pub tags: Vec<String>,
    #[prost(enumeration = "ApplicationState", tag = "5")]
    pub state: i32,
    #[prost(enumeration = "FinalStatus", tag = "6")]
    pub final_status: i32,
    /// Empty unless the application is running.
    #[prost(string, tag = "7")]
    pub address: String,
    /// Milliseconds since the epoch, 0 when unset.
    #[prost(int64, tag = "8")]
    pub start_time: i64,
    #[prost(int64, tag = "9")]
    pub finish_time: i64,
    #[prost(string, tag = "10")]
    pub diagnostics: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationsResponse {
    #[prost(message, repeated, tag = "1")]
    pub reports: Vec<ApplicationReport>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Container {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(uint32, tag = "2")]
    pub instance: u32,
    #[prost(enumeration = "ContainerState", tag = "3")]
    pub state: i32,
    #[prost(int64, tag = "4")]
    pub start_time: i64,
    #[prost(int64, tag = "5")]
    pub finish_time: i64,
    #[prost(string, tag = "6")]
    pub exit_message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerList {
    #[prost(message, repeated, tag = "1")]
    pub containers: Vec<Container>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScaleRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(int32, tag = "2")]
    pub instances: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerId {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainersRequest {
    #[prost(string, repeated, tag = "1")]
    pub services: Vec<String>,
    #[prost(enumeration = "ContainerState", repeated, tag = "2")]
    pub states: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShutdownRequest {
    #[prost(enumeration = "FinalStatus", tag = "1")]
    pub final_status: i32,
    #[prost(string, tag = "2")]
    pub diagnostics: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyRequest {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetRequest {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueResponse {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValueMap {
    #[prost(map = "string, string", tag = "1")]
    pub entries: HashMap<String, String>,
}

fn to_millis(time: Option<DateTime<Utc>>) -> i64 {
    time.map(|t| t.timestamp_millis()).unwrap_or_default()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

fn unknown_enum(field: &str, value: i32) -> Error {
    Error::InvalidArgument(format!("unknown {field} value {value}"))
}

impl From<container::ContainerState> for ContainerState {
    fn from(input: container::ContainerState) -> Self {
        match input {
            container::ContainerState::Requested => ContainerState::Requested,
            container::ContainerState::Running => ContainerState::Running,
            container::ContainerState::Succeeded => ContainerState::Succeeded,
            container::ContainerState::Failed => ContainerState::Failed,
            container::ContainerState::Killed => ContainerState::Killed,
        }
    }
}

impl From<ContainerState> for container::ContainerState {
    fn from(input: ContainerState) -> Self {
        match input {
            ContainerState::Requested => container::ContainerState::Requested,
            ContainerState::Running => container::ContainerState::Running,
            ContainerState::Succeeded => container::ContainerState::Succeeded,
            ContainerState::Failed => container::ContainerState::Failed,
            ContainerState::Killed => container::ContainerState::Killed,
        }
    }
}

pub fn container_state_from_i32(value: i32) -> Result<container::ContainerState> {
    ContainerState::try_from(value)
        .map(Into::into)
        .map_err(|_| unknown_enum("container state", value))
}

impl From<application::ApplicationState> for ApplicationState {
    fn from(input: application::ApplicationState) -> Self {
        match input {
            application::ApplicationState::Submitted => ApplicationState::Submitted,
            application::ApplicationState::Accepted => ApplicationState::Accepted,
            application::ApplicationState::Running => ApplicationState::Running,
            application::ApplicationState::Finished => ApplicationState::Finished,
            application::ApplicationState::Failed => ApplicationState::Failed,
            application::ApplicationState::Killed => ApplicationState::Killed,
        }
    }
}

impl From<ApplicationState> for application::ApplicationState {
    fn from(input: ApplicationState) -> Self {
        match input {
            ApplicationState::Submitted => application::ApplicationState::Submitted,
            ApplicationState::Accepted => application::ApplicationState::Accepted,
            ApplicationState::Running => application::ApplicationState::Running,
            ApplicationState::Finished => application::ApplicationState::Finished,
            ApplicationState::Failed => application::ApplicationState::Failed,
            ApplicationState::Killed => application::ApplicationState::Killed,
        }
    }
}

pub fn application_state_from_i32(value: i32) -> Result<application::ApplicationState> {
    ApplicationState::try_from(value)
        .map(Into::into)
        .map_err(|_| unknown_enum("application state", value))
}

impl From<application::FinalStatus> for FinalStatus {
    fn from(input: application::FinalStatus) -> Self {
        match input {
            application::FinalStatus::Undefined => FinalStatus::Undefined,
            application::FinalStatus::Succeeded => FinalStatus::Succeeded,
            application::FinalStatus::Failed => FinalStatus::Failed,
            application::FinalStatus::Killed => FinalStatus::Killed,
        }
    }
}

impl From<FinalStatus> for application::FinalStatus {
    fn from(input: FinalStatus) -> Self {
        match input {
            FinalStatus::Undefined => application::FinalStatus::Undefined,
            FinalStatus::Succeeded => application::FinalStatus::Succeeded,
            FinalStatus::Failed => application::FinalStatus::Failed,
            FinalStatus::Killed => application::FinalStatus::Killed,
        }
    }
}

pub fn final_status_from_i32(value: i32) -> Result<application::FinalStatus> {
    FinalStatus::try_from(value)
        .map(Into::into)
        .map_err(|_| unknown_enum("final status", value))
}

impl From<&definition::ServiceSpec> for Service {
    fn from(input: &definition::ServiceSpec) -> Self {
        Self {
            instances: input.instances,
            resources: Some(Resources {
                memory: input.resources.memory,
                vcores: input.resources.vcores,
            }),
            commands: input.commands.clone(),
            env: input.env.clone().into_iter().collect(),
        }
    }
}

impl TryFrom<Service> for definition::ServiceSpec {
    type Error = Error;

    fn try_from(input: Service) -> Result<Self, Self::Error> {
        let resources = input
            .resources
            .ok_or_else(|| Error::InvalidArgument("service resources are required".to_owned()))?;

        Ok(Self {
            instances: input.instances,
            resources: definition::Resources {
                memory: resources.memory,
                vcores: resources.vcores,
            },
            commands: input.commands,
            env: input.env.into_iter().collect(),
        })
    }
}

impl From<&definition::ApplicationSpec> for ApplicationSpec {
    fn from(input: &definition::ApplicationSpec) -> Self {
        Self {
            name: input.name.clone(),
            queue: input.queue.clone(),
            tags: input.tags.iter().cloned().collect(),
            services: input
                .services
                .iter()
                .map(|(name, service)| (name.clone(), Service::from(service)))
                .collect(),
        }
    }
}

impl TryFrom<ApplicationSpec> for definition::ApplicationSpec {
    type Error = Error;

    fn try_from(input: ApplicationSpec) -> Result<Self, Self::Error> {
        let services = input
            .services
            .into_iter()
            .map(|(name, service)| -> Result<_> {
                Ok((name, definition::ServiceSpec::try_from(service)?))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            name: input.name,
            queue: if input.queue.is_empty() {
                "default".to_owned()
            } else {
                input.queue
            },
            tags: input.tags.into_iter().collect(),
            services,
        })
    }
}

impl From<&container::Container> for Container {
    fn from(input: &container::Container) -> Self {
        Self {
            service_name: input.service_name.clone(),
            instance: input.instance,
            state: ContainerState::from(input.state).into(),
            start_time: to_millis(input.start_time),
            finish_time: to_millis(input.finish_time),
            exit_message: input.exit_message.clone(),
        }
    }
}

impl TryFrom<Container> for container::Container {
    type Error = Error;

    fn try_from(input: Container) -> Result<Self, Self::Error> {
        Ok(Self {
            state: container_state_from_i32(input.state)?,
            service_name: input.service_name,
            instance: input.instance,
            start_time: from_millis(input.start_time),
            finish_time: from_millis(input.finish_time),
            exit_message: input.exit_message,
        })
    }
}

impl From<&[container::Container]> for ContainerList {
    fn from(input: &[container::Container]) -> Self {
        Self {
            containers: input.iter().map(Container::from).collect(),
        }
    }
}

impl TryFrom<ContainerList> for Vec<container::Container> {
    type Error = Error;

    fn try_from(input: ContainerList) -> Result<Self, Self::Error> {
        input
            .containers
            .into_iter()
            .map(container::Container::try_from)
            .collect()
    }
}

impl From<&application::ApplicationReport> for ApplicationReport {
    fn from(input: &application::ApplicationReport) -> Self {
        Self {
            id: input.id.clone(),
            name: input.name.clone(),
            queue: input.queue.clone(),
            tags: input.tags.iter().cloned().collect(),
            state: ApplicationState::from(input.state).into(),
            final_status: FinalStatus::from(input.final_status).into(),
            address: input.address.clone().unwrap_or_default(),
            start_time: input.start_time.timestamp_millis(),
            finish_time: to_millis(input.finish_time),
            diagnostics: input.diagnostics.clone(),
        }
    }
}

impl TryFrom<ApplicationReport> for application::ApplicationReport {
    type Error = Error;

    fn try_from(input: ApplicationReport) -> Result<Self, Self::Error> {
        Ok(Self {
            state: application_state_from_i32(input.state)?,
            final_status: final_status_from_i32(input.final_status)?,
            id: input.id,
            name: input.name,
            queue: input.queue,
            tags: input.tags.into_iter().collect(),
            address: if input.address.is_empty() {
                None
            } else {
                Some(input.address)
            },
            start_time: from_millis(input.start_time).unwrap_or_else(Utc::now),
            finish_time: from_millis(input.finish_time),
            diagnostics: input.diagnostics,
        })
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

/// The application definition used in `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub services: BTreeMap<String, ServiceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Containers started when the application is submitted.
    #[serde(default = "default_instances")]
    pub instances: u32,
    pub resources: Resources,
    /// Run in order by every container of the service. The first failing
    /// command fails the container.
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory in MiB.
    pub memory: u64,
    pub vcores: u32,
}

fn default_queue() -> String {
    "default".to_owned()
}

fn default_instances() -> u32 {
    1
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DefinitionError {
    #[error("field {0} is required")]
    MissingField(String),
    #[error("field {field} is invalid: {reason}")]
    InvalidField { field: String, reason: String },
}

impl ApplicationSpec {
    pub async fn from_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_contents = tokio::fs::read_to_string(file_path.as_ref()).await?;
        let spec: ApplicationSpec = serde_yaml::from_str(&file_contents)?;

        spec.validate()?;

        Ok(spec)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::MissingField("name".to_owned()));
        }

        if self.services.is_empty() {
            return Err(DefinitionError::MissingField("services".to_owned()));
        }

        for (name, service) in self.services.iter() {
            if name.is_empty() {
                return Err(DefinitionError::InvalidField {
                    field: "services".to_owned(),
                    reason: "service names must not be empty".to_owned(),
                });
            }

            if service.commands.is_empty() {
                return Err(DefinitionError::MissingField(format!(
                    "services.{name}.commands"
                )));
            }

            if service.resources.memory == 0 || service.resources.vcores == 0 {
                return Err(DefinitionError::InvalidField {
                    field: format!("services.{name}.resources"),
                    reason: "memory and vcores must be positive".to_owned(),
                });
            }
        }

        Ok(())
    }
}

impl From<DefinitionError> for crate::error::Error {
    fn from(error: DefinitionError) -> Self {
        crate::error::Error::InvalidArgument(error.to_string())
    }
}

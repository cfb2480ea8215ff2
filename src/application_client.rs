use std::collections::HashMap;
use tonic::transport::Channel;

use crate::{
    application::FinalStatus,
    container::{Container, ContainerState},
    definition::{ApplicationSpec, ServiceSpec},
    error::{Error, Result},
    master::{APPLICATION_ID_ENV, MASTER_ADDRESS_ENV, SECURITY_DIR_ENV},
    proto::{
        self, master_client::MasterClient, ContainersRequest, Empty, KeyRequest, ScaleRequest,
        SetRequest, ShutdownRequest,
    },
    security::Security,
};

/// Handle on one application's master.
#[derive(Debug, Clone)]
pub struct ApplicationClient {
    id: String,
    address: String,
    master: MasterClient<Channel>,
    kv: KeyValue,
}

impl ApplicationClient {
    pub async fn connect(id: &str, address: &str, security: &Security) -> Result<Self> {
        let channel = security.connect(address).await?;
        let master = MasterClient::new(channel);

        Ok(Self {
            id: id.to_owned(),
            address: address.to_owned(),
            kv: KeyValue {
                master: master.clone(),
            },
            master,
        })
    }

    /// Connects from inside a container, using the variables the master
    /// exports to every container it starts.
    pub async fn from_env() -> Result<Self> {
        let id = read_env(APPLICATION_ID_ENV)?;
        let address = read_env(MASTER_ADDRESS_ENV)?;
        let security = Security::from_directory(read_env(SECURITY_DIR_ENV)?)?;

        Self::connect(&id, &address, &security).await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kv(&self) -> &KeyValue {
        &self.kv
    }

    pub async fn specification(&self) -> Result<ApplicationSpec> {
        let spec = self
            .master
            .clone()
            .get_specification(Empty {})
            .await?
            .into_inner();

        ApplicationSpec::try_from(spec)
    }

    pub async fn service(&self, name: &str) -> Result<ServiceSpec> {
        self.specification()
            .await?
            .services
            .remove(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown service {name:?}")))
    }

    /// Sets the number of active containers of `service` and returns the
    /// containers that were started or stopped.
    pub async fn scale(&self, service: &str, instances: i32) -> Result<Vec<Container>> {
        let response = self
            .master
            .clone()
            .scale(ScaleRequest {
                service: service.to_owned(),
                instances,
            })
            .await?;

        Vec::<Container>::try_from(response.into_inner())
    }

    /// Kills the container with id `<service>_<instance>`.
    pub async fn kill_container(&self, id: &str) -> Result<()> {
        self.master
            .clone()
            .kill_container(proto::ContainerId { id: id.to_owned() })
            .await?;

        Ok(())
    }

    pub async fn containers(
        &self,
        services: &[&str],
        states: &[ContainerState],
    ) -> Result<Vec<Container>> {
        let request = ContainersRequest {
            services: services.iter().map(|s| (*s).to_owned()).collect(),
            states: states
                .iter()
                .map(|state| proto::ContainerState::from(*state).into())
                .collect(),
        };

        let response = self.master.clone().get_containers(request).await?;

        Vec::<Container>::try_from(response.into_inner())
    }

    /// Finishes the application. The master stops serving afterwards.
    pub async fn shutdown(&self, final_status: FinalStatus, diagnostics: &str) -> Result<()> {
        self.master
            .clone()
            .shutdown(ShutdownRequest {
                final_status: proto::FinalStatus::from(final_status).into(),
                diagnostics: diagnostics.to_owned(),
            })
            .await?;

        Ok(())
    }
}

/// The application's coordination store.
#[derive(Debug, Clone)]
pub struct KeyValue {
    master: MasterClient<Channel>,
}

impl KeyValue {
    pub async fn get(&self, key: &str) -> Result<String> {
        let response = self.master.clone().key_value_get(key_request(key)).await?;

        Ok(response.into_inner().value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.master
            .clone()
            .key_value_set(SetRequest {
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .await?;

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.master
            .clone()
            .key_value_delete(key_request(key))
            .await?;

        Ok(())
    }

    /// Blocks until `key` has a value.
    pub async fn wait(&self, key: &str) -> Result<String> {
        let response = self
            .master
            .clone()
            .key_value_wait(key_request(key))
            .await?;

        Ok(response.into_inner().value)
    }

    pub async fn to_map(&self) -> Result<HashMap<String, String>> {
        let response = self.master.clone().key_value_get_all(Empty {}).await?;

        Ok(response.into_inner().entries)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.to_map().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

fn key_request(key: &str) -> KeyRequest {
    KeyRequest {
        key: key.to_owned(),
    }
}

fn read_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::NotFound(format!("environment variable {name} is not set")))
}

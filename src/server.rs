//! gRPC front ends of the driver registry and of each application master.

use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::{
    application::{ApplicationState, FinalStatus},
    container::ContainerState,
    definition,
    driver::Driver,
    error::Result,
    master::ApplicationMaster,
    proto::{
        self, application_state_from_i32, container_state_from_i32, driver_server,
        final_status_from_i32, master_server, ApplicationId, ApplicationsRequest,
        ApplicationsResponse, ContainerList, ContainersRequest, Empty, KeyRequest, KeyValueMap,
        ScaleRequest, SetRequest, ShutdownRequest, ValueResponse,
    },
};

pub struct DriverService {
    driver: Arc<Driver>,
}

impl DriverService {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }
}

#[tonic::async_trait]
impl driver_server::Driver for DriverService {
    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    #[tracing::instrument(name = "DriverService::submit", skip_all, fields(
        name = %request.get_ref().name
    ))]
    async fn submit(
        &self,
        request: Request<proto::ApplicationSpec>,
    ) -> Result<Response<ApplicationId>, Status> {
        let spec = definition::ApplicationSpec::try_from(request.into_inner())?;

        let id = self.driver.submit(spec).await?;

        Ok(Response::new(ApplicationId { id }))
    }

    async fn get_applications(
        &self,
        request: Request<ApplicationsRequest>,
    ) -> Result<Response<ApplicationsResponse>, Status> {
        let states = request
            .into_inner()
            .states
            .into_iter()
            .map(application_state_from_i32)
            .collect::<Result<Vec<ApplicationState>>>()?;

        let reports = self.driver.get_applications(&states).await;

        Ok(Response::new(ApplicationsResponse {
            reports: reports.iter().map(proto::ApplicationReport::from).collect(),
        }))
    }

    async fn application_report(
        &self,
        request: Request<ApplicationId>,
    ) -> Result<Response<proto::ApplicationReport>, Status> {
        let report = self
            .driver
            .application_report(&request.into_inner().id)
            .await?;

        Ok(Response::new(proto::ApplicationReport::from(&report)))
    }

    #[tracing::instrument(name = "DriverService::kill_application", skip_all, fields(
        id = %request.get_ref().id
    ))]
    async fn kill_application(
        &self,
        request: Request<ApplicationId>,
    ) -> Result<Response<Empty>, Status> {
        self.driver
            .kill_application(&request.into_inner().id)
            .await?;

        Ok(Response::new(Empty {}))
    }
}

pub struct MasterService {
    master: Arc<ApplicationMaster>,
}

impl MasterService {
    pub fn new(master: Arc<ApplicationMaster>) -> Self {
        Self { master }
    }

    /// The master refuses work once its application has terminated.
    fn active(&self) -> Result<&ApplicationMaster, Status> {
        if self.master.tracker().is_terminal() {
            return Err(Status::unavailable(format!(
                "application {} has terminated",
                self.master.id()
            )));
        }

        Ok(&self.master)
    }
}

#[tonic::async_trait]
impl master_server::Master for MasterService {
    async fn get_specification(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<proto::ApplicationSpec>, Status> {
        let master = self.active()?;

        Ok(Response::new(proto::ApplicationSpec::from(master.spec())))
    }

    #[tracing::instrument(name = "MasterService::scale", skip_all, fields(
        service = %request.get_ref().service,
        instances = %request.get_ref().instances
    ))]
    async fn scale(
        &self,
        request: Request<ScaleRequest>,
    ) -> Result<Response<ContainerList>, Status> {
        let master = self.active()?;
        let request = request.into_inner();

        let containers = master
            .engine()
            .scale(&request.service, request.instances)
            .await?;

        Ok(Response::new(ContainerList::from(containers.as_slice())))
    }

    #[tracing::instrument(name = "MasterService::kill_container", skip_all, fields(
        id = %request.get_ref().id
    ))]
    async fn kill_container(
        &self,
        request: Request<proto::ContainerId>,
    ) -> Result<Response<Empty>, Status> {
        let master = self.active()?;

        master
            .engine()
            .kill_container(&request.into_inner().id)
            .await?;

        Ok(Response::new(Empty {}))
    }

    async fn get_containers(
        &self,
        request: Request<ContainersRequest>,
    ) -> Result<Response<ContainerList>, Status> {
        let master = self.active()?;
        let request = request.into_inner();

        let states = request
            .states
            .into_iter()
            .map(container_state_from_i32)
            .collect::<Result<Vec<ContainerState>>>()?;

        let containers = master
            .engine()
            .get_containers(&request.services, &states)
            .await?;

        Ok(Response::new(ContainerList::from(containers.as_slice())))
    }

    #[tracing::instrument(name = "MasterService::shutdown", skip_all, fields(
        final_status = %request.get_ref().final_status
    ))]
    async fn shutdown(
        &self,
        request: Request<ShutdownRequest>,
    ) -> Result<Response<Empty>, Status> {
        let master = self.active()?;
        let request = request.into_inner();

        let final_status: FinalStatus = final_status_from_i32(request.final_status)?;

        master.shutdown(final_status, &request.diagnostics).await?;

        Ok(Response::new(Empty {}))
    }

    async fn key_value_get(
        &self,
        request: Request<KeyRequest>,
    ) -> Result<Response<ValueResponse>, Status> {
        let value = self.active()?.key_value().get(&request.into_inner().key)?;

        Ok(Response::new(ValueResponse { value }))
    }

    async fn key_value_set(&self, request: Request<SetRequest>) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();

        self.active()?
            .key_value()
            .set(&request.key, &request.value)?;

        Ok(Response::new(Empty {}))
    }

    async fn key_value_delete(
        &self,
        request: Request<KeyRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.active()?
            .key_value()
            .delete(&request.into_inner().key)?;

        Ok(Response::new(Empty {}))
    }

    async fn key_value_wait(
        &self,
        request: Request<KeyRequest>,
    ) -> Result<Response<ValueResponse>, Status> {
        let value = self
            .active()?
            .key_value()
            .wait(&request.into_inner().key)
            .await?;

        Ok(Response::new(ValueResponse { value }))
    }

    async fn key_value_get_all(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<KeyValueMap>, Status> {
        let entries = self.active()?.key_value().to_map()?;

        Ok(Response::new(KeyValueMap { entries }))
    }
}

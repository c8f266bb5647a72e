//! SzConfig gRPC handler: configuration documents addressed by handle.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::support::{wire_id, ServiceCore, SubdomainService, HANDLER_MESSAGES};
use crate::engine::{EngineBinding, SzConfig};
use crate::observability::MessageLogger;
use crate::observer::ObserverRegistry;
use crate::proto::szconfig::sz_config_server::SzConfig as SzConfigRpc;
use crate::proto::szconfig::{
    AddDataSourceRequest, AddDataSourceResponse, CloseConfigRequest, CloseConfigResponse,
    CreateConfigRequest, CreateConfigResponse, DeleteDataSourceRequest, DeleteDataSourceResponse,
    ExportConfigRequest, ExportConfigResponse, GetDataSourcesRequest, GetDataSourcesResponse,
    ImportConfigRequest, ImportConfigResponse,
};
use crate::types::ConfigHandle;

pub const CONFIG_COMPONENT_ID: u32 = 6011;

#[derive(Debug)]
pub struct ConfigService {
    core: ServiceCore<dyn SzConfig>,
}

impl ConfigService {
    pub fn new(binding: Arc<EngineBinding<dyn SzConfig>>) -> Self {
        Self {
            core: ServiceCore::new(
                MessageLogger::new(CONFIG_COMPONENT_ID, "szconfigserver.", HANDLER_MESSAGES),
                binding,
            ),
        }
    }
}

#[async_trait]
impl SubdomainService for ConfigService {
    fn logger(&self) -> &Arc<MessageLogger> {
        self.core.logger()
    }

    fn observers(&self) -> &ObserverRegistry {
        self.core.binding().observers()
    }
}

#[tonic::async_trait]
impl SzConfigRpc for ConfigService {
    async fn add_data_source(
        &self,
        request: Request<AddDataSourceRequest>,
    ) -> std::result::Result<Response<AddDataSourceResponse>, Status> {
        let req = request.into_inner();
        let (handle, code) = (req.config_handle, req.data_source_code.clone());
        let result = self
            .core
            .call(
                1,
                "AddDataSource",
                &req,
                json!({ "configHandle": handle, "dataSourceCode": code }),
                move |config| config.add_data_source(wire_id(handle, ConfigHandle::new)?, &code),
            )
            .await?;
        Ok(Response::new(AddDataSourceResponse { result }))
    }

    async fn close_config(
        &self,
        request: Request<CloseConfigRequest>,
    ) -> std::result::Result<Response<CloseConfigResponse>, Status> {
        let req = request.into_inner();
        let handle = req.config_handle;
        self.core
            .call(3, "CloseConfig", &req, json!({ "configHandle": handle }), move |config| {
                config.close_config(wire_id(handle, ConfigHandle::new)?)
            })
            .await?;
        Ok(Response::new(CloseConfigResponse {}))
    }

    async fn create_config(
        &self,
        request: Request<CreateConfigRequest>,
    ) -> std::result::Result<Response<CreateConfigResponse>, Status> {
        let req = request.into_inner();
        let handle = self
            .core
            .call(5, "CreateConfig", &req, json!({}), |config| config.create_config())
            .await?;
        Ok(Response::new(CreateConfigResponse { result: handle.get() }))
    }

    async fn delete_data_source(
        &self,
        request: Request<DeleteDataSourceRequest>,
    ) -> std::result::Result<Response<DeleteDataSourceResponse>, Status> {
        let req = request.into_inner();
        let (handle, code) = (req.config_handle, req.data_source_code.clone());
        self.core
            .call(
                7,
                "DeleteDataSource",
                &req,
                json!({ "configHandle": handle, "dataSourceCode": code }),
                move |config| config.delete_data_source(wire_id(handle, ConfigHandle::new)?, &code),
            )
            .await?;
        Ok(Response::new(DeleteDataSourceResponse {}))
    }

    async fn export_config(
        &self,
        request: Request<ExportConfigRequest>,
    ) -> std::result::Result<Response<ExportConfigResponse>, Status> {
        let req = request.into_inner();
        let handle = req.config_handle;
        let result = self
            .core
            .call(9, "ExportConfig", &req, json!({ "configHandle": handle }), move |config| {
                config.export_config(wire_id(handle, ConfigHandle::new)?)
            })
            .await?;
        Ok(Response::new(ExportConfigResponse { result }))
    }

    async fn get_data_sources(
        &self,
        request: Request<GetDataSourcesRequest>,
    ) -> std::result::Result<Response<GetDataSourcesResponse>, Status> {
        let req = request.into_inner();
        let handle = req.config_handle;
        let result = self
            .core
            .call(11, "GetDataSources", &req, json!({ "configHandle": handle }), move |config| {
                config.get_data_sources(wire_id(handle, ConfigHandle::new)?)
            })
            .await?;
        Ok(Response::new(GetDataSourcesResponse { result }))
    }

    async fn import_config(
        &self,
        request: Request<ImportConfigRequest>,
    ) -> std::result::Result<Response<ImportConfigResponse>, Status> {
        let req = request.into_inner();
        let definition = req.config_definition.clone();
        let handle = self
            .core
            .call(13, "ImportConfig", &req, json!({}), move |config| {
                config.import_config(&definition)
            })
            .await?;
        Ok(Response::new(ImportConfigResponse { result: handle.get() }))
    }
}

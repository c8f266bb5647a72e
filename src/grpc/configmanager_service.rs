//! SzConfigManager gRPC handler: the persisted configuration repository.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::support::{wire_id, ServiceCore, SubdomainService, HANDLER_MESSAGES};
use crate::engine::{EngineBinding, SzConfigManager};
use crate::observability::MessageLogger;
use crate::observer::ObserverRegistry;
use crate::proto::szconfigmanager::sz_config_manager_server::SzConfigManager as SzConfigManagerRpc;
use crate::proto::szconfigmanager::{
    AddConfigRequest, AddConfigResponse, GetConfigRequest, GetConfigResponse, GetConfigsRequest,
    GetConfigsResponse, GetDefaultConfigIdRequest, GetDefaultConfigIdResponse,
    ReplaceDefaultConfigIdRequest, ReplaceDefaultConfigIdResponse, SetDefaultConfigIdRequest,
    SetDefaultConfigIdResponse,
};
use crate::types::ConfigId;

pub const CONFIG_MANAGER_COMPONENT_ID: u32 = 6012;

#[derive(Debug)]
pub struct ConfigManagerService {
    core: ServiceCore<dyn SzConfigManager>,
}

impl ConfigManagerService {
    pub fn new(binding: Arc<EngineBinding<dyn SzConfigManager>>) -> Self {
        Self {
            core: ServiceCore::new(
                MessageLogger::new(
                    CONFIG_MANAGER_COMPONENT_ID,
                    "szconfigmanagerserver.",
                    HANDLER_MESSAGES,
                ),
                binding,
            ),
        }
    }
}

#[async_trait]
impl SubdomainService for ConfigManagerService {
    fn logger(&self) -> &Arc<MessageLogger> {
        self.core.logger()
    }

    fn observers(&self) -> &ObserverRegistry {
        self.core.binding().observers()
    }
}

#[tonic::async_trait]
impl SzConfigManagerRpc for ConfigManagerService {
    async fn add_config(
        &self,
        request: Request<AddConfigRequest>,
    ) -> std::result::Result<Response<AddConfigResponse>, Status> {
        let req = request.into_inner();
        let (definition, comment) = (req.config_definition.clone(), req.config_comment.clone());
        let config_id = self
            .core
            .call(
                1,
                "AddConfig",
                &req,
                json!({ "configComment": comment }),
                move |manager| manager.add_config(&definition, &comment),
            )
            .await?;
        Ok(Response::new(AddConfigResponse {
            result: config_id.get(),
        }))
    }

    async fn get_config(
        &self,
        request: Request<GetConfigRequest>,
    ) -> std::result::Result<Response<GetConfigResponse>, Status> {
        let req = request.into_inner();
        let config_id = req.config_id;
        let result = self
            .core
            .call(3, "GetConfig", &req, json!({ "configId": config_id }), move |manager| {
                manager.get_config(wire_id(config_id, ConfigId::new)?)
            })
            .await?;
        Ok(Response::new(GetConfigResponse { result }))
    }

    async fn get_configs(
        &self,
        request: Request<GetConfigsRequest>,
    ) -> std::result::Result<Response<GetConfigsResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(5, "GetConfigs", &req, json!({}), |manager| manager.get_configs())
            .await?;
        Ok(Response::new(GetConfigsResponse { result }))
    }

    async fn get_default_config_id(
        &self,
        request: Request<GetDefaultConfigIdRequest>,
    ) -> std::result::Result<Response<GetDefaultConfigIdResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(7, "GetDefaultConfigId", &req, json!({}), |manager| {
                manager.get_default_config_id()
            })
            .await?;
        Ok(Response::new(GetDefaultConfigIdResponse { result }))
    }

    async fn replace_default_config_id(
        &self,
        request: Request<ReplaceDefaultConfigIdRequest>,
    ) -> std::result::Result<Response<ReplaceDefaultConfigIdResponse>, Status> {
        let req = request.into_inner();
        let (current, new) = (req.current_default_config_id, req.new_default_config_id);
        self.core
            .call(
                9,
                "ReplaceDefaultConfigId",
                &req,
                json!({ "currentDefaultConfigId": current, "newDefaultConfigId": new }),
                move |manager| {
                    manager.replace_default_config_id(current, wire_id(new, ConfigId::new)?)
                },
            )
            .await?;
        Ok(Response::new(ReplaceDefaultConfigIdResponse {}))
    }

    async fn set_default_config_id(
        &self,
        request: Request<SetDefaultConfigIdRequest>,
    ) -> std::result::Result<Response<SetDefaultConfigIdResponse>, Status> {
        let req = request.into_inner();
        let config_id = req.config_id;
        self.core
            .call(11, "SetDefaultConfigId", &req, json!({ "configId": config_id }), move |manager| {
                manager.set_default_config_id(wire_id(config_id, ConfigId::new)?)
            })
            .await?;
        Ok(Response::new(SetDefaultConfigIdResponse {}))
    }
}

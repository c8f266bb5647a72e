//! SzDiagnostic gRPC handler.
//!
//! `PurgeRepository` and `Reinitialize` are lifecycle-class calls and run
//! under the process lifecycle lock.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::support::{wire_id, ServiceCore, SubdomainService, HANDLER_MESSAGES};
use crate::engine::{EngineBinding, SzDiagnostic};
use crate::observability::MessageLogger;
use crate::observer::ObserverRegistry;
use crate::proto::szdiagnostic::sz_diagnostic_server::SzDiagnostic as SzDiagnosticRpc;
use crate::proto::szdiagnostic::{
    CheckDatastorePerformanceRequest, CheckDatastorePerformanceResponse, GetDatastoreInfoRequest,
    GetDatastoreInfoResponse, GetFeatureRequest, GetFeatureResponse, PurgeRepositoryRequest,
    PurgeRepositoryResponse, ReinitializeRequest, ReinitializeResponse,
};
use crate::types::ConfigId;

pub const DIAGNOSTIC_COMPONENT_ID: u32 = 6013;

#[derive(Debug)]
pub struct DiagnosticService {
    core: ServiceCore<dyn SzDiagnostic>,
}

impl DiagnosticService {
    pub fn new(binding: Arc<EngineBinding<dyn SzDiagnostic>>) -> Self {
        Self {
            core: ServiceCore::new(
                MessageLogger::new(DIAGNOSTIC_COMPONENT_ID, "szdiagnosticserver.", HANDLER_MESSAGES),
                binding,
            ),
        }
    }
}

#[async_trait]
impl SubdomainService for DiagnosticService {
    fn logger(&self) -> &Arc<MessageLogger> {
        self.core.logger()
    }

    fn observers(&self) -> &ObserverRegistry {
        self.core.binding().observers()
    }
}

#[tonic::async_trait]
impl SzDiagnosticRpc for DiagnosticService {
    async fn check_datastore_performance(
        &self,
        request: Request<CheckDatastorePerformanceRequest>,
    ) -> std::result::Result<Response<CheckDatastorePerformanceResponse>, Status> {
        let req = request.into_inner();
        let seconds = req.seconds_to_run;
        let result = self
            .core
            .call(
                1,
                "CheckDatastorePerformance",
                &req,
                json!({ "secondsToRun": seconds }),
                move |diagnostic| diagnostic.check_datastore_performance(seconds),
            )
            .await?;
        Ok(Response::new(CheckDatastorePerformanceResponse { result }))
    }

    async fn get_datastore_info(
        &self,
        request: Request<GetDatastoreInfoRequest>,
    ) -> std::result::Result<Response<GetDatastoreInfoResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(3, "GetDatastoreInfo", &req, json!({}), |diagnostic| {
                diagnostic.get_datastore_info()
            })
            .await?;
        Ok(Response::new(GetDatastoreInfoResponse { result }))
    }

    async fn get_feature(
        &self,
        request: Request<GetFeatureRequest>,
    ) -> std::result::Result<Response<GetFeatureResponse>, Status> {
        let req = request.into_inner();
        let feature_id = req.feature_id;
        let result = self
            .core
            .call(5, "GetFeature", &req, json!({ "featureId": feature_id }), move |diagnostic| {
                diagnostic.get_feature(feature_id)
            })
            .await?;
        Ok(Response::new(GetFeatureResponse { result }))
    }

    async fn purge_repository(
        &self,
        request: Request<PurgeRepositoryRequest>,
    ) -> std::result::Result<Response<PurgeRepositoryResponse>, Status> {
        let req = request.into_inner();
        self.core
            .call_lifecycle(7, "PurgeRepository", &req, json!({}), |diagnostic| {
                diagnostic.purge_repository()
            })
            .await?;
        Ok(Response::new(PurgeRepositoryResponse {}))
    }

    async fn reinitialize(
        &self,
        request: Request<ReinitializeRequest>,
    ) -> std::result::Result<Response<ReinitializeResponse>, Status> {
        let req = request.into_inner();
        let config_id = req.config_id;
        self.core
            .call_lifecycle(9, "Reinitialize", &req, json!({ "configId": config_id }), move |diagnostic| {
                diagnostic.reinitialize(wire_id(config_id, ConfigId::new)?)
            })
            .await?;
        Ok(Response::new(ReinitializeResponse {}))
    }
}

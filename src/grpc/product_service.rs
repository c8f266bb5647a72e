//! SzProduct gRPC handler.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status};

use super::support::{ServiceCore, SubdomainService, HANDLER_MESSAGES};
use crate::engine::{EngineBinding, SzProduct};
use crate::observability::MessageLogger;
use crate::observer::ObserverRegistry;
use crate::proto::szproduct::sz_product_server::SzProduct as SzProductRpc;
use crate::proto::szproduct::{
    GetLicenseRequest, GetLicenseResponse, GetVersionRequest, GetVersionResponse,
};

pub const PRODUCT_COMPONENT_ID: u32 = 6016;

#[derive(Debug)]
pub struct ProductService {
    core: ServiceCore<dyn SzProduct>,
}

impl ProductService {
    pub fn new(binding: Arc<EngineBinding<dyn SzProduct>>) -> Self {
        Self {
            core: ServiceCore::new(
                MessageLogger::new(PRODUCT_COMPONENT_ID, "szproductserver.", HANDLER_MESSAGES),
                binding,
            ),
        }
    }
}

#[async_trait]
impl SubdomainService for ProductService {
    fn logger(&self) -> &Arc<MessageLogger> {
        self.core.logger()
    }

    fn observers(&self) -> &ObserverRegistry {
        self.core.binding().observers()
    }
}

#[tonic::async_trait]
impl SzProductRpc for ProductService {
    async fn get_license(
        &self,
        request: Request<GetLicenseRequest>,
    ) -> std::result::Result<Response<GetLicenseResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(1, "GetLicense", &req, json!({}), |product| product.get_license())
            .await?;
        Ok(Response::new(GetLicenseResponse { result }))
    }

    async fn get_version(
        &self,
        request: Request<GetVersionRequest>,
    ) -> std::result::Result<Response<GetVersionResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .core
            .call(3, "GetVersion", &req, json!({}), |product| product.get_version())
            .await?;
        Ok(Response::new(GetVersionResponse { result }))
    }
}

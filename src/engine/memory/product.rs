use chrono::Utc;
use serde_json::json;

use super::SessionSlot;
use crate::engine::{EngineLifecycle, InitArgs, SzProduct};
use crate::types::Result;

#[derive(Debug, Default)]
pub struct MemoryProduct {
    session: SessionSlot,
}

impl MemoryProduct {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineLifecycle for MemoryProduct {
    fn initialize(&self, args: &InitArgs) -> Result<()> {
        self.session.open(args)?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.session.close()
    }
}

impl SzProduct for MemoryProduct {
    fn get_license(&self) -> Result<String> {
        let session = self.session.current()?;
        Ok(json!({
            "customer": session.instance_name,
            "contract": "",
            "issueDate": Utc::now().format("%Y-%m-%d").to_string(),
            "licenseType": "EVAL (Solely for non-productive use)",
            "licenseLevel": "STANDARD",
            "billing": "MONTHLY",
            "expireDate": "9999-12-31",
            "recordLimit": 500,
        })
        .to_string())
    }

    fn get_version(&self) -> Result<String> {
        self.session.current()?;
        Ok(json!({
            "PRODUCT_NAME": "sz-grpc-server in-process engine",
            "VERSION": env!("CARGO_PKG_VERSION"),
            "BUILD_VERSION": env!("CARGO_PKG_VERSION"),
            "COMPATIBILITY_VERSION": { "CONFIG_VERSION": "11" },
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::args;
    use super::*;

    #[test]
    fn test_version_reports_package() {
        let product = MemoryProduct::new();
        product.initialize(&args()).unwrap();
        let version: serde_json::Value = serde_json::from_str(&product.get_version().unwrap()).unwrap();
        assert_eq!(version["VERSION"], env!("CARGO_PKG_VERSION"));
        assert!(product.get_license().unwrap().contains("memory-test"));
    }

    #[test]
    fn test_destroy_then_call_is_unavailable() {
        let product = MemoryProduct::new();
        product.initialize(&args()).unwrap();
        product.destroy().unwrap();
        assert_eq!(product.get_version().unwrap_err().kind(), "unavailable");
        assert_eq!(product.destroy().unwrap_err().kind(), "unavailable");
    }
}

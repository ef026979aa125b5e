use anyhow::Result;
use std::collections::HashMap;

use crate::db::Store;
use crate::models::*;

/// Read-only snapshot of modules and their feature definitions
#[derive(Debug, Clone, Default)]
pub struct FeatureCatalog {
    modules: Vec<ModuleFeatures>,
    by_code: HashMap<String, FeatureDefinition>,
}

impl FeatureCatalog {
    pub fn new(modules: Vec<CatalogModule>, features: Vec<FeatureDefinition>) -> Self {
        let by_code = features
            .iter()
            .map(|f| (f.code.clone(), f.clone()))
            .collect();

        let modules = modules
            .into_iter()
            .map(|module| {
                let features = features
                    .iter()
                    .filter(|f| f.module_id == module.id)
                    .cloned()
                    .collect();
                ModuleFeatures { module, features }
            })
            .collect();

        Self { modules, by_code }
    }

    pub async fn load(store: &Store) -> Result<Self> {
        let modules = store.list_modules().await?;
        let features = store.list_features().await?;
        Ok(Self::new(modules, features))
    }

    pub fn modules(&self) -> &[ModuleFeatures] {
        &self.modules
    }

    pub fn feature(&self, code: &str) -> Option<&FeatureDefinition> {
        self.by_code.get(code)
    }

    pub fn requires_license(&self, code: &str) -> bool {
        self.feature(code).is_some_and(|f| f.requires_license)
    }

    /// Default values of every active feature in the given modules of a
    /// product. Modules may be named by id or by code.
    pub fn module_defaults(&self, product_id: &str, module_refs: &[String]) -> FeatureMap {
        self.modules
            .iter()
            .filter(|m| m.module.product_id == product_id)
            .filter(|m| module_refs.iter().any(|r| *r == m.module.id || *r == m.module.code))
            .flat_map(|m| m.features.iter())
            .filter(|f| f.is_active)
            .map(|f| (f.code.clone(), f.default_value))
            .collect()
    }
}

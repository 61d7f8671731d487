use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, ServeError};
use crate::model::{LoadedModel, ModelInfo};

pub type ModelMap = HashMap<String, Arc<LoadedModel>>;

/// Loaded models by name.
///
/// Readers get an immutable snapshot; registration and removal publish a new
/// map rather than editing the one readers may be holding.
pub struct ModelRegistry {
    snapshot: RwLock<Arc<ModelMap>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ModelRegistry {
    pub fn new(models: Vec<LoadedModel>) -> Self {
        let map: ModelMap = models
            .into_iter()
            .map(|m| (m.name().to_string(), Arc::new(m)))
            .collect();
        Self {
            snapshot: RwLock::new(Arc::new(map)),
        }
    }

    pub async fn snapshot(&self) -> Arc<ModelMap> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<LoadedModel>> {
        self.snapshot
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ServeError::ModelNotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.snapshot.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Describe every model, sorted by name.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let snapshot = self.snapshot().await;
        let mut infos: Vec<ModelInfo> = snapshot.values().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        infos
    }

    pub async fn insert(&self, model: LoadedModel) -> Result<Arc<LoadedModel>> {
        let mut guard = self.snapshot.write().await;
        if guard.contains_key(model.name()) {
            return Err(ServeError::Conflict(format!(
                "model '{}' is already registered",
                model.name()
            )));
        }

        let model = Arc::new(model);
        let mut next = ModelMap::clone(&guard);
        next.insert(model.name().to_string(), Arc::clone(&model));
        *guard = Arc::new(next);
        Ok(model)
    }

    /// Remove a model and stop it accepting new requests.
    ///
    /// Requests already holding the model keep it alive until they finish.
    pub async fn remove(&self, name: &str) -> Result<Arc<LoadedModel>> {
        let mut guard = self.snapshot.write().await;
        let mut next = ModelMap::clone(&guard);
        let model = next
            .remove(name)
            .ok_or_else(|| ServeError::ModelNotFound(name.to_string()))?;
        *guard = Arc::new(next);

        model.close();
        Ok(model)
    }

    /// Release every model. Returns how many were loaded.
    pub async fn clear(&self) -> usize {
        let mut guard = self.snapshot.write().await;
        let released = std::mem::take(&mut *guard);
        for model in released.values() {
            model.close();
        }
        released.len()
    }
}

//! One handle over an opened vault: store, backups, inference and SOS orchestration wired
//! from a single [`PhaitConfig`].

use crate::backup::BackupManager;
use crate::config::PhaitConfig;
use crate::error::PhaitResult;
use crate::inference::{InferenceGateway, InferenceModel, PlaceholderModel};
use crate::orchestrator::SosOrchestrator;
use crate::vault::VaultStore;
use std::sync::Arc;

#[derive(Debug)]
pub struct Phait {
    store: Arc<VaultStore>,
    backups: BackupManager,
    gateway: Arc<InferenceGateway>,
    sos: Arc<SosOrchestrator>,
}

impl Phait {
    /// Open with the placeholder model.
    pub fn open(config: PhaitConfig, secret: &str) -> PhaitResult<Self> {
        Self::open_with_model(config, secret, Arc::new(PlaceholderModel::new()))
    }

    pub fn open_with_model(
        config: PhaitConfig,
        secret: &str,
        model: Arc<dyn InferenceModel>,
    ) -> PhaitResult<Self> {
        let gateway = Arc::new(InferenceGateway::new(model, &config));
        if !gateway.model_available() {
            tracing::info!(
                target: "phait::inference",
                path = %gateway.model_path().display(),
                "no local model asset found"
            );
        }
        let store = Arc::new(VaultStore::open(config, secret)?);
        Ok(Self::from_parts(store, gateway))
    }

    /// Wire components around an already-open store (e.g. one returned by
    /// [`BackupManager::restore_into`]).
    pub fn from_parts(store: Arc<VaultStore>, gateway: Arc<InferenceGateway>) -> Self {
        let backups = BackupManager::new(Arc::clone(&store));
        let sos = SosOrchestrator::new(Arc::clone(&store), Arc::clone(&gateway));
        Self {
            store,
            backups,
            gateway,
            sos,
        }
    }

    pub fn config(&self) -> &PhaitConfig {
        self.store.config()
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn gateway(&self) -> &Arc<InferenceGateway> {
        &self.gateway
    }

    pub fn sos(&self) -> &Arc<SosOrchestrator> {
        &self.sos
    }

    /// Flush and wipe the master key.
    pub fn close(&self) -> PhaitResult<()> {
        self.store.close()
    }
}

//! Engine - wires the stores, locks and services together

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::config::{ConfigStore, JsonConfigStore, LaunchResolver, ServerLaunchResolver};
use super::health::HealthMonitor;
use super::instance::RuntimeState;
use super::lock::LockManager;
use super::process::ProcessSupervisor;
use super::reconcile::{ReconcileScheduler, Reconciler};
use super::settings::EngineSettings;
use super::validator::ProcessValidator;
use crate::error::Result;
use crate::persistence::StateStore;

/// One row of `status` output
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub name: String,
    /// Present in the instance configuration
    pub configured: bool,
    pub state: Option<RuntimeState>,
}

/// Shared handles used by commands and the daemon
pub struct Engine {
    settings: EngineSettings,
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    configs: Arc<dyn ConfigStore>,
    validator: Arc<ProcessValidator>,
    supervisor: Arc<ProcessSupervisor>,
    reconciler: Arc<Reconciler>,
}

impl Engine {
    /// Open the engine on the data directory named by `settings`
    pub fn open(settings: EngineSettings) -> Result<Self> {
        let configs: Arc<dyn ConfigStore> =
            Arc::new(JsonConfigStore::new(settings.get_instances_file()));
        let launcher = ServerLaunchResolver::new(settings.executable_path.clone())
            .with_args_template(settings.launch_args.clone());
        let executable_name = launcher.executable_name();
        Self::with_collaborators(settings, configs, Arc::new(launcher), executable_name)
    }

    /// Open with caller-supplied configuration and launch collaborators
    pub fn with_collaborators(
        settings: EngineSettings,
        configs: Arc<dyn ConfigStore>,
        launcher: Arc<dyn LaunchResolver>,
        executable_name: Option<String>,
    ) -> Result<Self> {
        let data_dir = settings.get_data_directory();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(settings.get_logs_directory())?;

        let store = StateStore::open(&settings.get_database_path())?;
        store.initialize()?;
        let store = Arc::new(store);
        debug!("State store ready at {:?}", settings.get_database_path());

        let locks = Arc::new(LockManager::from_settings(&settings)?);
        let validator = Arc::new(ProcessValidator::new(executable_name));
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&configs),
            launcher,
            Arc::clone(&validator),
            &settings,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&validator),
            Arc::clone(&configs),
            settings.lock_timeout(),
        ));

        info!("Engine initialized with data directory {:?}", data_dir);
        Ok(Self {
            settings,
            store,
            locks,
            configs,
            validator,
            supervisor,
            reconciler,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn configs(&self) -> &Arc<dyn ConfigStore> {
        &self.configs
    }

    pub fn validator(&self) -> &Arc<ProcessValidator> {
        &self.validator
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// A health monitor sized from the settings
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.store),
            Arc::clone(&self.configs),
            self.settings.probe_workers,
        )
    }

    /// A reconcile scheduler using the configured minimum interval
    ///
    /// Its run history lives in the state store, so every scheduler on the
    /// same data directory shares one rate limit.
    pub fn reconcile_scheduler(&self) -> ReconcileScheduler {
        ReconcileScheduler::new(
            Arc::clone(&self.reconciler),
            Arc::clone(&self.store),
            self.settings.reconcile_min_interval(),
        )
    }

    pub fn instance_status(&self, name: &str) -> Result<Option<RuntimeState>> {
        self.store.get_runtime(name)
    }

    /// Every configured instance plus any runtime row without configuration
    pub fn list_status(&self) -> Result<Vec<InstanceSummary>> {
        let mut rows: BTreeMap<String, InstanceSummary> = BTreeMap::new();
        for name in self.configs.list_instances()? {
            rows.insert(
                name.clone(),
                InstanceSummary {
                    name,
                    configured: true,
                    state: None,
                },
            );
        }
        for state in self.store.list_runtime()? {
            let name = state.name.clone();
            rows.entry(name.clone())
                .or_insert_with(|| InstanceSummary {
                    name,
                    configured: false,
                    state: None,
                })
                .state = Some(state);
        }
        Ok(rows.into_values().collect())
    }

    /// Number of instances whose runtime row is active
    pub fn active_instance_count(&self) -> Result<usize> {
        Ok(self
            .store
            .list_runtime()?
            .iter()
            .filter(|s| s.status.is_active())
            .count())
    }
}

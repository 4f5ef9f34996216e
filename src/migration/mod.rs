//! The migration service: ordered, stage-gated schema evolution.
//!
//! Each migration declares a semver version and reacts to application
//! lifecycle stages. At startup the service compares the stored library
//! version against the compiled-in one, activates every migration newer
//! than the stored version, and forwards each lifecycle stage to the
//! active set. When the final stage has been forwarded the stored version
//! is overwritten. Migration failure is the one fatal error class: the
//! library refuses to launch on it.

use crate::events::{ApplicationEvent, EventBus};
use crate::storage::{StorageService, VERSION_KEY};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

/// The compiled-in library version, written to storage once all
/// migrations for it have completed.
pub const LIBRARY_VERSION: &str = "1.0.0";

/// Lifecycle stages forwarded to migrations as the host progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStage {
    PreparingForLaunch,
    LoadedDatabase,
    StorageDecrypted,
    Launched,
    SignedIn,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration {version} failed: {message}")]
    Failed { version: String, message: String },

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Services a migration may touch while running.
pub struct MigrationHost {
    pub storage: Arc<StorageService>,
    pub events: Arc<EventBus>,
}

/// One versioned migration. Implementations register interest in stages
/// by matching on them in `handle_stage`.
pub trait Migration: Send + Sync {
    /// Semver of the library release this migration belongs to.
    fn version(&self) -> &'static str;

    fn handle_stage(
        &mut self,
        stage: ApplicationStage,
        host: &MigrationHost,
    ) -> Result<(), MigrationError>;
}

/// Compare two `x.y.z` strings numerically.
pub fn compare_semver(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> (u32, u32, u32) {
        let mut parts = v.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    };
    parse(a).cmp(&parse(b))
}

/// Always-on migration handling keychain repair and version-marker
/// bootstrap for clients predating the version marker.
struct BaseMigration;

impl BaseMigration {
    /// Runs before version comparison. A client with persisted state but
    /// no version marker predates the marker; it gets a floor version so
    /// every registered migration runs. Fresh installs start current.
    fn pre_run(&self, host: &MigrationHost) -> Result<(), MigrationError> {
        if host.storage.get_value::<String>(VERSION_KEY)?.is_some() {
            return Ok(());
        }
        let has_existing_state = host.storage.keychain_value()?.is_some()
            || !host.storage.load_all_payloads()?.is_empty();
        let baseline = if has_existing_state { "0.0.0" } else { LIBRARY_VERSION };
        debug!(baseline, "bootstrapping version marker");
        host.storage.set_value(VERSION_KEY, &baseline)?;
        Ok(())
    }

    fn handle_stage(
        &self,
        _stage: ApplicationStage,
        _host: &MigrationHost,
    ) -> Result<(), MigrationError> {
        Ok(())
    }
}

/// Orders and drives migrations across lifecycle stages.
pub struct MigrationService {
    host: MigrationHost,
    base: BaseMigration,
    active: Mutex<Vec<Box<dyn Migration>>>,
}

impl MigrationService {
    pub fn new(
        storage: Arc<StorageService>,
        events: Arc<EventBus>,
        registered: Vec<Box<dyn Migration>>,
    ) -> MigrationService {
        MigrationService {
            host: MigrationHost { storage, events },
            base: BaseMigration,
            active: Mutex::new(registered),
        }
    }

    /// Run the base pre-run and activate required migrations. Must be
    /// called before any stage is forwarded.
    pub fn initialize(&self) -> Result<(), MigrationError> {
        self.base.pre_run(&self.host)?;

        let stored = self
            .host
            .storage
            .get_value::<String>(VERSION_KEY)?
            .unwrap_or_else(|| "0.0.0".to_string());

        let mut active = self.active.lock().unwrap();
        active.retain(|m| compare_semver(m.version(), &stored) == std::cmp::Ordering::Greater);
        active.sort_by(|a, b| compare_semver(a.version(), b.version()));

        if !active.is_empty() {
            info!(
                count = active.len(),
                from = %stored,
                to = LIBRARY_VERSION,
                "migrations pending"
            );
        }
        self.host.events.publish(ApplicationEvent::MigrationsLoaded);
        Ok(())
    }

    /// True while required migrations remain.
    pub fn has_pending_migrations(&self) -> bool {
        !self.active.lock().unwrap().is_empty()
    }

    /// Forward a lifecycle stage to the base migration and every active
    /// migration, in version order. After the final stage the stored
    /// version advances.
    pub fn handle_stage(&self, stage: ApplicationStage) -> Result<(), MigrationError> {
        self.base.handle_stage(stage, &self.host)?;

        let mut active = self.active.lock().unwrap();
        for migration in active.iter_mut() {
            migration.handle_stage(stage, &self.host)?;
        }

        if stage == ApplicationStage::Launched {
            active.clear();
            self.host.storage.set_value(VERSION_KEY, &LIBRARY_VERSION)?;
        }
        Ok(())
    }
}

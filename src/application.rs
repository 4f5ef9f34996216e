//! The application container: explicit composition of every service.
//!
//! No process-wide singletons; two applications with different identifiers
//! share a device without seeing each other's data. Construction wires the
//! observer graph (payload manager → item manager → domain services) and
//! `launch` drives the migration stages and local data load.

use crate::api::{ApiClient, User};
use crate::challenge::ChallengeResponder;
use crate::device::DeviceInterface;
use crate::events::{ApplicationEvent, EventBus};
use crate::items::ItemManager;
use crate::keys::KeyRecoveryService;
use crate::migration::{ApplicationStage, Migration, MigrationService};
use crate::payload::{ContentType, Payload, PayloadManager, PayloadSource, RawPayload};
use crate::protocol::{EncryptionIntent, ProtocolService};
use crate::session::SessionService;
use crate::storage::StorageService;
use crate::sync::deltas::delta_file_import;
use crate::sync::{SyncMode, SyncOptions, SyncService, SyncStatus};
use crate::Result;
use std::sync::Arc;

/// One running library instance, bound to an application identifier.
pub struct Application {
    identifier: String,
    pub events: Arc<EventBus>,
    pub storage: Arc<StorageService>,
    pub payloads: Arc<PayloadManager>,
    pub items: Arc<ItemManager>,
    pub protocol: Arc<ProtocolService>,
    pub session: Arc<SessionService>,
    pub sync: Arc<SyncService>,
    pub key_recovery: Arc<KeyRecoveryService>,
    pub migrations: MigrationService,
}

impl Application {
    pub fn new(
        identifier: &str,
        device: Arc<dyn DeviceInterface>,
        api: Arc<dyn ApiClient>,
        challenges: Arc<dyn ChallengeResponder>,
    ) -> Arc<Application> {
        Self::with_migrations(identifier, device, api, challenges, Vec::new())
    }

    pub fn with_migrations(
        identifier: &str,
        device: Arc<dyn DeviceInterface>,
        api: Arc<dyn ApiClient>,
        challenges: Arc<dyn ChallengeResponder>,
        migrations: Vec<Box<dyn Migration>>,
    ) -> Arc<Application> {
        let events = Arc::new(EventBus::new());
        let storage = Arc::new(StorageService::new(
            device,
            identifier,
            Arc::clone(&events),
        ));
        let payloads = Arc::new(PayloadManager::new());
        let items = ItemManager::new(Arc::clone(&payloads));
        let protocol = ProtocolService::new(Arc::clone(&items));
        let session = SessionService::new(
            Arc::clone(&api),
            Arc::clone(&storage),
            Arc::clone(&protocol),
            Arc::clone(&payloads),
            Arc::clone(&challenges),
            Arc::clone(&events),
        );
        let sync = SyncService::new(
            Arc::clone(&payloads),
            Arc::clone(&protocol),
            Arc::clone(&storage),
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&events),
        );
        let key_recovery = KeyRecoveryService::new(
            Arc::clone(&payloads),
            Arc::clone(&items),
            Arc::clone(&protocol),
            Arc::clone(&storage),
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&sync),
            challenges,
            Arc::clone(&events),
        );
        let migrations =
            MigrationService::new(Arc::clone(&storage), Arc::clone(&events), migrations);

        Self::observe_items_key_arrivals(&payloads, &protocol);
        Self::observe_preference_changes(&payloads, &events);

        Arc::new(Application {
            identifier: identifier.to_string(),
            events,
            storage,
            payloads,
            items,
            protocol,
            session,
            sync,
            key_recovery,
            migrations,
        })
    }

    /// Payloads held back by a missing items key retry whenever a
    /// decrypted items key lands.
    fn observe_items_key_arrivals(payloads: &Arc<PayloadManager>, protocol: &Arc<ProtocolService>) {
        let payloads_ref = Arc::downgrade(payloads);
        let protocol_ref = Arc::downgrade(protocol);
        payloads.add_observer(move |outcome| {
            let (Some(payloads), Some(protocol)) =
                (payloads_ref.upgrade(), protocol_ref.upgrade())
            else {
                return;
            };
            let key_arrived = outcome.applied().any(|p| {
                p.content_type == ContentType::ItemsKey && p.is_decrypted() && !p.deleted
            });
            if !key_arrived {
                return;
            }

            let waiting: Vec<Payload> = payloads
                .all_payloads()
                .into_iter()
                .filter(|p| p.waiting_for_key)
                .collect();
            if waiting.is_empty() {
                return;
            }

            let retried: Vec<Payload> = waiting
                .iter()
                .map(|p| protocol.decrypt_payload(p))
                .filter(|p| !p.waiting_for_key)
                .collect();
            if !retried.is_empty() {
                payloads.emit_payloads(retried, PayloadSource::DecryptedTransient);
            }
        });
    }

    fn observe_preference_changes(payloads: &Arc<PayloadManager>, events: &Arc<EventBus>) {
        let events_ref = Arc::downgrade(events);
        payloads.add_observer(move |outcome| {
            let Some(events) = events_ref.upgrade() else { return };
            if outcome
                .applied()
                .any(|p| p.content_type == ContentType::UserPreferences)
            {
                events.publish(ApplicationEvent::PreferencesChanged);
            }
        });
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Drive migrations and local data loading through the launch stages.
    /// Migration failure is fatal; the library refuses to launch.
    pub fn launch(&self) -> Result<()> {
        self.events.publish(ApplicationEvent::Started);

        self.migrations.initialize()?;
        self.migrations
            .handle_stage(ApplicationStage::PreparingForLaunch)?;

        let stored = self.storage.load_all_payloads()?;
        if !stored.is_empty() {
            self.payloads
                .emit_payloads(stored, PayloadSource::LocalRetrieved);
        }
        self.migrations
            .handle_stage(ApplicationStage::LoadedDatabase)?;
        self.events.publish(ApplicationEvent::LocalDataLoaded);

        self.session.restore()?;

        let undecrypted: Vec<Payload> = self
            .payloads
            .all_payloads()
            .into_iter()
            .filter(|p| !p.is_decrypted() && !p.content.is_absent())
            .collect();
        if !undecrypted.is_empty() {
            let decrypted = self.protocol.decrypt_payloads(&undecrypted);
            self.payloads
                .emit_payloads(decrypted, PayloadSource::DecryptedTransient);
        }
        self.migrations
            .handle_stage(ApplicationStage::StorageDecrypted)?;
        self.events.publish(ApplicationEvent::StorageReady);

        self.key_recovery.restore();

        self.migrations.handle_stage(ApplicationStage::Launched)?;
        self.events.publish(ApplicationEvent::Launched);

        if self.session.is_signed_in() {
            self.migrations.handle_stage(ApplicationStage::SignedIn)?;
        }
        Ok(())
    }

    /// Register a new account and upload the initial state.
    pub fn register(&self, email: &str, password: &str) -> Result<User> {
        let user = self.session.register(email, password)?;
        self.sync.sync(SyncOptions::default())?;
        self.migrations.handle_stage(ApplicationStage::SignedIn)?;
        Ok(user)
    }

    /// Sign in and run an initial-mode sync so existing items keys are
    /// discovered before anything new is created.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let user = self.session.sign_in(email, password)?;
        self.sync.sync(SyncOptions {
            mode: SyncMode::Initial,
            ..Default::default()
        })?;
        self.migrations.handle_stage(ApplicationStage::SignedIn)?;
        Ok(user)
    }

    /// Change the account password and re-upload everything under the new
    /// key hierarchy.
    pub fn change_password(&self, current: &str, new: &str) -> Result<()> {
        self.session.change_password(current, new)?;
        self.sync.sync(SyncOptions::default())?;
        Ok(())
    }

    pub fn sign_out(&self) -> Result<()> {
        self.session.sign_out()?;
        Ok(())
    }

    /// Export every live item as a decrypted backup record (`000`
    /// framing).
    pub fn export_decrypted_backup(&self) -> Result<Vec<RawPayload>> {
        let mut records = Vec::new();
        for payload in self.payloads.all_payloads() {
            if payload.deleted {
                continue;
            }
            let framed = self
                .protocol
                .encrypt_payload(&payload, EncryptionIntent::FileDecrypted)
                .map_err(crate::CoreError::Crypto)?;
            records.push(framed.to_wire());
        }
        Ok(records)
    }

    /// Import backup records. Uuid collisions never overwrite local data;
    /// the imported copy lands as a `conflict_of` duplicate. Returns the
    /// number of items touched.
    pub fn import_backup(&self, records: Vec<RawPayload>) -> Result<usize> {
        let decrypted: Vec<Payload> = records
            .into_iter()
            .map(Payload::from_raw)
            .map(|p| self.protocol.decrypt_payload(&p))
            .collect();

        let base = self.payloads.master_collection();
        let result = delta_file_import(&base, &decrypted);
        let outcome = self
            .payloads
            .emit_payloads(result.into_payloads(), PayloadSource::FileImport);
        Ok(outcome.touched())
    }

    /// Run a default sync.
    pub fn sync_now(&self) -> Result<SyncStatus> {
        Ok(self.sync.sync(SyncOptions::default())?)
    }
}

//! End-to-end scenarios against the in-memory device and mock server.

mod support;

use cipherpad_core::challenge::ScriptedChallengeResponder;
use cipherpad_core::events::ApplicationEvent;
use cipherpad_core::items::MutationType;
use cipherpad_core::payload::{ContentType, ItemContent};
use cipherpad_core::sync::{SyncMode, SyncOptions, TimingStrategy};
use cipherpad_core::{Application, ApiClient, ChallengeResponder, DeviceInterface, MemoryDevice};
use serde_json::json;
use std::sync::Arc;
use support::{EventRecorder, MockServer};

const EMAIL: &str = "user@example.org";
const PASSWORD: &str = "correct horse battery staple";

fn build_app(
    server: &Arc<MockServer>,
    device: &Arc<MemoryDevice>,
    identifier: &str,
) -> Arc<Application> {
    let app = Application::new(
        identifier,
        Arc::clone(device) as Arc<dyn DeviceInterface>,
        Arc::clone(server) as Arc<dyn ApiClient>,
        Arc::new(ScriptedChallengeResponder::new()) as Arc<dyn ChallengeResponder>,
    );
    app.launch().expect("launch");
    app
}

fn note_content(title: &str, text: &str) -> ItemContent {
    ItemContent {
        title: Some(title.to_string()),
        text: Some(text.to_string()),
        ..Default::default()
    }
}

fn note_count(app: &Application) -> usize {
    app.items.items_of_type(&ContentType::Note).len()
}

#[test]
fn register_sign_out_sign_in_roundtrip() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());
    let app = build_app(&server, &device, "app");

    let user = app.register(EMAIL, PASSWORD).expect("register");
    app.sign_out().expect("sign out");
    assert!(!app.session.is_signed_in());

    assert!(app.sign_in(EMAIL, "not the password").is_err());

    let again = app.sign_in(EMAIL, PASSWORD).expect("sign in");
    assert_eq!(user.uuid, again.uuid);
    assert!(app.session.is_signed_in());
}

#[test]
fn notes_survive_sign_in_on_fresh_device() {
    let server = MockServer::new();
    let device_a = Arc::new(MemoryDevice::new());
    let app_a = build_app(&server, &device_a, "app");

    app_a.register(EMAIL, PASSWORD).unwrap();
    for i in 0..3 {
        app_a
            .items
            .create_item(ContentType::Note, note_content(&format!("note {}", i), "body"))
            .unwrap();
    }
    app_a.sync_now().unwrap();

    // A different machine signs in and downloads everything.
    let device_b = Arc::new(MemoryDevice::new());
    let app_b = build_app(&server, &device_b, "app");
    app_b.sign_in(EMAIL, PASSWORD).unwrap();

    assert_eq!(note_count(&app_b), 3);
    assert!(app_b.items.invalid_items().is_empty());

    // Dirty flags cleared and server timestamps applied after upload.
    for item in app_a.items.items_of_type(&ContentType::Note) {
        assert!(!item.dirty());
        assert!(item.updated_at() > 0);
    }
}

#[test]
fn change_password_with_105_items() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());
    let app = build_app(&server, &device, "app");
    let recorder = EventRecorder::attach(&app.events);

    app.register(EMAIL, PASSWORD).unwrap();
    for i in 0..105 {
        app.items
            .create_item(
                ContentType::Note,
                note_content(&format!("note {}", i), "text"),
            )
            .unwrap();
    }
    app.sync_now().unwrap();
    assert!(recorder.contains(ApplicationEvent::MajorDataChange));

    let new_password = "an entirely different passphrase";
    app.change_password(PASSWORD, new_password).unwrap();

    // Everything re-uploaded under the new hierarchy.
    assert!(app.payloads.dirty_payloads().is_empty());

    app.sign_out().unwrap();

    let fresh_device = Arc::new(MemoryDevice::new());
    let fresh = build_app(&server, &fresh_device, "app");
    fresh.sign_in(EMAIL, new_password).unwrap();

    assert_eq!(note_count(&fresh), 105);
    assert!(fresh.items.invalid_items().is_empty());
}

#[test]
fn preference_persists_across_sign_in() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());
    let app = build_app(&server, &device, "app");

    app.register(EMAIL, PASSWORD).unwrap();
    let prefs = app
        .items
        .create_item(ContentType::UserPreferences, ItemContent::default())
        .unwrap();
    app.items
        .change_item(&prefs.uuid(), MutationType::UserInteraction, |mutator| {
            mutator.set_preference("editorLeft", json!(300));
        })
        .unwrap();
    app.sync_now().unwrap();
    app.sign_out().unwrap();

    let fresh_device = Arc::new(MemoryDevice::new());
    let fresh = build_app(&server, &fresh_device, "app");
    fresh.sign_in(EMAIL, PASSWORD).unwrap();

    let restored = fresh
        .items
        .items_of_type(&ContentType::UserPreferences)
        .pop()
        .expect("preferences item downloaded");
    assert_eq!(
        restored.preferences().unwrap().value("editorLeft"),
        Some(&json!(300))
    );

    // A fresh install that never registered has no preference item at all;
    // callers fall back to their defaults.
    let clean_device = Arc::new(MemoryDevice::new());
    let clean = build_app(&server, &clean_device, "app");
    assert!(clean
        .items
        .items_of_type(&ContentType::UserPreferences)
        .is_empty());
}

#[test]
fn concurrent_edits_duplicate_into_conflict_copy() {
    let server = MockServer::new();
    let device_a = Arc::new(MemoryDevice::new());
    let app_a = build_app(&server, &device_a, "app");

    app_a.register(EMAIL, PASSWORD).unwrap();
    let note = app_a
        .items
        .create_item(ContentType::Note, note_content("shared", "original"))
        .unwrap();
    let note_uuid = note.uuid();
    app_a.sync_now().unwrap();

    // A second device edits the same note and uploads first.
    let device_b = Arc::new(MemoryDevice::new());
    let app_b = build_app(&server, &device_b, "app");
    app_b.sign_in(EMAIL, PASSWORD).unwrap();
    app_b
        .items
        .change_item(&note_uuid, MutationType::UserInteraction, |mutator| {
            mutator.set_text("server wins this round");
        })
        .unwrap();
    app_b.sync_now().unwrap();

    // Meanwhile the first device edits offline, then syncs.
    app_a
        .items
        .change_item(&note_uuid, MutationType::UserInteraction, |mutator| {
            mutator.set_text("local edits");
        })
        .unwrap();
    app_a.sync_now().unwrap();

    let notes = app_a.items.items_of_type(&ContentType::Note);
    assert_eq!(notes.len(), 2);

    let canonical = app_a.items.item(&note_uuid).expect("canonical survives");
    assert_eq!(canonical.note().unwrap().text(), "server wins this round");
    assert!(!canonical.dirty());

    let duplicate = notes
        .iter()
        .find(|item| item.uuid() != note_uuid)
        .expect("conflict duplicate exists");
    assert_eq!(duplicate.conflict_of(), Some(note_uuid));
    assert_eq!(duplicate.note().unwrap().text(), "local edits");

    // The duplicate was re-uploaded by the chained sync.
    assert!(app_a.payloads.dirty_payloads().is_empty());
    assert_eq!(server.live_item_count(EMAIL), 3); // items key + 2 notes
}

#[test]
fn integrity_divergence_enters_and_exits_out_of_sync() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());
    let app = build_app(&server, &device, "app");
    let recorder = EventRecorder::attach(&app.events);

    app.register(EMAIL, PASSWORD).unwrap();
    let note = app
        .items
        .create_item(ContentType::Note, note_content("n", "body"))
        .unwrap();
    app.sync_now().unwrap();

    server.corrupt_touch_item(EMAIL, &note.uuid());

    let checked = SyncOptions {
        mode: SyncMode::Default,
        timing: TimingStrategy::ResolveOnNext,
        check_integrity: true,
    };
    for _ in 0..7 {
        app.sync.sync(checked).unwrap();
    }

    assert!(app.sync.is_out_of_sync());
    assert!(recorder.contains(ApplicationEvent::EnteredOutOfSync));

    app.sync.resolve_out_of_sync().unwrap();

    assert!(!app.sync.is_out_of_sync());
    assert!(recorder.contains(ApplicationEvent::ExitedOutOfSync));
}

#[test]
fn never_uploaded_deletions_are_discarded_locally() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());
    let app = build_app(&server, &device, "app");

    app.register(EMAIL, PASSWORD).unwrap();
    let note = app
        .items
        .create_item(ContentType::Note, note_content("ephemeral", ""))
        .unwrap();
    let uuid = note.uuid();
    app.items.set_item_deleted(&uuid).unwrap();

    app.sync_now().unwrap();

    assert!(app.payloads.get(&uuid).is_none());
    // Only the items key reached the server.
    assert_eq!(server.live_item_count(EMAIL), 1);
}

#[test]
fn offline_rounds_persist_and_reload_without_an_account() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());

    {
        let app = build_app(&server, &device, "app");
        app.items
            .create_item(ContentType::Note, note_content("offline", "kept locally"))
            .unwrap();
        app.sync_now().unwrap();
        assert!(app.payloads.dirty_payloads().is_empty());
    }

    // Relaunch over the same device: data comes back from local storage.
    let reopened = build_app(&server, &device, "app");
    assert_eq!(note_count(&reopened), 1);
    let item = &reopened.items.items_of_type(&ContentType::Note)[0];
    assert_eq!(item.note().unwrap().text(), "kept locally");
}

#[test]
fn items_waiting_for_key_resolve_when_key_arrives() {
    let server = MockServer::new();
    let device_a = Arc::new(MemoryDevice::new());
    let app_a = build_app(&server, &device_a, "app");

    app_a.register(EMAIL, PASSWORD).unwrap();
    for i in 0..20 {
        app_a
            .items
            .create_item(ContentType::Note, note_content(&format!("n{}", i), "x"))
            .unwrap();
    }
    app_a.sync_now().unwrap();

    // A fresh sign-in downloads notes and keys together; notes held in
    // waiting-for-key state must all resolve once the key lands.
    let device_b = Arc::new(MemoryDevice::new());
    let app_b = build_app(&server, &device_b, "app");
    app_b.sign_in(EMAIL, PASSWORD).unwrap();

    assert_eq!(note_count(&app_b), 20);
    assert!(app_b
        .payloads
        .all_payloads()
        .iter()
        .all(|p| !p.waiting_for_key));
    assert!(app_b.items.invalid_items().is_empty());
}

#[test]
fn backup_export_import_roundtrip_and_collision() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());
    let app = build_app(&server, &device, "app");

    app.register(EMAIL, PASSWORD).unwrap();
    app.items
        .create_item(ContentType::Note, note_content("backed up", "contents"))
        .unwrap();
    app.sync_now().unwrap();

    let backup = app.export_decrypted_backup().unwrap();
    assert!(backup
        .iter()
        .all(|record| match &record.content {
            Some(serde_json::Value::String(s)) => s.starts_with("000"),
            _ => false,
        }));

    // Importing into an empty offline instance restores the items.
    let other_device = Arc::new(MemoryDevice::new());
    let other = build_app(&server, &other_device, "app");
    other.import_backup(backup.clone()).unwrap();
    assert_eq!(note_count(&other), 1);
    assert_eq!(
        other.items.items_of_type(&ContentType::Note)[0]
            .note()
            .unwrap()
            .text(),
        "contents"
    );
    // Imported items are dirty, pending upload.
    assert!(!other.payloads.dirty_payloads().is_empty());

    // Importing again collides on uuid and duplicates instead of
    // overwriting.
    other.import_backup(backup).unwrap();
    let notes = other.items.items_of_type(&ContentType::Note);
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().any(|n| n.conflict_of().is_some()));
}

#[test]
fn two_namespaces_coexist_on_one_device() {
    let server = MockServer::new();
    let device = Arc::new(MemoryDevice::new());

    let first = build_app(&server, &device, "first");
    let second = build_app(&server, &device, "second");

    first
        .items
        .create_item(ContentType::Note, note_content("mine", ""))
        .unwrap();
    first.sync_now().unwrap();

    assert_eq!(note_count(&first), 1);
    assert_eq!(note_count(&second), 0);

    let reopened_second = build_app(&server, &device, "second");
    assert_eq!(note_count(&reopened_second), 0);
}

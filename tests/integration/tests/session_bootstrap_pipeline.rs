use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use herald_cache::{FixedMemoryProbe, TIER_MESSAGES, TIER_USERS};
use herald_migration::MigrationConfig;
use herald_runtime::{run_session, BotRuntime, RuntimeConfig, OWNER_CACHE_KEY};
use herald_session::{
    ConnectionManagerConfig, CredentialStore, DisconnectReason, IdentifierResolver,
    InboundMessage, LiveSession, SessionConnector, SessionEvent,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

const KNOWN: &str = "111111@s.whatsapp.net";
const ORPHAN: &str = "222222@s.whatsapp.net";
const OWNER: &str = "999999@s.whatsapp.net";

struct DirectoryResolver {
    known: HashMap<String, String>,
    calls: AtomicUsize,
}

impl DirectoryResolver {
    fn new() -> Self {
        let known = [(KNOWN, "abc@lid"), (OWNER, "owner@lid")]
            .into_iter()
            .map(|(legacy, new_id)| (legacy.to_string(), new_id.to_string()))
            .collect();
        Self {
            known,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IdentifierResolver for DirectoryResolver {
    async fn resolve(&self, legacy_id: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.known.get(legacy_id).cloned())
    }
}

struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<SessionEvent>>>,
    senders: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    resolver: Arc<DirectoryResolver>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Vec<SessionEvent>>, resolver: Arc<DirectoryResolver>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::from(scripts)),
            senders: Mutex::new(Vec::new()),
            resolver,
            connects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, _credentials: &CredentialStore) -> Result<LiveSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(32);
        for event in script {
            tx.send(event).await.expect("scripted event");
        }
        // Keep the sender alive so the session stays open after the script.
        self.senders.lock().expect("senders lock").push(tx);
        Ok(LiveSession {
            events: rx,
            resolver: self.resolver.clone(),
        })
    }
}

fn message(id: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        chat_id: "group-1".to_string(),
        sender_id: KNOWN.to_string(),
        timestamp_unix_ms: 1,
        payload: json!({"text": format!("hello {id}")}),
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).expect("read record")).expect("json")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn integration_open_runs_migration_then_ingests_across_reconnect() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = temp.path().join("store");
    std::fs::create_dir_all(&store).expect("store dir");
    let group = store.join("group.json");
    std::fs::write(&group, json!({"members": [KNOWN, ORPHAN]}).to_string()).expect("seed group");
    std::fs::write(
        store.join(format!("{ORPHAN}.json")),
        json!({"xp": 10}).to_string(),
    )
    .expect("seed orphan user");

    let resolver = Arc::new(DirectoryResolver::new());
    let connector = Arc::new(ScriptedConnector::new(
        vec![
            vec![
                SessionEvent::Open,
                SessionEvent::Inbound(vec![message("m1"), message("m2"), message("m3")]),
                SessionEvent::Close(DisconnectReason::RestartRequired),
            ],
            vec![SessionEvent::Open, SessionEvent::Inbound(vec![message("m4")])],
        ],
        Arc::clone(&resolver),
    ));

    let mut config = RuntimeConfig::new(temp.path().join("auth"));
    config.migration = Some(MigrationConfig::new(&store));
    config.owner_legacy_id = Some(OWNER.to_string());
    config.max_workers = 2;
    let runtime = BotRuntime::with_probe(config, Arc::new(FixedMemoryProbe::new(1, 1_000)))
        .expect("runtime");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let session_task = tokio::spawn(run_session(
        Arc::clone(&runtime),
        connector.clone(),
        ConnectionManagerConfig::default(),
        CredentialStore::new(temp.path().join("auth")),
        async move {
            let _ = stop_rx.await;
        },
    ));

    wait_until(|| runtime.bootstrap_runs() == 2 && runtime.queue().stats().total_processed == 4)
        .await;

    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    assert!(runtime.is_listener_attached());
    assert_eq!(runtime.cache().len(TIER_MESSAGES).expect("messages"), 4);
    assert_eq!(
        runtime
            .cache()
            .get_as::<String>(TIER_USERS, OWNER_CACHE_KEY)
            .expect("owner"),
        Some("owner@lid".to_string())
    );

    assert_eq!(read_json(&group), json!({"members": ["abc@lid"]}));
    assert!(!store.join(format!("{ORPHAN}.json")).exists());
    let second_migration = runtime.last_migration().expect("migration report");
    assert_eq!(second_migration.candidates, 0);
    assert!(second_migration.is_noop());

    stop_tx.send(()).expect("stop");
    let report = session_task
        .await
        .expect("join")
        .expect("session shutdown");
    assert!(report.drained);
    assert_eq!(report.queue.total_processed, 4);
    assert_eq!(report.queue.total_errors, 0);
    assert!(report.queue.peak_active_workers <= 2);
    assert_eq!(runtime.cache().total_entries(), 0);
}

#[tokio::test(start_paused = true)]
async fn integration_critical_memory_pressure_runs_emergency_cleanup_after_open() {
    let temp = tempfile::tempdir().expect("tempdir");
    let media = temp.path().join("media");
    std::fs::create_dir_all(media.join("stickers")).expect("media dir");
    std::fs::write(media.join("stickers").join("a.webp"), vec![0_u8; 64]).expect("media file");

    let resolver = Arc::new(DirectoryResolver::new());
    let connector = Arc::new(ScriptedConnector::new(
        vec![vec![SessionEvent::Open]],
        Arc::clone(&resolver),
    ));
    let mut config = RuntimeConfig::new(temp.path().join("auth"));
    config.media_dirs = vec![media.clone()];
    let runtime = BotRuntime::with_probe(config, Arc::new(FixedMemoryProbe::new(990, 1_000)))
        .expect("runtime");
    runtime
        .cache()
        .set(TIER_USERS, "cached", &json!({"warm": true}), None)
        .expect("seed cache");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let session_task = tokio::spawn(run_session(
        Arc::clone(&runtime),
        connector,
        ConnectionManagerConfig::default(),
        CredentialStore::new(temp.path().join("auth")),
        async move {
            let _ = stop_rx.await;
        },
    ));

    wait_until(|| runtime.emergency().completed_runs() >= 1).await;
    assert!(!media.join("stickers").join("a.webp").exists());
    assert!(media.join("stickers").is_dir());
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);

    stop_tx.send(()).expect("stop");
    session_task
        .await
        .expect("join")
        .expect("session shutdown");
}

//! Shared fixtures for gateway integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use gatehouse_core::config::{AuthConfig, ControlPlaneConfig, GatewayConfig, SchedulerConfig};
use gatehouse_core::{AgentRunner, ConnId, RunInput, RunOutput, RunnerError};
use gatehouse_gateway::{ConnectionHandle, ConnectionRecord, Gateway, Role};
use gatehouse_term::testing::FakeSpawner;

pub const ADMIN_TOKEN: &str = "admin-secret-token-0123456789";
pub const CONTROL_TOKEN: &str = "control-secret-token-0123456789";

/// Runner that records every call and answers with a fixed reply.
pub struct RecordingRunner {
    pub calls: Mutex<Vec<(String, RunInput)>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn session_keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl AgentRunner for RecordingRunner {
    async fn run(&self, session_key: &str, input: RunInput) -> Result<RunOutput, RunnerError> {
        self.calls
            .lock()
            .unwrap()
            .push((session_key.to_string(), input));
        Ok(RunOutput {
            text: "recorded-reply".to_string(),
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

/// A gateway over a tempdir with admin + control-plane tokens configured
/// and schedulers disabled.
pub fn test_gateway() -> (
    tempfile::TempDir,
    Arc<Gateway>,
    Arc<RecordingRunner>,
    Arc<FakeSpawner>,
) {
    let tmp = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        state_dir: tmp.path().join("state"),
        auth: AuthConfig {
            admin_token: Some(ADMIN_TOKEN.to_string()),
        },
        control_plane: ControlPlaneConfig {
            token: Some(CONTROL_TOKEN.to_string()),
        },
        scheduler: SchedulerConfig { enabled: false },
        ..GatewayConfig::default()
    };
    let runner = RecordingRunner::new();
    let spawner = Arc::new(FakeSpawner::new());
    let gateway = Gateway::new(
        config,
        Arc::clone(&runner) as Arc<dyn AgentRunner>,
        Arc::clone(&spawner) as _,
    )
    .unwrap();
    (tmp, gateway, runner, spawner)
}

/// Register a fake client connection directly with the registry.
pub fn fake_connection(
    gateway: &Arc<Gateway>,
    tenant_token: Option<&str>,
    scopes: &[&str],
) -> (ConnectionHandle, mpsc::Receiver<String>) {
    let tenant = tenant_token.map(|token| {
        gateway
            .registry
            .validate_token(token)
            .unwrap()
            .expect("valid tenant token")
    });
    let record = ConnectionRecord {
        conn_id: ConnId::new(),
        tenant,
        remote_ip: None,
        role: Role::Operator,
        scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
    };
    let (tx, rx) = mpsc::channel(64);
    let handle = ConnectionHandle::new(record, tx);
    gateway.connections.add_client(handle.clone());
    (handle, rx)
}

/// Dispatch one frame and return the decoded response.
pub async fn call(
    gateway: &Arc<Gateway>,
    handle: &ConnectionHandle,
    rx: &mut mpsc::Receiver<String>,
    method: &str,
    params: Value,
) -> Value {
    let frame = serde_json::json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "method": method,
        "params": params,
    })
    .to_string();
    let task = gateway
        .dispatcher
        .dispatch(gateway, handle, &frame)
        .expect("dispatch returns a task");
    task.await.unwrap();
    // Broadcast events (e.g. cron start/finish) share this connection's
    // frame channel with RPC responses; skip any non-response frames to
    // find the one this call actually triggered.
    loop {
        let raw = rx.recv().await.expect("response frame");
        let value: Value = serde_json::from_str(&raw).unwrap();
        if value.get("ok").is_some() {
            return value;
        }
    }
}

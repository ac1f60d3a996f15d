//! Shared harness: a fully wired orchestrator on in-memory collaborators

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

use tether_core::config::OrchestratorConfig;
use tether_core::types::RemoteMachine;
use tether_orchestrator::keychain::MemoryKeychain;
use tether_orchestrator::session::SessionExit;
use tether_orchestrator::testsupport::{
    FailingStore, FakeExecutor, FakeForwarder, FakeLauncher, MemoryRemoteFiles,
};
use tether_orchestrator::{api, Collaborators, OrchestratorState};

pub const MACHINE: &str = "machine-123";

pub struct Harness {
    pub state: Arc<OrchestratorState>,
    pub launcher: Arc<FakeLauncher>,
    pub forwarder: Arc<FakeForwarder>,
    pub executor: Arc<FakeExecutor>,
    pub files: Arc<MemoryRemoteFiles>,
    pub store: Arc<FailingStore>,
    pub exits: mpsc::UnboundedReceiver<SessionExit>,
}

pub fn harness() -> Harness {
    let mut config = OrchestratorConfig::default();
    config.machines.push(RemoteMachine::new(MACHINE, "10.0.0.5", "ops"));

    let launcher = Arc::new(FakeLauncher::new());
    let forwarder = Arc::new(FakeForwarder::new());
    let executor = Arc::new(FakeExecutor::new());
    let files = Arc::new(MemoryRemoteFiles::new());
    let store = Arc::new(FailingStore::new());

    let (state, exits) = OrchestratorState::with_collaborators(
        config,
        Arc::new(MemoryKeychain::new()),
        Collaborators {
            launcher: launcher.clone(),
            forwarder: forwarder.clone(),
            executor: executor.clone(),
            files: files.clone(),
            store: store.clone(),
        },
    );

    Harness {
        state: Arc::new(state),
        launcher,
        forwarder,
        executor,
        files,
        store,
        exits,
    }
}

impl Harness {
    /// Open a streaming response without reading its body
    pub async fn open(&self, uri: &str) -> Response<Body> {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        api::router(self.state.clone()).oneshot(request).await.unwrap()
    }

    /// Send one request through a fresh router
    pub async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = api::router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}

// Test doubles: scripted backends and a one-shot HTTP server

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

use super::{Artifact, Backend, BackendError, VerificationMode};
use crate::engine::CancelToken;
use crate::models::step::{BackendKind, Capabilities, Target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
    pub relaxed: bool,
}

/// Backend whose acquire/install results are scripted per call.
///
/// An exhausted script succeeds, unless `fail_install_always` was set.
pub struct ScriptedBackend {
    kind: BackendKind,
    caps: Capabilities,
    available: bool,
    acquire_script: Mutex<VecDeque<Result<(), BackendError>>>,
    install_script: Mutex<VecDeque<Result<(), BackendError>>>,
    install_default: Option<BackendError>,
    calls: Mutex<Vec<Call>>,
    repairs: AtomicU32,
    cancel_on_install: Option<CancelToken>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        let idempotent = matches!(kind, BackendKind::SystemPackage | BackendKind::SandboxedApp);
        Self {
            kind,
            caps: Capabilities {
                checks_availability: true,
                needs_network: true,
                idempotent,
                relaxable: kind != BackendKind::SandboxedApp,
            },
            available: true,
            acquire_script: Mutex::new(VecDeque::new()),
            install_script: Mutex::new(VecDeque::new()),
            install_default: None,
            calls: Mutex::new(Vec::new()),
            repairs: AtomicU32::new(0),
            cancel_on_install: None,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn acquire_results(self, results: Vec<Result<(), BackendError>>) -> Self {
        if let Ok(mut q) = self.acquire_script.lock() {
            q.extend(results);
        }
        self
    }

    pub fn install_results(self, results: Vec<Result<(), BackendError>>) -> Self {
        if let Ok(mut q) = self.install_script.lock() {
            q.extend(results);
        }
        self
    }

    pub fn fail_install_always(mut self, err: BackendError) -> Self {
        self.install_default = Some(err);
        self
    }

    /// Request cancellation from inside every install call (simulates Ctrl-C mid-step).
    pub fn cancel_during_install(mut self, token: CancelToken) -> Self {
        self.cancel_on_install = Some(token);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    pub fn repair_count(&self) -> u32 {
        self.repairs.load(Ordering::SeqCst)
    }

    fn record(&self, op: &'static str, target: &Target, mode: VerificationMode) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                op,
                target: target.label(),
                relaxed: mode.is_relaxed(),
            });
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn acquire(
        &self,
        target: &Target,
        mode: VerificationMode,
    ) -> Result<Artifact, BackendError> {
        self.record("acquire", target, mode);
        let next = self
            .acquire_script
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(Ok(()));
        next.map(|_| Artifact::Resolved {
            name: target.label(),
            version: Some("1.0".to_string()),
            already_installed: false,
        })
    }

    async fn install(
        &self,
        target: &Target,
        _artifact: &Artifact,
        mode: VerificationMode,
    ) -> Result<(), BackendError> {
        self.record("install", target, mode);
        if let Some(token) = &self.cancel_on_install {
            token.cancel();
        }
        let scripted = self.install_script.lock().ok().and_then(|mut q| q.pop_front());
        match scripted {
            Some(result) => result,
            None => match &self.install_default {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        }
    }

    async fn repair(&self) -> Result<(), BackendError> {
        self.repairs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn read_request(sock: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Serve the given `(status, body)` responses, one connection each, on an ephemeral port.
/// Returns the base URL (`http://127.0.0.1:<port>`).
pub async fn serve_http(responses: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            read_request(&mut sock).await;
            let reason = reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Unknown");
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                body.len(),
                body
            );
            let _ = sock.write_all(response.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });

    format!("http://{}", addr)
}

/// Accept one connection and stop talking for `stall`. With `send_headers` the server first
/// answers 200 and the first 5 bytes of a 1 KiB body; otherwise it never answers at all.
pub async fn serve_stalling_http(send_headers: bool, stall: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        read_request(&mut sock).await;
        if send_headers {
            let head = concat!(
                "HTTP/1.1 200 OK\r\n",
                "Content-Type: application/octet-stream\r\n",
                "Content-Length: 1024\r\n\r\n",
                "hello"
            );
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.flush().await;
        }
        tokio::time::sleep(stall).await;
    });

    format!("http://{}", addr)
}

//! The kernel launch contract, and a loopback reference engine.
//!
//! ## Contract
//!
//! Interpreter engines and the worker spawn mechanism are host concerns with
//! fixed contracts; the manager consumes them through [`KernelLauncher`]:
//! given a [`LaunchSpec`], produce a [`LaunchedKernel`] — the manager-side
//! transport half plus, when the host supports shared memory, the one-byte
//! interrupt region the engine polls at its safe points.
//!
//! A launched kernel is not usable until it has sent `READY`;
//! [`wait_ready`] awaits the handshake with a deadline.
//!
//! ## Loopback engine
//!
//! [`LoopbackLauncher`] bundles a transport-faithful engine for tests,
//! benches, and the smoke CLI. It interprets a miniature line-directive
//! language instead of a real guest language:
//!
//! | Directive | Effect |
//! |---|---|
//! | `print:<text>` | stdout stream chunk |
//! | `eprint:<text>` | stderr stream chunk |
//! | `display:<mime>:<payload>` | display-data event |
//! | `result:<text>` | sets the execute-result payload |
//! | `error:<ename>:<evalue>` | terminal execute-error |
//! | `sleep:<ms>` | sleeps, polling for interrupt at safe points |
//! | `spin` | runs until interrupted or disposed |
//! | `# …` / blank | ignored |
//! | anything else | echoed to stdout |
//!
//! Directive boundaries (and 10 ms slices of `sleep`/`spin`) are the
//! engine's safe points: it drains its request queue and checks the
//! interrupt region there, exactly as a real interpreter checks at bytecode
//! boundaries or loop back-edges.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};

use crate::events::{KernelEvent, MimeBundle, StreamName};
use crate::interrupt::{self, InterruptRegion};
use crate::transport::{duplex, EngineEndpoint, WorkerReply, WorkerRequest, WorkerTransport};
use crate::types::{KernelLanguage, KernelMode, MountConfig};

/// Deadline for the `READY` handshake during create and restart.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the loopback engine visits a safe point inside `sleep`/`spin`.
const SAFE_POINT_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a launcher needs to build one kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub mode: KernelMode,
    pub language: KernelLanguage,
    /// Opaque to the manager; forwarded to the interpreter runtime.
    pub mount: Option<MountConfig>,
}

/// A freshly launched kernel, not yet `READY`-awaited.
#[derive(Debug)]
pub struct LaunchedKernel {
    pub transport: WorkerTransport,
    /// `None` when the host provides no shared memory; interrupt delivery
    /// then falls back to the in-band message.
    pub interrupt_region: Option<InterruptRegion>,
}

/// Launch failure; wraps the underlying cause as a message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LaunchError {
    message: String,
}

impl LaunchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The fixed contract the manager consumes from the host runtime.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedKernel, LaunchError>;
}

/// Awaits the `READY` handshake on a freshly launched kernel.
pub async fn wait_ready(
    transport: &mut WorkerTransport,
    timeout: Duration,
) -> Result<(), LaunchError> {
    match time::timeout(timeout, transport.recv()).await {
        Ok(Some(WorkerReply::Ready)) => Ok(()),
        Ok(Some(_)) => Err(LaunchError::new("kernel emitted events before READY")),
        Ok(None) => Err(LaunchError::new("worker exited before READY")),
        Err(_) => Err(LaunchError::new("timed out waiting for READY")),
    }
}

// ── Loopback launcher ────────────────────────────────────────────────────────

/// Reference launcher spawning loopback engines on the host runtime.
#[derive(Debug, Clone)]
pub struct LoopbackLauncher {
    shared_interrupt: bool,
}

impl LoopbackLauncher {
    /// Engines poll a shared-memory interrupt region (the fast path).
    pub fn new() -> Self {
        Self {
            shared_interrupt: true,
        }
    }

    /// Engines observe interrupts via the in-band message fallback only,
    /// as on hosts without shared memory.
    pub fn without_shared_interrupt() -> Self {
        Self {
            shared_interrupt: false,
        }
    }
}

impl Default for LoopbackLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelLauncher for LoopbackLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedKernel, LaunchError> {
        let (transport, endpoint) = duplex();
        let region = self.shared_interrupt.then(interrupt::new_region);
        tracing::debug!(mode = %spec.mode, language = %spec.language, "launching loopback engine");
        let engine = LoopbackEngine::new(endpoint, region.clone());
        tokio::spawn(engine.run());
        Ok(LaunchedKernel {
            transport,
            interrupt_region: region,
        })
    }
}

// ── Loopback engine internals ────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Directive {
    Print(String),
    Eprint(String),
    Display { mime: String, payload: String },
    Result(String),
    Error { ename: String, evalue: String },
    Sleep(u64),
    Spin,
    Echo(String),
}

/// Parses one script line. `None` for blank lines and comments.
fn parse_directive(line: &str) -> Option<Directive> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if let Some(text) = trimmed.strip_prefix("print:") {
        return Some(Directive::Print(text.to_string()));
    }
    if let Some(text) = trimmed.strip_prefix("eprint:") {
        return Some(Directive::Eprint(text.to_string()));
    }
    if let Some(rest) = trimmed.strip_prefix("display:") {
        let (mime, payload) = rest.split_once(':').unwrap_or((rest, ""));
        return Some(Directive::Display {
            mime: mime.to_string(),
            payload: payload.to_string(),
        });
    }
    if let Some(text) = trimmed.strip_prefix("result:") {
        return Some(Directive::Result(text.to_string()));
    }
    if let Some(rest) = trimmed.strip_prefix("error:") {
        let (ename, evalue) = rest.split_once(':').unwrap_or((rest, ""));
        return Some(Directive::Error {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
        });
    }
    if let Some(ms) = trimmed.strip_prefix("sleep:") {
        if let Ok(ms) = ms.parse::<u64>() {
            return Some(Directive::Sleep(ms));
        }
    }
    if trimmed == "spin" {
        return Some(Directive::Spin);
    }
    Some(Directive::Echo(trimmed.to_string()))
}

enum SafePoint {
    Continue,
    Interrupted,
    Disposed,
}

enum ScriptEnd {
    Completed,
    Disposed,
}

struct LoopbackEngine {
    endpoint: EngineEndpoint,
    region: Option<InterruptRegion>,
    execution_count: u64,
    pending_interrupt: bool,
    /// Executes drained at a safe point while another execution was running.
    deferred: VecDeque<(String, u64)>,
}

impl LoopbackEngine {
    fn new(endpoint: EngineEndpoint, region: Option<InterruptRegion>) -> Self {
        Self {
            endpoint,
            region,
            execution_count: 0,
            pending_interrupt: false,
            deferred: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        if !self.endpoint.ready().await {
            return;
        }
        loop {
            let request = if let Some((code, execution_id)) = self.deferred.pop_front() {
                WorkerRequest::Execute { code, execution_id }
            } else {
                match self.endpoint.next_request().await {
                    Some(request) => request,
                    None => return,
                }
            };
            match request {
                WorkerRequest::Execute { code, execution_id } => {
                    if let ScriptEnd::Disposed = self.execute(&code, execution_id).await {
                        return;
                    }
                }
                // Idle interrupt: nothing is running, success no-op.
                WorkerRequest::Interrupt => {}
                WorkerRequest::Dispose => return,
            }
        }
    }

    async fn execute(&mut self, code: &str, execution_id: u64) -> ScriptEnd {
        self.execution_count += 1;
        // A request delivered while idle must not abort the next execution.
        if let Some(region) = &self.region {
            interrupt::clear(region);
        }
        self.pending_interrupt = false;

        let mut result_value: Option<String> = None;
        for line in code.lines() {
            match self.safe_point() {
                SafePoint::Disposed => return ScriptEnd::Disposed,
                SafePoint::Interrupted => return self.abort_interrupted(execution_id).await,
                SafePoint::Continue => {}
            }
            let Some(directive) = parse_directive(line) else {
                continue;
            };
            match directive {
                Directive::Print(text) => {
                    self.emit_stream(execution_id, StreamName::Stdout, text).await;
                }
                Directive::Eprint(text) => {
                    self.emit_stream(execution_id, StreamName::Stderr, text).await;
                }
                Directive::Display { mime, payload } => {
                    let mut data = MimeBundle::new();
                    data.insert(mime, serde_json::Value::String(payload));
                    self.endpoint
                        .emit(
                            execution_id,
                            KernelEvent::DisplayData {
                                data,
                                metadata: MimeBundle::new(),
                            },
                        )
                        .await;
                }
                Directive::Result(text) => {
                    result_value = Some(text);
                }
                Directive::Error { ename, evalue } => {
                    self.endpoint
                        .emit(
                            execution_id,
                            KernelEvent::ExecuteError {
                                ename,
                                evalue,
                                traceback: vec![format!("execution {execution_id}")],
                            },
                        )
                        .await;
                    return ScriptEnd::Completed;
                }
                Directive::Sleep(ms) => {
                    let deadline = Instant::now() + Duration::from_millis(ms);
                    loop {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let slice = SAFE_POINT_INTERVAL.min(deadline - now);
                        time::sleep(slice).await;
                        match self.safe_point() {
                            SafePoint::Disposed => return ScriptEnd::Disposed,
                            SafePoint::Interrupted => {
                                return self.abort_interrupted(execution_id).await;
                            }
                            SafePoint::Continue => {}
                        }
                    }
                }
                Directive::Spin => loop {
                    time::sleep(SAFE_POINT_INTERVAL).await;
                    match self.safe_point() {
                        SafePoint::Disposed => return ScriptEnd::Disposed,
                        SafePoint::Interrupted => {
                            return self.abort_interrupted(execution_id).await;
                        }
                        SafePoint::Continue => {}
                    }
                },
                Directive::Echo(line) => {
                    self.emit_stream(execution_id, StreamName::Stdout, line).await;
                }
            }
        }

        let mut data = MimeBundle::new();
        data.insert(
            "text/plain".to_string(),
            serde_json::Value::String(result_value.unwrap_or_default()),
        );
        self.endpoint
            .emit(
                execution_id,
                KernelEvent::ExecuteResult {
                    data,
                    metadata: MimeBundle::new(),
                    execution_count: self.execution_count,
                },
            )
            .await;
        ScriptEnd::Completed
    }

    /// Drains the request queue and checks the interrupt region.
    fn safe_point(&mut self) -> SafePoint {
        while let Some(request) = self.endpoint.poll_request() {
            match request {
                WorkerRequest::Interrupt => self.pending_interrupt = true,
                WorkerRequest::Dispose => return SafePoint::Disposed,
                WorkerRequest::Execute { code, execution_id } => {
                    self.deferred.push_back((code, execution_id));
                }
            }
        }
        let region_requested = self
            .region
            .as_ref()
            .map(interrupt::is_requested)
            .unwrap_or(false);
        if region_requested || self.pending_interrupt {
            if let Some(region) = &self.region {
                interrupt::clear(region);
            }
            self.pending_interrupt = false;
            return SafePoint::Interrupted;
        }
        SafePoint::Continue
    }

    async fn abort_interrupted(&mut self, execution_id: u64) -> ScriptEnd {
        self.endpoint
            .emit(
                execution_id,
                KernelEvent::ExecuteError {
                    ename: "Interrupted".to_string(),
                    evalue: "execution interrupted at safe point".to_string(),
                    traceback: Vec::new(),
                },
            )
            .await;
        ScriptEnd::Completed
    }

    async fn emit_stream(&mut self, execution_id: u64, name: StreamName, text: String) {
        self.endpoint
            .emit(
                execution_id,
                KernelEvent::Stream {
                    name,
                    text: format!("{text}\n"),
                },
            )
            .await;
    }
}

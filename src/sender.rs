// ============================================================================
// GRAPHITE SENDER
// ============================================================================
// `GraphiteRunner` owns the dispatch queue, every registered target and the
// single UDP transport. Its drain loop wakes on a fixed tick and sends until
// the queue is empty. Delivery is fire-and-forget: a failed send is logged
// and the point is gone.
// ============================================================================

use std::fmt::Debug;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use crate::config::GraphiteConfig;
use crate::error::{SenderError, SenderResult};
use crate::queue::{DispatchQueue, QueueStatsSnapshot};
use crate::schedule::{LoopControl, Periodic, PeriodicTimer};
use crate::target::{TargetDirectory, TargetHandle};

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// Carries one wire line to the collector.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(&self, payload: &[u8]) -> io::Result<()>;
}

/// One UDP datagram per line.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    collector: SocketAddr,
}

impl UdpTransport {
    /// Resolve the collector once and bind a local socket of the same family.
    pub async fn connect(host: &str, port: u16) -> SenderResult<Self> {
        let resolve_error = |message: String| SenderError::Resolve {
            host: host.to_string(),
            port,
            message,
        };
        let collector = lookup_host((host, port))
            .await
            .map_err(|e| resolve_error(e.to_string()))?
            .next()
            .ok_or_else(|| resolve_error("no addresses returned".into()))?;

        let local: SocketAddr = if collector.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        info!(target: "sqlgraphite::sender", collector = %collector, "Collector socket ready");
        Ok(Self { socket, collector })
    }

    pub fn collector(&self) -> SocketAddr {
        self.collector
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.collector).await.map(|_| ())
    }
}

// ----------------------------------------------------------------------------
// Console
// ----------------------------------------------------------------------------

/// Terminal progress sink.
pub trait Console: Send + Sync + Debug {
    fn write(&self, text: &str);
}

#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn write(&self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

/// Echo and silent are independent.
#[derive(Debug, Default)]
pub struct ConsoleFlags {
    echo: AtomicBool,
    silent: AtomicBool,
}

impl ConsoleFlags {
    pub fn new(echo: bool, silent: bool) -> Self {
        Self {
            echo: AtomicBool::new(echo),
            silent: AtomicBool::new(silent),
        }
    }

    pub fn echo(&self) -> bool {
        self.echo.load(AtomicOrdering::Relaxed)
    }

    pub fn silent(&self) -> bool {
        self.silent.load(AtomicOrdering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// Sender Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SenderCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    idle_ticks: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderStats {
    pub sent: u64,
    pub failed: u64,
    pub idle_ticks: u64,
    pub queue: QueueStatsSnapshot,
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// The drain loop state. Only the sender timer and `quit` ever touch it.
#[derive(Debug)]
pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
    transport: Option<Arc<dyn Transport>>,
    console: Arc<dyn Console>,
    flags: Arc<ConsoleFlags>,
    counters: Arc<SenderCounters>,
}

impl Dispatcher {
    /// Send until the queue reports empty. Returns the number of points
    /// taken off the queue.
    pub async fn drain(&mut self) -> usize {
        let Some(transport) = self.transport.clone() else {
            return 0;
        };
        let silent = self.flags.silent();
        let echo = self.flags.echo();

        let mut drained = 0;
        while let Some(point) = self.queue.pop() {
            let line = point.to_line();
            if !silent {
                self.console.write(if echo { &line } else { "*" });
            }
            match transport.send(line.as_bytes()).await {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(target: "sqlgraphite::sender", path = %point.path(), error = %e, "Send failed");
                }
            }
            drained += 1;
        }

        if drained == 0 {
            self.counters.idle_ticks.fetch_add(1, AtomicOrdering::Relaxed);
            if !silent {
                self.console.write(".");
            }
        }
        drained
    }

    /// Drop the transport, closing the socket.
    fn release(&mut self) {
        self.transport = None;
    }
}

#[async_trait]
impl Periodic for Dispatcher {
    async fn on_tick(&mut self) -> LoopControl {
        self.drain().await;
        LoopControl::Continue
    }
}

// ----------------------------------------------------------------------------
// Graphite Runner
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct GraphiteRunner {
    host: String,
    port: u16,
    queue: Arc<DispatchQueue>,
    targets: Vec<TargetHandle>,
    directory: Arc<TargetDirectory>,
    console: Arc<dyn Console>,
    flags: Arc<ConsoleFlags>,
    counters: Arc<SenderCounters>,
    dispatcher: Option<Arc<TokioMutex<Dispatcher>>>,
    timer: PeriodicTimer,
}

impl GraphiteRunner {
    pub fn new(config: &GraphiteConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            queue: Arc::new(DispatchQueue::new()),
            targets: Vec::new(),
            directory: Arc::new(TargetDirectory::new()),
            console: Arc::new(StdoutConsole),
            flags: Arc::new(ConsoleFlags::new(config.echo, config.silent)),
            counters: Arc::new(SenderCounters::default()),
            dispatcher: None,
            timer: PeriodicTimer::new("sender", config.send_interval),
        }
    }

    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    /// Register a target under its canonical name. Duplicates are logged and
    /// rejected.
    pub fn add_target(&mut self, handle: TargetHandle) -> bool {
        if !self.directory.register(handle.name(), handle.view()) {
            error!(target: "sqlgraphite::sender", target_name = %handle.name(),
                "Cannot add the same target to the runner twice. Address the attached target directly to change its metrics");
            return false;
        }
        debug!(target: "sqlgraphite::sender", target_name = %handle.name(), "Target registered");
        self.targets.push(handle);
        true
    }

    pub fn target(&self, name: &str) -> Option<&TargetHandle> {
        let name = crate::types::canonical_target_name(name);
        self.targets.iter().find(|t| t.name() == name)
    }

    pub fn targets(&self) -> &[TargetHandle] {
        &self.targets
    }

    /// Live target views, for resolving formulas.
    pub fn directory(&self) -> Arc<TargetDirectory> {
        Arc::clone(&self.directory)
    }

    pub fn queue(&self) -> Arc<DispatchQueue> {
        Arc::clone(&self.queue)
    }

    pub fn set_echo(&self, echo: bool) {
        self.flags.echo.store(echo, AtomicOrdering::Relaxed);
    }

    pub fn set_silent(&self, silent: bool) {
        self.flags.silent.store(silent, AtomicOrdering::Relaxed);
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            sent: self.counters.sent.load(AtomicOrdering::Relaxed),
            failed: self.counters.failed.load(AtomicOrdering::Relaxed),
            idle_ticks: self.counters.idle_ticks.load(AtomicOrdering::Relaxed),
            queue: self.queue.stats(),
        }
    }

    /// Open the UDP transport, start every target and the drain loop.
    pub async fn start(&mut self) -> SenderResult<()> {
        let transport = UdpTransport::connect(&self.host, self.port).await?;
        self.start_with(Arc::new(transport)).await;
        Ok(())
    }

    /// Start over an already-open transport.
    pub async fn start_with(&mut self, transport: Arc<dyn Transport>) {
        for handle in &mut self.targets {
            handle.start(Arc::clone(&self.queue)).await;
        }
        self.dispatcher = Some(Arc::new(TokioMutex::new(Dispatcher {
            queue: Arc::clone(&self.queue),
            transport: Some(transport),
            console: Arc::clone(&self.console),
            flags: Arc::clone(&self.flags),
            counters: Arc::clone(&self.counters),
        })));
        info!(target: "sqlgraphite::sender", targets = self.targets.len(), host = %self.host,
            port = self.port, "Runner started");
        self.run();
    }

    /// Resume the drain loop. Targets keep their own timers.
    pub fn run(&mut self) -> bool {
        match &self.dispatcher {
            Some(dispatcher) => self.timer.start(Arc::clone(dispatcher)),
            None => {
                warn!(target: "sqlgraphite::sender", "Runner has not been started");
                false
            }
        }
    }

    /// Stop the drain loop. Points keep accumulating in the queue.
    pub async fn pause(&mut self) {
        self.timer.stop().await;
        debug!(target: "sqlgraphite::sender", depth = self.queue.len(), "Sender paused");
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Stop all producers, send everything still queued, then release the
    /// socket. Returns how many points the final drain sent.
    pub async fn quit(&mut self) -> usize {
        join_all(self.targets.iter_mut().map(|t| t.quit())).await;
        self.timer.stop().await;

        let Some(dispatcher) = self.dispatcher.take() else {
            return 0;
        };
        let mut dispatcher = dispatcher.lock().await;
        let drained = dispatcher.drain().await;
        dispatcher.release();

        let stats = self.stats();
        info!(target: "sqlgraphite::sender", drained, sent = stats.sent, failed = stats.failed,
            "Runner stopped");
        drained
    }
}

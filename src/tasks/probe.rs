use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::HealthRegistry;

/// One periodically checked dependency.
///
/// `check` returns the details to report on success. Errors and panics are
/// caught by the loop and reported as unhealthy; they never reach the caller.
#[rocket::async_trait]
pub trait Probe: Send + Sync + 'static {
    fn component(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn check(&self) -> anyhow::Result<String>;
}

/// Run `probe` until `cancel` fires: check, report, sleep, repeat.
///
/// Once cancellation is observed the loop never writes to the registry
/// again, even if a check was in flight.
pub async fn run_probe(probe: Arc<dyn Probe>, registry: HealthRegistry, cancel: CancellationToken) {
    let component = probe.component().to_string();
    let mut was_healthy: Option<bool> = None;
    info!("Probe {} started, interval {:?}", component, probe.interval());

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = AssertUnwindSafe(probe.check()).catch_unwind() => outcome,
        };
        if cancel.is_cancelled() {
            break;
        }

        let (healthy, details) = match outcome {
            Ok(Ok(details)) => (true, details),
            Ok(Err(e)) => (false, format!("{e:#}")),
            Err(panic) => {
                let details = format!("probe panicked: {}", panic_message(panic.as_ref()));
                error!("Probe {}: {}", component, details);
                (false, details)
            }
        };

        match (was_healthy, healthy) {
            (Some(true) | None, false) => warn!("Probe {} unhealthy: {}", component, details),
            (Some(false), true) => info!("Probe {} recovered: {}", component, details),
            _ => debug!("Probe {}: healthy={} {}", component, healthy, details),
        }
        was_healthy = Some(healthy);
        registry.update(&component, healthy, details);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(probe.interval()) => {}
        }
    }

    debug!("Probe {} stopped", component);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// The probes of one process, sharing a cancellation token.
pub struct ProbeSet {
    registry: HealthRegistry,
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl ProbeSet {
    pub fn new(registry: HealthRegistry) -> Self {
        Self {
            registry,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn spawn<P: Probe>(&mut self, probe: P) {
        let component = probe.component().to_string();
        let task = tokio::spawn(run_probe(
            Arc::new(probe),
            self.registry.clone(),
            self.cancel.child_token(),
        ));
        self.tasks.push((component, task));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every probe and wait until each loop has exited.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (component, task) in self.tasks {
            if let Err(e) = task.await {
                error!("Probe {} task ended abnormally: {}", component, e);
            }
        }
        info!("All probes stopped");
    }
}

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, anyhow};
use log::info;
use rocket::config::LogLevel;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Build, Orbit, Rocket, State, get, routes};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::registry::{AggregateStatus, HealthRegistry, HealthSnapshot};

/// Shape of the `/healthy` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthWire {
    /// Always `200 {"status":"ok"}` once the listener is up.
    Minimal,
    /// `200`/`503` with every component's record.
    #[default]
    Full,
}

impl FromStr for HealthWire {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(HealthWire::Minimal),
            "full" => Ok(HealthWire::Full),
            other => Err(format!("expected minimal or full, got {other}")),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum HealthBody {
    Minimal { status: AggregateStatus },
    Full(HealthSnapshot),
}

#[get("/healthy")]
fn healthy(
    registry: &State<HealthRegistry>,
    wire: &State<HealthWire>,
) -> (Status, Json<HealthBody>) {
    match wire.inner() {
        HealthWire::Minimal => (
            Status::Ok,
            Json(HealthBody::Minimal {
                status: AggregateStatus::Ok,
            }),
        ),
        HealthWire::Full => {
            let snapshot = registry.snapshot();
            let status = if snapshot.is_healthy() {
                Status::Ok
            } else {
                Status::ServiceUnavailable
            };
            (status, Json(HealthBody::Full(snapshot)))
        }
    }
}

/// Listener settings: all interfaces, no rocket request logging, and no
/// signal handling of its own since the service decides when to stop it.
pub fn listener_config(port: u16) -> rocket::Config {
    rocket::Config {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
        workers: 2,
        log_level: LogLevel::Off,
        shutdown: rocket::config::Shutdown {
            ctrlc: false,
            #[cfg(unix)]
            signals: HashSet::new(),
            grace: 1,
            mercy: 1,
            ..Default::default()
        },
        ..rocket::Config::default()
    }
}

pub fn build_rocket(
    config: rocket::Config,
    registry: HealthRegistry,
    wire: HealthWire,
) -> Rocket<Build> {
    rocket::custom(config)
        .manage(registry)
        .manage(wire)
        .mount("/", routes![healthy])
}

/// Reports the bound port once rocket is actually listening.
struct BoundSignal {
    tx: Mutex<Option<oneshot::Sender<u16>>>,
}

#[rocket::async_trait]
impl Fairing for BoundSignal {
    fn info(&self) -> Info {
        Info {
            name: "Health Listener Bound",
            kind: Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(rocket.config().port);
        }
    }
}

/// Running `/healthy` listener.
pub struct HealthServer {
    port: u16,
    shutdown: rocket::Shutdown,
    task: JoinHandle<Result<(), String>>,
}

impl HealthServer {
    /// Launch the listener on its own task and return once the socket is
    /// bound, so that probes started afterwards are never ahead of it.
    pub async fn start(
        port: u16,
        registry: HealthRegistry,
        wire: HealthWire,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = oneshot::channel();

        let rocket = build_rocket(listener_config(port), registry, wire)
            .attach(BoundSignal {
                tx: Mutex::new(Some(tx)),
            })
            .ignite()
            .await
            .map_err(|e| anyhow!("health endpoint failed to ignite: {e}"))?;

        let shutdown = rocket.shutdown();
        let task = tokio::spawn(async move {
            rocket
                .launch()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        });

        match rx.await {
            Ok(bound) => {
                info!("Health endpoint listening on port {}", bound);
                Ok(Self {
                    port: bound,
                    shutdown,
                    task,
                })
            }
            Err(_) => {
                let reason = match task.await {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => "listener exited before binding".to_string(),
                    Err(e) => e.to_string(),
                };
                Err(anyhow!("health endpoint failed to bind port {port}: {reason}"))
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the listener and wait for in-flight requests to drain.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.notify();
        self.task
            .await
            .context("health endpoint task panicked")?
            .map_err(|e| anyhow!("health endpoint failed: {e}"))?;
        info!("Health endpoint on port {} closed", self.port);
        Ok(())
    }
}

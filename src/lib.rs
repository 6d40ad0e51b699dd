pub mod config;
pub mod db;
pub mod detections;
pub mod devices;
pub mod error;
pub mod health;
pub mod logging;
pub mod models;
pub mod profiles;
pub mod recordings;
pub mod remotes;
pub mod schema;
pub mod service;
pub mod settings;
pub mod tasks;
pub mod uploads;
pub mod weather;

pub use error::{StoreError, StoreResult};

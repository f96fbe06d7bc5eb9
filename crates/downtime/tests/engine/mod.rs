/// Measurement engine tests
pub mod connection_tests;
pub mod measurement_tests;

use std::sync::Arc;
use std::time::Duration;

use downtime::config::ProbeConfig;
use downtime::probe::{ConnectionManager, ConnectionSettings, EngineSettings, MeasurementEngine};

pub fn engine_with(configure: impl FnOnce(&mut ProbeConfig)) -> MeasurementEngine {
    let mut config = ProbeConfig::default();
    config.connect_timeout_ms = 1_000;
    configure(&mut config);

    let connections = Arc::new(ConnectionManager::new(ConnectionSettings::from(&config)).unwrap());
    MeasurementEngine::new(connections, EngineSettings::from(&config))
}

pub fn engine() -> MeasurementEngine {
    engine_with(|_| {})
}

pub const BUDGET: Duration = Duration::from_secs(5);

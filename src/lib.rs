pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod mux;
pub mod policy;
pub mod pool;
pub mod session;
pub mod sock;
pub mod task;
pub mod telemetry;
pub mod thread;
pub mod utils;
pub mod worker;

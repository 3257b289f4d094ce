pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod relay;
pub mod sink;
pub mod stream;
pub mod telemetry;
pub mod upstream;
pub mod usage;

pub mod adapters;
pub mod apischema;
pub mod config;
pub mod cost;
pub mod error;
pub mod metadata;
pub mod processor;
pub mod router;
pub mod sse;
pub mod stream;
pub mod telemetry;

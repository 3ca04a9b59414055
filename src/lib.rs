mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod detection;
pub mod image_pipeline;
pub mod labels;
pub mod lazy_model;
pub mod model_service;
pub mod ort_service;

pub use app::start_app;

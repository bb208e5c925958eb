mod app;
mod config;
mod effects;
mod logging;
mod report;

pub use app::run_app;

pub mod api;
pub mod article;
pub mod config;
pub mod error;
pub mod generator;
pub mod llm;
pub mod logging;
pub mod schedule;
pub mod scheduler;

use std::sync::Arc;
use config::Config;
use scheduler::SchedulerHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: SchedulerHandle,
}

use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub mod api;
pub mod config;
pub mod error;
pub mod grid;
pub mod init;
pub mod model;
pub mod pipeline;
pub mod planner;
pub mod queue;
pub mod script;

pub use error::{Result, StoryboardError};

pub type PipelineLogHook = Arc<Mutex<dyn Fn(&str) + Send + Sync + 'static>>;

static LOG_HOOK: Lazy<Mutex<Option<PipelineLogHook>>> = Lazy::new(|| Mutex::new(None));

/// Installs (or clears) a callback that receives every tagged progress line.
pub fn set_log_hook(hook: Option<PipelineLogHook>) {
    if let Ok(mut guard) = LOG_HOOK.lock() {
        *guard = hook;
    }
}

pub(crate) fn logv(tag: &str, message: &str) {
    match tag {
        "WARN" => tracing::warn!("{}", message),
        _ => tracing::info!("{}", message),
    }

    if let Ok(guard) = LOG_HOOK.lock() {
        if let Some(hook) = guard.as_ref() {
            if let Ok(callback) = hook.lock() {
                let line = format!("[{}] {}", tag, message);
                callback(&line);
            }
        }
    }
}

pub fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}

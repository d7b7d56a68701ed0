//! # Converter Module
//!
//! Motore di conversione, separato in sottomoduli:
//! - `image_converter`: conversione di un singolo file
//! - `worker_pool`: worker concorrenti che consumano la coda dei job
//! - `rate_limiter`: gate token bucket condiviso dai worker
//! - `cache`: cache concorrente dei risultati
//! - `path_resolver`: logica di calcolo path centralizzata

pub mod cache;
pub mod image_converter;
pub mod path_resolver;
pub mod rate_limiter;
pub mod worker_pool;

pub use cache::{CacheEntry, ConversionCache};
pub use image_converter::{ConversionResult, ConvertOptions, ImageConverter, Job};
pub use path_resolver::PathResolver;
pub use rate_limiter::RateLimiter;
pub use worker_pool::WorkerPool;

use std::any::Any;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

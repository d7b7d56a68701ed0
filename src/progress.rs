//! # Progress Module
//!
//! Barra di progresso `indicatif` per il run batch. Il driver la aggiorna
//! una volta per ogni risultato consumato.
//!
//! ```text
//! ⠋ [00:02:15] [========================================] 150/150 (100%) photo.png
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}";

/// Manages progress reporting for a conversion run
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new(total_files: u64) -> Self {
        let bar = ProgressBar::new(total_files);
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Hidden bar, for dry runs in tests and non-interactive use
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Advance past files already done in a resumed session
    pub fn skip(&self, count: u64) {
        self.bar.inc(count);
    }

    /// Update progress with a message
    pub fn update(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_skip_advance_position() {
        let progress = ProgressManager::hidden();
        progress.skip(3);
        progress.update("a.png");
        assert_eq!(progress.position(), 4);
        progress.finish("done");
    }
}

//! C6: progress reporting. A minimal trait plus a no-op and an
//! `indicatif`-backed terminal implementation, mirroring the teacher's
//! progress-bar styling and the dual real/no-op factory pattern used
//! elsewhere in the example pack for the same purpose.

use indicatif::{ProgressBar, ProgressStyle};

/// Reports fractional completion of a run. Implementations must tolerate
/// out-of-order, duplicate, or skipped calls without panicking.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64);
}

/// Silent implementation, used in library/test contexts.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _fraction: f64) {}
}

/// Terminal progress bar, for CLI use.
pub struct IndicatifProgressSink {
    bar: ProgressBar,
}

impl IndicatifProgressSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        IndicatifProgressSink { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for IndicatifProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgressSink {
    fn report(&self, fraction: f64) {
        let clamped = fraction.clamp(0.0, 1.0);
        self.bar.set_position((clamped * 1000.0).round() as u64);
    }
}

//! Centralized progress reporting
//!
//! One piece-counting bar for the posting run and a plainer one for the
//! validation pass, with upload speed derived from the payload byte count.

use human_bytes::human_bytes;
use indicatif::{ProgressBar, ProgressStyle as IndicatifStyle};
use std::time::Duration;

/// Progress display style
#[derive(Debug, Clone, Copy)]
pub enum ProgressStyle {
    Post,
    Validate,
}

/// Create a progress bar over `total` pieces with the specified style
pub fn create_progress_bar(total: u64, style: ProgressStyle) -> ProgressBar {
    let bar = ProgressBar::new(total);
    apply_style(&bar, style);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Apply a style to an existing progress bar
pub fn apply_style(bar: &ProgressBar, style: ProgressStyle) {
    match style {
        ProgressStyle::Post => {
            bar.set_style(
                IndicatifStyle::with_template(
                    "[{bar:40.cyan/blue}] {percent:>3}% {pos:>6}/{len:<6} pieces ETA {eta:>5} {msg}",
                )
                .unwrap()
                .progress_chars("━━╸ ")
                .with_key(
                    "eta",
                    |state: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                        let _ = write!(w, "{:>5.0}s", state.eta().as_secs_f64());
                    },
                ),
            );
        }
        ProgressStyle::Validate => {
            bar.set_style(
                IndicatifStyle::with_template("[{bar:40.yellow}] {percent:>3}% {pos}/{len} {msg}")
                    .unwrap()
                    .progress_chars("━━╸ "),
            );
        }
    }
}

/// Upload-speed label shown next to the bar.
pub fn speed_message(bytes_posted: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        format!("{}/s", human_bytes(bytes_posted as f64 / secs))
    } else {
        String::new()
    }
}

/// Format the end-of-run summary line
pub fn format_post_summary(
    pieces_posted: u64,
    total_pieces: u64,
    bytes_posted: u64,
    elapsed: Duration,
) -> String {
    if pieces_posted == total_pieces {
        format!(
            "✓ Posted {} pieces ({}) in {:.0}s, {}",
            pieces_posted,
            human_bytes(bytes_posted as f64),
            elapsed.as_secs_f64(),
            speed_message(bytes_posted, elapsed),
        )
    } else {
        format!(
            "⚠ Posted {} of {} pieces ({})",
            pieces_posted,
            total_pieces,
            human_bytes(bytes_posted as f64),
        )
    }
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use thousands::Separable;

/// Width needed to print `count` with comma separators
fn get_display_chars(count: u64) -> usize {
    if count == 0 {
        1
    } else {
        let display_digits = count.ilog10() + 1;
        let display_commas = (display_digits - 1) / 3;
        (display_digits + display_commas) as usize
    }
}

struct LogInfo {
    total: u64,
    event_verb: String,
    event_label: String,
    display_chars: usize,
    report_interval: Duration,
    progress: AtomicU64,
    run_reporter: AtomicBool,
}

impl LogInfo {
    fn status_message(&self) -> String {
        let progress = self.progress.load(Ordering::SeqCst);
        let remaining = self.total.saturating_sub(progress);
        let width = self.display_chars;
        let percent = if self.total > 0 {
            (100 * progress) / self.total
        } else {
            0
        };
        format!(
            "{} {:>width$} of {:>width$} {} ({}%), {} remaining",
            self.event_verb,
            progress.separate_with_commas(),
            self.total.separate_with_commas(),
            self.event_label,
            percent,
            remaining.separate_with_commas(),
        )
    }
}

fn progress_status_reporter(log_info: Arc<LogInfo>) {
    loop {
        std::thread::sleep(log_info.report_interval);
        if !log_info.run_reporter.load(Ordering::Relaxed) {
            return;
        }
        info!("{}", log_info.status_message());
    }
}

enum ProgressReporterType {
    Bar(ProgressBar),
    PeriodicLog(Arc<LogInfo>),
}

/// Progress reporter covering both tty and non-tty output
///
/// Uses a single-line progress bar for tty contexts, and a status log line at a fixed interval
/// for non-tty contexts. Reporting never blocks the threads calling [ProgressReporter::inc].
///
pub struct ProgressReporter {
    pr_type: ProgressReporterType,
}

impl ProgressReporter {
    /// Create a new reporter instance
    ///
    /// The periodic report format is:
    /// "{event_verb} {completed} of {event_count} {event_label} ({percent}%), {remaining} remaining"
    ///
    /// # Arguments
    /// * event_count - Total events to be completed
    /// * report_interval - Time between periodic log reports
    /// * force_periodic_updates - Use periodic log reports even if a tty is available
    ///
    pub fn new(
        event_count: u64,
        event_verb: &str,
        event_label: &str,
        report_interval: Duration,
        force_periodic_updates: bool,
    ) -> Self {
        let display_chars = get_display_chars(event_count);

        let template_string = format!(
            "[{{elapsed_precise}}] [{{bar:40}}] {event_verb} {{human_pos:>{display_chars}}} of {{human_len:{display_chars}}} {event_label} ({{percent}}%)");
        let progress_bar = ProgressBar::new(event_count);
        if let Ok(style) = ProgressStyle::with_template(&template_string) {
            progress_bar.set_style(style.progress_chars("=> "));
        }

        use ProgressReporterType::*;
        // Reuse the tty criteria from indicatif, so that the periodic update is always provided
        // when the progress bar is hidden
        if force_periodic_updates || progress_bar.is_hidden() {
            let log_info = Arc::new(LogInfo {
                total: event_count,
                event_verb: event_verb.to_string(),
                event_label: event_label.to_string(),
                display_chars,
                report_interval,
                progress: AtomicU64::new(0),
                run_reporter: AtomicBool::new(true),
            });
            {
                let log_info = log_info.clone();
                std::thread::spawn(|| {
                    progress_status_reporter(log_info);
                });
            }

            Self {
                pr_type: PeriodicLog(log_info),
            }
        } else {
            progress_bar.tick();
            Self {
                pr_type: Bar(progress_bar),
            }
        }
    }

    /// Increment progress by `delta` completed events
    pub fn inc(&self, delta: u64) {
        use ProgressReporterType::*;
        match &self.pr_type {
            Bar(progress_bar) => {
                progress_bar.inc(delta);
            }
            PeriodicLog(log_info) => {
                log_info.progress.fetch_add(delta, Ordering::SeqCst);
            }
        }
    }

    /// Clear the progress bar in tty mode, or stop the periodic updater in non-tty mode
    pub fn clear(&self) {
        use ProgressReporterType::*;
        match &self.pr_type {
            Bar(progress_bar) => {
                progress_bar.finish_and_clear();
            }
            PeriodicLog(log_info) => {
                log_info.run_reporter.store(false, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.clear();
    }
}

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use vidl_engine::state::format_bytes;
use vidl_engine::{ProgressCallback, ProgressSnapshot, RecProgress};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.red} [{elapsed_precise}] {msg}";

/// Progress output: an indicatif bar, or JSON lines on stdout.
pub struct ProgressView {
    bar: Option<ProgressBar>,
}

impl ProgressView {
    pub fn batch(json_output: bool) -> (Self, ProgressCallback<ProgressSnapshot>) {
        if json_output {
            return (
                Self { bar: None },
                Arc::new(|snapshot: ProgressSnapshot| print_json("progress", &snapshot)),
            );
        }

        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        let handle = bar.clone();
        let callback = Arc::new(move |snapshot: ProgressSnapshot| {
            handle.set_length(snapshot.total);
            handle.set_position(snapshot.finished);
            handle.set_message(format!(
                "{}/{} ({}/s) retry {}/{}",
                format_bytes(snapshot.downloaded_bytes),
                format_bytes(snapshot.total_bytes_estimate),
                format_bytes(snapshot.speed_bytes_per_sec),
                snapshot.retry_count,
                snapshot.max_retry,
            ));
        });
        (Self { bar: Some(bar) }, callback)
    }

    pub fn live(json_output: bool) -> (Self, ProgressCallback<RecProgress>) {
        if json_output {
            return (
                Self { bar: None },
                Arc::new(|progress: RecProgress| print_json("recording", &progress)),
            );
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template(SPINNER_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        let handle = bar.clone();
        let callback = Arc::new(move |progress: RecProgress| handle.set_message(progress.to_string()));
        (Self { bar: Some(bar) }, callback)
    }

    pub fn finish(self, message: &str) {
        if let Some(bar) = self.bar {
            bar.finish_with_message(message.to_owned());
        }
    }
}

fn print_json<T: serde::Serialize>(event: &str, value: &T) {
    if let Ok(data) = serde_json::to_value(value) {
        println!("{}", json!({ "event": event, "data": data }));
    }
}

// SPDX-License-Identifier: MIT

use indicatif::{ProgressBar, ProgressStyle};

/// A byte-counting spinner for the stream-to-file pull loop, where the
/// final output size isn't known until the producer finishes.
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {bytes} written {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

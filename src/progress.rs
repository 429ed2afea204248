use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::writer::{SaveProgress, SaveStage};

/// Bar resolution: the save fraction is shown in permille steps.
const STEPS: u64 = 1000;

/// Console progress for a save, with a status line above the bar
#[derive(Debug)]
pub struct ConsoleProgress {
    log_line: ProgressBar,
    progress_bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new(total_channels: usize) -> Result<Self, indicatif::style::TemplateError> {
        let multi = MultiProgress::new();

        let log_line = multi.add(ProgressBar::new_spinner());
        log_line.set_style(ProgressStyle::default_spinner().template("{msg}")?);
        log_line.set_message(format!("Encoding {} channels...", total_channels));

        let progress_bar = multi.add(ProgressBar::new(STEPS));
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {percent}% | {elapsed_precise} | {msg}")?
                .progress_chars("█▓░"),
        );

        Ok(Self {
            log_line,
            progress_bar,
        })
    }

    /// Apply one update from the save thread
    pub fn update(&self, progress: &SaveProgress) {
        let stage = match progress.stage {
            SaveStage::Packing => "packing",
            SaveStage::Encoding => "encoding",
            SaveStage::Stored => "stored",
        };
        self.log_line.set_message(format!(
            "Channel {}/{}: {}",
            progress.channel + 1,
            progress.total_channels,
            stage
        ));
        self.progress_bar
            .set_position((progress.fraction.clamp(0.0, 1.0) * STEPS as f64).round() as u64);
    }

    pub fn finish(&self, message: &str) {
        self.progress_bar.finish_with_message(message.to_string());
        self.log_line.finish_and_clear();
    }

    pub fn abandon(&self) {
        self.progress_bar.abandon_with_message("failed");
        self.log_line.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_maps_to_position() {
        let progress = ConsoleProgress::new(2).unwrap();
        progress.update(&SaveProgress {
            channel: 0,
            total_channels: 2,
            fraction: 0.5,
            stage: SaveStage::Stored,
        });
        assert_eq!(progress.progress_bar.position(), 500);
        progress.finish("done");
        assert!(progress.progress_bar.is_finished());
    }
}

use hearth::app::events::{Event, EventHandler};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

const STEPS: u64 = 100;

/// Draws a bar on stderr while a model loads.
pub struct LoadProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl LoadProgress {
    pub fn new() -> Self {
        Self { bar: Mutex::new(None) }
    }

    fn start(message: String) -> ProgressBar {
        let bar = ProgressBar::new(STEPS);
        let style = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {percent}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(message);
        bar
    }
}

impl Default for LoadProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for LoadProgress {
    fn handle(&self, event: &Event) {
        let mut slot = self.bar.lock();
        match event {
            Event::ModelLoading { model, progress } => {
                let bar = slot.get_or_insert_with(|| Self::start(format!("loading {}", model.display_name())));
                bar.set_position((progress.clamp(0.0, 1.0) * STEPS as f32) as u64);
            }
            Event::ModelLoaded { .. } => {
                if let Some(bar) = slot.take() {
                    bar.finish_and_clear();
                }
            }
            Event::ModelLoadFailed { .. } | Event::ModelUnloaded { .. } => {
                if let Some(bar) = slot.take() {
                    bar.abandon();
                }
            }
            _ => {}
        }
    }

    fn name(&self) -> &str {
        "load-progress"
    }
}

//! Context-window tracking for a single agent turn.

/// Window used when the model is unknown or unrecognised.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Default share of the window at which a turn is stopped.
pub const DEFAULT_THRESHOLD_PCT: u8 = 90;

/// Model-name prefixes and their context windows, in tokens.
///
/// No entry is a prefix of another, so lookup order does not matter.
const MODEL_WINDOWS: &[(&str, u64)] = &[
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-haiku-4", 200_000),
    ("claude-3-7-sonnet", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("opus", 200_000),
    ("sonnet", 200_000),
    ("haiku", 200_000),
    ("gpt-5", 400_000),
    ("gpt-4.1", 1_047_576),
    ("gemini-2.5", 1_048_576),
];

/// Context window for `model`, falling back to [`DEFAULT_CONTEXT_WINDOW`].
pub fn context_window_for(model: &str) -> u64 {
    MODEL_WINDOWS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Tracks cumulative token usage reported by `Message` events and decides
/// when the turn should be stopped before the model's window overflows.
#[derive(Debug, Clone)]
pub struct ContextTracker {
    window: u64,
    threshold_pct: u8,
    used: u64,
    tripped: bool,
}

impl ContextTracker {
    pub fn new(model: Option<&str>, threshold_pct: u8) -> Self {
        Self {
            window: model.map(context_window_for).unwrap_or(DEFAULT_CONTEXT_WINDOW),
            threshold_pct: threshold_pct.clamp(1, 100),
            used: 0,
            tripped: false,
        }
    }

    /// Re-resolve the window once the agent reports which model it runs.
    pub fn set_model(&mut self, model: &str) {
        self.window = context_window_for(model);
    }

    /// Add one message's reported usage. Returns `true` exactly once, on the
    /// call that first crosses the threshold.
    pub fn record(&mut self, tokens: u64) -> bool {
        self.used = self.used.saturating_add(tokens);
        if !self.tripped && self.used >= self.limit() {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn limit(&self) -> u64 {
        self.window * u64::from(self.threshold_pct) / 100
    }

    pub fn used(&self) -> u64 {
        self.used
    }

}

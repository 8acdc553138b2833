//! Iteration counter and ceiling policy, free of I/O.

/// Iterations added when extended mode first triggers.
pub const EXTENSION_ITERATIONS: u32 = 3;

/// What a developer/reviewer agreement means for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agreement {
    /// Normal mode: the plan is done.
    Complete,
    /// Extended mode, first agreement: keep going until the new ceiling.
    Extend { ceiling: u32 },
    /// Extended mode after the first trigger: no effect.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct LoopState {
    iteration: u32,
    ceiling: u32,
    extended: bool,
    triggered: bool,
}

impl LoopState {
    /// `last_iteration` is the highest persisted iteration (0 for a fresh plan).
    pub fn new(last_iteration: u32, max_iterations: u32, extended: bool) -> Self {
        Self {
            iteration: last_iteration,
            ceiling: max_iterations,
            extended,
            triggered: false,
        }
    }

    /// Move to the next iteration. Returns `None` once the ceiling has been
    /// passed. Extended mode runs without a ceiling until its first trigger.
    pub fn advance(&mut self) -> Option<u32> {
        self.iteration += 1;
        if self.extended && !self.triggered {
            return Some(self.iteration);
        }
        (self.iteration <= self.ceiling).then_some(self.iteration)
    }

    pub fn on_agreement(&mut self) -> Agreement {
        if !self.extended {
            return Agreement::Complete;
        }
        if self.triggered {
            return Agreement::Ignored;
        }
        self.triggered = true;
        self.ceiling = self.iteration + EXTENSION_ITERATIONS;
        Agreement::Extend {
            ceiling: self.ceiling,
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }
}

//! Derivations for the presentational consumers of presence state.
//!
//! The badge only needs a label; the toast fires when the count rises
//! between two consecutive observations after the tab has seen at least
//! one visitor.

/// Badge text for a visitor count.
pub fn visitor_label(count: u64) -> String {
    if count == 1 {
        "1 visitor".to_string()
    } else {
        format!("{count} visitors")
    }
}

/// Notification payload for a newly arrived visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewVisitor {
    pub total: u64,
}

impl NewVisitor {
    pub fn description(&self) -> String {
        format!(
            "Someone new is checking out the portfolio! Total visitors: {}",
            self.total
        )
    }
}

/// Watches successive counts and reports increases.
#[derive(Debug, Clone, Default)]
pub struct NewVisitorDetector {
    previous: u64,
}

impl NewVisitorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe the latest count. Returns a notification when it rose.
    ///
    /// The first non-zero count (our own welcome) never notifies.
    pub fn observe(&mut self, count: u64) -> Option<NewVisitor> {
        let previous = std::mem::replace(&mut self.previous, count);
        (previous > 0 && count > previous).then_some(NewVisitor { total: count })
    }

    pub fn previous(&self) -> u64 {
        self.previous
    }
}

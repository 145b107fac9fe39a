//! Page lifecycle signals consumed by the interaction tracker.

use serde::{Deserialize, Serialize};

/// Page visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// The page is in the foreground.
    Visible,
    /// The page was backgrounded or minimised.
    Hidden,
}

/// A lifecycle event reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    /// Visibility changed.
    VisibilityChanged(Visibility),
    /// The page is about to be torn down.
    BeforeUnload,
}

impl PageSignal {
    /// Whether this signal requires buffered events to be flushed now.
    #[must_use]
    pub const fn forces_flush(self) -> bool {
        matches!(
            self,
            Self::VisibilityChanged(Visibility::Hidden) | Self::BeforeUnload
        )
    }

    /// Whether the process is going away and retries cannot be waited for.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::BeforeUnload)
    }
}

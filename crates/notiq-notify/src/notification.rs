//! Destination-agnostic notification model.

use serde::{Deserialize, Serialize};

/// Visual status of a notification.
///
/// Status is the source of truth; the sidebar color and default emoji are
/// derived from it and never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Positive outcome (payments received, renewals).
    Success,
    /// Failure (payment failures).
    Failed,
    /// Attention needed (cancellations, trials ending).
    Warning,
    /// Neutral information.
    Info,
}

impl Status {
    /// Sidebar color for this status.
    pub const fn color(self) -> &'static str {
        match self {
            Self::Success => "#28a745",
            Self::Failed => "#dc3545",
            Self::Warning => "#ffc107",
            Self::Info => "#17a2b8",
        }
    }

    /// Default emoji for this status.
    pub const fn emoji(self) -> &'static str {
        match self {
            Self::Success => "\u{1f4b0}",  // money bag
            Self::Failed => "\u{274c}",    // cross mark
            Self::Warning => "\u{26a0}\u{fe0f}", // warning sign
            Self::Info => "\u{2139}\u{fe0f}",    // information
        }
    }
}

/// A titled group of ordered key/value fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section header text.
    pub title: String,
    fields: Vec<(String, String)>,
}

impl Section {
    /// Creates an empty section.
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), fields: Vec::new() }
    }

    /// Appends a field, preserving insertion order.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Builder-style variant of [`Section::add_field`].
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_field(key, value);
        self
    }

    /// Fields in insertion order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Whether the section carries no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// An action button attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    /// Button label.
    pub text: String,
    /// URL opened on click.
    pub url: String,
    /// Visual style: `default`, `primary`, or `danger`.
    pub style: String,
}

impl ActionButton {
    /// Creates a default-styled button.
    pub fn new(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self { text: text.into(), url: url.into(), style: "default".to_string() }
    }

    /// Sets the button style.
    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }
}

/// A complete notification: header, sections, optional actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Header title (without the emoji).
    pub title: String,
    /// Ordered content sections.
    pub sections: Vec<Section>,
    /// Optional action buttons.
    pub actions: Vec<ActionButton>,
    /// Header emoji; defaults to the status emoji.
    emoji: String,
    status: Status,
}

impl Notification {
    /// Creates a notification with the given title and status.
    pub fn new(title: impl Into<String>, status: Status) -> Self {
        Self {
            title: title.into(),
            sections: Vec::new(),
            actions: Vec::new(),
            emoji: status.emoji().to_string(),
            status,
        }
    }

    /// Current status.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Sets the status, updating the derived color and emoji.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.emoji = status.emoji().to_string();
    }

    /// Sidebar color, derived from the status.
    pub const fn color(&self) -> &'static str {
        self.status.color()
    }

    /// Header emoji.
    pub fn emoji(&self) -> &str {
        &self.emoji
    }

    /// Overrides the header emoji without touching the status.
    pub fn set_emoji(&mut self, emoji: impl Into<String>) {
        self.emoji = emoji.into();
    }

    /// Appends a section, skipping empty ones.
    pub fn push_section(&mut self, section: Section) {
        if !section.is_empty() {
            self.sections.push(section);
        }
    }

    /// Appends an action button.
    pub fn push_action(&mut self, action: ActionButton) {
        self.actions.push(action);
    }
}

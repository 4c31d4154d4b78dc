//! Slack Block Kit formatter.
//!
//! Renders a [`Notification`] as a color-striped attachment: a header block
//! (emoji + title), one mrkdwn section per field group with bold-key lines,
//! and an actions block when buttons are present.

use serde_json::{json, Value};

use crate::notification::Notification;

/// Converts notifications into a destination-specific payload.
pub trait DestinationFormatter: Send + Sync + 'static {
    /// Destination name used in logs.
    fn destination(&self) -> &'static str;

    /// Renders the notification into the destination's wire format.
    fn format(&self, notification: &Notification) -> Value;
}

/// The Slack Block Kit destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlackFormatter;

impl SlackFormatter {
    /// Creates the formatter.
    pub fn new() -> Self {
        Self
    }
}

impl DestinationFormatter for SlackFormatter {
    fn destination(&self) -> &'static str {
        "slack"
    }

    fn format(&self, notification: &Notification) -> Value {
        let mut blocks = Vec::new();

        blocks.push(json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("{} {}", notification.emoji(), notification.title),
                "emoji": true,
            }
        }));

        for section in &notification.sections {
            let mut lines = vec![format!("*{}*", section.title)];
            for (key, value) in section.fields() {
                lines.push(format!("*{key}*: {value}"));
            }
            blocks.push(json!({
                "type": "section",
                "text": {"type": "mrkdwn", "text": lines.join("\n")}
            }));
        }

        if !notification.actions.is_empty() {
            let elements: Vec<Value> = notification
                .actions
                .iter()
                .map(|button| {
                    let mut element = json!({
                        "type": "button",
                        "text": {"type": "plain_text", "text": button.text},
                        "url": button.url,
                    });
                    // Slack rejects "default" as an explicit style.
                    if button.style != "default" {
                        element["style"] = json!(button.style);
                    }
                    element
                })
                .collect();
            blocks.push(json!({"type": "actions", "elements": elements}));
        }

        json!({
            "attachments": [{
                "color": notification.color(),
                "blocks": blocks,
            }]
        })
    }
}

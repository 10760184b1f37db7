use async_trait::async_trait;

use super::{Notification, NotificationSink};
use crate::Result;

/// Prints notifications as JSON lines. Useful when running outside a
/// cluster or when the events API is not writable.
#[derive(Debug)]
pub struct StdoutSink {
    name: String,
    pretty: bool,
}

impl StdoutSink {
    pub fn new(name_override: Option<String>, pretty: bool) -> Self {
        let name = name_override.unwrap_or_else(|| "stdout".to_string());
        Self { name, pretty }
    }

    fn render(&self, notification: &Notification) -> Result<String> {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(notification)?
        } else {
            serde_json::to_string(notification)?
        };
        Ok(rendered)
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new(None, false)
    }
}

#[async_trait]
impl NotificationSink for StdoutSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        println!("{}", self.render(notification)?);
        Ok(())
    }
}

use std::fmt::Display;
use std::sync::Arc;

use tracing::warn;

use crate::discord::{ChatGateway, OutgoingMessage, with_deadline};

/// Posts operator-facing failure notices to the incident channel, when one
/// is configured. Reporting is best effort and never fails the caller.
pub struct IncidentReporter {
    chat: Arc<dyn ChatGateway>,
    channel_id: Option<u64>,
    chat_timeout_secs: u64,
}

impl IncidentReporter {
    pub fn new(chat: Arc<dyn ChatGateway>, channel_id: Option<u64>, chat_timeout_secs: u64) -> Self {
        Self {
            chat,
            channel_id,
            chat_timeout_secs,
        }
    }

    pub async fn report(&self, context: &str, err: &(dyn Display + Sync)) {
        let Some(channel_id) = self.channel_id else {
            return;
        };
        let notice = OutgoingMessage::text(format!("⚠️ {context} : {err}"));
        if let Err(report_err) = with_deadline(
            self.chat_timeout_secs,
            self.chat.send_message(channel_id, notice),
        )
        .await
        {
            warn!(channel_id, "could not report incident: {report_err}");
        }
    }
}

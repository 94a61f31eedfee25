use serde::{Deserialize, Serialize};
use serenity::builder::CreateEmbed;
use serenity::model::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Platform-neutral embed payload.
///
/// Equal values render to identical Discord payloads, which lets callers
/// skip edits when nothing changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordEmbed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub color: Option<u32>,
    pub fields: Vec<EmbedField>,
    /// Unix seconds.
    pub timestamp: Option<i64>,
}

impl DiscordEmbed {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn timestamp(mut self, unix_seconds: i64) -> Self {
        self.timestamp = Some(unix_seconds);
        self
    }

    pub fn to_create_embed(&self) -> CreateEmbed {
        let mut embed_builder = CreateEmbed::new();

        if let Some(ref title) = self.title {
            embed_builder = embed_builder.title(title);
        }

        if let Some(ref description) = self.description {
            embed_builder = embed_builder.description(description);
        }

        if let Some(color) = self.color {
            embed_builder = embed_builder.color(color);
        }

        for field in &self.fields {
            embed_builder = embed_builder.field(&field.name, &field.value, field.inline);
        }

        if let Some(timestamp) = self.timestamp.and_then(|ts| Timestamp::from_unix_timestamp(ts).ok()) {
            embed_builder = embed_builder.timestamp(timestamp);
        }

        embed_builder
    }
}

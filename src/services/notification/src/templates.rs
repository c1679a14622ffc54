//! Template management module for notification service
//!
//! This module provides:
//! - The template store contract and an in-memory store seeded with defaults
//! - Title/body rendering with Handlebars for an event type + channel pair
//! - Batch summary rendering (`count` and `items` in the context)
//!
//! Templates are plain text: HTML escaping is turned off.

use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fileshare_shared::{
    event_types, metadata_to_json, BatchNotification, NotificationChannel, NotificationRequest,
};
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub event_type: String,
    /// `None` applies to every channel without a more specific template
    #[serde(default)]
    pub channel: Option<NotificationChannel>,
    pub title_template: String,
    pub body_template: String,
    #[serde(default)]
    pub batch_title_template: Option<String>,
    #[serde(default)]
    pub batch_body_template: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl NotificationTemplate {
    pub fn new(event_type: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            channel: None,
            title_template: title.into(),
            body_template: body.into(),
            batch_title_template: None,
            batch_body_template: None,
            is_active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn for_channel(mut self, channel: NotificationChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_batch(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.batch_title_template = Some(title.into());
        self.batch_body_template = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// The channel-specific template if one exists, else the channel-agnostic one
    async fn get_by_event_and_channel(
        &self,
        event_type: &str,
        channel: Option<NotificationChannel>,
    ) -> Result<Option<NotificationTemplate>>;

    async fn upsert(&self, template: NotificationTemplate) -> Result<()>;

    async fn list(&self) -> Result<Vec<NotificationTemplate>>;
}

#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: DashMap<(String, Option<NotificationChannel>), NotificationTemplate>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the file lifecycle, share, quota and security templates
    pub fn with_defaults() -> Self {
        let store = Self::new();
        for template in default_templates() {
            store
                .templates
                .insert((template.event_type.clone(), template.channel), template);
        }
        info!(count = store.templates.len(), "Loaded default notification templates");
        store
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get_by_event_and_channel(
        &self,
        event_type: &str,
        channel: Option<NotificationChannel>,
    ) -> Result<Option<NotificationTemplate>> {
        if channel.is_some() {
            if let Some(template) = self.templates.get(&(event_type.to_string(), channel)) {
                return Ok(Some(template.value().clone()));
            }
        }
        Ok(self
            .templates
            .get(&(event_type.to_string(), None))
            .map(|t| t.value().clone()))
    }

    async fn upsert(&self, template: NotificationTemplate) -> Result<()> {
        self.templates
            .insert((template.event_type.clone(), template.channel), template);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<NotificationTemplate>> {
        let mut templates: Vec<_> = self.templates.iter().map(|t| t.value().clone()).collect();
        templates.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        Ok(templates)
    }
}

const DEFAULT_BATCH_TITLE: &str = "{{count}} new notifications";
const DEFAULT_BATCH_BODY: &str = "{{#each items}}{{#unless @first}}\n{{/unless}}- {{this.title}}{{/each}}";

fn default_templates() -> Vec<NotificationTemplate> {
    vec![
        NotificationTemplate::new(
            event_types::FILE_UPLOADED,
            "File uploaded: {{file_name}}",
            "{{file_name}} ({{filesize file_size}}) was uploaded successfully.",
        )
        .with_batch(
            "{{count}} files uploaded",
            "{{#each items}}{{#unless @first}}\n{{/unless}}- {{this.metadata.file_name}} ({{filesize this.metadata.file_size}}){{/each}}",
        ),
        NotificationTemplate::new(
            event_types::FILE_UPLOAD_FAILED,
            "Upload failed: {{file_name}}",
            "{{file_name}} could not be uploaded: {{error_reason}}",
        )
        .with_batch(
            "{{count}} uploads failed",
            "{{#each items}}{{#unless @first}}\n{{/unless}}- {{this.metadata.file_name}}: {{this.metadata.error_reason}}{{/each}}",
        ),
        NotificationTemplate::new(
            event_types::FILE_DOWNLOADED,
            "File downloaded: {{file_name}}",
            "{{file_name}} was downloaded on {{date event_timestamp \"%Y-%m-%d %H:%M\"}}.",
        )
        .with_batch(
            "{{count}} downloads",
            "{{#each items}}{{#unless @first}}\n{{/unless}}- {{this.metadata.file_name}}{{/each}}",
        ),
        NotificationTemplate::new(
            event_types::FILE_DELETED,
            "File deleted: {{file_name}}",
            "{{file_name}} was deleted.",
        )
        .with_batch(
            "{{count}} files deleted",
            "{{#each items}}{{#unless @first}}\n{{/unless}}- {{this.metadata.file_name}}{{/each}}",
        ),
        NotificationTemplate::new(
            event_types::FILE_SHARED,
            "{{file_name}} was shared with you",
            "{{shared_by}} shared {{file_name}} with you.",
        )
        .with_batch(
            "{{count}} files shared with you",
            "{{#each items}}{{#unless @first}}\n{{/unless}}- {{this.metadata.file_name}}{{/each}}",
        ),
        NotificationTemplate::new(
            event_types::SHARE_GRANTED,
            "Access granted",
            "You now have access to {{file_name}}.",
        ),
        NotificationTemplate::new(
            event_types::QUOTA_WARNING,
            "Storage almost full",
            "You have used {{usage_percent}}% of your storage quota.",
        ),
        NotificationTemplate::new(
            event_types::QUOTA_EXCEEDED,
            "Storage quota exceeded",
            "Your storage quota is exceeded. New uploads are blocked until you free up space.",
        ),
        NotificationTemplate::new(
            event_types::SECURITY_ALERT,
            "Security alert: {{uppercase alert_type}}",
            "{{description}} ({{date event_timestamp \"%Y-%m-%d %H:%M:%S\"}} UTC)",
        ),
    ]
}

// Helpers

fn date_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h
        .param(0)
        .ok_or_else(|| RenderError::new("date helper requires a value"))?
        .value();
    let format = h
        .param(1)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%d");

    match param.as_str() {
        Some(date_str) => match DateTime::parse_from_rfc3339(date_str) {
            Ok(datetime) => out.write(&datetime.format(format).to_string())?,
            Err(_) => out.write(date_str)?,
        },
        None if param.is_null() => {}
        None => out.write(&param.to_string())?,
    }
    Ok(())
}

fn uppercase_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn filesize_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if let Some(bytes) = h.param(0).and_then(|p| p.value().as_f64()) {
        out.write(&format_file_size(bytes))?;
    }
    Ok(())
}

pub fn format_file_size(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes.max(0.0);
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", size as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Renders notification titles and bodies from stored templates
pub struct TemplateResolver {
    store: Arc<dyn TemplateStore>,
    handlebars: Handlebars<'static>,
}

impl TemplateResolver {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("date", Box::new(date_helper));
        handlebars.register_helper("uppercase", Box::new(uppercase_helper));
        handlebars.register_helper("filesize", Box::new(filesize_helper));

        Self { store, handlebars }
    }

    pub fn store(&self) -> &Arc<dyn TemplateStore> {
        &self.store
    }

    /// Store a template after checking that both parts compile
    pub async fn upsert(&self, mut template: NotificationTemplate) -> Result<()> {
        Self::validate_template_syntax(&template)?;
        template.updated_at = Utc::now();
        self.store.upsert(template).await
    }

    fn validate_template_syntax(template: &NotificationTemplate) -> Result<()> {
        let mut check = Handlebars::new();
        let parts = [
            Some(&template.title_template),
            Some(&template.body_template),
            template.batch_title_template.as_ref(),
            template.batch_body_template.as_ref(),
        ];
        for (index, source) in parts.into_iter().flatten().enumerate() {
            check
                .register_template_string(&format!("part_{}", index), source)
                .map_err(|e| NotificationError::template(format!("Template syntax error: {}", e)))?;
        }
        Ok(())
    }

    fn context(request: &NotificationRequest, channel: Option<NotificationChannel>) -> serde_json::Value {
        let mut context = metadata_to_json(&request.metadata);
        if let Some(map) = context.as_object_mut() {
            map.insert("user_id".into(), json!(request.user_id));
            map.insert("event_type".into(), json!(request.event_type));
            map.insert("title".into(), json!(request.title));
            map.insert("body".into(), json!(request.body));
            map.insert("channel".into(), json!(channel));
        }
        context
    }

    /// Render title and body for one request. Without an active template the
    /// request's own title and body are kept.
    pub async fn render(
        &self,
        request: &NotificationRequest,
        channel: Option<NotificationChannel>,
    ) -> Result<RenderedContent> {
        let template = self
            .store
            .get_by_event_and_channel(&request.event_type, channel)
            .await?
            .filter(|t| t.is_active);

        let Some(template) = template else {
            return Ok(RenderedContent {
                title: request.title.clone(),
                body: request.body.clone(),
            });
        };

        let context = Self::context(request, channel);
        let content = RenderedContent {
            title: self.handlebars.render_template(&template.title_template, &context)?,
            body: self.handlebars.render_template(&template.body_template, &context)?,
        };
        debug!(event_type = %request.event_type, ?channel, "Rendered notification template");
        Ok(content)
    }

    /// Summary of a closed batch window
    pub async fn render_batch(&self, batch: &BatchNotification) -> Result<RenderedContent> {
        let template = self
            .store
            .get_by_event_and_channel(&batch.event_type, Some(batch.channel))
            .await?
            .filter(|t| t.is_active);

        let title_source = template
            .as_ref()
            .and_then(|t| t.batch_title_template.as_deref())
            .unwrap_or(DEFAULT_BATCH_TITLE);
        let body_source = template
            .as_ref()
            .and_then(|t| t.batch_body_template.as_deref())
            .unwrap_or(DEFAULT_BATCH_BODY);

        let items: Vec<serde_json::Value> = batch
            .items
            .iter()
            .map(|item| {
                json!({
                    "title": item.title,
                    "body": item.body,
                    "metadata": metadata_to_json(&item.metadata),
                    "received_at": item.received_at,
                })
            })
            .collect();
        let context = json!({
            "user_id": batch.user_id,
            "event_type": batch.event_type,
            "channel": batch.channel,
            "count": batch.count,
            "items": items,
        });

        Ok(RenderedContent {
            title: self.handlebars.render_template(title_source, &context)?,
            body: self
                .handlebars
                .render_template(body_source, &context)?
                .trim_end()
                .to_string(),
        })
    }
}

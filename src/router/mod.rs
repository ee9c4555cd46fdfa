//! Message router.
//!
//! Maps a message's category to a header template and preferred transport,
//! and resolves the recipient against the static registry. Routing is a pure
//! function of the message and the registry; the only failure is an unknown
//! (or disabled) recipient.

use crate::config::{Config, Coordinates, TransportKind};
use crate::queue::{Message, MessageCategory};
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("recipient `{recipient}` is not a registered agent")]
    RecipientNotFound { recipient: String },
}

// ── Registry ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub inbox_dir: PathBuf,
    /// Known live input surface.
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Default)]
pub struct RecipientRegistry {
    recipients: HashMap<String, Recipient>,
}

impl RecipientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled `[[agents]]` with their resolved inbox directories.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for agent in config.agents.iter().filter(|agent| agent.enabled) {
            registry.insert(Recipient {
                name: agent.name.trim().to_string(),
                inbox_dir: config.agent_inbox_dir(agent),
                coordinates: agent.coordinates,
            });
        }
        registry
    }

    pub fn insert(&mut self, recipient: Recipient) {
        self.recipients.insert(recipient.name.clone(), recipient);
    }

    pub fn get(&self, name: &str) -> Option<&Recipient> {
        self.recipients.get(name)
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recipients.keys().map(String::as_str)
    }
}

// ── Templates ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Sender,
    Recipient,
    Category,
    Priority,
    MessageId,
    CreatedAt,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sender" => Some(Self::Sender),
            "recipient" => Some(Self::Recipient),
            "category" => Some(Self::Category),
            "priority" => Some(Self::Priority),
            "message_id" => Some(Self::MessageId),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }

    fn value(self, message: &Message) -> String {
        match self {
            Self::Sender => message.sender.clone(),
            Self::Recipient => message.recipient.clone(),
            Self::Category => message.category.to_string(),
            Self::Priority => message.priority.as_str().to_ascii_uppercase(),
            Self::MessageId => message.id.clone(),
            Self::CreatedAt => message.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Header template with `{placeholder}` fields, checked when parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                anyhow::bail!("unterminated placeholder in template: {raw}");
            };
            let name = after[..close].trim();
            let field = Field::parse(name)
                .ok_or_else(|| anyhow::anyhow!("unknown placeholder `{{{name}}}` in template: {raw}"))?;
            segments.push(Segment::Field(field));
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            anyhow::bail!("unmatched `}}` in template: {raw}");
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn literal(text: &str) -> Self {
        Self {
            segments: vec![Segment::Literal(text.to_string())],
        }
    }

    pub fn render(&self, message: &Message) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(&field.value(message)),
            }
        }
        out
    }
}

// ── Category policy ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPolicy {
    pub header: Template,
    pub prefer: TransportKind,
}

fn builtin_policy(category: MessageCategory) -> (&'static str, TransportKind) {
    match category {
        MessageCategory::AgentToAgent => (
            "[A2A] MESSAGE | from {sender} to {recipient} | priority {priority}",
            TransportKind::Injection,
        ),
        MessageCategory::CaptainToAgent => (
            "[C2A] CAPTAIN DIRECTIVE | from {sender} to {recipient} | priority {priority}",
            TransportKind::Injection,
        ),
        MessageCategory::SystemToAgent => (
            "[S2A] SYSTEM NOTICE | to {recipient} | priority {priority}",
            TransportKind::Inbox,
        ),
        MessageCategory::ExternalToAgent => (
            "[E2A] EXTERNAL MESSAGE | from {sender} to {recipient} | priority {priority}",
            TransportKind::Inbox,
        ),
    }
}

/// Complete table from category to policy. Every category has an entry.
#[derive(Debug, Clone)]
pub struct CategoryPolicies {
    policies: HashMap<MessageCategory, CategoryPolicy>,
}

impl CategoryPolicies {
    pub fn builtin() -> Self {
        let policies = MessageCategory::ALL
            .into_iter()
            .map(|category| {
                let (header, prefer) = builtin_policy(category);
                let header =
                    Template::parse(header).unwrap_or_else(|_| Template::literal(header));
                (category, CategoryPolicy { header, prefer })
            })
            .collect();
        Self { policies }
    }

    /// Built-in table with `[router.categories]` overrides applied.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut table = Self::builtin();
        for (key, override_cfg) in &config.router.categories {
            let category: MessageCategory = key
                .parse()
                .map_err(|e| anyhow::anyhow!("router.categories.{key}: {e}"))?;
            let Some(policy) = table.policies.get_mut(&category) else {
                continue;
            };
            if let Some(header) = &override_cfg.header {
                policy.header = Template::parse(header)
                    .map_err(|e| anyhow::anyhow!("router.categories.{key}.header: {e}"))?;
            }
            if let Some(prefer) = override_cfg.prefer {
                policy.prefer = prefer;
            }
        }
        Ok(table)
    }

    pub fn get(&self, category: MessageCategory) -> Option<&CategoryPolicy> {
        self.policies.get(&category)
    }
}

// ── Routing ─────────────────────────────────────────────────────

/// How one message should be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub recipient: Recipient,
    pub category: MessageCategory,
    /// Attempt order; the inbox is always last.
    pub transports: Vec<TransportKind>,
    /// Header plus content, as handed to every transport.
    pub formatted: String,
}

impl DeliveryPlan {
    pub fn primary(&self) -> TransportKind {
        self.transports
            .first()
            .copied()
            .unwrap_or(TransportKind::Inbox)
    }
}

#[derive(Debug, Clone)]
pub struct MessageRouter {
    registry: RecipientRegistry,
    policies: CategoryPolicies,
    injection_enabled: bool,
}

impl MessageRouter {
    pub fn new(
        registry: RecipientRegistry,
        policies: CategoryPolicies,
        injection_enabled: bool,
    ) -> Self {
        Self {
            registry,
            policies,
            injection_enabled,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            RecipientRegistry::from_config(config),
            CategoryPolicies::from_config(config)?,
            config.delivery.injection_enabled,
        ))
    }

    pub fn registry(&self) -> &RecipientRegistry {
        &self.registry
    }

    pub fn route(&self, message: &Message) -> Result<DeliveryPlan, RouteError> {
        let recipient = self
            .registry
            .get(message.recipient.trim())
            .ok_or_else(|| RouteError::RecipientNotFound {
                recipient: message.recipient.clone(),
            })?;

        let (header, prefer) = match self.policies.get(message.category) {
            Some(policy) => (policy.header.render(message), policy.prefer),
            None => {
                let (raw, prefer) = builtin_policy(message.category);
                (raw.to_string(), prefer)
            }
        };

        let injectable = self.injection_enabled && recipient.coordinates.is_some();
        let transports = if prefer == TransportKind::Injection && injectable {
            vec![TransportKind::Injection, TransportKind::Inbox]
        } else {
            vec![TransportKind::Inbox]
        };

        Ok(DeliveryPlan {
            recipient: recipient.clone(),
            category: message.category,
            transports,
            formatted: format!("{header}\n\n{}\n", message.content.trim_end()),
        })
    }
}

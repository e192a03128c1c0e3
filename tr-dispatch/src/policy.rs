//! Static per-destination reply policy.

use crate::error::PolicyError;
use crate::types::DestinationId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const UNKNOWN_DESTINATION_NAME: &str = "Unknown";

/// How the reply text is built from the ticket label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageTemplate {
    /// The extracted ticket number.
    #[default]
    TicketNumber,
    /// One of `choices`, picked uniformly at random per event.
    RandomChoice { choices: Vec<String> },
    /// Literal text; `{ticket}` and `{label}` are substituted.
    Template { text: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const ZERO: Self = Self {
        min_ms: 0,
        max_ms: 0,
    };

    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    pub fn is_fixed(&self) -> bool {
        self.min_ms == self.max_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRule {
    pub id: DestinationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub delay_min_ms: u64,
    #[serde(default)]
    pub delay_max_ms: u64,
    #[serde(default)]
    pub message: MessageTemplate,
}

impl DestinationRule {
    pub fn delay(&self) -> DelayRange {
        DelayRange::new(self.delay_min_ms, self.delay_max_ms)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.delay_min_ms > self.delay_max_ms {
            return Err(PolicyError::InvertedDelay {
                id: self.id.to_string(),
                min: self.delay_min_ms,
                max: self.delay_max_ms,
            });
        }
        if let MessageTemplate::RandomChoice { choices } = &self.message {
            if choices.is_empty() {
                return Err(PolicyError::EmptyChoices {
                    id: self.id.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub message: String,
    pub priority: bool,
    pub delay: DelayRange,
}

#[derive(Debug, Clone, Default)]
pub struct DestinationPolicy {
    rules: HashMap<DestinationId, DestinationRule>,
}

impl DestinationPolicy {
    pub fn from_rules(
        rules: impl IntoIterator<Item = DestinationRule>,
    ) -> Result<Self, PolicyError> {
        let mut table = HashMap::new();
        for rule in rules {
            rule.validate()?;
            if table.contains_key(&rule.id) {
                return Err(PolicyError::Duplicate {
                    id: rule.id.to_string(),
                });
            }
            table.insert(rule.id.clone(), rule);
        }
        Ok(Self { rules: table })
    }

    pub fn contains(&self, destination: &DestinationId) -> bool {
        self.rules.contains_key(destination)
    }

    pub fn rule(&self, destination: &DestinationId) -> Option<&DestinationRule> {
        self.rules.get(destination)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules sorted by destination id.
    pub fn rules(&self) -> Vec<&DestinationRule> {
        let mut rules: Vec<&DestinationRule> = self.rules.values().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn name_of(&self, destination: &DestinationId) -> &str {
        self.rules
            .get(destination)
            .map(|rule| rule.name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_DESTINATION_NAME)
    }

    pub fn resolve(&self, destination: &DestinationId, label: &str) -> Resolution {
        self.resolve_with(destination, label, |range| fastrand::usize(range))
    }

    /// Same as [`resolve`](Self::resolve) with an explicit chooser for
    /// `random_choice` templates; `pick(0..n)` must return an index below `n`.
    pub fn resolve_with(
        &self,
        destination: &DestinationId,
        label: &str,
        pick: impl FnOnce(std::ops::Range<usize>) -> usize,
    ) -> Resolution {
        let Some(rule) = self.rules.get(destination) else {
            return Resolution {
                message: extract_ticket_number(label).to_string(),
                priority: false,
                delay: DelayRange::ZERO,
            };
        };

        let message = match &rule.message {
            MessageTemplate::TicketNumber => extract_ticket_number(label).to_string(),
            MessageTemplate::RandomChoice { choices } => {
                let index = pick(0..choices.len()).min(choices.len().saturating_sub(1));
                choices
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| extract_ticket_number(label).to_string())
            }
            MessageTemplate::Template { text } => text
                .replace("{ticket}", extract_ticket_number(label))
                .replace("{label}", label),
        };

        Resolution {
            message,
            priority: rule.priority,
            delay: rule.delay(),
        }
    }
}

/// First maximal run of ASCII digits in `label`, or the whole label if it has none.
pub fn extract_ticket_number(label: &str) -> &str {
    let Some(start) = label.find(|c: char| c.is_ascii_digit()) else {
        return label;
    };
    let rest = &label[start..];
    let len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    &rest[..len]
}

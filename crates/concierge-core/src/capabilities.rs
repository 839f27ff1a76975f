//! Capability schema registry with pattern-based matching.
//!
//! Entries are sorted once at construction (priority descending, ties kept in
//! registration order) and the registry is read-only afterwards, so a single
//! instance can be shared across threads behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::capabilities_builtin::{BUILTIN_CAPABILITIES, BuiltinCapability};
use crate::error::{Error, Result};

/// Points awarded per trigger phrase found in the message
const TRIGGER_SCORE: f64 = 10.0;

/// Trigger phrases for one locale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSet {
    pub locale: String,
    pub phrases: Vec<String>,
}

/// A registered capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    /// Stable name (e.g. "task_create")
    pub name: String,
    /// Capability/domain tag shared with plan steps and handlers
    pub capability: String,
    /// Human-readable summary, used in disambiguation prompts
    pub summary: String,
    /// Action hints this entry can fulfill; the first one is the default
    pub actions: Vec<String>,
    /// Localized trigger phrases
    pub triggers: Vec<TriggerSet>,
    /// Worked example utterances
    #[serde(default)]
    pub examples: Vec<String>,
    pub priority: i32,
}

impl CapabilityEntry {
    /// The action a pattern match routes to
    pub fn default_action(&self) -> &str {
        self.actions.first().map(String::as_str).unwrap_or("respond")
    }

    /// What the message is about once this entry's trigger phrase is removed.
    ///
    /// Takes the text after the longest matching trigger (or before it, when
    /// nothing follows) and drops leading connector words:
    /// "remind me to buy milk" gives "buy milk".
    pub fn subject(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        let hit = self
            .triggers
            .iter()
            .flat_map(|t| t.phrases.iter())
            .filter(|p| !p.is_empty())
            .filter_map(|p| lower.find(p.as_str()).map(|at| (at, p.len())))
            .max_by_key(|(_, len)| *len);

        // Byte offsets only carry over when case folding kept the length
        let source = if lower.len() == text.len() { text } else { lower.as_str() };
        let rest = match hit {
            Some((at, len)) => match (source.get(at + len..), source.get(..at)) {
                (Some(after), _) if !after.trim().is_empty() => after,
                (_, Some(before)) => before,
                _ => source,
            },
            None => source,
        };
        strip_connectors(rest)
    }

    /// Count trigger phrases (any locale) contained in an already case-folded message
    fn count_triggers(&self, normalized: &str) -> usize {
        self.triggers
            .iter()
            .flat_map(|t| t.phrases.iter())
            .filter(|p| !p.is_empty() && normalized.contains(p.as_str()))
            .count()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_capability(&self.name, "empty name"));
        }
        if self.capability.trim().is_empty() {
            return Err(Error::invalid_capability(&self.name, "empty capability tag"));
        }
        if self.actions.is_empty() {
            return Err(Error::invalid_capability(&self.name, "no action hints"));
        }
        Ok(())
    }
}

impl BuiltinCapability {
    fn to_entry(&self) -> CapabilityEntry {
        CapabilityEntry {
            name: self.name.to_string(),
            capability: self.capability.to_string(),
            summary: self.summary.to_string(),
            actions: self.actions.iter().map(|a| a.to_string()).collect(),
            triggers: self
                .triggers
                .iter()
                .map(|(locale, phrases)| TriggerSet {
                    locale: locale.to_string(),
                    phrases: phrases.iter().map(|p| p.to_string()).collect(),
                })
                .collect(),
            examples: self.examples.iter().map(|e| e.to_string()).collect(),
            priority: self.priority,
        }
    }
}

const CONNECTORS: &[&str] = &[
    "to", "that", "about", "with", "for", "the", "a", "an", "que", "de", "la", "el",
];

fn strip_connectors(text: &str) -> String {
    let mut words: Vec<&str> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, ':' | ',' | ';' | '-')))
        .filter(|w| !w.is_empty())
        .collect();
    while words
        .first()
        .is_some_and(|w| CONNECTORS.contains(&w.to_lowercase().as_str()))
    {
        words.remove(0);
    }
    words
        .join(" ")
        .trim_end_matches(['.', '?', '!'])
        .to_string()
}

/// A registry entry that matched a message, with its score
#[derive(Debug, Clone, Copy)]
pub struct PatternMatch<'a> {
    pub entry: &'a CapabilityEntry,
    pub score: f64,
}

/// Priority-ordered catalog of capabilities
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    entries: Vec<CapabilityEntry>,
}

impl CapabilityRegistry {
    /// Build a registry from entries in registration order.
    ///
    /// Trigger phrases are case-folded here so matching only folds the message.
    pub fn new(entries: Vec<CapabilityEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            entry.validate()?;
            if !seen.insert(entry.name.clone()) {
                return Err(Error::DuplicateCapability(entry.name.clone()));
            }
        }
        Ok(Self::sorted(entries))
    }

    /// The builtin catalog
    pub fn builtin() -> Self {
        Self::sorted(BUILTIN_CAPABILITIES.iter().map(|b| b.to_entry()).collect())
    }

    fn sorted(mut entries: Vec<CapabilityEntry>) -> Self {
        for entry in &mut entries {
            for set in &mut entry.triggers {
                for phrase in &mut set.phrases {
                    *phrase = phrase.to_lowercase();
                }
            }
        }
        // sort_by is stable: equal priorities keep registration order
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { entries }
    }

    /// All entries, priority descending
    pub fn entries(&self) -> &[CapabilityEntry] {
        &self.entries
    }

    /// Look up an entry by name
    pub fn get(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Find the entry that serves a capability/action pair
    pub fn find_action(&self, capability: &str, action: &str) -> Option<&CapabilityEntry> {
        self.entries
            .iter()
            .find(|e| e.capability == capability && e.actions.iter().any(|a| a == action))
    }

    /// Score every entry against the message and return the matching ones,
    /// best first. Ties keep registry order.
    pub fn match_patterns(&self, message: &str) -> Vec<PatternMatch<'_>> {
        self.match_patterns_where(message, |_| true)
    }

    /// Like [`match_patterns`](Self::match_patterns), restricted to entries accepted by `filter`
    pub fn match_patterns_where(
        &self,
        message: &str,
        filter: impl Fn(&CapabilityEntry) -> bool,
    ) -> Vec<PatternMatch<'_>> {
        let normalized = message.to_lowercase();
        let mut matches: Vec<PatternMatch<'_>> = self
            .entries
            .iter()
            .filter(|e| filter(e))
            .filter_map(|entry| {
                let hits = entry.count_triggers(&normalized);
                if hits == 0 {
                    return None;
                }
                let score = hits as f64 * TRIGGER_SCORE + entry.priority as f64 / 10.0;
                (score > 0.0).then_some(PatternMatch { entry, score })
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches
    }

    /// Highest-scoring entry, if any matched
    pub fn best_match(&self, message: &str) -> Option<&CapabilityEntry> {
        self.match_patterns(message).first().map(|m| m.entry)
    }

    /// One line per entry, for classifier system context
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "- {} (capability: {}, actions: {}): {}",
                    e.name,
                    e.capability,
                    e.actions.join(", "),
                    e.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Build a human-readable disambiguation prompt from pattern matches
pub fn disambiguation_message(matches: &[PatternMatch<'_>]) -> String {
    match matches {
        [] => "I'm not sure what you'd like me to do. Could you rephrase that?".to_string(),
        [only] => format!("Did you mean: {}?", only.entry.summary.to_lowercase()),
        many => {
            let mut out = String::from("I found several possible matches:\n");
            for (i, m) in many.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, m.entry.summary));
            }
            out.push_str("Which one did you mean?");
            out
        }
    }
}

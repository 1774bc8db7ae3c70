// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Prompt-rule engine
//!
//! Matches captured output against a configured rule list and produces an
//! incremental-output signal with optional buttons. Rules are compiled once
//! at load: regexes pre-compiled, keyword sets normalized to the configured
//! case sensitivity. The compiled engine is immutable; a reload builds a new
//! one and swaps the pointer.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// A button offered alongside a matched prompt. `action` is the literal text
/// sent to the terminal when the button is pressed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ButtonSpec {
    pub label: String,
    pub action: String,
}

/// Result of evaluating a capture against the rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub rule_id: String,
    pub incremental: bool,
    pub buttons: Vec<ButtonSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RulesFile {
    rules: RulesSection,
    user_overrides: OverridesSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RulesSection {
    enabled: bool,
    default_silence: bool,
    matchers: Vec<MatcherSpec>,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_silence: true,
            matchers: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverridesSection {
    users: HashMap<String, UserOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserOverride {
    pub enabled: Option<bool>,
    pub force_incremental: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MatcherSpec {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "default_matcher_type")]
    r#type: String,
    #[serde(default)]
    pattern: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default = "default_true")]
    case_sensitive: bool,
    #[serde(default)]
    incremental_output: bool,
    #[serde(default)]
    buttons: Vec<ButtonSpec>,
}

fn default_matcher_type() -> String {
    "keyword".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Keywords {
        keywords: Vec<String>,
        case_sensitive: bool,
    },
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    matcher: Matcher,
    incremental_output: bool,
    buttons: Vec<ButtonSpec>,
}

impl CompiledRule {
    fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(pattern) => pattern.is_match(text),
            Matcher::Keywords {
                keywords,
                case_sensitive,
            } => {
                let haystack = if *case_sensitive {
                    text.to_string()
                } else {
                    text.to_lowercase()
                };
                keywords.iter().any(|k| haystack.contains(k))
            }
        }
    }
}

/// Immutable compiled rule set.
#[derive(Debug)]
pub struct PromptRuleEngine {
    enabled: bool,
    default_silence: bool,
    rules: Vec<CompiledRule>,
    overrides: HashMap<String, UserOverride>,
}

impl Default for PromptRuleEngine {
    fn default() -> Self {
        Self {
            enabled: true,
            default_silence: true,
            rules: Vec::new(),
            overrides: HashMap::new(),
        }
    }
}

impl PromptRuleEngine {
    /// Load and compile rules. A missing file yields the default engine.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let file: RulesFile = serde_yaml::from_str(&contents)?;
        Self::compile(file)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(contents)?;
        Self::compile(file)
    }

    fn compile(file: RulesFile) -> Result<Self> {
        let mut rules = Vec::with_capacity(file.rules.matchers.len());
        for (index, spec) in file.rules.matchers.into_iter().enumerate() {
            let id = spec.id.unwrap_or_else(|| format!("rule-{index}"));
            let matcher = match spec.r#type.as_str() {
                "regex" => {
                    let pattern = if spec.case_sensitive {
                        spec.pattern.clone()
                    } else {
                        format!("(?i){}", spec.pattern)
                    };
                    Matcher::Regex(Regex::new(&pattern).map_err(|source| {
                        Error::InvalidPattern {
                            pattern: spec.pattern.clone(),
                            source,
                        }
                    })?)
                }
                _ => Matcher::Keywords {
                    keywords: if spec.case_sensitive {
                        spec.keywords
                    } else {
                        spec.keywords.iter().map(|k| k.to_lowercase()).collect()
                    },
                    case_sensitive: spec.case_sensitive,
                },
            };
            rules.push(CompiledRule {
                id,
                matcher,
                incremental_output: spec.incremental_output,
                buttons: spec.buttons,
            });
        }
        Ok(Self {
            enabled: file.rules.enabled,
            default_silence: file.rules.default_silence,
            rules,
            overrides: file.user_overrides.users,
        })
    }

    /// Evaluate captured text for a user. `None` means stay silent.
    pub fn evaluate(&self, text: &str, user_id: &str) -> Option<Signal> {
        if !self.enabled {
            return None;
        }
        let user = self.overrides.get(user_id);
        // A user-level disable wins over everything, including
        // force_incremental set on the same override.
        if user.is_some_and(|o| o.enabled == Some(false)) {
            return None;
        }

        for rule in &self.rules {
            if rule.matches(text) {
                let incremental = match user.and_then(|o| o.force_incremental) {
                    Some(forced) => forced,
                    None => rule.incremental_output,
                };
                return Some(Signal {
                    rule_id: rule.id.clone(),
                    incremental,
                    buttons: rule.buttons.clone(),
                });
            }
        }

        if self.default_silence {
            None
        } else {
            Some(Signal {
                rule_id: "default".to_string(),
                incremental: true,
                buttons: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
rules:
  enabled: true
  default_silence: true
  matchers:
    - id: confirm
      type: regex
      pattern: "\\?\\s*$"
      incremental_output: true
      buttons:
        - { label: "Yes", action: "y" }
        - { label: "No", action: "n" }
    - id: password
      type: keyword
      keywords: ["Password:", "passphrase"]
      case_sensitive: false
      incremental_output: false
user_overrides:
  users:
    "7": { enabled: false, force_incremental: true }
    "8": { force_incremental: true }
"#;

    fn engine() -> PromptRuleEngine {
        PromptRuleEngine::from_yaml(RULES).unwrap()
    }

    #[test]
    fn first_match_wins_with_buttons() {
        let signal = engine().evaluate("Proceed?", "42").unwrap();
        assert_eq!(signal.rule_id, "confirm");
        assert!(signal.incremental);
        assert_eq!(signal.buttons.len(), 2);
        assert_eq!(signal.buttons[0].action, "y");
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let signal = engine().evaluate("Enter PASSWORD: ", "42").unwrap();
        assert_eq!(signal.rule_id, "password");
        assert!(!signal.incremental);
    }

    #[test]
    fn no_match_is_silent_by_default() {
        assert_eq!(engine().evaluate("compiling...", "42"), None);
    }

    #[test]
    fn disabled_user_sees_nothing_even_with_force() {
        assert_eq!(engine().evaluate("Proceed?", "7"), None);
    }

    #[test]
    fn force_incremental_overrides_rule() {
        let signal = engine().evaluate("Password:", "8").unwrap();
        assert!(signal.incremental);
    }

    #[test]
    fn default_signal_when_silence_disabled() {
        let yaml = "rules:\n  default_silence: false\n";
        let engine = PromptRuleEngine::from_yaml(yaml).unwrap();
        let signal = engine.evaluate("anything", "42").unwrap();
        assert_eq!(signal.rule_id, "default");
        assert!(signal.incremental);
        assert!(signal.buttons.is_empty());
    }

    #[test]
    fn missing_file_yields_default_engine() {
        let engine = PromptRuleEngine::load(Path::new("/nonexistent/rules.yaml")).unwrap();
        assert_eq!(engine.evaluate("Proceed?", "42"), None);
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Command policy
//!
//! A pure predicate over outgoing shell commands. Patterns are compiled once
//! at construction; evaluation has no side effects.

use regex::Regex;

use crate::config::CommandPolicyConfig;
use crate::error::{Error, Result};

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    Empty,
    TooLong,
    Blocked,
    NotAllowlisted,
}

impl PolicyViolation {
    /// Stable token used in audit records and user responses.
    pub fn token(self) -> &'static str {
        match self {
            PolicyViolation::Empty => "empty",
            PolicyViolation::TooLong => "too_long",
            PolicyViolation::Blocked => "blocked",
            PolicyViolation::NotAllowlisted => "not_allowlisted",
        }
    }
}

/// Compiled command policy.
#[derive(Debug)]
pub struct CommandPolicy {
    max_length: usize,
    blocked: Vec<Regex>,
    allowed: Vec<Regex>,
    require_allowlist: bool,
}

impl CommandPolicy {
    pub fn compile(config: &CommandPolicyConfig) -> Result<Self> {
        Ok(Self {
            max_length: config.max_length,
            blocked: compile_all(&config.blocked_patterns)?,
            allowed: compile_all(&config.allowed_patterns)?,
            require_allowlist: config.require_allowlist,
        })
    }

    /// Check a command. `Ok(())` means it may be sent to the terminal.
    pub fn check(&self, command: &str) -> std::result::Result<(), PolicyViolation> {
        if command.trim().is_empty() {
            return Err(PolicyViolation::Empty);
        }
        if command.len() > self.max_length {
            return Err(PolicyViolation::TooLong);
        }
        if self.blocked.iter().any(|p| p.is_match(command)) {
            return Err(PolicyViolation::Blocked);
        }
        // allowed_patterns are inert unless the allowlist is required.
        if self.require_allowlist && !self.allowed.iter().any(|p| p.is_match(command)) {
            return Err(PolicyViolation::NotAllowlisted);
        }
        Ok(())
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| Error::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(config: CommandPolicyConfig) -> CommandPolicy {
        CommandPolicy::compile(&config).unwrap()
    }

    #[test]
    fn blocked_pattern_rejects() {
        let policy = policy(CommandPolicyConfig {
            blocked_patterns: vec!["rm -rf /".to_string()],
            ..Default::default()
        });
        assert_eq!(policy.check("rm -rf /"), Err(PolicyViolation::Blocked));
        assert_eq!(policy.check("ls"), Ok(()));
    }

    #[test]
    fn allowlist_enforced_only_when_required() {
        let required = policy(CommandPolicyConfig {
            allowed_patterns: vec!["^echo".to_string()],
            require_allowlist: true,
            ..Default::default()
        });
        assert_eq!(required.check("ls"), Err(PolicyViolation::NotAllowlisted));
        assert_eq!(required.check("echo ok"), Ok(()));

        let inert = policy(CommandPolicyConfig {
            allowed_patterns: vec!["^echo".to_string()],
            require_allowlist: false,
            ..Default::default()
        });
        assert_eq!(inert.check("ls"), Ok(()));
    }

    #[test]
    fn length_and_emptiness() {
        let policy = policy(CommandPolicyConfig {
            max_length: 5,
            ..Default::default()
        });
        assert_eq!(policy.check("   "), Err(PolicyViolation::Empty));
        assert_eq!(policy.check("123456"), Err(PolicyViolation::TooLong));
        assert_eq!(policy.check("12345"), Ok(()));
    }

    #[test]
    fn check_is_deterministic() {
        let policy = policy(CommandPolicyConfig {
            blocked_patterns: vec!["sudo".to_string()],
            ..Default::default()
        });
        for _ in 0..3 {
            assert_eq!(policy.check("sudo id"), Err(PolicyViolation::Blocked));
        }
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let result = CommandPolicy::compile(&CommandPolicyConfig {
            blocked_patterns: vec!["(".to_string()],
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::InvalidPattern { .. })));
    }
}

// SPF Tool Gateway - Access Policy Engine
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Evaluates a path or shell command against a session's policy.
// - Blacklist beats whitelist (deny-wins)
// - Empty whitelist = deny (fail-closed)
// - Shell commands: forbidden patterns only, no whitelist
// - Malformed pattern = evaluation error, never allow or deny

use crate::error::GatewayError;
use crate::paths;
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-session access policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub working_dir: PathBuf,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub shell_forbidden_patterns: Vec<String>,
    #[serde(default)]
    pub is_customized: bool,
    #[serde(default)]
    pub customized_at: Option<DateTime<Utc>>,
}

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum AccessDecision {
    Allow,
    Deny { reason: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Blacklist applied to every default policy
const DEFAULT_BLACKLIST: &[&str] = &[
    "**/.env",
    "**/*.env",
    "**/.git/**",
    "**/.ssh/**",
    "**/.aws/**",
    "**/.gnupg/**",
    "**/*.pem",
    "**/id_rsa*",
];

/// Forbidden shell fragments. Entries with glob metacharacters are matched
/// as globs against the whole command, the rest as substrings.
const DEFAULT_SHELL_FORBIDDEN: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "dd if=",
    "> /dev/",
    "chmod 777",
    "mkfs",
    ":(){ :|:& };:",
    "curl*|*sh",
    "wget*|*sh",
    "git push*--force*",
];

impl AccessPolicy {
    /// Default policy derived from a session's working directory:
    /// everything under the directory, minus secrets and VCS internals.
    pub fn for_working_dir(working_dir: &Path) -> Self {
        let root = std::fs::canonicalize(working_dir)
            .unwrap_or_else(|_| paths::normalize(working_dir));
        let root_str = root.to_string_lossy().trim_end_matches('/').to_string();
        let whitelist = if root_str.is_empty() {
            vec!["/**".to_string()]
        } else {
            let escaped = escape_glob(&root_str);
            vec![escaped.clone(), format!("{}/**", escaped)]
        };
        Self {
            working_dir: root,
            whitelist,
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            shell_forbidden_patterns: DEFAULT_SHELL_FORBIDDEN.iter().map(|s| s.to_string()).collect(),
            is_customized: false,
            customized_at: None,
        }
    }
}

fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        match c {
            '*' | '?' | '[' | ']' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

fn path_match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn compile(pattern: &str) -> Result<Pattern, GatewayError> {
    Pattern::new(pattern)
        .map_err(|e| GatewayError::PolicyEvaluation(format!("malformed pattern '{}': {}", pattern, e)))
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Check a filesystem path. Relative paths resolve against the policy's
/// working directory.
pub fn check_path(policy: &AccessPolicy, path: &str) -> Result<AccessDecision, GatewayError> {
    let resolved = paths::resolve_path(&policy.working_dir, path);
    let target = resolved.to_string_lossy();
    let options = path_match_options();

    // Compile everything first: a malformed entry anywhere is an error,
    // not a silent skip
    let blacklist = policy.blacklist.iter().map(|p| compile(p).map(|c| (p, c))).collect::<Result<Vec<_>, _>>()?;
    let whitelist = policy.whitelist.iter().map(|p| compile(p)).collect::<Result<Vec<_>, _>>()?;

    // Deny-wins, first match reported
    if let Some((raw, _)) = blacklist.iter().find(|(_, p)| p.matches_with(&target, options)) {
        return Ok(AccessDecision::Deny {
            reason: format!("path {} matches blacklist pattern '{}'", target, raw),
        });
    }

    if whitelist.is_empty() {
        return Ok(AccessDecision::Deny {
            reason: format!("path {} denied: whitelist is empty", target),
        });
    }

    if whitelist.iter().any(|p| p.matches_with(&target, options)) {
        Ok(AccessDecision::Allow)
    } else {
        Ok(AccessDecision::Deny {
            reason: format!("path {} matches no whitelist pattern", target),
        })
    }
}

/// Check a shell command against the forbidden patterns
pub fn check_shell_command(policy: &AccessPolicy, command: &str) -> Result<AccessDecision, GatewayError> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");

    for raw in &policy.shell_forbidden_patterns {
        let hit = if has_glob_meta(raw) {
            let mut wrapped = raw.clone();
            if !wrapped.starts_with('*') {
                wrapped.insert(0, '*');
            }
            if !wrapped.ends_with('*') {
                wrapped.push('*');
            }
            let pattern = compile(&wrapped)?;
            pattern.matches_with(&normalized, options)
        } else {
            normalized.contains(raw.as_str())
        };
        if hit {
            return Ok(AccessDecision::Deny {
                reason: format!("command matches forbidden pattern '{}'", raw),
            });
        }
    }
    Ok(AccessDecision::Allow)
}

// ============================================================================
// TESTS
// ============================================================================

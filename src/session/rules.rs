//! Always-allow rules
//!
//! A rule auto-approves future calls of one tool within a session, either
//! for identical parameters (`exact`) or for parameters matching a pattern
//! (`pattern`). Rules live in the session options so they persist with the
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Wildcard accepted by every pattern field
const ANY: &str = "*";

/// How a rule compares tool parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchMode {
    Exact,
    Pattern,
}

/// Parameter constraints of a `pattern` rule; `*` accepts anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePattern {
    /// `Bash`: command must start with this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_prefix: Option<String>,
    /// `Read`/`Write`/`Edit`: file must be inside this directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path_pattern: Option<String>,
    /// `Grep`: glob over the search path; `Glob`: prefix of the pattern
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
}

/// Auto-approval rule for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlwaysAllowRule {
    /// Assigned when the rule is added if left empty
    #[serde(default)]
    pub id: String,
    pub tool: String,
    pub match_mode: RuleMatchMode,
    /// Parameters an `exact` rule must equal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<RulePattern>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl AlwaysAllowRule {
    /// Rule allowing every call of `tool`
    pub fn allow_all(tool: &str) -> Self {
        let mut pattern = RulePattern::default();
        match tool {
            "Bash" => pattern.command_prefix = Some(ANY.to_string()),
            "Read" | "Write" | "Edit" => {
                pattern.directory_path = Some(ANY.to_string());
                pattern.file_path_pattern = Some(ANY.to_string());
            }
            "Glob" | "Grep" => pattern.path_pattern = Some(ANY.to_string()),
            _ => {}
        }

        let mut rule = Self {
            id: String::new(),
            tool: tool.to_string(),
            match_mode: RuleMatchMode::Pattern,
            parameters: None,
            pattern: Some(pattern),
            description: String::new(),
            created_at: None,
        };
        rule.description = rule.describe();
        rule
    }

    /// Reject rules that could never match
    pub fn validate(&self) -> crate::Result<()> {
        if self.tool.is_empty() {
            return Err(crate::Error::InvalidRule("tool is required".to_string()));
        }
        match self.match_mode {
            RuleMatchMode::Exact if self.parameters.is_none() => Err(crate::Error::InvalidRule(
                "exact rules need parameters".to_string(),
            )),
            RuleMatchMode::Pattern if self.pattern.is_none() => Err(crate::Error::InvalidRule(
                "pattern rules need a pattern".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether this rule auto-approves the call
    pub fn matches(&self, tool: &str, input: &serde_json::Value) -> bool {
        if self.tool != tool {
            return false;
        }
        match self.match_mode {
            RuleMatchMode::Exact => self.parameters.as_ref() == Some(input),
            RuleMatchMode::Pattern => match &self.pattern {
                Some(pattern) => pattern.matches(tool, input),
                None => false,
            },
        }
    }

    /// Human-readable summary shown in rule lists
    pub fn describe(&self) -> String {
        if self.match_mode == RuleMatchMode::Exact {
            return format!("Exact {} call", self.tool);
        }
        let Some(pattern) = &self.pattern else {
            return "Pattern match".to_string();
        };

        let fields = [
            &pattern.command_prefix,
            &pattern.directory_path,
            &pattern.path_pattern,
        ];
        if fields.iter().any(|f| f.as_deref() == Some(ANY)) {
            return match self.tool.as_str() {
                "Read" | "Write" | "Edit" => format!("All {} operations (any file)", self.tool),
                "Bash" => "All Bash commands".to_string(),
                tool => format!("All {} operations", tool),
            };
        }

        let described = match self.tool.as_str() {
            "Bash" => pattern
                .command_prefix
                .as_ref()
                .map(|p| format!("All commands starting with: {}", p)),
            "Read" => pattern
                .directory_path
                .as_ref()
                .map(|d| format!("All files in: {}/", d)),
            "Write" => pattern
                .directory_path
                .as_ref()
                .map(|d| format!("All writes to: {}/", d)),
            "Edit" => pattern
                .directory_path
                .as_ref()
                .map(|d| format!("All edits in: {}/", d)),
            "Grep" | "Glob" => pattern
                .path_pattern
                .as_ref()
                .map(|p| format!("Pattern: {}", p)),
            tool => Some(format!("All {} operations", tool)),
        };
        described.unwrap_or_else(|| "Pattern match".to_string())
    }
}

impl RulePattern {
    fn matches(&self, tool: &str, input: &serde_json::Value) -> bool {
        let field = |key: &str| input.get(key).and_then(|v| v.as_str());

        match tool {
            "Bash" => match self.command_prefix.as_deref() {
                Some(ANY) => true,
                Some(prefix) => field("command").is_some_and(|c| c.starts_with(prefix)),
                None => false,
            },
            "Read" | "Write" | "Edit" => match self.directory_path.as_deref() {
                Some(ANY) | Some("/**") => true,
                Some(dir) => field("file_path").is_some_and(|f| is_within(dir, f)),
                None => false,
            },
            "Grep" => match self.path_pattern.as_deref() {
                Some(ANY) => true,
                Some(glob) => field("path").is_some_and(|p| glob_matches(glob, p)),
                None => false,
            },
            "Glob" => match self.path_pattern.as_deref() {
                Some(ANY) => true,
                Some(prefix) => field("pattern")
                    .is_some_and(|p| p.starts_with(prefix.trim_end_matches('*'))),
                None => false,
            },
            // Other tools take no parameter constraints
            _ => true,
        }
    }
}

/// First rule that auto-approves the call
pub fn find_match<'a>(
    rules: &'a [AlwaysAllowRule],
    tool: &str,
    input: &serde_json::Value,
) -> Option<&'a AlwaysAllowRule> {
    rules.iter().find(|rule| rule.matches(tool, input))
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
    {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(e) => {
            tracing::debug!("Ignoring invalid rule glob {}: {}", pattern, e);
            false
        }
    }
}

/// Whether `file` lies inside `dir`, both resolved against the current directory
fn is_within(dir: &str, file: &str) -> bool {
    let base = std::env::current_dir().unwrap_or_default();
    normalize(&base.join(file)).starts_with(normalize(&base.join(dir)))
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern_rule(tool: &str, pattern: RulePattern) -> AlwaysAllowRule {
        AlwaysAllowRule {
            id: "r1".to_string(),
            tool: tool.to_string(),
            match_mode: RuleMatchMode::Pattern,
            parameters: None,
            pattern: Some(pattern),
            description: String::new(),
            created_at: None,
        }
    }

    #[test]
    fn test_exact_rule_needs_equal_parameters() {
        let rule = AlwaysAllowRule {
            id: "r1".to_string(),
            tool: "Bash".to_string(),
            match_mode: RuleMatchMode::Exact,
            parameters: Some(json!({"command": "cargo fmt", "timeout": 60})),
            pattern: None,
            description: String::new(),
            created_at: None,
        };

        // Key order does not matter
        assert!(rule.matches("Bash", &json!({"timeout": 60, "command": "cargo fmt"})));
        assert!(!rule.matches("Bash", &json!({"command": "cargo fmt"})));
        assert!(!rule.matches("Bash", &json!({"command": "cargo fmt --all", "timeout": 60})));
        assert!(!rule.matches("Read", &json!({"command": "cargo fmt", "timeout": 60})));
    }

    #[test]
    fn test_bash_command_prefix() {
        let rule = pattern_rule(
            "Bash",
            RulePattern {
                command_prefix: Some("git ".to_string()),
                ..Default::default()
            },
        );
        assert!(rule.matches("Bash", &json!({"command": "git status"})));
        assert!(!rule.matches("Bash", &json!({"command": "rm -rf .git"})));
        assert!(!rule.matches("Bash", &json!({})));
        assert_eq!(rule.describe(), "All commands starting with: git ");
    }

    #[test]
    fn test_directory_containment() {
        let rule = pattern_rule(
            "Write",
            RulePattern {
                directory_path: Some("/srv/app".to_string()),
                ..Default::default()
            },
        );
        assert!(rule.matches("Write", &json!({"file_path": "/srv/app/src/main.rs"})));
        assert!(!rule.matches("Write", &json!({"file_path": "/srv/app/../etc/passwd"})));
        assert!(!rule.matches("Write", &json!({"file_path": "/srv/application.rs"})));
        assert!(!rule.matches("Read", &json!({"file_path": "/srv/app/a.rs"})));
    }

    #[test]
    fn test_grep_and_glob_paths() {
        let grep = pattern_rule(
            "Grep",
            RulePattern {
                path_pattern: Some("src/*".to_string()),
                ..Default::default()
            },
        );
        assert!(grep.matches("Grep", &json!({"pattern": "fn", "path": "src/lib.rs"})));
        assert!(!grep.matches("Grep", &json!({"pattern": "fn", "path": "src/session/actor.rs"})));

        let glob = pattern_rule(
            "Glob",
            RulePattern {
                path_pattern: Some("src/*".to_string()),
                ..Default::default()
            },
        );
        assert!(glob.matches("Glob", &json!({"pattern": "src/**/*.rs"})));
        assert!(!glob.matches("Glob", &json!({"pattern": "tests/*.rs"})));
    }

    #[test]
    fn test_allow_all_rules() {
        let bash = AlwaysAllowRule::allow_all("Bash");
        assert!(bash.matches("Bash", &json!({"command": "anything"})));
        assert_eq!(bash.description, "All Bash commands");

        let edit = AlwaysAllowRule::allow_all("Edit");
        assert!(edit.matches("Edit", &json!({"file_path": "/any/where.rs"})));
        assert_eq!(edit.description, "All Edit operations (any file)");

        let fetch = AlwaysAllowRule::allow_all("WebFetch");
        assert!(fetch.matches("WebFetch", &json!({"url": "https://example.com"})));
        assert!(!fetch.matches("WebSearch", &json!({})));
    }

    #[test]
    fn test_validate() {
        assert!(AlwaysAllowRule::allow_all("Bash").validate().is_ok());

        let mut rule = AlwaysAllowRule::allow_all("Bash");
        rule.match_mode = RuleMatchMode::Exact;
        assert!(matches!(rule.validate(), Err(crate::Error::InvalidRule(_))));

        rule.tool.clear();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_find_match_and_wire_format() {
        let rules: Vec<AlwaysAllowRule> = serde_json::from_value(json!([
            {"tool": "Bash", "match_mode": "pattern", "pattern": {"command_prefix": "ls"}},
            {"tool": "Read", "match_mode": "exact", "parameters": {"file_path": "a.txt"}}
        ]))
        .unwrap();

        assert_eq!(
            find_match(&rules, "Read", &json!({"file_path": "a.txt"})).map(|r| r.tool.as_str()),
            Some("Read")
        );
        assert!(find_match(&rules, "Bash", &json!({"command": "ls -la"})).is_some());
        assert!(find_match(&rules, "Bash", &json!({"command": "rm"})).is_none());
    }
}

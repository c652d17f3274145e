//! Deterministic routing on message keywords

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::IntentRouter;
use crate::domain::{ChatMessage, ProviderKind, ToolDescriptor, ToolInvocation};
use crate::mcp::registry::ProviderCapabilities;

const ISSUE_KEY_PATTERN: &str = r"\b[A-Z][A-Z0-9]+-\d+\b";
const MAX_ISSUE_KEYS: usize = 5;

// Phrases match as substrings. English words match whole tokens, plurals
// included; Cyrillic entries are stems and match as token prefixes.
const SOURCE_CONTROL_WORDS: &[&str] = &[
    "source control",
    "merge request",
    "pull request",
    "repo",
    "repository",
    "repositories",
    "project",
    "commit",
    "branch",
    "pipeline",
    "gitlab",
    "github",
    "git",
    "code",
    "репозитор",
    "проект",
    "коммит",
    "ветк",
    "мерж",
];

const TRACKER_WORDS: &[&str] = &[
    "issue",
    "ticket",
    "task",
    "bug",
    "epic",
    "sprint",
    "backlog",
    "jira",
    "confluence",
    "wiki",
    "page",
    "documentation",
    "docs",
    "задач",
    "тикет",
    "баг",
    "спринт",
    "документац",
    "страниц",
];

const DIRECTORY_WORDS: &[&str] = &[
    "who is",
    "user",
    "employee",
    "colleague",
    "group",
    "member",
    "email",
    "phone",
    "department",
    "ldap",
    "пользовател",
    "сотрудник",
    "коллег",
    "групп",
    "отдел",
];

pub struct KeywordRouter {
    issue_key: Option<Regex>,
}

impl KeywordRouter {
    pub fn new() -> Self {
        Self {
            issue_key: Regex::new(ISSUE_KEY_PATTERN).ok(),
        }
    }

    fn issue_keys(&self, message: &str) -> Vec<String> {
        let Some(re) = &self.issue_key else {
            return Vec::new();
        };
        let mut keys: Vec<String> = Vec::new();
        for m in re.find_iter(message) {
            if !keys.iter().any(|k| k == m.as_str()) {
                keys.push(m.as_str().to_string());
            }
            if keys.len() == MAX_ISSUE_KEYS {
                break;
            }
        }
        keys
    }

    fn route_provider(
        &self,
        provider: &ProviderCapabilities,
        message: &str,
        text: &Text,
        issue_keys: &[String],
    ) -> Vec<ToolInvocation> {
        let query = message.trim();

        if provider.kind == ProviderKind::IssueTracker && !issue_keys.is_empty() {
            if let Some(tool) = find_tool(&provider.tools, &["get_issue"]) {
                return issue_keys
                    .iter()
                    .map(|key| {
                        ToolInvocation::new(&provider.provider_id, &tool.name)
                            .with_argument("issue_key", key.as_str())
                    })
                    .collect();
            }
        }

        let own_words: Vec<&str> = provider
            .keywords
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(provider.provider_id.as_str()))
            .collect();
        let kind_words = match provider.kind {
            ProviderKind::SourceControl => SOURCE_CONTROL_WORDS,
            ProviderKind::IssueTracker => TRACKER_WORDS,
            ProviderKind::Directory => DIRECTORY_WORDS,
        };
        if !text.matches_any(&own_words) && !text.matches_any(kind_words) {
            return Vec::new();
        }

        let preferred: &[&str] = match provider.kind {
            ProviderKind::SourceControl => {
                if text.matches_any(&["merge request", "pull request", "мерж"]) {
                    &["list_merge_requests", "search"]
                } else if text.matches_any(&[
                    "project",
                    "repo",
                    "repository",
                    "repositories",
                    "проект",
                    "репозитор",
                ]) {
                    &["list_projects", "search"]
                } else {
                    &["search", "list_projects"]
                }
            }
            ProviderKind::IssueTracker => {
                if text.matches_any(&[
                    "confluence",
                    "wiki",
                    "page",
                    "docs",
                    "documentation",
                    "документац",
                    "страниц",
                ]) {
                    &["search_pages", "search_issues"]
                } else {
                    &["search_issues", "search_pages"]
                }
            }
            ProviderKind::Directory => {
                if text.matches_any(&["group", "member", "групп", "отдел"]) {
                    &["list_group_members", "find_user"]
                } else {
                    &["find_user", "list_group_members"]
                }
            }
        };

        let Some(tool) = find_tool(&provider.tools, preferred) else {
            debug!(provider = %provider.provider_id, "Keyword match but no suitable tool");
            return Vec::new();
        };

        let mut invocation = ToolInvocation::new(&provider.provider_id, &tool.name);
        if accepts_argument(tool, "query") {
            invocation = invocation.with_argument("query", query);
        }
        vec![invocation]
    }
}

impl Default for KeywordRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntentRouter for KeywordRouter {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn propose(
        &self,
        message: &str,
        _history: &[ChatMessage],
        available: &[ProviderCapabilities],
    ) -> Vec<ToolInvocation> {
        let text = Text::new(message);
        let issue_keys = self.issue_keys(message);

        available
            .iter()
            .flat_map(|provider| self.route_provider(provider, message, &text, &issue_keys))
            .collect()
    }
}

/// Lowercased message plus its word tokens
struct Text {
    lower: String,
    tokens: Vec<String>,
}

impl Text {
    fn new(message: &str) -> Self {
        let lower = message.to_lowercase();
        let tokens = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self { lower, tokens }
    }

    fn matches(&self, word: &str) -> bool {
        let word = word.to_lowercase();
        if word.contains(' ') {
            self.lower.contains(&word)
        } else if word.is_ascii() {
            self.tokens.iter().any(|t| is_inflection(t, &word))
        } else {
            self.tokens.iter().any(|t| t.starts_with(&word))
        }
    }

    fn matches_any(&self, words: &[&str]) -> bool {
        words.iter().any(|w| !w.is_empty() && self.matches(w))
    }
}

/// `token` is `word` or its plain English plural
fn is_inflection(token: &str, word: &str) -> bool {
    matches!(token.strip_prefix(word), Some("" | "s" | "es"))
}

/// First tool in the catalog matching the preference order
fn find_tool<'a>(tools: &'a [ToolDescriptor], preferred: &[&str]) -> Option<&'a ToolDescriptor> {
    preferred
        .iter()
        .find_map(|name| tools.iter().find(|t| t.name == *name))
        .or_else(|| tools.iter().find(|t| t.name.contains("search")))
}

/// Whether the tool's input schema has room for `key`; open schemas accept anything
fn accepts_argument(tool: &ToolDescriptor, key: &str) -> bool {
    match tool
        .input_schema
        .as_ref()
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object())
    {
        Some(props) => props.contains_key(key),
        None => true,
    }
}

//! Branch protection
//!
//! Rules live in a kind-30620 event keyed by `d = <repo id>`, authored by the
//! repository owner. The content holds a JSON array of rules and the same
//! rules are repeated as `branch` tags:
//!
//! ```text
//! ["branch", "main"]
//! ["branch", "main", "require-pr"]
//! ["branch", "main", "allow-force-push"]
//! ["branch", "main", "require-reviewers", <key>...]
//! ["branch", "main", "require-status", <check>...]
//! ["branch", "main", "allowed-maintainers", <key>...]
//! ```
//!
//! JSON wins when it parses; tags are the fallback.

use forgestr_relay::{
    normalize_key, Event, EventSource, Filter, UnsignedEvent, KIND_BRANCH_PROTECTION,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::Result;

const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchRule {
    pub branch: String,
    pub require_pull_request: bool,
    pub require_reviewers: Vec<String>,
    pub allow_force_push: bool,
    pub require_status_checks: Vec<String>,
    pub allowed_maintainers: Vec<String>,
}

impl BranchRule {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            ..Default::default()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtectionError {
    #[error("not a branch protection event (kind {0})")]
    WrongKind(u16),

    #[error("malformed protection rules: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PushDecision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RulesContent {
    List(Vec<BranchRule>),
    Wrapped { rules: Vec<BranchRule> },
}

/// Rules carried by a protection event
pub fn parse_protection_event(event: &Event) -> std::result::Result<Vec<BranchRule>, ProtectionError> {
    if event.kind != KIND_BRANCH_PROTECTION {
        return Err(ProtectionError::WrongKind(event.kind));
    }

    let content = event.content.trim();
    if !content.is_empty() {
        match serde_json::from_str::<RulesContent>(content) {
            Ok(RulesContent::List(rules)) | Ok(RulesContent::Wrapped { rules }) => return Ok(rules),
            Err(e) => {
                if !has_branch_tags(event) {
                    return Err(ProtectionError::Malformed(e.to_string()));
                }
                debug!("Protection event {} has bad JSON, using tags: {}", event.id, e);
            }
        }
    }

    Ok(rules_from_tags(event))
}

fn has_branch_tags(event: &Event) -> bool {
    event
        .tags
        .iter()
        .any(|tag| tag.len() >= 2 && tag[0] == "branch")
}

fn rules_from_tags(event: &Event) -> Vec<BranchRule> {
    let mut rules: Vec<BranchRule> = Vec::new();

    for tag in event.tags.iter().filter(|t| t.len() >= 2 && t[0] == "branch") {
        let name = &tag[1];
        let idx = match rules.iter().position(|r| &r.branch == name) {
            Some(idx) => idx,
            None => {
                rules.push(BranchRule::new(name.clone()));
                rules.len() - 1
            }
        };
        let rule = &mut rules[idx];
        let values = || tag.iter().skip(3).cloned();

        match tag.get(2).map(String::as_str) {
            None => {}
            Some("require-pr") => rule.require_pull_request = true,
            Some("allow-force-push") => rule.allow_force_push = true,
            Some("require-reviewers") => rule.require_reviewers.extend(values()),
            Some("require-status") => rule.require_status_checks.extend(values()),
            Some("allowed-maintainers") => rule.allowed_maintainers.extend(values()),
            Some(other) => debug!("Unknown branch rule flag {}", other),
        }
    }

    rules
}

/// Protection event template for `owner`'s `repo_id`, carrying both encodings
pub fn create_protection_event(
    owner: &str,
    repo_id: &str,
    rules: &[BranchRule],
    created_at: u64,
) -> std::result::Result<UnsignedEvent, serde_json::Error> {
    let content = serde_json::to_string(rules)?;

    let mut tags = vec![vec!["d".to_string(), repo_id.to_string()]];
    for rule in rules {
        let branch = || vec!["branch".to_string(), rule.branch.clone()];
        let flagged = |flag: &str, values: &[String]| {
            let mut tag = branch();
            tag.push(flag.to_string());
            tag.extend(values.iter().cloned());
            tag
        };

        tags.push(branch());
        if rule.require_pull_request {
            tags.push(flagged("require-pr", &[]));
        }
        if rule.allow_force_push {
            tags.push(flagged("allow-force-push", &[]));
        }
        if !rule.require_reviewers.is_empty() {
            tags.push(flagged("require-reviewers", &rule.require_reviewers));
        }
        if !rule.require_status_checks.is_empty() {
            tags.push(flagged("require-status", &rule.require_status_checks));
        }
        if !rule.allowed_maintainers.is_empty() {
            tags.push(flagged("allowed-maintainers", &rule.allowed_maintainers));
        }
    }

    Ok(UnsignedEvent::new(KIND_BRANCH_PROTECTION, tags, content)
        .with_pubkey(owner)
        .with_created_at(created_at))
}

/// Decide a push of `branch` by `user` against a single (optional) rule
pub fn evaluate_push(
    user: &str,
    owner: &str,
    rule: Option<&BranchRule>,
    branch: &str,
    is_maintainer: bool,
) -> PushDecision {
    if user == owner {
        return PushDecision::allow();
    }

    if let Some(rule) = rule {
        let listed = rule
            .allowed_maintainers
            .iter()
            .filter_map(|k| normalize_key(k).ok())
            .any(|k| k == user);
        if listed {
            return PushDecision::allow();
        }
        if rule.require_pull_request {
            return PushDecision::deny(format!(
                "branch '{}' requires a pull request",
                branch
            ));
        }
    }

    if is_maintainer {
        PushDecision::allow()
    } else {
        PushDecision::deny(format!("{} is not a maintainer", user))
    }
}

/// Loads protection rules and evaluates pushes
pub struct ProtectionEvaluator {
    source: Arc<dyn EventSource>,
}

impl ProtectionEvaluator {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self { source }
    }

    /// Rules from the newest protection event by `owner`; an unparsable event means none
    pub async fn rules(&self, owner: &str, repo_id: &str) -> Result<Vec<BranchRule>> {
        let owner = normalize_key(owner)?;
        let filter = Filter::new()
            .kind(KIND_BRANCH_PROTECTION)
            .author(owner.clone())
            .d_tag(repo_id)
            .limit(10);

        let latest = self
            .source
            .fetch_events(&[filter])
            .await?
            .into_iter()
            .filter(|e| e.pubkey.eq_ignore_ascii_case(&owner))
            .filter(|e| e.kind == KIND_BRANCH_PROTECTION && e.tag_value("d") == Some(repo_id))
            .filter(|e| e.verify().is_ok())
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let Some(event) = latest else {
            return Ok(Vec::new());
        };
        match parse_protection_event(&event) {
            Ok(rules) => Ok(rules),
            Err(e) => {
                warn!("Ignoring protection event {} for {}: {}", event.id, repo_id, e);
                Ok(Vec::new())
            }
        }
    }

    /// Whether `user` may push to `branch` (bare name or `refs/heads/...`)
    pub async fn can_push(
        &self,
        user: &str,
        owner: &str,
        repo_id: &str,
        branch: &str,
        is_maintainer: bool,
    ) -> PushDecision {
        let (Ok(user), Ok(owner)) = (normalize_key(user), normalize_key(owner)) else {
            return PushDecision::deny("invalid key");
        };
        if user == owner {
            return PushDecision::allow();
        }

        let branch = branch.strip_prefix(BRANCH_PREFIX).unwrap_or(branch);
        let rules = match self.rules(&owner, repo_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Denying push to {}/{}: {}", repo_id, branch, e);
                return PushDecision::deny(format!("could not load branch protection: {}", e));
            }
        };

        let rule = rules.iter().find(|r| r.branch == branch);
        evaluate_push(&user, &owner, rule, branch, is_maintainer)
    }
}

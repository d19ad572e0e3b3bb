use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use taskgate_core::{AppError, AppResult};

use crate::subject::Subject;

/// Outcome category a permission rule can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionEffect {
    /// The action proceeds immediately.
    Allow,
    /// The action is rejected.
    Deny,
    /// The action is suspended behind an approval request.
    RequireApproval,
}

impl PermissionEffect {
    /// Returns a stable storage value for this effect.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        }
    }
}

/// One declared permission rule, evaluated in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Stable rule identifier referenced by decisions and audit output.
    pub id: String,
    /// Action names this rule covers; `None` covers every action.
    #[serde(default)]
    pub actions: Option<BTreeSet<String>>,
    /// Effect produced when the rule matches.
    pub effect: PermissionEffect,
    /// Subjects the acting user must match.
    pub subjects: Vec<Subject>,
    /// Subjects allowed to resolve a resulting approval request.
    #[serde(default)]
    pub approver_subjects: Vec<Subject>,
    /// Subjects notified when a resulting approval request is created.
    #[serde(default)]
    pub notify_subjects: Vec<Subject>,
    /// Optional provider scope; when set the context provider must match.
    #[serde(default)]
    pub provider: Option<String>,
    /// Optional channel scope; when set the context channel must match.
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Fallback policy applied when no rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefaults {
    /// Effect applied when no rule matches.
    pub effect: PermissionEffect,
    /// Approver subjects used when the default effect requires approval.
    #[serde(default)]
    pub approver_subjects: Vec<Subject>,
    /// Notify subjects used when the default effect requires approval.
    #[serde(default)]
    pub notify_subjects: Vec<Subject>,
}

/// The identity attempting an action, with group memberships already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Acting user identifier.
    pub user_id: String,
    /// Chat provider the actor arrived through.
    pub provider: String,
    /// Provider-scoped group ids the actor is a resolved member of.
    pub group_ids: BTreeSet<String>,
}

/// Channel identity of the conversation an action originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelContext {
    /// Chat provider name.
    pub provider: String,
    /// Provider channel identifier.
    pub channel_id: String,
    /// Optional thread identifier inside the channel.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Optional workspace identifier (Slack-style providers).
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Optional guild identifier (Discord-style providers).
    #[serde(default)]
    pub guild_id: Option<String>,
}

impl Actor {
    /// Returns whether this actor matches one permission subject.
    #[must_use]
    pub fn matches_subject(&self, subject: &Subject) -> bool {
        match subject {
            Subject::AnyUser => true,
            Subject::User(user_id) => user_id == &self.user_id,
            Subject::Group { provider, group_id } => {
                provider == &self.provider && self.group_ids.contains(group_id)
            }
        }
    }
}

/// Output of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    /// Effect produced by the matched rule or the defaults.
    pub effect: PermissionEffect,
    /// Identifier of the matched rule, absent on default fallback.
    pub rule_id: Option<String>,
    /// Subjects allowed to resolve a resulting approval request.
    pub approver_subjects: Vec<Subject>,
    /// Subjects notified when a resulting approval request is created.
    pub notify_subjects: Vec<Subject>,
}

/// Evaluates rules in declaration order and returns the first match.
///
/// Pure and side-effect free; safe for unlimited concurrent invocation.
/// Group membership must already be resolved onto the actor.
#[must_use]
pub fn evaluate(
    rules: &[PermissionRule],
    defaults: &PolicyDefaults,
    actor: &Actor,
    context: &ChannelContext,
    action: &str,
) -> PermissionDecision {
    for rule in rules {
        if rule_matches(rule, actor, context, action) {
            return PermissionDecision {
                effect: rule.effect,
                rule_id: Some(rule.id.clone()),
                approver_subjects: rule.approver_subjects.clone(),
                notify_subjects: rule.notify_subjects.clone(),
            };
        }
    }

    PermissionDecision {
        effect: defaults.effect,
        rule_id: None,
        approver_subjects: defaults.approver_subjects.clone(),
        notify_subjects: defaults.notify_subjects.clone(),
    }
}

/// Validates rules and defaults at configuration load time.
///
/// A require_approval rule (or default) without approver subjects is a
/// configuration error; the engine assumes this invariant holds at runtime.
pub fn validate_policy(rules: &[PermissionRule], defaults: &PolicyDefaults) -> AppResult<()> {
    for rule in rules {
        if rule.id.trim().is_empty() {
            return Err(AppError::Validation(
                "permission rule id must not be empty".to_owned(),
            ));
        }

        if rule.subjects.is_empty() {
            return Err(AppError::Validation(format!(
                "permission rule '{}' must name at least one subject",
                rule.id
            )));
        }

        if let Some(actions) = &rule.actions
            && actions.is_empty()
        {
            return Err(AppError::Validation(format!(
                "permission rule '{}' declares an empty action set",
                rule.id
            )));
        }

        if rule.effect == PermissionEffect::RequireApproval && rule.approver_subjects.is_empty() {
            return Err(AppError::Validation(format!(
                "permission rule '{}' requires approval but names no approver subjects",
                rule.id
            )));
        }
    }

    if defaults.effect == PermissionEffect::RequireApproval && defaults.approver_subjects.is_empty()
    {
        return Err(AppError::Validation(
            "default effect requires approval but names no approver subjects".to_owned(),
        ));
    }

    Ok(())
}

fn rule_matches(
    rule: &PermissionRule,
    actor: &Actor,
    context: &ChannelContext,
    action: &str,
) -> bool {
    if let Some(actions) = &rule.actions
        && !actions.contains(action)
    {
        return false;
    }

    if let Some(provider) = &rule.provider
        && provider != &context.provider
    {
        return false;
    }

    if let Some(channel_id) = &rule.channel_id
        && channel_id != &context.channel_id
    {
        return false;
    }

    rule.subjects
        .iter()
        .any(|subject| actor.matches_subject(subject))
}

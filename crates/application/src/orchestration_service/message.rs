use chrono::SecondsFormat;
use taskgate_domain::ApprovalRequest;

/// Renders the provider-agnostic approval notification text block.
///
/// Deterministic for a given request; channel adapters wrap it in their own
/// message and button formatting.
#[must_use]
pub fn build_approval_message(provider: &str, request: &ApprovalRequest) -> String {
    format!(
        "Approval required: {action}\n\
         Requested by: {requested_by} ({provider})\n\
         Summary: {summary}\n\
         Expires at: {expires_at}\n\
         Approval id: {id}",
        action = request.action,
        requested_by = request.requested_by,
        summary = request.summary,
        expires_at = request
            .expires_at
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        id = request.id,
    )
}

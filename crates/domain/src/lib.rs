//! Domain entities and the pure policy decision engine.

#![forbid(unsafe_code)]

mod approval;
mod job;
mod policy;
mod subject;

pub use approval::{
    ApprovalRequest, ApprovalResolution, ApprovalStatus, DeferredOperation, NewApprovalRequest,
};
pub use job::{JobRecord, JobRecordPatch, JobSpec, JobStatus, MergeRequestRef};
pub use policy::{
    Actor, ChannelContext, PermissionDecision, PermissionEffect, PermissionRule, PolicyDefaults,
    evaluate, validate_policy,
};
pub use subject::Subject;

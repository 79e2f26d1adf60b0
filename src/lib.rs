pub mod access;
pub mod auth;
pub mod config;
pub mod provisioning;
pub mod server;

pub use access::{policy_from_config, AccessPolicy, AllowlistAccess, OpenAccess, SocialGraphAccess};
pub use auth::{
    BranchRule, MaintainerResolver, MaintainerSet, OwnershipResolver, ProtectionEvaluator,
    PushDecision,
};
pub use config::Config;
pub use provisioning::{
    PendingAttestation, ProvisioningScheduler, SchedulerConfig, TickOutcome, TickReport,
};
pub use server::ForgeServer;

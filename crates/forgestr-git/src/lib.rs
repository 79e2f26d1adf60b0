//! Local repository provisioning for forgestr
//!
//! Keeps one bare repository per announced coordinate under a root directory:
//!   <root>/<owner hex>/<repo id>.git
//!
//! Provisioning is create-or-refresh and never destroys history.

pub mod error;
pub mod manager;

pub use error::{Error, Result};
pub use manager::{validate_repo_id, FsRepoManager, ProvisionOutcome, RepoManager, HINT_DIR};

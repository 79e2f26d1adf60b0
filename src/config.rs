use anyhow::{bail, Context, Result};
use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Keys, SecretKey};
use secp256k1::{Keypair, Secp256k1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Basic auth (credentials from the auth cookie) on admin endpoints
    #[serde(default = "default_enable_auth")]
    pub enable_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bare repositories live at `<repos_dir>/<owner hex>/<repo id>.git`
    #[serde(default = "default_repos_dir")]
    pub repos_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// Per-relay timeout for one fetch or publish
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    /// Anyone announcing a repository on our domain gets one
    Open,
    /// Only keys in `allowlist` (plus the local identity)
    Allowlist,
    /// Keys within `max_distance` follows of `socialgraph_root`
    SocialGraph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Host name clone URLs must point at. Empty disables provisioning.
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_access_mode")]
    pub access: AccessMode,
    /// npub or hex keys
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Social graph root npub. If not set, uses the local nsec's pubkey.
    #[serde(default)]
    pub socialgraph_root: Option<String>,
    /// 0 = only root user, 1 = root + direct follows, 2 = friends of friends, etc.
    #[serde(default = "default_max_distance")]
    pub max_distance: u32,
    /// How long a crawled follow graph is reused
    #[serde(default = "default_graph_refresh_secs")]
    pub graph_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_maintainer_ttl_secs")]
    pub maintainer_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_enable_auth() -> bool {
    true
}

fn default_repos_dir() -> String {
    get_forgestr_dir()
        .join("repos")
        .to_string_lossy()
        .to_string()
}

fn default_relays() -> Vec<String> {
    forgestr_relay::DEFAULT_RELAYS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_fetch_timeout_secs() -> u64 {
    forgestr_relay::DEFAULT_FETCH_TIMEOUT.as_secs()
}

fn default_interval_secs() -> u64 {
    crate::provisioning::DEFAULT_TICK_INTERVAL.as_secs()
}

fn default_batch_limit() -> usize {
    crate::provisioning::DEFAULT_BATCH_LIMIT
}

fn default_access_mode() -> AccessMode {
    AccessMode::Allowlist
}

fn default_max_distance() -> u32 {
    2
}

fn default_graph_refresh_secs() -> u64 {
    3600
}

fn default_maintainer_ttl_secs() -> u64 {
    crate::auth::DEFAULT_MAINTAINER_TTL.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_auth: default_enable_auth(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
        }
    }
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            interval_secs: default_interval_secs(),
            batch_limit: default_batch_limit(),
            access: default_access_mode(),
            allowlist: vec![],
            socialgraph_root: None,
            max_distance: default_max_distance(),
            graph_refresh_secs: default_graph_refresh_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maintainer_ttl_secs: default_maintainer_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: Config =
                toml::from_str(&content).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("provisioning.interval_secs", self.provisioning.interval_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
            ("nostr.fetch_timeout_secs", self.nostr.fetch_timeout_secs),
        ] {
            if value == 0 {
                bail!("{} must be at least 1", name);
            }
        }
        if self.provisioning.batch_limit == 0 {
            bail!("provisioning.batch_limit must be at least 1");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }
}

/// Get the forgestr directory (~/.forgestr)
pub fn get_forgestr_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".forgestr")
}

/// Get the config file path (~/.forgestr/config.toml)
pub fn get_config_path() -> PathBuf {
    get_forgestr_dir().join("config.toml")
}

/// Get the auth cookie path (~/.forgestr/auth.cookie)
pub fn get_auth_cookie_path() -> PathBuf {
    get_forgestr_dir().join("auth.cookie")
}

/// Get the nsec file path (~/.forgestr/nsec)
pub fn get_nsec_path() -> PathBuf {
    get_forgestr_dir().join("nsec")
}

/// Generate and save auth cookie if it doesn't exist
pub fn ensure_auth_cookie() -> Result<(String, String)> {
    let cookie_path = get_auth_cookie_path();

    if cookie_path.exists() {
        read_auth_cookie()
    } else {
        generate_auth_cookie()
    }
}

/// Read existing auth cookie
pub fn read_auth_cookie() -> Result<(String, String)> {
    let cookie_path = get_auth_cookie_path();
    let content = fs::read_to_string(&cookie_path)
        .context("Failed to read auth cookie")?;

    let (username, password) = content
        .trim()
        .split_once(':')
        .context("Invalid auth cookie format")?;
    if username.is_empty() || password.is_empty() || password.contains(':') {
        anyhow::bail!("Invalid auth cookie format");
    }

    Ok((username.to_string(), password.to_string()))
}

/// Generate new random auth cookie
pub fn generate_auth_cookie() -> Result<(String, String)> {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let cookie_path = get_auth_cookie_path();
    if let Some(parent) = cookie_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut rng = rand::thread_rng();
    let username = format!("forgestr_{}", rng.gen::<u32>());
    let password: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    fs::write(&cookie_path, format!("{}:{}", username, password))?;
    restrict_permissions(&cookie_path)?;

    Ok((username, password))
}

/// Ensure nsec exists, generating one if not present
/// Returns (Keys, was_generated)
pub fn ensure_nsec() -> Result<(Keys, bool)> {
    let nsec_path = get_nsec_path();

    if nsec_path.exists() {
        Ok((read_nsec()?, false))
    } else {
        Ok((generate_nsec()?, true))
    }
}

/// Read existing nsec
pub fn read_nsec() -> Result<Keys> {
    let nsec_path = get_nsec_path();
    let nsec_str = fs::read_to_string(&nsec_path)
        .context("Failed to read nsec file")?;
    let secret_key = SecretKey::from_bech32(nsec_str.trim())
        .context("Invalid nsec format")?;
    Ok(Keys::new(secret_key))
}

/// Generate new nsec and save to file
pub fn generate_nsec() -> Result<Keys> {
    let nsec_path = get_nsec_path();
    if let Some(parent) = nsec_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let keys = Keys::generate();
    let nsec = keys.secret_key().to_bech32()
        .context("Failed to encode nsec")?;

    fs::write(&nsec_path, &nsec)?;
    restrict_permissions(&nsec_path)?;

    Ok(keys)
}

/// Signing keypair for the event layer
pub fn keypair_from_keys(keys: &Keys) -> Result<Keypair> {
    Keypair::from_seckey_slice(&Secp256k1::new(), &keys.secret_key().to_secret_bytes())
        .context("Invalid secret key")
}

/// Owner read/write only
fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

//! File-backed token stores
//!
//! Tokens are plain lines in text files under `credentials/`. A line is either
//! `token` or `token|expiry`, where expiry is a unix timestamp in seconds.
//! Matching is always against the whole token field, never a prefix, so
//! consuming `abc` leaves `abcd` alone.
//!
//! # Categories
//!
//! - Admission tokens authorize exactly one join and are deleted on use
//! - Certificate-request tokens authorize exactly one CSR signing call
//! - Callback tokens (`host:port token`) let this node call back into a peer
//! - The self callback token is this node's own long-lived credential
//!
//! The static bearer-token registry lives in [`known`].

pub mod known;

use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::config::StatePaths;
use crate::error::io_state;
use crate::lock::ResourceLocks;
use crate::{Error, Result};

pub use known::KnownTokens;

/// Length of generated tokens
pub const TOKEN_LENGTH: usize = 32;

/// Token categories, each backed by its own file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenCategory {
    /// Single-use join credential
    Admission,
    /// Single-use CSR signing credential
    CertificateRequest,
    /// Peer callback credentials keyed by endpoint
    Callback,
    /// This node's own callback credential
    SelfCallback,
}

impl TokenCategory {
    fn path(self, paths: &StatePaths) -> PathBuf {
        match self {
            Self::Admission => paths.cluster_tokens(),
            Self::CertificateRequest => paths.cert_request_tokens(),
            Self::Callback => paths.callback_tokens(),
            Self::SelfCallback => paths.self_callback_token(),
        }
    }
}

/// Generate a random alphanumeric token
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Token field of a stored line (text before an optional `|expiry`)
fn token_field(line: &str) -> &str {
    line.trim().split('|').next().unwrap_or_default()
}

/// Decide whether `token` is valid in file `contents` at unix time `now`.
///
/// The first line whose token field equals `token` decides: without an
/// expiry it is valid, with one it is valid while `now < expiry`, and a
/// malformed expiry makes it invalid.
pub fn is_valid_at(contents: &str, token: &str, now: i64) -> bool {
    let token = token.trim();
    if token.is_empty() {
        return false;
    }

    for line in contents.lines() {
        let mut parts = line.trim().splitn(2, '|');
        if parts.next() != Some(token) {
            continue;
        }
        return match parts.next() {
            None => true,
            Some(expiry) => expiry
                .trim()
                .parse::<i64>()
                .map(|expiry| now < expiry)
                .unwrap_or(false),
        };
    }
    false
}

/// Remove every line whose token field equals `token`, preserving order
pub fn remove_token(contents: &str, token: &str) -> String {
    let token = token.trim();
    let kept: Vec<&str> = contents
        .lines()
        .filter(|line| !line.trim().is_empty() && token_field(line) != token)
        .collect();

    if kept.is_empty() {
        String::new()
    } else {
        let mut out = kept.join("\n");
        out.push('\n');
        out
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Best-effort group-writable permissions on credential files
async fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).await
        {
            debug!(path = %path.display(), error = %e, "Could not set permissions");
        }
    }
}

/// Read a token file, treating a missing file as empty
async fn read_tokens(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(io_state(format!("read {}", path.display()), e)),
    }
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_state(format!("create {}", parent.display()), e))?;
    }

    // Never glue a new entry onto a last line lacking its newline.
    let existing = read_tokens(path).await?;
    let mut entry = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        entry.push('\n');
    }
    entry.push_str(line);
    entry.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_state(format!("open {}", path.display()), e))?;
    file.write_all(entry.as_bytes())
        .await
        .map_err(|e| io_state(format!("append to {}", path.display()), e))?;
    file.flush()
        .await
        .map_err(|e| io_state(format!("flush {}", path.display()), e))?;

    restrict_permissions(path).await;
    Ok(())
}

/// Token store over the four token files
#[derive(Clone, Debug)]
pub struct TokenStore {
    paths: StatePaths,
    locks: ResourceLocks,
}

impl TokenStore {
    /// Create a store over the given paths, sharing `locks` with other
    /// components touching the same files
    pub fn new(paths: StatePaths, locks: ResourceLocks) -> Self {
        Self { paths, locks }
    }

    /// Check whether `token` is currently valid in `category`
    pub async fn is_valid(&self, token: &str, category: TokenCategory) -> bool {
        let path = category.path(&self.paths);
        let _guard = self.locks.lock(&path).await;
        match read_tokens(&path).await {
            Ok(contents) => is_valid_at(&contents, token, now_epoch()),
            Err(_) => false,
        }
    }

    /// Remove `token` from `category`
    pub async fn consume(&self, token: &str, category: TokenCategory) -> Result<()> {
        let path = category.path(&self.paths);
        let _guard = self.locks.lock(&path).await;
        self.remove_locked(&path, token).await
    }

    /// Validate and remove `token` in one locked step.
    ///
    /// Fails with an auth error when the token is unknown or expired; on
    /// success the token is gone for good.
    pub async fn consume_valid(&self, token: &str, category: TokenCategory) -> Result<()> {
        let path = category.path(&self.paths);
        let _guard = self.locks.lock(&path).await;

        let contents = read_tokens(&path).await?;
        if !is_valid_at(&contents, token, now_epoch()) {
            return Err(Error::auth(
                "validate token",
                format!("invalid {} token", category_name(category)),
            ));
        }
        self.remove_locked(&path, token).await
    }

    async fn remove_locked(&self, path: &Path, token: &str) -> Result<()> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_state(format!("read {}", path.display()), e))?;

        tokio::fs::write(path, remove_token(&contents, token))
            .await
            .map_err(|e| io_state(format!("write {}", path.display()), e))?;

        restrict_permissions(path).await;
        debug!(path = %path.display(), "Removed token");
        Ok(())
    }

    /// Append `token` to `category`
    pub async fn append(&self, token: &str, category: TokenCategory) -> Result<()> {
        let path = category.path(&self.paths);
        let _guard = self.locks.lock(&path).await;
        append_line(&path, token).await
    }

    /// Record the callback token a peer agent at `endpoint` accepts
    pub async fn add_callback(&self, endpoint: &str, token: &str) -> Result<()> {
        self.append(&format!("{endpoint} {token}"), TokenCategory::Callback)
            .await
    }

    /// Check a peer callback token for `endpoint`
    pub async fn is_valid_callback(&self, endpoint: &str, token: &str) -> bool {
        self.is_valid(&format!("{endpoint} {token}"), TokenCategory::Callback)
            .await
    }

    /// Return this node's callback token, creating it on first use
    pub async fn self_callback_token(&self) -> Result<String> {
        let path = TokenCategory::SelfCallback.path(&self.paths);
        let _guard = self.locks.lock(&path).await;

        let existing = read_tokens(&path).await?;
        if let Some(token) = existing.lines().map(token_field).find(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }

        let token = generate_token();
        append_line(&path, &token).await?;
        debug!("Created self callback token");
        Ok(token)
    }
}

fn category_name(category: TokenCategory) -> &'static str {
    match category {
        TokenCategory::Admission => "cluster",
        TokenCategory::CertificateRequest => "certificate request",
        TokenCategory::Callback => "callback",
        TokenCategory::SelfCallback => "callback",
    }
}

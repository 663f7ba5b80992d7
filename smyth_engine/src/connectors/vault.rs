//! JSON file vault connector.
//!
//! On-disk form: `{ [team_id]: { [key_name]: string } }`, optionally
//! wrapped as `{ "encrypted": true, "algorithm": "aes-256-gcm", "data":
//! base64(nonce || ciphertext) }`. The master key is requested once at
//! load through a configured callback (a blocking prompt in CLI builds)
//! and derived as SHA-256 of the passphrase.
//!
//! String values may embed `$env(VAR)` placeholders, resolved once per
//! read; unresolved references stay intact and are logged.
//!
//! The file is watched and hot-reloaded on change; a failed reload keeps
//! the previous snapshot.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use smyth_core::vault::{SHARED_VAULT_TEAM, VaultConnector};
use smyth_core::{
    AccessCandidate, AccessLevel, AccessRequest, AccessRole, Acl, Connector, Error, Result,
    Subsystem,
};

const CONNECTOR_NAME: &str = "JSONFileVault";
const NONCE_LEN: usize = 12;

type Snapshot = BTreeMap<String, BTreeMap<String, String>>;

/// Callback producing the master passphrase for encrypted vault files.
pub type MasterKeyFn = Arc<dyn Fn() -> Result<String> + Send + Sync>;

pub struct JsonVault {
    path: PathBuf,
    snapshot: Arc<RwLock<Snapshot>>,
    master_key: Option<MasterKeyFn>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl JsonVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: Arc::new(RwLock::new(Snapshot::new())),
            master_key: None,
            watcher: Mutex::new(None),
        }
    }

    pub fn with_master_key(mut self, cb: MasterKeyFn) -> Self {
        self.master_key = Some(cb);
        self
    }

    fn decode(raw: &[u8], master_key: Option<&MasterKeyFn>) -> Result<Snapshot> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|err| Error::Configuration(format!("malformed vault file: {err}")))?;

        let plain = if value.get("encrypted").and_then(|v| v.as_bool()) == Some(true) {
            let algorithm = value
                .get("algorithm")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if algorithm != "aes-256-gcm" {
                return Err(Error::Unsupported(format!(
                    "vault encryption algorithm {algorithm}"
                )));
            }
            let data = value
                .get("data")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Configuration("encrypted vault has no data".into()))?;
            let payload = BASE64
                .decode(data)
                .map_err(|err| Error::Configuration(format!("vault data is not base64: {err}")))?;
            if payload.len() <= NONCE_LEN {
                return Err(Error::Configuration("vault payload too short".into()));
            }
            let master = master_key
                .ok_or_else(|| Error::Configuration("vault is encrypted but no master key callback is configured".into()))?;
            let passphrase = master()?;
            let key = Sha256::digest(passphrase.as_bytes());
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
            let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
            let decrypted = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| Error::Configuration("vault decryption failed".into()))?;
            serde_json::from_slice(&decrypted)
                .map_err(|err| Error::Configuration(format!("malformed decrypted vault: {err}")))?
        } else {
            value
        };

        serde_json::from_value(plain)
            .map_err(|err| Error::Configuration(format!("malformed vault contents: {err}")))
    }

    fn load(&self) -> Result<()> {
        let raw = std::fs::read(&self.path)
            .map_err(|err| Error::Configuration(format!("cannot read vault file: {err}")))?;
        let snapshot = Self::decode(&raw, self.master_key.as_ref())?;
        *self.snapshot.write() = snapshot;
        Ok(())
    }

    /// Substitutes `$env(VAR)` placeholders once. Unresolvable references
    /// stay in place.
    fn resolve_env(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("$env(") {
            out.push_str(&rest[..start]);
            let tail = &rest[start + 5..];
            match tail.find(')') {
                Some(end) => {
                    let var = &tail[..end];
                    match std::env::var(var) {
                        Ok(resolved) => out.push_str(&resolved),
                        Err(_) => {
                            log::warn!(target: "vault", var = var; "unresolved $env reference");
                            out.push_str(&rest[start..start + 5 + end + 1]);
                        }
                    }
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, team_id: &str, key: &str) -> Option<String> {
        let snapshot = self.snapshot.read();
        snapshot
            .get(team_id)
            .and_then(|keys| keys.get(key))
            .or_else(|| {
                snapshot
                    .get(SHARED_VAULT_TEAM)
                    .and_then(|keys| keys.get(key))
            })
            .cloned()
    }
}

#[async_trait]
impl Connector for JsonVault {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Vault
    }

    /// Loads the file and installs the change watcher. A change event
    /// triggers a reload; a reload that fails leaves the previous snapshot
    /// in place.
    async fn start(&self) -> Result<()> {
        self.load()?;

        let path = self.path.clone();
        let snapshot = self.snapshot.clone();
        let master_key = self.master_key.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            if !matches!(
                event.kind,
                notify::EventKind::Modify(_) | notify::EventKind::Create(_)
            ) {
                return;
            }
            match std::fs::read(&path)
                .map_err(|err| Error::Configuration(format!("cannot read vault file: {err}")))
                .and_then(|raw| JsonVault::decode(&raw, master_key.as_ref()))
            {
                Ok(fresh) => {
                    *snapshot.write() = fresh;
                    log::info!(target: "vault", path = path.display().to_string(); "vault reloaded");
                }
                Err(err) => {
                    log::warn!(target: "vault", path = path.display().to_string(), error = err.to_string(); "vault reload failed, keeping previous snapshot");
                }
            }
        })
        .map_err(|err| Error::Configuration(format!("vault watcher: {err}")))?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|err| Error::Configuration(format!("vault watcher: {err}")))?;
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.watcher.lock().take();
        Ok(())
    }
}

#[async_trait]
impl VaultConnector for JsonVault {
    // Callers act with their team's authority: the requester resolves
    // candidate -> team before the check, so the asking candidate itself
    // earns no grants here.
    async fn resource_acl(&self, key_id: &str, _candidate: &AccessCandidate) -> Result<Acl> {
        // Key ids are `<team>.<key>`; the shared team reads for everyone.
        let team = key_id.split_once('.').map(|(t, _)| t).unwrap_or(key_id);
        let mut acl = Acl::new();
        acl.grant(AccessRole::Team, team, AccessLevel::Owner);
        if self
            .snapshot
            .read()
            .get(SHARED_VAULT_TEAM)
            .is_some_and(|keys| {
                key_id
                    .split_once('.')
                    .is_some_and(|(_, key)| keys.contains_key(key))
            })
        {
            acl.grant_wildcard(AccessRole::User, AccessLevel::Read);
            acl.grant_wildcard(AccessRole::Team, AccessLevel::Read);
            acl.grant_wildcard(AccessRole::Agent, AccessLevel::Read);
        }
        Ok(acl)
    }

    async fn get(&self, _req: &AccessRequest, team_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .lookup(team_id, key)
            .map(|value| Self::resolve_env(&value)))
    }

    async fn exists(&self, _req: &AccessRequest, team_id: &str, key: &str) -> Result<bool> {
        Ok(self.lookup(team_id, key).is_some())
    }

    async fn list_keys(&self, _req: &AccessRequest, team_id: &str) -> Result<Vec<String>> {
        let snapshot = self.snapshot.read();
        let mut keys: BTreeSet<String> = snapshot
            .get(team_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        if team_id != SHARED_VAULT_TEAM {
            if let Some(shared) = snapshot.get(SHARED_VAULT_TEAM) {
                keys.extend(shared.keys().cloned());
            }
        }
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_vault(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_plain_vault() {
        let (_dir, path) = write_vault(r#"{"team-1": {"openai": "sk-123"}, "shared": {"common": "c-1"}}"#);
        let vault = JsonVault::new(&path);
        vault.load().unwrap();

        let req = AccessCandidate::team("team-1").read_request();
        assert_eq!(
            vault.get(&req, "team-1", "openai").await.unwrap(),
            Some("sk-123".to_string())
        );
        assert_eq!(vault.get(&req, "team-1", "missing").await.unwrap(), None);
        // Shared keys are visible to every team.
        assert_eq!(
            vault.get(&req, "team-1", "common").await.unwrap(),
            Some("c-1".to_string())
        );
        assert!(vault.exists(&req, "team-1", "openai").await.unwrap());
        assert_eq!(
            vault.list_keys(&req, "team-1").await.unwrap(),
            vec!["common".to_string(), "openai".to_string()]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_env_resolution() {
        unsafe { std::env::set_var("SMYTH_TEST_SECRET", "resolved-value") };
        let (_dir, path) = write_vault(
            r#"{"t": {"a": "$env(SMYTH_TEST_SECRET)", "b": "pre-$env(SMYTH_TEST_MISSING)-post"}}"#,
        );
        let vault = JsonVault::new(&path);
        vault.load().unwrap();

        let req = AccessCandidate::team("t").read_request();
        assert_eq!(
            vault.get(&req, "t", "a").await.unwrap(),
            Some("resolved-value".to_string())
        );
        // Unresolved references stay intact.
        assert_eq!(
            vault.get(&req, "t", "b").await.unwrap(),
            Some("pre-$env(SMYTH_TEST_MISSING)-post".to_string())
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_encrypted_vault_round_trip() {
        let plain = br#"{"t": {"k": "secret"}}"#;
        let passphrase = "correct horse";
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = [7u8; NONCE_LEN];
        let mut payload = nonce.to_vec();
        payload.extend(cipher.encrypt(Nonce::from_slice(&nonce), plain.as_slice()).unwrap());
        let content = serde_json::json!({
            "encrypted": true,
            "algorithm": "aes-256-gcm",
            "data": BASE64.encode(&payload),
        });
        let (_dir, path) = write_vault(&content.to_string());

        let vault = JsonVault::new(&path)
            .with_master_key(Arc::new(move || Ok("correct horse".to_string())));
        vault.load().unwrap();
        let req = AccessCandidate::team("t").read_request();
        assert_eq!(vault.get(&req, "t", "k").await.unwrap(), Some("secret".to_string()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_failed_reload_keeps_snapshot() {
        let (_dir, path) = write_vault(r#"{"t": {"k": "v1"}}"#);
        let vault = JsonVault::new(&path);
        vault.load().unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(vault.load().is_err());
        let req = AccessCandidate::team("t").read_request();
        assert_eq!(vault.get(&req, "t", "k").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_shared_acl() {
        let (_dir, path) = write_vault(r#"{"shared": {"common": "c"}, "t": {"own": "o"}}"#);
        let vault = JsonVault::new(&path);
        vault.load().unwrap();

        let stranger = AccessCandidate::team("other");
        let acl = vault.resource_acl("shared.common", &stranger).await.unwrap();
        assert!(acl.check(&stranger.read_request()));

        let acl = vault.resource_acl("t.own", &stranger).await.unwrap();
        assert!(!acl.check(&stranger.read_request()));
        assert!(acl.check(&AccessCandidate::team("t").owner_request()));
    }
}

//! Shared, expiring credentials.
//!
//! Jobs and resources do not own credential files directly; they acquire a
//! reference-counted [`Credential`] from the [`CredentialStore`]. All
//! credentials carrying the same subject identity are grouped under one
//! `ProxySubject`, which owns a *master* credential: a byte-copy of
//! whichever sibling currently has the furthest-out expiration. Holders
//! register a watcher closure and are woken whenever their credential's
//! expiration grows or it crosses the near-expiration threshold.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::common::ids::{CredentialId, IdCounter, WatchToken};
use crate::{Map, Set};

/// What can be read out of a credential file.
#[derive(Debug, Clone)]
pub struct CredentialInfo {
    pub subject: String,
    pub expiration: SystemTime,
    pub email: Option<String>,
    pub attributes: Vec<String>,
}

/// Seam over the on-disk credential format.
pub trait CredentialSource {
    fn inspect(&self, path: &Path) -> crate::Result<CredentialInfo>;

    /// Replaces `dst` with the content of `src` without ever exposing a
    /// half-written destination file.
    fn copy_atomic(&self, src: &Path, dst: &Path) -> crate::Result<()>;
}

#[derive(Debug, Deserialize)]
struct RawCredential {
    subject: String,
    /// Expiration as seconds since the Unix epoch.
    expiration: u64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    attributes: Vec<String>,
}

/// Credential files as JSON metadata documents.
pub struct JsonCredentialSource;

impl CredentialSource for JsonCredentialSource {
    fn inspect(&self, path: &Path) -> crate::Result<CredentialInfo> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::CredentialError(format!("cannot read {}: {e}", path.display()))
        })?;
        let raw: RawCredential = serde_json::from_str(&raw).map_err(|e| {
            crate::Error::CredentialError(format!("cannot parse {}: {e}", path.display()))
        })?;
        Ok(CredentialInfo {
            subject: raw.subject,
            expiration: SystemTime::UNIX_EPOCH + Duration::from_secs(raw.expiration),
            email: raw.email,
            attributes: raw.attributes,
        })
    }

    fn copy_atomic(&self, src: &Path, dst: &Path) -> crate::Result<()> {
        let content = std::fs::read(src)?;
        let dir = dst.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &content)?;
        tmp.persist(dst)
            .map_err(|e| crate::Error::IoError(e.error))?;
        Ok(())
    }
}

pub type CredentialWatcher = Box<dyn Fn()>;

pub struct Credential {
    path: PathBuf,
    subject: String,
    expiration: SystemTime,
    near_expired: bool,
    refs: u32,
    watchers: Map<WatchToken, CredentialWatcher>,
    is_master: bool,
}

impl Credential {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    pub fn near_expired(&self) -> bool {
        self.near_expired
    }

    pub fn num_references(&self) -> u32 {
        self.refs
    }

    fn fire_watchers(&self) {
        for watcher in self.watchers.values() {
            watcher();
        }
    }
}

/// All credentials sharing one subject identity, plus their master copy.
struct ProxySubject {
    master: CredentialId,
    siblings: Set<CredentialId>,
}

pub struct CredentialStore {
    source: Box<dyn CredentialSource>,
    master_dir: PathBuf,
    min_lifetime: Duration,
    max_check_interval: Duration,
    by_path: Map<PathBuf, CredentialId>,
    credentials: Map<CredentialId, Credential>,
    subjects: Map<String, ProxySubject>,
    credential_ids: IdCounter,
    watch_tokens: IdCounter,
    master_names: IdCounter,
}

impl CredentialStore {
    pub fn new(
        source: Box<dyn CredentialSource>,
        master_dir: PathBuf,
        min_lifetime: Duration,
        max_check_interval: Duration,
    ) -> Self {
        Self {
            source,
            master_dir,
            min_lifetime,
            max_check_interval,
            by_path: Map::default(),
            credentials: Map::default(),
            subjects: Map::default(),
            credential_ids: IdCounter::default(),
            watch_tokens: IdCounter::default(),
            master_names: IdCounter::default(),
        }
    }

    pub fn reconfig(&mut self, min_lifetime: Duration, max_check_interval: Duration) {
        self.min_lifetime = min_lifetime;
        self.max_check_interval = max_check_interval;
    }

    /// Acquires a shared reference to the credential stored at `path`,
    /// registering `watcher` to be called on expiration changes.
    ///
    /// An unreadable, unparsable or already-expired file is an error; the
    /// caller decides what that means (for a job: held at construction).
    pub fn acquire(
        &mut self,
        path: &Path,
        watcher: CredentialWatcher,
    ) -> crate::Result<(CredentialId, WatchToken)> {
        if let Some(&id) = self.by_path.get(path) {
            let token = WatchToken::new(self.watch_tokens.increment());
            let credential = self.credential_mut(id);
            credential.refs += 1;
            credential.watchers.insert(token, watcher);
            return Ok((id, token));
        }

        let info = self.source.inspect(path)?;
        let now = SystemTime::now();
        if info.expiration <= now {
            return Err(crate::Error::CredentialError(format!(
                "credential {} has already expired",
                path.display()
            )));
        }

        let id = CredentialId::new(self.credential_ids.increment());
        let token = WatchToken::new(self.watch_tokens.increment());
        let mut credential = Credential {
            path: path.to_path_buf(),
            subject: info.subject.clone(),
            expiration: info.expiration,
            near_expired: is_near_expired(info.expiration, now, self.min_lifetime),
            refs: 1,
            watchers: Map::default(),
            is_master: false,
        };
        credential.watchers.insert(token, watcher);

        if let Some(subject) = self.subjects.get_mut(&info.subject) {
            let master_id = subject.master;
            subject.siblings.insert(id);
            self.by_path.insert(path.to_path_buf(), id);
            self.credentials.insert(id, credential);
            if info.expiration > self.credential(master_id).expiration() {
                self.refresh_master(master_id, id, now);
            }
        } else {
            let master_id = match self.create_master(&info, path, now) {
                Ok(master_id) => master_id,
                Err(e) => {
                    return Err(crate::Error::CredentialError(format!(
                        "cannot create master copy of {}: {e}",
                        path.display()
                    )));
                }
            };
            let mut siblings = Set::default();
            siblings.insert(id);
            self.subjects.insert(info.subject.clone(), ProxySubject {
                master: master_id,
                siblings,
            });
            self.by_path.insert(path.to_path_buf(), id);
            self.credentials.insert(id, credential);
        }

        log::debug!(
            "Acquired credential {} for subject {}",
            path.display(),
            info.subject
        );
        Ok((id, token))
    }

    /// Acquires a shared reference to the master credential of the given
    /// subject identity, if one exists.
    pub fn acquire_master(
        &mut self,
        subject: &str,
        watcher: CredentialWatcher,
    ) -> Option<(CredentialId, WatchToken)> {
        let master_id = self.subjects.get(subject)?.master;
        let token = WatchToken::new(self.watch_tokens.increment());
        let master = self.credential_mut(master_id);
        master.refs += 1;
        master.watchers.insert(token, watcher);
        Some((master_id, token))
    }

    /// Drops one reference. At zero references a non-master credential is
    /// deleted; the subject group (and its master file) goes away once no
    /// sibling and no master reference remains.
    pub fn release(&mut self, id: CredentialId, token: WatchToken) {
        let credential = self.credential_mut(id);
        assert!(
            credential.refs > 0,
            "credential {} released more times than acquired",
            credential.path.display()
        );
        credential.watchers.remove(&token);
        credential.refs -= 1;
        if credential.refs > 0 {
            return;
        }

        if credential.is_master {
            let subject = credential.subject.clone();
            self.maybe_destroy_subject(&subject);
        } else {
            let credential = self.credentials.remove(&id).unwrap();
            self.by_path.remove(&credential.path);
            let subject = self
                .subjects
                .get_mut(&credential.subject)
                .expect("credential without a subject record");
            subject.siblings.remove(&id);
            log::debug!("Deleted credential {}", credential.path.display());
            self.maybe_destroy_subject(&credential.subject);
        }
    }

    /// Periodic reconciliation: re-reads every sibling's on-disk expiration,
    /// fires watchers for grown expirations and fresh near-expiration
    /// crossings, and refreshes masters that fell behind. Returns the delay
    /// until the next check should run: the earliest moment any live
    /// credential will cross its near-expiration threshold, clamped to the
    /// configured maximum interval.
    pub fn check_credentials(&mut self, now: SystemTime) -> Duration {
        let subject_keys: Vec<String> = self.subjects.keys().cloned().collect();
        for key in subject_keys {
            let (master_id, sibling_ids) = {
                let subject = &self.subjects[&key];
                (
                    subject.master,
                    subject.siblings.iter().copied().collect::<Vec<_>>(),
                )
            };

            let mut freshest: Option<(CredentialId, SystemTime)> = None;
            for id in sibling_ids {
                let path = self.credential(id).path.clone();
                let info = match self.source.inspect(&path) {
                    Ok(info) => info,
                    Err(e) => {
                        log::warn!("Failed to re-read credential {}: {e}", path.display());
                        continue;
                    }
                };

                let mut fire = false;
                {
                    let min_lifetime = self.min_lifetime;
                    let credential = self.credential_mut(id);
                    if info.expiration > credential.expiration {
                        log::debug!(
                            "Credential {} was renewed, expires at {:?}",
                            path.display(),
                            info.expiration
                        );
                        credential.expiration = info.expiration;
                        fire = true;
                    }
                    let near =
                        is_near_expired(credential.expiration, now, min_lifetime);
                    if near != credential.near_expired {
                        credential.near_expired = near;
                        if near {
                            fire = true;
                        }
                    }
                    let expiration = credential.expiration;
                    if freshest.is_none_or(|(_, best)| expiration > best) {
                        freshest = Some((id, expiration));
                    }
                }
                if fire {
                    self.credential(id).fire_watchers();
                }
            }

            if let Some((freshest_id, expiration)) = freshest
                && expiration > self.credential(master_id).expiration
            {
                self.refresh_master(master_id, freshest_id, now);
            }
        }

        self.next_check_delay(now)
    }

    pub fn get(&self, id: CredentialId) -> &Credential {
        self.credential(id)
    }

    pub fn master_of_subject(&self, subject: &str) -> Option<&Credential> {
        self.subjects
            .get(subject)
            .map(|record| self.credential(record.master))
    }

    fn next_check_delay(&self, now: SystemTime) -> Duration {
        let mut next = self.max_check_interval;
        for credential in self.credentials.values() {
            if credential.near_expired {
                continue;
            }
            if let Ok(remaining) = credential.expiration.duration_since(now) {
                let until_crossing = remaining.saturating_sub(self.min_lifetime);
                next = next.min(until_crossing.max(Duration::from_secs(1)));
            }
        }
        next
    }

    fn create_master(
        &mut self,
        info: &CredentialInfo,
        src: &Path,
        now: SystemTime,
    ) -> crate::Result<CredentialId> {
        std::fs::create_dir_all(&self.master_dir)?;
        let master_path = self
            .master_dir
            .join(format!("master_credential.{}", self.master_names.increment()));
        self.source.copy_atomic(src, &master_path)?;

        let master_id = CredentialId::new(self.credential_ids.increment());
        self.credentials.insert(master_id, Credential {
            path: master_path,
            subject: info.subject.clone(),
            expiration: info.expiration,
            near_expired: is_near_expired(info.expiration, now, self.min_lifetime),
            refs: 0,
            watchers: Map::default(),
            is_master: true,
        });
        Ok(master_id)
    }

    /// Re-copies the master file from the given sibling. On I/O failure the
    /// master keeps its previous content and expiration; this is reported
    /// but not fatal.
    fn refresh_master(&mut self, master_id: CredentialId, src_id: CredentialId, now: SystemTime) {
        let (src_path, src_expiration) = {
            let src = self.credential(src_id);
            (src.path.clone(), src.expiration)
        };
        let master_path = self.credential(master_id).path.clone();

        if let Err(e) = self.source.copy_atomic(&src_path, &master_path) {
            log::warn!(
                "Failed to refresh master credential {} from {}: {e}",
                master_path.display(),
                src_path.display()
            );
            return;
        }

        let min_lifetime = self.min_lifetime;
        let master = self.credential_mut(master_id);
        master.expiration = src_expiration;
        master.near_expired = is_near_expired(src_expiration, now, min_lifetime);
        log::debug!(
            "Master credential {} refreshed from {}",
            master_path.display(),
            src_path.display()
        );
        self.credential(master_id).fire_watchers();
    }

    fn maybe_destroy_subject(&mut self, subject: &str) {
        let destroy = match self.subjects.get(subject) {
            Some(record) => {
                record.siblings.is_empty() && self.credential(record.master).refs == 0
            }
            None => false,
        };
        if !destroy {
            return;
        }
        let record = self.subjects.remove(subject).unwrap();
        let master = self.credentials.remove(&record.master).unwrap();
        if let Err(e) = std::fs::remove_file(&master.path) {
            log::warn!(
                "Failed to remove master credential {}: {e}",
                master.path.display()
            );
        }
        log::debug!("Destroyed credential subject {subject}");
    }

    fn credential(&self, id: CredentialId) -> &Credential {
        self.credentials
            .get(&id)
            .expect("reference to a deleted credential")
    }

    fn credential_mut(&mut self, id: CredentialId) -> &mut Credential {
        self.credentials
            .get_mut(&id)
            .expect("reference to a deleted credential")
    }
}

fn is_near_expired(expiration: SystemTime, now: SystemTime, min_lifetime: Duration) -> bool {
    match expiration.duration_since(now) {
        Ok(remaining) => remaining <= min_lifetime,
        Err(_) => true,
    }
}

//! Keyboard sequence detector.
//!
//! A hotkey opens a listening window; every character typed afterwards is
//! appended to a bounded, zeroizing buffer and each trailing substring is
//! checked against the registered sequence verifiers. A match emits a
//! [`Detection`] and ends the session. The buffer is wiped on every exit
//! (match, timeout, cancel, restart).
//!
//! Verifiers are `HMAC(install secret, salt || password)`: cheap enough to
//! test on every keystroke and useless without the secret. A detection is a
//! hint; the manager still verifies the password against the profile's
//! PBKDF2 hash before touching any folder.

use crate::crypto::{constant_time_eq, hmac_sha256, random_bytes};
use crate::error::VaultResult;
use crate::model::{FolderId, ProfileId, SequenceVerifier, UnlockMode};
use crate::settings::{DetectionScope, DetectorSettings};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

const VERIFIER_SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Listening,
    Matched,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    Hotkey,
    Char(char),
    Cancel,
    Shutdown,
}

/// Handle given to the platform adapter (and the IPC fallback channel).
#[derive(Debug, Clone)]
pub struct KeystrokeSink {
    tx: Sender<KeyInput>,
}

impl KeystrokeSink {
    pub fn hotkey(&self) -> bool {
        self.tx.send(KeyInput::Hotkey).is_ok()
    }

    pub fn key(&self, c: char) -> bool {
        self.tx.send(KeyInput::Char(c)).is_ok()
    }

    pub fn cancel(&self) -> bool {
        self.tx.send(KeyInput::Cancel).is_ok()
    }

    /// Hotkey followed by `text`, as if typed.
    pub fn type_sequence(&self, text: &str) -> bool {
        self.hotkey() && text.chars().all(|c| self.key(c))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(KeyInput::Shutdown);
    }
}

pub struct Detection {
    pub profile_id: ProfileId,
    pub folder_id: Option<FolderId>,
    pub password: Zeroizing<String>,
    pub mode: UnlockMode,
}

impl std::fmt::Debug for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detection")
            .field("profile_id", &self.profile_id)
            .field("folder_id", &self.folder_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub profile_id: ProfileId,
    pub folder_id: Option<FolderId>,
    pub verifier: SequenceVerifier,
}

/// Verifiers for every registered sequence, shared between the manager
/// (writer) and the detector thread (reader).
pub struct CandidateSet {
    secret: Zeroizing<Vec<u8>>,
    candidates: Vec<Candidate>,
    scope: DetectionScope,
    active_profile: Option<ProfileId>,
}

pub type SharedCandidates = Arc<RwLock<CandidateSet>>;

impl CandidateSet {
    pub fn new(secret: Zeroizing<Vec<u8>>, scope: DetectionScope) -> Self {
        Self {
            secret,
            candidates: Vec::new(),
            scope,
            active_profile: None,
        }
    }

    pub fn shared(self) -> SharedCandidates {
        Arc::new(RwLock::new(self))
    }

    pub fn make_verifier(&self, password: &str) -> VaultResult<SequenceVerifier> {
        let salt = random_bytes::<VERIFIER_SALT_LEN>();
        let tag = hmac_sha256(&self.secret, &[&salt, password.as_bytes()])?;
        Ok(SequenceVerifier {
            salt: salt.to_vec(),
            tag: tag.to_vec(),
        })
    }

    pub fn replace_profile(&mut self, profile_id: &str, candidates: Vec<Candidate>) {
        self.candidates.retain(|c| c.profile_id != profile_id);
        self.candidates.extend(candidates);
    }

    pub fn remove_profile(&mut self, profile_id: &str) {
        self.candidates.retain(|c| c.profile_id != profile_id);
        if self.active_profile.as_deref() == Some(profile_id) {
            self.active_profile = None;
        }
    }

    pub fn set_active_profile(&mut self, profile_id: Option<ProfileId>) {
        self.active_profile = profile_id;
    }

    pub fn active_profile(&self) -> Option<&str> {
        self.active_profile.as_deref()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn in_scope(&self, candidate: &Candidate) -> bool {
        match self.scope {
            DetectionScope::Global => true,
            DetectionScope::ActiveProfile => {
                self.active_profile.as_deref() == Some(candidate.profile_id.as_str())
            }
        }
    }

    /// Every in-scope verifier is evaluated; folder bindings win over
    /// profile sequences when both match.
    fn find(&self, text: &[u8]) -> Option<&Candidate> {
        let mut found: Option<&Candidate> = None;
        for candidate in self.candidates.iter().filter(|c| self.in_scope(c)) {
            let Ok(tag) = hmac_sha256(&self.secret, &[&candidate.verifier.salt, text]) else {
                continue;
            };
            if constant_time_eq(&tag, &candidate.verifier.tag) {
                let better = match found {
                    None => true,
                    Some(prev) => prev.folder_id.is_none() && candidate.folder_id.is_some(),
                };
                if better {
                    found = Some(candidate);
                }
            }
        }
        found
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub timeout: Duration,
    pub max_chars: usize,
    pub min_len: usize,
    pub temporary_prefix: char,
    pub permanent_prefix: char,
    pub prefix_case_sensitive: bool,
}

impl From<&DetectorSettings> for DetectorConfig {
    fn from(s: &DetectorSettings) -> Self {
        Self {
            timeout: Duration::from_secs(s.timeout_secs),
            max_chars: s.max_buffer_chars,
            min_len: s.min_password_len,
            temporary_prefix: s.temporary_prefix,
            permanent_prefix: s.permanent_prefix,
            prefix_case_sensitive: s.prefix_case_sensitive,
        }
    }
}

/// One listening session at a time. Owns the keystroke buffer.
pub struct SequenceSession {
    config: DetectorConfig,
    candidates: SharedCandidates,
    state: DetectorState,
    deadline: Option<Instant>,
    buffer: Zeroizing<Vec<u8>>,
    /// Byte offset of every character in `buffer`.
    boundaries: Vec<usize>,
}

impl SequenceSession {
    pub fn new(config: DetectorConfig, candidates: SharedCandidates) -> Self {
        let capacity = config.max_chars * 4;
        Self {
            buffer: Zeroizing::new(Vec::with_capacity(capacity)),
            boundaries: Vec::with_capacity(config.max_chars),
            config,
            candidates,
            state: DetectorState::Idle,
            deadline: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn buffered_chars(&self) -> usize {
        self.boundaries.len()
    }

    /// A hotkey while already listening restarts the window.
    pub fn on_hotkey(&mut self, now: Instant) {
        if self.state == DetectorState::Listening {
            self.finish(DetectorState::Cancelled);
        }
        self.state = DetectorState::Listening;
        self.deadline = Some(now + self.config.timeout);
        debug!("sequence listening started");
    }

    pub fn on_char(&mut self, c: char, now: Instant) -> Option<Detection> {
        if self.state != DetectorState::Listening {
            return None;
        }
        if self.poll_timeout(now) {
            return None;
        }
        if c.is_control() {
            return None;
        }
        if self.boundaries.len() == self.config.max_chars {
            self.drop_oldest();
        }
        self.boundaries.push(self.buffer.len());
        let mut utf8 = [0u8; 4];
        self.buffer.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
        utf8.zeroize();

        let detection = self.check();
        if detection.is_some() {
            self.finish(DetectorState::Matched);
        }
        detection
    }

    pub fn cancel(&mut self) {
        if self.state == DetectorState::Listening {
            self.finish(DetectorState::Cancelled);
        }
    }

    /// Returns true when the window expired and the session was closed.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match (self.state, self.deadline) {
            (DetectorState::Listening, Some(deadline)) if now >= deadline => {
                self.finish(DetectorState::TimedOut);
                true
            }
            _ => false,
        }
    }

    fn drop_oldest(&mut self) {
        if self.boundaries.len() < 2 {
            self.wipe();
            return;
        }
        let cut = self.boundaries[1];
        let len = self.buffer.len();
        self.buffer.copy_within(cut..len, 0);
        self.buffer[len - cut..].zeroize();
        self.buffer.truncate(len - cut);
        self.boundaries.remove(0);
        for b in self.boundaries.iter_mut() {
            *b -= cut;
        }
    }

    fn check(&self) -> Option<Detection> {
        let set = self.candidates.read();
        if set.is_empty() {
            return None;
        }
        let total = self.boundaries.len();
        // Longest suffix first, so a prefix character is never mistaken for
        // part of a shorter password.
        for (index, &start) in self.boundaries.iter().enumerate() {
            if total - index < self.config.min_len {
                break;
            }
            let text = &self.buffer[start..];
            if let Some(candidate) = set.find(text) {
                let mode = self.mode_for(index);
                let password = Zeroizing::new(String::from_utf8_lossy(text).into_owned());
                return Some(Detection {
                    profile_id: candidate.profile_id.clone(),
                    folder_id: candidate.folder_id.clone(),
                    password,
                    mode,
                });
            }
        }
        None
    }

    /// The character right before the matched password selects the mode.
    /// Anything that is not a configured prefix counts as a bare password.
    fn mode_for(&self, match_index: usize) -> UnlockMode {
        if match_index == 0 {
            return UnlockMode::Temporary;
        }
        let start = self.boundaries[match_index - 1];
        let end = self.boundaries[match_index];
        let prefix = std::str::from_utf8(&self.buffer[start..end])
            .ok()
            .and_then(|s| s.chars().next());
        match prefix {
            Some(p) if self.prefix_eq(p, self.config.permanent_prefix) => UnlockMode::Permanent,
            Some(p) if self.prefix_eq(p, self.config.temporary_prefix) => UnlockMode::Temporary,
            _ => UnlockMode::Temporary,
        }
    }

    fn prefix_eq(&self, typed: char, expected: char) -> bool {
        if self.config.prefix_case_sensitive {
            typed == expected
        } else {
            typed.to_lowercase().eq(expected.to_lowercase())
        }
    }

    fn finish(&mut self, exit: DetectorState) {
        self.wipe();
        self.deadline = None;
        debug!(exit = ?exit, "sequence session closed");
        self.state = DetectorState::Idle;
    }

    fn wipe(&mut self) {
        self.buffer.zeroize();
        self.buffer.clear();
        self.boundaries.clear();
    }
}

impl Drop for SequenceSession {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Channel pair for feeding a detector thread.
pub fn keystroke_channel() -> (KeystrokeSink, Receiver<KeyInput>) {
    let (tx, rx) = mpsc::channel();
    (KeystrokeSink { tx }, rx)
}

/// Runs `session` on a dedicated thread until the sink sends `Shutdown` or
/// every sender is dropped. Detections go to `events`.
pub fn spawn_detector(
    mut session: SequenceSession,
    inputs: Receiver<KeyInput>,
    events: tokio::sync::mpsc::UnboundedSender<Detection>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("phantom-detector".into())
        .spawn(move || {
            info!("keyboard sequence detector running");
            loop {
                let input = match session.deadline() {
                    Some(deadline) => {
                        let wait = deadline.saturating_duration_since(Instant::now());
                        match inputs.recv_timeout(wait) {
                            Ok(input) => Some(input),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match inputs.recv() {
                        Ok(input) => Some(input),
                        Err(_) => break,
                    },
                };
                let now = Instant::now();
                match input {
                    None => {
                        session.poll_timeout(now);
                    }
                    Some(KeyInput::Hotkey) => session.on_hotkey(now),
                    Some(KeyInput::Char(c)) => {
                        if let Some(detection) = session.on_char(c, now) {
                            if events.send(detection).is_err() {
                                break;
                            }
                        }
                    }
                    Some(KeyInput::Cancel) => session.cancel(),
                    Some(KeyInput::Shutdown) => break,
                }
            }
            session.cancel();
            info!("keyboard sequence detector stopped");
        })
}

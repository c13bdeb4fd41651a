//! Browsing-context session: one id per tab lifetime, reused across page navigations.

use crate::config::StorageKeys;
use crate::env::Environment;
use crate::ids::{time_random_id, SERVER_SIDE_ID};
use crate::log_bridge::Logger;
use crate::storage::{get_json, set_json};
use serde::{Deserialize, Serialize};

/// Session record kept in session storage next to the bare id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub fingerprint: String,
    pub created: u64,
    pub last_activity: u64,
}

pub fn generate_session_id(env: &dyn Environment) -> String {
    time_random_id(env)
}

pub fn get_session_data(env: &dyn Environment, key: &str, log: &Logger) -> Option<SessionData> {
    if !env.is_browser() {
        return None;
    }
    match get_json(env.session_storage(), key) {
        Ok(data) => data,
        Err(e) => {
            log.error(format_args!("[Session] failed to get session data: {e}"));
            None
        }
    }
}

pub fn save_session_data(env: &dyn Environment, key: &str, data: &SessionData, log: &Logger) {
    if !env.is_browser() {
        return;
    }
    if let Err(e) = set_json(env.session_storage(), key, data) {
        log.error(format_args!("[Session] failed to save session data: {e}"));
    }
}

/// Reuse the session id stored for this browsing context, or start a new session.
///
/// When session storage cannot be read or written the id lives only in memory, so a
/// reload starts a new session.
pub fn create_or_reuse_session(
    env: &dyn Environment,
    keys: &StorageKeys,
    fingerprint: &str,
    log: &Logger,
) -> String {
    if !env.is_browser() {
        return SERVER_SIDE_ID.to_string();
    }

    let storage = env.session_storage();
    match storage.get_item(&keys.session_id) {
        Ok(Some(id)) if !id.is_empty() => {
            log.debug(format_args!("[Session] reusing session {id}"));
            return id;
        }
        Ok(_) => {}
        Err(e) => log.error(format_args!("[Session] failed to read session id: {e}")),
    }

    let id = generate_session_id(env);
    let now = env.now_ms();
    if let Err(e) = storage.set_item(&keys.session_id, &id) {
        log.error(format_args!("[Session] failed to store session id: {e}"));
    }
    save_session_data(
        env,
        &keys.session_data,
        &SessionData {
            id: id.clone(),
            fingerprint: fingerprint.to_string(),
            created: now,
            last_activity: now,
        },
        log,
    );
    log.debug(format_args!("[Session] created session {id}"));
    id
}

/// Bump `last_activity` of the stored record. A missing or corrupt record is left alone.
pub fn update_activity(env: &dyn Environment, key: &str, log: &Logger) {
    if let Some(mut data) = get_session_data(env, key, log) {
        data.last_activity = env.now_ms();
        save_session_data(env, key, &data, log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{HostEnvironment, ManualClock};
    use crate::storage::{MemoryStorage, Storage, UnavailableStorage};
    use std::sync::Arc;

    fn setup() -> (HostEnvironment, ManualClock, StorageKeys, Logger) {
        let clock = ManualClock::new(1_700_000_000_000);
        let env = HostEnvironment::default().with_clock(Arc::new(clock.clone()));
        (env, clock, StorageKeys::default(), Logger::new(false, "[Tracker]"))
    }

    #[test]
    fn new_session_stores_id_and_record() {
        let (env, _clock, keys, log) = setup();
        let id = create_or_reuse_session(&env, &keys, "7f3a9c21", &log);
        assert!(id.starts_with("loyw3v28"), "id starts with base36 timestamp: {id}");
        assert_eq!(env.session_storage().get_item(&keys.session_id).expect("get"), Some(id.clone()));

        let data = get_session_data(&env, &keys.session_data, &log).expect("record");
        assert_eq!(data.id, id);
        assert_eq!(data.fingerprint, "7f3a9c21");
        assert_eq!(data.created, 1_700_000_000_000);
        assert_eq!(data.last_activity, data.created);
    }

    #[test]
    fn session_is_reused_within_browsing_context() {
        let (env, _clock, keys, log) = setup();
        let first = create_or_reuse_session(&env, &keys, "fp", &log);
        let second = create_or_reuse_session(&env, &keys, "fp", &log);
        assert_eq!(first, second);
    }

    #[test]
    fn ended_context_starts_a_new_session() {
        let session = Arc::new(MemoryStorage::new());
        let keys = StorageKeys::default();
        let log = Logger::new(false, "[Tracker]");
        let env = HostEnvironment::default().with_session_storage(Arc::clone(&session));
        let first = create_or_reuse_session(&env, &keys, "fp", &log);
        session.clear().expect("clear");
        let second = create_or_reuse_session(&env, &keys, "fp", &log);
        assert_ne!(first, second);
    }

    #[test]
    fn update_activity_bumps_last_activity() {
        let (env, clock, keys, log) = setup();
        create_or_reuse_session(&env, &keys, "fp", &log);
        clock.advance(4_000);
        update_activity(&env, &keys.session_data, &log);
        let data = get_session_data(&env, &keys.session_data, &log).expect("record");
        assert_eq!(data.last_activity, data.created + 4_000);
    }

    #[test]
    fn corrupt_record_is_not_updated_and_not_fatal() {
        let (env, _clock, keys, log) = setup();
        env.session_storage().set_item(&keys.session_data, "{oops").expect("seed");
        update_activity(&env, &keys.session_data, &log);
        assert_eq!(
            env.session_storage().get_item(&keys.session_data).expect("get").as_deref(),
            Some("{oops")
        );
        assert!(log.drain().iter().any(|l| l.contains("failed to get session data")));
    }

    #[test]
    fn unavailable_storage_gives_in_memory_session() {
        let env = HostEnvironment::default().with_session_storage(UnavailableStorage);
        let log = Logger::new(false, "[Tracker]");
        let id = create_or_reuse_session(&env, &StorageKeys::default(), "fp", &log);
        assert!(!id.is_empty());
        update_activity(&env, &StorageKeys::default().session_data, &log);
    }
}

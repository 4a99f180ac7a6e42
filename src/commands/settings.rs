use super::CommandError;
use crate::AppState;
use std::collections::HashMap;

const SETTING_KEYS: &[&str] = &["default_model", "theme"];

fn mask_key(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "*".repeat(chars.len())
    }
}

pub fn get_settings(state: &AppState) -> Result<HashMap<String, String>, CommandError> {
    let mut map = HashMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = state.db.get_setting(key)? {
            map.insert(key.to_string(), value);
        }
    }
    Ok(map)
}

pub fn set_setting(state: &AppState, key: &str, value: &str) -> Result<(), CommandError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(CommandError::InvalidInput(format!("Unknown setting key: {}", key)));
    }
    state.db.set_setting(key, value)?;
    Ok(())
}

pub fn delete_setting(state: &AppState, key: &str) -> Result<(), CommandError> {
    state.db.delete_setting(key)?;
    Ok(())
}

/// Stores the caller's provider credential, replacing any previous one.
pub fn set_api_key(state: &AppState, user_id: &str, api_key: &str) -> Result<(), CommandError> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(CommandError::InvalidInput("API key must not be empty".into()));
    }
    state.db.set_api_key(user_id, api_key)?;
    tracing::info!(user_id, "provider credential updated");
    Ok(())
}

/// Masked for display; the raw key never leaves the store.
pub fn get_api_key_masked(state: &AppState, user_id: &str) -> Result<Option<String>, CommandError> {
    Ok(state.db.get_api_key(user_id)?.map(|key| mask_key(&key)))
}

pub fn delete_api_key(state: &AppState, user_id: &str) -> Result<(), CommandError> {
    state.db.delete_api_key(user_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::{ScriptedProvider, DONE_LINE};
    use crate::config::AppConfig;
    use crate::db::Database;
    use std::sync::Arc;

    fn state() -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        AppState::assemble(db, ScriptedProvider::chunks(&[DONE_LINE]), AppConfig::default())
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-or-v1-abcdef123456"), "sk-o...3456");
        assert_eq!(mask_key("short"), "*****");
    }

    #[test]
    fn test_api_key_lifecycle() {
        let state = state();

        assert_eq!(get_api_key_masked(&state, "alice").unwrap(), None);
        set_api_key(&state, "alice", "  sk-or-v1-abcdef123456 ").unwrap();
        assert_eq!(
            get_api_key_masked(&state, "alice").unwrap().as_deref(),
            Some("sk-o...3456")
        );
        assert_eq!(
            state.db.get_api_key("alice").unwrap().as_deref(),
            Some("sk-or-v1-abcdef123456")
        );
        assert_eq!(get_api_key_masked(&state, "bob").unwrap(), None);

        delete_api_key(&state, "alice").unwrap();
        assert_eq!(get_api_key_masked(&state, "alice").unwrap(), None);
        assert!(matches!(
            set_api_key(&state, "alice", ""),
            Err(CommandError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_settings_only_accept_known_keys() {
        let state = state();

        set_setting(&state, "default_model", "openai/gpt-4o").unwrap();
        assert!(matches!(
            set_setting(&state, "openai_api_key", "x"),
            Err(CommandError::InvalidInput(_))
        ));

        let settings = get_settings(&state).unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings["default_model"], "openai/gpt-4o");

        delete_setting(&state, "default_model").unwrap();
        assert!(get_settings(&state).unwrap().is_empty());
    }
}

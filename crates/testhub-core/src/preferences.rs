//! UI language preference
//!
//! Stored under its own key, outside the session, so it survives logout.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use testhub_storage::Database;

use crate::error::CoreError;
use crate::Result;

pub const LANGUAGE_KEY: &str = "app-lang";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "zh-cn")]
    ZhCn,
    #[serde(rename = "en")]
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::ZhCn => "zh-cn",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zh-cn" | "zh" => Ok(Language::ZhCn),
            "en" | "en-us" => Ok(Language::En),
            other => Err(CoreError::Config(format!("unsupported language: {}", other))),
        }
    }
}

#[derive(Clone)]
pub struct LanguagePreference {
    db: Database,
    current: Arc<RwLock<Language>>,
}

impl LanguagePreference {
    pub fn new(db: Database) -> Result<Self> {
        let current = match db.get_item(LANGUAGE_KEY)? {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(value = %raw, error = %e, "Ignoring stored language");
                Language::default()
            }),
            None => Language::default(),
        };

        Ok(Self {
            db,
            current: Arc::new(RwLock::new(current)),
        })
    }

    pub fn language(&self) -> Language {
        *self.current.read()
    }

    pub fn set_language(&self, language: Language) -> Result<()> {
        self.db.set_item(LANGUAGE_KEY, language.as_str())?;
        *self.current.write() = language;
        tracing::info!(language = %language, "Language changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_language() {
        let db = Database::open_in_memory().unwrap();
        let preference = LanguagePreference::new(db.clone()).unwrap();
        assert_eq!(preference.language(), Language::ZhCn);
        assert_eq!(db.get_item(LANGUAGE_KEY).unwrap(), None);
    }

    #[test]
    fn test_set_language_persists() {
        let db = Database::open_in_memory().unwrap();
        let preference = LanguagePreference::new(db.clone()).unwrap();

        preference.set_language(Language::En).unwrap();
        assert_eq!(preference.language(), Language::En);
        assert_eq!(db.get_item(LANGUAGE_KEY).unwrap().as_deref(), Some("en"));

        let reloaded = LanguagePreference::new(db).unwrap();
        assert_eq!(reloaded.language(), Language::En);
    }

    #[test]
    fn test_unknown_stored_language_falls_back() {
        let db = Database::open_in_memory().unwrap();
        db.set_item(LANGUAGE_KEY, "fr").unwrap();

        let preference = LanguagePreference::new(db).unwrap();
        assert_eq!(preference.language(), Language::ZhCn);
    }

    #[test]
    fn test_parse_language() {
        assert_eq!("EN".parse::<Language>().unwrap(), Language::En);
        assert_eq!("zh-cn".parse::<Language>().unwrap(), Language::ZhCn);
        assert!("fr".parse::<Language>().is_err());
        assert_eq!(
            serde_json::to_string(&Language::ZhCn).unwrap(),
            "\"zh-cn\""
        );
    }
}

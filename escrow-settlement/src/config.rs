//! Layered configuration loading
//!
//! Values come from the built-in defaults, then an optional TOML file, then
//! environment variables prefixed `ESCROW` with `__` between path segments
//! (`ESCROW__LEDGER__RPC_URL`, `ESCROW__RECONCILER__BATCH_SIZE`, ...).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;

use crate::EscrowResult;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ESCROW";

/// A string that never shows up in logs or debug output
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

/// Load `T` from defaults, an optional TOML file and the environment
pub fn load<T>(path: Option<&Path>) -> EscrowResult<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&T::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Sample {
        section: Section,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Section {
        name: String,
        retries: u32,
        key: Option<SecretString>,
    }

    impl Default for Section {
        fn default() -> Self {
            Self {
                name: "default".into(),
                retries: 3,
                key: None,
            }
        }
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::new("0xdeadbeef");
        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(secret.expose(), "0xdeadbeef");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"[REDACTED]\"");
    }

    #[test]
    fn test_defaults_then_file() {
        let loaded: Sample = load(None).unwrap();
        assert_eq!(loaded.section.name, "default");
        assert_eq!(loaded.section.retries, 3);

        let dir = std::env::temp_dir().join(format!("escrow-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settlement.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[section]\nretries = 7\nkey = \"abc\"").unwrap();

        let loaded: Sample = load(Some(&path)).unwrap();
        assert_eq!(loaded.section.name, "default");
        assert_eq!(loaded.section.retries, 7);
        assert_eq!(loaded.section.key.unwrap().expose(), "abc");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/escrow/settlement.toml");
        assert!(load::<Sample>(Some(missing)).is_err());
    }
}

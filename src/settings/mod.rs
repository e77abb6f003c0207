//! Loading and validation of settings.
//!
//! Both binaries read a TOML configuration file whose values can be overridden by environment
//! variables prefixed with `FEDERA_`, nested sections being separated by `__` (for instance
//! `FEDERA_LOG__FILTER=debug`). Examples of configuration files can be found in the `configs/`
//! directory located in the repository root.

mod coordinator;
mod node;

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, DeserializeOwned, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

use crate::crypto::ByteObject;

pub use self::{
    coordinator::{
        ApiSettings,
        CollaborationSettings,
        CoordinatorSettings,
        MemberSettings,
        SchedulerSettings,
    },
    node::{
        ChannelSettings,
        IdentitySettings,
        NetworkSettings,
        NodeCollaborationSettings,
        NodeSettings,
        PeerSettings,
        SandboxSettings,
    },
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Loads settings of type `S` from the file at `path` and the environment, then validates them.
fn load<S>(path: impl AsRef<Path>) -> Result<S, SettingsError>
where
    S: DeserializeOwned + Validate,
{
    let settings: S = Config::builder()
        .add_source(File::from(path.as_ref()))
        .add_source(
            Environment::with_prefix("federa")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info,federa::node::sandbox=debug"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDERA_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

/// Deserializes a hex encoded key or seed.
fn deserialize_hex<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: ByteObject,
{
    let value = String::deserialize(deserializer)?;
    T::from_hex(&value).ok_or_else(|| {
        de::Error::invalid_value(
            de::Unexpected::Str(&value),
            &format!("{} hex encoded bytes", T::LENGTH).as_str(),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    pub(super) fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        #[derive(Debug, Deserialize, Validate)]
        struct OnlyLog {
            #[allow(dead_code)]
            log: LoggingSettings,
        }

        let file = write_config("[log]\nfilter = \"info\"\n");
        assert!(load::<OnlyLog>(file.path()).is_ok());

        let file = write_config("[log]\nfilter = \"federa=loud\"\n");
        assert!(matches!(
            load::<OnlyLog>(file.path()),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(CoordinatorSettings::new("does/not/exist.toml").is_err());
        assert!(NodeSettings::new("does/not/exist.toml").is_err());
    }
}

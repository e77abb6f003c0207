use std::{collections::HashSet, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;
use validator::{Validate, ValidationError};

use super::{deserialize_hex, load, LoggingSettings, SettingsError};
use crate::{
    common::{CollaborationId, NodeId},
    coordinator::{MemberRecord, NodeDirectory},
    crypto::{PublicEncryptKey, PublicSigningKey, StaticKeyRegistry},
};

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_collaborations"))]
/// The coordinator settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct CoordinatorSettings {
    #[validate]
    pub api: ApiSettings,
    #[validate]
    pub scheduler: SchedulerSettings,
    pub log: LoggingSettings,
    #[serde(default)]
    pub collaborations: Vec<CollaborationSettings>,
}

impl CoordinatorSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }

    /// Builds the membership directory used to authenticate nodes and validate task targets.
    pub fn directory(&self) -> NodeDirectory {
        let mut directory = NodeDirectory::default();
        for collaboration in &self.collaborations {
            for member in &collaboration.members {
                directory.insert(
                    CollaborationId::from(collaboration.id),
                    NodeId::from(member.node),
                    MemberRecord {
                        signing_key: member.signing_key,
                    },
                );
            }
        }
        directory
    }

    /// Builds the registry of the nodes' public encryption keys.
    pub fn key_registry(&self) -> StaticKeyRegistry {
        let mut registry = StaticKeyRegistry::default();
        for collaboration in &self.collaborations {
            for member in &collaboration.members {
                registry.insert(
                    CollaborationId::from(collaboration.id),
                    NodeId::from(member.node),
                    member.encrypt_key,
                );
            }
        }
        registry
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Control channel settings.
pub struct ApiSettings {
    /// The address the control channel listens on.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:7070"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDERA_API__BIND_ADDRESS=127.0.0.1:7070
    /// ```
    pub bind_address: SocketAddr,

    /// The largest control message accepted, in bytes. Defaults to 16 MiB.
    #[serde(default = "default_max_message_size")]
    #[validate(range(min = 1024))]
    pub max_message_size: usize,

    /// How long a connecting node has to answer the handshake challenge, in seconds.
    #[serde(default = "default_handshake_timeout")]
    #[validate(range(min = 1))]
    pub handshake_timeout: u64,
}

pub(super) fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_handshake_timeout() -> u64 {
    10
}

impl ApiSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Scheduler settings.
pub struct SchedulerSettings {
    /// Interval of the periodic dispatch of pending runs, in seconds.
    ///
    /// Runs are also dispatched right away when a task is submitted or a node connects; the
    /// periodic trigger only picks up runs that fell back to `PENDING` after a retriable failure.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [scheduler]
    /// dispatch_interval = 5
    /// ```
    #[validate(range(min = 1))]
    pub dispatch_interval: u64,

    /// Optional staleness timeout for tasks, in seconds.
    ///
    /// When set, runs of a task older than this that are still `PENDING` (typically because their
    /// node never came back) are failed with the reason `timed_out`. Runs that are assigned or
    /// running are left alone. Disabled when absent.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub task_timeout: Option<u64>,
}

impl SchedulerSettings {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
/// A collaboration and its members.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [[collaborations]]
/// id = 1
///
/// [[collaborations.members]]
/// node = 10
/// signing_key = "<64 hex characters>"
/// encrypt_key = "<64 hex characters>"
/// ```
pub struct CollaborationSettings {
    pub id: u64,
    pub members: Vec<MemberSettings>,
}

#[derive(Debug, Deserialize, Clone)]
/// A member node of a collaboration.
pub struct MemberSettings {
    pub node: u64,
    /// The node's `Ed25519` identity key, as printed by `node keys`.
    #[serde(deserialize_with = "deserialize_hex")]
    pub signing_key: PublicSigningKey,
    /// The node's `C25519` encryption key for this collaboration, as printed by `node keys`.
    #[serde(deserialize_with = "deserialize_hex")]
    pub encrypt_key: PublicEncryptKey,
}

fn validate_collaborations(s: &CoordinatorSettings) -> Result<(), ValidationError> {
    check_collaborations(&s.collaborations)
}

fn check_collaborations(collaborations: &[CollaborationSettings]) -> Result<(), ValidationError> {
    let mut ids = HashSet::new();
    for collaboration in collaborations {
        if !ids.insert(collaboration.id) {
            return Err(ValidationError::new("duplicate collaboration id"));
        }
        let mut members = HashSet::new();
        if !collaboration.members.iter().all(|m| members.insert(m.node)) {
            return Err(ValidationError::new("duplicate collaboration member"));
        }
    }
    // a node identifies with a single signing key, whatever the collaboration
    let mut signing_keys = std::collections::HashMap::new();
    for member in collaborations.iter().flat_map(|c| c.members.iter()) {
        if let Some(key) = signing_keys.insert(member.node, member.signing_key) {
            if key != member.signing_key {
                return Err(ValidationError::new("conflicting node signing keys"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{ByteObject, EncryptKeyPair, KeyRegistry, SigningKeyPair},
        settings::tests::write_config,
    };

    fn member(node: u64, signing: &SigningKeyPair) -> MemberSettings {
        MemberSettings {
            node,
            signing_key: signing.public,
            encrypt_key: EncryptKeyPair::generate().public,
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(CoordinatorSettings::new("configs/coordinator.toml").is_ok());
    }

    #[test]
    fn test_load_members() {
        let signing = SigningKeyPair::generate();
        let encrypt = EncryptKeyPair::generate();
        let file = write_config(&format!(
            r#"
[api]
bind_address = "127.0.0.1:7070"

[scheduler]
dispatch_interval = 2

[log]
filter = "info"

[[collaborations]]
id = 1

[[collaborations.members]]
node = 10
signing_key = "{}"
encrypt_key = "{}"
"#,
            signing.public.to_hex(),
            encrypt.public.to_hex()
        ));
        let settings = CoordinatorSettings::new(file.path()).unwrap();
        assert_eq!(settings.api.max_message_size, default_max_message_size());
        assert_eq!(settings.scheduler.task_timeout(), None);

        let registry = settings.key_registry();
        assert_eq!(
            registry.public_key(CollaborationId::from(1), NodeId::from(10)),
            Some(encrypt.public)
        );
        let directory = settings.directory();
        assert!(directory.is_member(CollaborationId::from(1), NodeId::from(10)));
        assert!(!directory.is_member(CollaborationId::from(1), NodeId::from(11)));
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let file = write_config(
            r#"
[api]
bind_address = "127.0.0.1:7070"

[scheduler]
dispatch_interval = 2

[log]
filter = "info"

[[collaborations]]
id = 1

[[collaborations.members]]
node = 10
signing_key = "abcd"
encrypt_key = "abcd"
"#,
        );
        assert!(matches!(
            CoordinatorSettings::new(file.path()),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    fn test_validate_collaborations() {
        let signing = SigningKeyPair::generate();
        let ok = vec![
            CollaborationSettings {
                id: 1,
                members: vec![member(10, &signing), member(11, &SigningKeyPair::generate())],
            },
            CollaborationSettings {
                id: 2,
                members: vec![member(10, &signing)],
            },
        ];
        assert!(check_collaborations(&ok).is_ok());

        let duplicate_collaboration = vec![
            CollaborationSettings {
                id: 1,
                members: vec![],
            },
            CollaborationSettings {
                id: 1,
                members: vec![],
            },
        ];
        assert!(check_collaborations(&duplicate_collaboration).is_err());

        let duplicate_member = vec![CollaborationSettings {
            id: 1,
            members: vec![member(10, &signing), member(10, &signing)],
        }];
        assert!(check_collaborations(&duplicate_member).is_err());

        let conflicting_keys = vec![
            CollaborationSettings {
                id: 1,
                members: vec![member(10, &signing)],
            },
            CollaborationSettings {
                id: 2,
                members: vec![member(10, &SigningKeyPair::generate())],
            },
        ];
        assert!(check_collaborations(&conflicting_keys).is_err());
    }

    #[test]
    fn test_duplicate_collaborations_are_rejected() {
        let file = write_config(
            r#"
[api]
bind_address = "127.0.0.1:7070"

[scheduler]
dispatch_interval = 2

[log]
filter = "info"

[[collaborations]]
id = 1

[[collaborations]]
id = 1
"#,
        );
        assert!(matches!(
            CoordinatorSettings::new(file.path()),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_scheduler() {
        let scheduler = SchedulerSettings {
            dispatch_interval: 0,
            task_timeout: None,
        };
        assert!(scheduler.validate().is_err());

        let scheduler = SchedulerSettings {
            dispatch_interval: 1,
            task_timeout: Some(0),
        };
        assert!(scheduler.validate().is_err());
    }
}

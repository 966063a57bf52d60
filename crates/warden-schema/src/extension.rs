use crate::config::Configuration;
use crate::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of the configuration entry in a container record's extension map.
pub const CONFIG_EXTENSION: &str = "warden.config.v1";

/// Type URL stamped on every encoded configuration.
pub const CONFIG_TYPE_URL: &str = "types.warden.dev/warden.v1.Container";

/// Opaque typed payload attached to a container record.
///
/// The runtime stores these verbatim; only the holder of the type URL knows
/// how to interpret `value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Extension {
    pub type_url: String,
    #[serde(with = "payload")]
    pub value: Vec<u8>,
}

impl Extension {
    pub fn new(type_url: &str, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.to_owned(),
            value,
        }
    }
}

// Payloads are JSON documents, so keep them readable inside container.json
// instead of serializing a byte array.
mod payload {
    use serde::{ser, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = std::str::from_utf8(value)
            .map_err(|e| <S::Error as ser::Error>::custom(format!("payload is not UTF-8: {e}")))?;
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

/// Wrap a validated configuration into the extension attached at container creation.
pub fn encode_config(config: &Configuration) -> Result<Extension, DecodeError> {
    config.validate()?;
    let value = serde_json::to_vec(config)?;
    Ok(Extension::new(CONFIG_TYPE_URL, value))
}

/// Recover the configuration of `container_id` from its extension map.
///
/// Absence of the extension is an error: every container that has been started
/// must carry a configuration, and an empty default would silently point the
/// engine at no network.
pub fn decode_config(
    container_id: &str,
    extensions: &BTreeMap<String, Extension>,
) -> Result<Configuration, DecodeError> {
    let ext = extensions
        .get(CONFIG_EXTENSION)
        .ok_or_else(|| DecodeError::MissingExtension(container_id.to_owned()))?;

    if ext.type_url != CONFIG_TYPE_URL {
        return Err(DecodeError::TypeMismatch {
            expected: CONFIG_TYPE_URL.to_owned(),
            actual: ext.type_url.clone(),
        });
    }

    let config: Configuration = serde_json::from_slice(&ext.value)?;
    if config.id != container_id {
        return Err(DecodeError::IdMismatch {
            container: container_id.to_owned(),
            config: config.id.into_inner(),
        });
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDef;

    fn extensions_for(config: &Configuration) -> BTreeMap<String, Extension> {
        let mut map = BTreeMap::new();
        map.insert(CONFIG_EXTENSION.to_owned(), encode_config(config).unwrap());
        map
    }

    #[test]
    fn decode_recovers_services() {
        let config =
            Configuration::new("web1", "bridge0").with_service("http", ServiceDef::new(80));
        let decoded = decode_config("web1", &extensions_for(&config)).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn missing_extension_is_an_error() {
        let result = decode_config("web1", &BTreeMap::new());
        assert!(matches!(result, Err(DecodeError::MissingExtension(id)) if id == "web1"));
    }

    #[test]
    fn foreign_type_url_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert(
            CONFIG_EXTENSION.to_owned(),
            Extension::new("types.example.com/Other", b"{}".to_vec()),
        );
        assert!(matches!(
            decode_config("web1", &map),
            Err(DecodeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let mut map = BTreeMap::new();
        map.insert(
            CONFIG_EXTENSION.to_owned(),
            Extension::new(CONFIG_TYPE_URL, b"not json".to_vec()),
        );
        assert!(matches!(
            decode_config("web1", &map),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn id_must_match_container() {
        let config = Configuration::new("web2", "host");
        assert!(matches!(
            decode_config("web1", &extensions_for(&config)),
            Err(DecodeError::IdMismatch { .. })
        ));
    }

    #[test]
    fn encode_refuses_invalid_config() {
        let config = Configuration::new("", "host");
        assert!(encode_config(&config).is_err());
    }

    #[test]
    fn extension_payload_is_readable_json() {
        let ext = encode_config(&Configuration::new("web1", "host")).unwrap();
        let json = serde_json::to_string(&ext).unwrap();
        assert!(json.contains("\\\"network\\\":\\\"host\\\""));
        let back: Extension = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ext);
    }
}

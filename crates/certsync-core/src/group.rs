//! Certificate bundle entities
//!
//! Records laid out as
//!
//! ```text
//! <namespace>/<root>/<service>/<domain>/<name>.<role>
//! ```
//!
//! share an [`EntityGroupKey`] of `(service, domain, name)`. An
//! [`EntityGroup`] holds exactly one record per required role; with the
//! default roles that is the properties JSON, the private key and the
//! certificate chain.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::digest::{ContentHash, Versioned};
use crate::reader::{StorageReader, StorageRecord};

/// Role holding the bundle's properties JSON
pub const ROLE_PROPERTIES: &str = "json";

/// Role holding the PEM private key
pub const ROLE_PRIVATE_KEY: &str = "key";

/// Role holding the PEM certificate chain
pub const ROLE_CERTIFICATE: &str = "crt";

/// Identity shared by every record of one bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityGroupKey {
    /// Issuing service (first segment under the root folder)
    pub service: String,
    /// Domain (second segment under the root folder)
    pub domain: String,
    /// File stem shared by the role files
    pub name: String,
}

impl EntityGroupKey {
    /// Derive the key from a reader's path
    ///
    /// The service and domain are the first two segments under
    /// `root_folder` and the name is the file stem, so
    /// `<root>/<service>/<domain>/<any>/<file>` groups with its siblings
    /// directly under `<domain>`. Returns `None` when fewer than three
    /// segments follow the root or the stem is blank.
    pub fn from_reader(reader: &StorageReader, root_folder: &str) -> Option<Self> {
        let path = reader.path(&[root_folder]);
        let [service, domain, _, ..] = path.as_slice() else {
            return None;
        };
        if service.trim().is_empty() || domain.trim().is_empty() {
            return None;
        }
        let name = reader.stem()?;
        Some(Self {
            service: service.to_string(),
            domain: domain.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for EntityGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.domain, self.name)
    }
}

/// One complete bundle: a selected record per required role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGroup {
    key: EntityGroupKey,
    roles: Vec<(String, StorageRecord)>,
    hash: ContentHash,
    modified: Option<DateTime<Utc>>,
}

impl EntityGroup {
    /// Assemble a group from its role records, in role order
    pub fn new(key: EntityGroupKey, roles: Vec<(String, StorageRecord)>) -> Self {
        let mut fields: Vec<&[u8]> = vec![
            key.service.as_bytes(),
            key.domain.as_bytes(),
            key.name.as_bytes(),
        ];
        let role_hashes: Vec<ContentHash> = roles.iter().map(|(_, r)| r.hash).collect();
        fields.extend(role_hashes.iter().map(|h| h.as_bytes().as_slice()));
        let hash = ContentHash::of(fields);

        let modified = roles.iter().filter_map(|(_, r)| r.modified).max();

        Self {
            key,
            roles,
            hash,
            modified,
        }
    }

    /// The bundle identity
    pub fn key(&self) -> &EntityGroupKey {
        &self.key
    }

    /// `H(service, domain, name, role hashes...)`
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    /// Latest `modified` across the role records
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// All role records, in configured role order
    pub fn roles(&self) -> &[(String, StorageRecord)] {
        &self.roles
    }

    /// The record selected for `role`
    pub fn role(&self, role: &str) -> Option<&StorageRecord> {
        self.roles
            .iter()
            .find(|(name, _)| name == role)
            .map(|(_, record)| record)
    }

    /// Properties JSON record
    pub fn properties(&self) -> Option<&StorageRecord> {
        self.role(ROLE_PROPERTIES)
    }

    /// Private key record
    pub fn private_key(&self) -> Option<&StorageRecord> {
        self.role(ROLE_PRIVATE_KEY)
    }

    /// Certificate record
    pub fn certificate(&self) -> Option<&StorageRecord> {
        self.role(ROLE_CERTIFICATE)
    }

    /// Parsed properties JSON, if present and valid
    pub fn properties_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.properties()?.value).ok()
    }

    fn property_values(&self, name: &str) -> Vec<Value> {
        match self.properties_json().and_then(|mut json| json.get_mut(name).map(Value::take)) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        }
    }

    /// First non-blank string under `"sans"` (a string or an array)
    pub fn sans(&self) -> Option<String> {
        self.property_values("sans")
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .find(|s| !s.trim().is_empty())
    }

    /// First non-empty object under `"issuer_data"`
    pub fn issuer_data(&self) -> Option<Map<String, Value>> {
        self.property_values("issuer_data")
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .find(|map| !map.is_empty())
    }
}

impl Versioned for EntityGroup {
    fn content_hash(&self) -> ContentHash {
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;
    use std::sync::Arc;

    fn record(key: &str, value: &[u8]) -> StorageRecord {
        StorageRecord {
            key: key.to_string(),
            raw: Vec::new(),
            value: value.to_vec(),
            modified: None,
            hash: ContentHash::of([key.as_bytes(), value]),
        }
    }

    fn group(properties: &str) -> EntityGroup {
        EntityGroup::new(
            EntityGroupKey {
                service: "svc".to_string(),
                domain: "example.com".to_string(),
                name: "site".to_string(),
            },
            vec![
                ("json".to_string(), record("k.json", properties.as_bytes())),
                ("key".to_string(), record("k.key", b"KEY")),
                ("crt".to_string(), record("k.crt", b"CRT")),
            ],
        )
    }

    #[test]
    fn key_from_reader_path() {
        let store: Arc<dyn crate::traits::KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let reader = |key: &str| StorageReader::new(Arc::clone(&store), "ns", key).unwrap();

        let key = EntityGroupKey::from_reader(
            &reader("ns/certificates/svcA/example.com/site.json"),
            "certificates",
        )
        .unwrap();
        assert_eq!(key.to_string(), "svcA/example.com/site");

        for bad in [
            "ns/acme/svcA/example.com/site.json",
            "ns/certificates/svcA/site.json",
            "ns/certificates/svcA/example.com/.json",
        ] {
            assert!(
                EntityGroupKey::from_reader(&reader(bad), "certificates").is_none(),
                "{} should not map to a group",
                bad
            );
        }
    }

    #[test]
    fn nested_files_share_the_domain_group() {
        let store: Arc<dyn crate::traits::KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let nested = StorageReader::new(
            Arc::clone(&store),
            "ns",
            "ns/certificates/svcA/example.com/archive/site.crt",
        )
        .unwrap();
        let direct =
            StorageReader::new(store, "ns", "ns/certificates/svcA/example.com/site.json").unwrap();

        assert_eq!(
            EntityGroupKey::from_reader(&nested, "certificates"),
            EntityGroupKey::from_reader(&direct, "certificates")
        );
        assert_eq!(
            EntityGroupKey::from_reader(&nested, "certificates")
                .unwrap()
                .to_string(),
            "svcA/example.com/site"
        );
    }

    #[test]
    fn hash_changes_with_any_role() {
        let a = group("{}");
        let b = group(r#"{"x":1}"#);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), group("{}").hash());
    }

    #[test]
    fn modified_is_latest_role_timestamp() {
        let mut g = group("{}");
        let early: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let late: DateTime<Utc> = "2024-06-01T00:00:00Z".parse().unwrap();
        let mut roles = g.roles().to_vec();
        roles[0].1.modified = Some(early);
        roles[2].1.modified = Some(late);
        g = EntityGroup::new(g.key().clone(), roles);
        assert_eq!(g.modified(), Some(late));
    }

    #[test]
    fn property_accessors() {
        let g = group(r#"{"sans": ["", "example.com", "www.example.com"], "issuer_data": [{}, {"ca": "le"}]}"#);
        assert_eq!(g.sans().as_deref(), Some("example.com"));
        assert_eq!(g.issuer_data().unwrap().get("ca"), Some(&Value::from("le")));
        assert_eq!(g.private_key().unwrap().value, b"KEY");
        assert_eq!(g.certificate().unwrap().value, b"CRT");

        let single = group(r#"{"sans": "example.org"}"#);
        assert_eq!(single.sans().as_deref(), Some("example.org"));
        assert!(single.issuer_data().is_none());

        assert!(group("not json").sans().is_none());
    }
}

//! Composite volume and snapshot identifiers.
//!
//! A volume ID has the form `csi-{prefix}-{name}-{arrayID}-{deviceID}`, a
//! snapshot ID `snap-{prefix}-{name}-{arrayID}-{deviceID}`. The cluster
//! prefix and both array-side IDs never contain `-`; the name may. Decoding
//! therefore takes the prefix up to the first `-` and the array and device
//! IDs from the last two segments.

use std::fmt;

use thiserror::Error;

/// Marker for volume identifiers.
pub const VOLUME_KIND: &str = "csi";
/// Marker for snapshot identifiers.
pub const SNAPSHOT_KIND: &str = "snap";
/// Longest permitted cluster prefix.
pub const MAX_CLUSTER_PREFIX_LEN: usize = 3;
/// Prepended to an array-side identifier when its volume is queued for deletion.
pub const DELETION_MARKER: &str = "_DEL";

const SEPARATOR: char = '-';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("cluster prefix '{0}' must be 1 to 3 ASCII letters or digits")]
    InvalidPrefix(String),

    #[error("{field} '{value}' must not contain '-'")]
    InvalidComponent { field: &'static str, value: String },

    #[error("'{0}' is not a valid identifier")]
    Grammar(String),
}

/// Check a cluster prefix: 1 to 3 ASCII alphanumerics.
pub fn validate_cluster_prefix(prefix: &str) -> Result<(), IdError> {
    if prefix.is_empty() {
        return Err(IdError::Empty("cluster prefix"));
    }
    if prefix.len() > MAX_CLUSTER_PREFIX_LEN || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(IdError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

/// Array-side identifier stored on a device: `csi-{prefix}-{name}`.
pub fn volume_identifier(cluster_prefix: &str, name: &str) -> String {
    format!("{}-{}-{}", VOLUME_KIND, cluster_prefix, name)
}

/// Array-side name of a snapshot: `snap-{prefix}-{name}`.
pub fn snapshot_identifier(cluster_prefix: &str, name: &str) -> String {
    format!("{}-{}-{}", SNAPSHOT_KIND, cluster_prefix, name)
}

/// Identifier a device carries while it waits for reclamation.
pub fn mark_for_deletion(identifier: &str) -> String {
    format!("{}{}", DELETION_MARKER, identifier)
}

/// The original identifier of a marked device, or `None` if it is unmarked.
pub fn strip_deletion_marker(identifier: &str) -> Option<&str> {
    identifier.strip_prefix(DELETION_MARKER)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Parts {
    cluster_prefix: String,
    name: String,
    array_id: String,
    device_id: String,
}

impl Parts {
    fn new(cluster_prefix: &str, name: &str, array_id: &str, device_id: &str) -> Result<Self, IdError> {
        validate_cluster_prefix(cluster_prefix)?;
        if name.is_empty() {
            return Err(IdError::Empty("name"));
        }
        for (field, value) in [("array ID", array_id), ("device ID", device_id)] {
            if value.is_empty() {
                return Err(IdError::Empty(field));
            }
            if value.contains(SEPARATOR) {
                return Err(IdError::InvalidComponent {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(Self {
            cluster_prefix: cluster_prefix.to_string(),
            name: name.to_string(),
            array_id: array_id.to_string(),
            device_id: device_id.to_string(),
        })
    }

    fn encode(&self, kind: &str) -> String {
        format!(
            "{kind}-{}-{}-{}-{}",
            self.cluster_prefix, self.name, self.array_id, self.device_id
        )
    }

    fn decode(kind: &str, id: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Grammar(id.to_string());

        let rest = id
            .strip_prefix(kind)
            .and_then(|r| r.strip_prefix(SEPARATOR))
            .ok_or_else(malformed)?;
        let (prefix, rest) = rest.split_once(SEPARATOR).ok_or_else(malformed)?;
        let (rest, device_id) = rest.rsplit_once(SEPARATOR).ok_or_else(malformed)?;
        let (name, array_id) = rest.rsplit_once(SEPARATOR).ok_or_else(malformed)?;

        Self::new(prefix, name, array_id, device_id).map_err(|_| malformed())
    }
}

/// Decoded volume ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId(Parts);

impl VolumeId {
    pub fn new(
        cluster_prefix: &str,
        name: &str,
        array_id: &str,
        device_id: &str,
    ) -> Result<Self, IdError> {
        Parts::new(cluster_prefix, name, array_id, device_id).map(Self)
    }

    pub fn decode(id: &str) -> Result<Self, IdError> {
        Parts::decode(VOLUME_KIND, id).map(Self)
    }

    pub fn cluster_prefix(&self) -> &str {
        &self.0.cluster_prefix
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn array_id(&self) -> &str {
        &self.0.array_id
    }

    pub fn device_id(&self) -> &str {
        &self.0.device_id
    }

    /// Identifier the device must carry on the array.
    pub fn array_identifier(&self) -> String {
        volume_identifier(&self.0.cluster_prefix, &self.0.name)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.encode(VOLUME_KIND))
    }
}

/// Decoded snapshot ID. The array and device are those of the source volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(Parts);

impl SnapshotId {
    pub fn new(
        cluster_prefix: &str,
        name: &str,
        array_id: &str,
        source_device_id: &str,
    ) -> Result<Self, IdError> {
        Parts::new(cluster_prefix, name, array_id, source_device_id).map(Self)
    }

    pub fn decode(id: &str) -> Result<Self, IdError> {
        Parts::decode(SNAPSHOT_KIND, id).map(Self)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn array_id(&self) -> &str {
        &self.0.array_id
    }

    pub fn source_device_id(&self) -> &str {
        &self.0.device_id
    }

    /// Name of the snapshot on the array.
    pub fn array_identifier(&self) -> String {
        snapshot_identifier(&self.0.cluster_prefix, &self.0.name)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.encode(SNAPSHOT_KIND))
    }
}

/// Encode a volume ID.
pub fn encode_volume_id(
    cluster_prefix: &str,
    name: &str,
    array_id: &str,
    device_id: &str,
) -> Result<String, IdError> {
    VolumeId::new(cluster_prefix, name, array_id, device_id).map(|id| id.to_string())
}

/// Decode a volume ID into `(name, array_id, device_id)`.
pub fn decode_volume_id(id: &str) -> Result<(String, String, String), IdError> {
    let id = VolumeId::decode(id)?;
    Ok((
        id.name().to_string(),
        id.array_id().to_string(),
        id.device_id().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_id() {
        let id = encode_volume_id("TST", "vol1", "000197900046", "00501").unwrap();
        assert_eq!(id, "csi-TST-vol1-000197900046-00501");

        let (name, array, device) = decode_volume_id(&id).unwrap();
        assert_eq!(name, "vol1");
        assert_eq!(array, "000197900046");
        assert_eq!(device, "00501");
    }

    #[test]
    fn test_name_may_contain_separator() {
        let name = "pvc-2f1e8a0c-6d3b-4c7e-9a55-0e1c2b3d4f5a";
        let id = VolumeId::new("k8s", name, "000197900046", "0A1B2").unwrap();
        let decoded = VolumeId::decode(&id.to_string()).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(decoded.name(), name);
        assert_eq!(decoded.cluster_prefix(), "k8s");
        assert_eq!(decoded.array_identifier(), format!("csi-k8s-{}", name));
    }

    #[test]
    fn test_round_trip_various_components() {
        let cases = [
            ("A", "v", "1", "2"),
            ("TST", "vol-with-many-dashes-", "000197900046", "FFFFF"),
            ("x9", "a b c", "ARRAY", "00001"),
        ];
        for (prefix, name, array, device) in cases {
            let encoded = encode_volume_id(prefix, name, array, device).unwrap();
            let (n, a, d) = decode_volume_id(&encoded).unwrap();
            assert_eq!((n.as_str(), a.as_str(), d.as_str()), (name, array, device));
        }
    }

    #[test]
    fn test_encode_rejects_empty_components() {
        assert_eq!(
            encode_volume_id("", "vol1", "000197900046", "00501").unwrap_err(),
            IdError::Empty("cluster prefix")
        );
        assert_eq!(
            encode_volume_id("TST", "", "000197900046", "00501").unwrap_err(),
            IdError::Empty("name")
        );
        assert_eq!(
            encode_volume_id("TST", "vol1", "", "00501").unwrap_err(),
            IdError::Empty("array ID")
        );
        assert_eq!(
            encode_volume_id("TST", "vol1", "000197900046", "").unwrap_err(),
            IdError::Empty("device ID")
        );
    }

    #[test]
    fn test_cluster_prefix_validation() {
        assert!(validate_cluster_prefix("TST").is_ok());
        assert!(validate_cluster_prefix("a1").is_ok());
        assert!(matches!(
            validate_cluster_prefix("LONG"),
            Err(IdError::InvalidPrefix(_))
        ));
        assert!(matches!(
            validate_cluster_prefix("T-T"),
            Err(IdError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_decode_rejects_foreign_strings() {
        let foreign = [
            "",
            "csi",
            "csi-",
            "csi-TST",
            "csi-TST-vol1",
            "csi-TST-vol1-000197900046",
            "csi-TST--000197900046-00501",
            "csi-TST-vol1--00501",
            "csi-TST-vol1-000197900046-",
            "csi-LONG-vol1-000197900046-00501",
            "snap-TST-vol1-000197900046-00501",
            "xyz-TST-vol1-000197900046-00501",
            "csiTST-vol1-000197900046-00501",
            "invalid-token",
        ];
        for id in foreign {
            assert!(
                matches!(VolumeId::decode(id), Err(IdError::Grammar(_))),
                "decoded foreign id {:?}",
                id
            );
        }
    }

    #[test]
    fn test_snapshot_ids_are_distinct_from_volume_ids() {
        let snap = SnapshotId::new("TST", "snap1", "000197900046", "00501").unwrap();
        let encoded = snap.to_string();
        assert_eq!(encoded, "snap-TST-snap1-000197900046-00501");
        assert!(VolumeId::decode(&encoded).is_err());

        let decoded = SnapshotId::decode(&encoded).unwrap();
        assert_eq!(decoded.source_device_id(), "00501");
        assert_eq!(decoded.array_identifier(), "snap-TST-snap1");
    }

    #[test]
    fn test_deletion_marker() {
        let marked = mark_for_deletion("csi-TST-vol1");
        assert_eq!(marked, "_DELcsi-TST-vol1");
        assert_eq!(strip_deletion_marker(&marked), Some("csi-TST-vol1"));
        assert_eq!(strip_deletion_marker("csi-TST-vol1"), None);
    }
}

//! XML image of a snapshot persistor (`snapshots.xml`).
//!
//! ```xml
//! <snapshots version="3">
//!   <parent namespace=".." snapshot=".."/>
//!   <current><tlog><uuid>..</uuid><written_to_backend>true</written_to_backend><size>0</size></tlog></current>
//!   <snapshots version="0" next_num="1">
//!     <snapshot version="5" name="..">
//!       <tlogs>..</tlogs><num>0</num><scrubbed>false</scrubbed>
//!       <date>..</date><snapshot-uuid>..</snapshot-uuid><cork_uuid>..</cork_uuid>
//!       <metadata>hex</metadata>
//!     </snapshot>
//!   </snapshots>
//!   <scrub_id>..</scrub_id>
//! </snapshots>
//! ```
//!
//! Names are attributes: text content is whitespace-trimmed on load,
//! attribute values are not. Versions must match exactly; older or newer
//! images are rejected.

use crate::persistor::SnapshotPersistor;
use crate::snapshot::{Snapshot, Snapshots};
use crate::tlog::{TLog, TLogs, WrittenPrefixVerifier};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use uuid::Uuid;
use voldrv_common::{Error, Namespace, ParentConfig, Result, ScrubId, SnapshotName, TLogId};

pub const SNAPSHOT_PERSISTOR_VERSION: u32 = 3;
pub const SNAPSHOTS_VERSION: u32 = 0;
pub const SNAPSHOT_VERSION: u32 = 5;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "snapshots")]
struct StoredPersistor {
    #[serde(rename = "@version")]
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<StoredParent>,
    current: StoredTLogs,
    snapshots: StoredSnapshots,
    scrub_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredParent {
    #[serde(rename = "@namespace")]
    namespace: String,
    #[serde(rename = "@snapshot")]
    snapshot: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTLogs {
    #[serde(rename = "tlog", default)]
    tlogs: Vec<StoredTLog>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTLog {
    uuid: String,
    written_to_backend: bool,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshots {
    #[serde(rename = "@version")]
    version: u32,
    #[serde(rename = "@next_num", default)]
    next_num: u32,
    #[serde(rename = "snapshot", default)]
    snapshots: Vec<StoredSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    #[serde(rename = "@version")]
    version: u32,
    #[serde(rename = "@name")]
    name: String,
    #[serde(default)]
    tlogs: StoredTLogs,
    num: u32,
    scrubbed: bool,
    date: String,
    #[serde(rename = "snapshot-uuid")]
    uuid: String,
    #[serde(rename = "cork_uuid", default, skip_serializing_if = "Option::is_none")]
    cork: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    metadata: String,
}

impl From<&TLogs> for StoredTLogs {
    fn from(tlogs: &TLogs) -> Self {
        Self {
            tlogs: tlogs
                .iter()
                .map(|t| StoredTLog {
                    uuid: t.id().to_string(),
                    written_to_backend: t.written_to_backend(),
                    size: t.backend_size(),
                })
                .collect(),
        }
    }
}

impl From<&Snapshot> for StoredSnapshot {
    fn from(s: &Snapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            name: s.name().to_string(),
            tlogs: s.tlogs().into(),
            num: s.num(),
            scrubbed: s.scrubbed(),
            date: s.date().to_string(),
            uuid: s.uuid().to_string(),
            cork: s.cork().map(|c| c.to_string()),
            metadata: hex::encode(s.metadata()),
        }
    }
}

fn check_version(what: &'static str, found: u32, expected: u32) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(Error::UnsupportedVersion {
            what,
            found,
            expected,
        })
    }
}

fn parse_uuid(what: &str, s: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim())
        .map_err(|e| Error::deserialization(format!("invalid {what} {s:?}: {e}")))
}

impl StoredTLogs {
    fn into_tlogs(self) -> Result<TLogs> {
        self.tlogs
            .into_iter()
            .map(|t| {
                Ok(TLog::from_parts(
                    TLogId::from_uuid(parse_uuid("tlog id", &t.uuid)?),
                    t.written_to_backend,
                    t.size,
                ))
            })
            .collect()
    }
}

impl StoredSnapshot {
    fn into_snapshot(self) -> Result<Snapshot> {
        check_version("Snapshot", self.version, SNAPSHOT_VERSION)?;
        let metadata = hex::decode(self.metadata.trim())
            .map_err(|e| Error::deserialization(format!("invalid snapshot metadata: {e}")))?;
        let cork = self
            .cork
            .as_deref()
            .map(|c| parse_uuid("cork", c).map(TLogId::from_uuid))
            .transpose()?;
        Ok(Snapshot::from_parts(
            self.num,
            SnapshotName::new(self.name),
            parse_uuid("snapshot uuid", &self.uuid)?,
            metadata,
            self.scrubbed,
            self.date,
            cork,
            self.tlogs.into_tlogs()?,
        ))
    }
}

impl StoredPersistor {
    fn into_persistor(self) -> Result<SnapshotPersistor> {
        check_version(
            "SnapshotPersistor",
            self.version,
            SNAPSHOT_PERSISTOR_VERSION,
        )?;
        check_version("Snapshots", self.snapshots.version, SNAPSHOTS_VERSION)?;
        let next_num = self.snapshots.next_num;

        let parent = self
            .parent
            .map(|p| {
                let namespace = Namespace::new(p.namespace)
                    .map_err(|e| Error::deserialization(format!("invalid parent namespace: {e}")))?;
                Ok::<_, Error>(ParentConfig::new(namespace, SnapshotName::new(p.snapshot)))
            })
            .transpose()?;
        let current = self.current.into_tlogs()?;
        let snapshots = self
            .snapshots
            .snapshots
            .into_iter()
            .map(StoredSnapshot::into_snapshot)
            .collect::<Result<Vec<_>>>()?;
        let scrub_id = ScrubId::from_uuid(parse_uuid("scrub id", &self.scrub_id)?);

        let mut verifier = WrittenPrefixVerifier::default();
        for snapshot in &snapshots {
            verifier.check(snapshot.tlogs())?;
        }
        verifier.check(&current)?;

        Ok(SnapshotPersistor::from_parts(
            current,
            Snapshots::from_parts(snapshots, next_num),
            parent,
            scrub_id,
        ))
    }
}

/// Render the XML image of `sp`
pub(crate) fn to_xml(sp: &SnapshotPersistor) -> Result<String> {
    let stored = StoredPersistor {
        version: SNAPSHOT_PERSISTOR_VERSION,
        parent: sp.parent().map(|p| StoredParent {
            namespace: p.namespace.to_string(),
            snapshot: p.snapshot.to_string(),
        }),
        current: sp.current().into(),
        snapshots: StoredSnapshots {
            version: SNAPSHOTS_VERSION,
            next_num: sp.snapshots().next_snapshot_num(),
            snapshots: sp.snapshots().iter().map(StoredSnapshot::from).collect(),
        },
        scrub_id: sp.scrub_id().to_string(),
    };
    let body = quick_xml::se::to_string(&stored).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n"))
}

/// Parse and verify an XML image
pub(crate) fn from_xml(xml: &str) -> Result<SnapshotPersistor> {
    let stored: StoredPersistor =
        quick_xml::de::from_str(xml).map_err(|e| Error::deserialization(e.to_string()))?;
    stored.into_persistor()
}

/// Parse and verify an XML image read from `reader`
pub(crate) fn from_reader(reader: impl BufRead) -> Result<SnapshotPersistor> {
    let stored: StoredPersistor =
        quick_xml::de::from_reader(reader).map_err(|e| Error::deserialization(e.to_string()))?;
    stored.into_persistor()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> SnapshotPersistor {
        let parent = ParentConfig::new(Namespace::new("parent-ns").unwrap(), "base".into());
        let mut sp = SnapshotPersistor::new(Some(parent));
        sp.new_tlog();
        sp.snapshot(&"first".into(), vec![1, 2, 255], Uuid::new_v4(), false)
            .unwrap();
        sp.new_tlog();
        sp.snapshot(&"second <&>".into(), Vec::new(), Uuid::new_v4(), true)
            .unwrap();
        for id in sp.get_all_tlogs(true).into_iter().take(3) {
            sp.set_tlog_written_to_backend(id).unwrap();
        }
        sp.add_current_backend_size(4096);
        sp
    }

    #[test]
    fn test_round_trip() {
        let sp = populated();
        let xml = to_xml(&sp).unwrap();
        assert!(xml.contains("<snapshots version=\"3\">"));
        assert!(xml.contains("<snapshot version=\"5\" name=\"first\">"));
        assert!(xml.contains("<metadata>0102ff</metadata>"));

        let restored = from_xml(&xml).unwrap();
        assert_eq!(restored, sp);
        let restored = from_reader(xml.as_bytes()).unwrap();
        assert_eq!(restored, sp);
    }

    #[test]
    fn test_round_trip_keeps_names_verbatim() {
        let parent = ParentConfig::new(Namespace::new(" ns ").unwrap(), " base\t".into());
        let mut sp = SnapshotPersistor::new(Some(parent));
        for name in [" padded ", "a", " a", "line\nbreak", "quote\"'"] {
            sp.snapshot(&name.into(), Vec::new(), Uuid::new_v4(), false)
                .unwrap();
        }

        let restored = from_xml(&to_xml(&sp).unwrap()).unwrap();
        assert_eq!(restored, sp);
        assert_eq!(restored.get_snapshot_num(&" padded ".into()).unwrap(), 0);
        assert_eq!(restored.get_snapshot_num(&" a".into()).unwrap(), 2);
        assert_eq!(restored.parent().unwrap().snapshot.as_str(), " base\t");
    }

    #[test]
    fn test_next_num_survives_round_trip() {
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&"a".into(), Vec::new(), Uuid::new_v4(), false)
            .unwrap();
        sp.snapshot(&"b".into(), Vec::new(), Uuid::new_v4(), false)
            .unwrap();
        sp.delete_snapshot(1).unwrap();
        sp.delete_snapshot(0).unwrap();

        let xml = to_xml(&sp).unwrap();
        assert!(xml.contains("next_num=\"2\""));
        let mut restored = from_xml(&xml).unwrap();
        assert_eq!(restored, sp);
        assert_eq!(
            restored
                .snapshot(&"c".into(), Vec::new(), Uuid::new_v4(), false)
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_missing_next_num_is_derived() {
        let mut sp = SnapshotPersistor::new(None);
        sp.snapshot(&"a".into(), Vec::new(), Uuid::new_v4(), false)
            .unwrap();
        let xml = to_xml(&sp).unwrap().replace(" next_num=\"1\"", "");
        assert!(!xml.contains("next_num"));
        assert_eq!(from_xml(&xml).unwrap().snapshots().next_snapshot_num(), 1);
    }

    #[test]
    fn test_round_trip_without_parent() {
        let sp = SnapshotPersistor::new(None);
        let xml = to_xml(&sp).unwrap();
        assert!(!xml.contains("<parent"));
        assert_eq!(from_xml(&xml).unwrap(), sp);
    }

    #[test]
    fn test_rejects_persistor_version() {
        let xml = to_xml(&populated())
            .unwrap()
            .replace("<snapshots version=\"3\">", "<snapshots version=\"2\">");
        assert!(matches!(
            from_xml(&xml),
            Err(Error::UnsupportedVersion {
                what: "SnapshotPersistor",
                found: 2,
                expected: 3
            })
        ));
    }

    #[test]
    fn test_rejects_snapshots_version() {
        let xml = to_xml(&populated())
            .unwrap()
            .replace("<snapshots version=\"0\" ", "<snapshots version=\"1\" ");
        assert!(matches!(
            from_xml(&xml),
            Err(Error::UnsupportedVersion {
                what: "Snapshots",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_snapshot_version() {
        let xml = to_xml(&populated())
            .unwrap()
            .replacen("<snapshot version=\"5\" ", "<snapshot version=\"6\" ", 1);
        let err = from_xml(&xml).unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(
            err,
            Error::UnsupportedVersion {
                what: "Snapshot",
                found: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_written_after_unwritten() {
        let sp = populated();
        let xml = to_xml(&sp).unwrap();
        // flip the last current TLog to written while its predecessor is not
        let last = sp.current_tlog().to_string();
        let needle = format!("<uuid>{last}</uuid><written_to_backend>false</written_to_backend>");
        assert!(xml.contains(&needle));
        let xml = xml.replace(
            &needle,
            &format!("<uuid>{last}</uuid><written_to_backend>true</written_to_backend>"),
        );
        assert!(matches!(
            from_xml(&xml),
            Err(Error::OrderingViolation { .. })
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            from_xml("<snapshots version=\"3\"><current>"),
            Err(Error::Deserialization(_))
        ));
        assert!(from_xml("not xml at all").unwrap_err().is_corruption());
    }
}

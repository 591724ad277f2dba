//! Topic snapshots and the durability hook.
//!
//! File layout (one file per topic, `<base>/<topic>.snapshot`):
//! `[CRC32: u32 BE][JSON body]`. Written to `<topic>.snapshot.tmp`, then renamed.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crc32fast::Hasher;
use tracing::{info, warn};

use crate::brokers::topics::errors::TopicError;
use crate::brokers::topics::options::TopicOptions;
use crate::brokers::topics::page::StoredElement;
use crate::brokers::topics::position::{ChannelId, PageNumber, Position};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PageSnapshot {
    pub number: PageNumber,
    pub sealed: bool,
    pub elements: Vec<StoredElement>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelSnapshot {
    pub channel: ChannelId,
    pub next_page: PageNumber,
    pub last_timestamp: u64,
    pub pages: Vec<PageSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupChannelSnapshot {
    pub committed: Position,
    pub head: Position,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub name: String,
    pub filter: Option<String>,
    pub converter: Option<String>,
    pub channels: Vec<GroupChannelSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicSnapshot {
    pub name: String,
    pub channel_count: u32,
    /// Resolved options of the topic; absent in older snapshots.
    #[serde(default)]
    pub options: TopicOptions,
    pub taken_at: u64,
    pub channels: Vec<ChannelSnapshot>,
    pub groups: Vec<GroupSnapshot>,
}

impl TopicSnapshot {
    pub fn element_count(&self) -> usize {
        self.channels
            .iter()
            .flat_map(|c| c.pages.iter())
            .map(|p| p.elements.len())
            .sum()
    }
}

// ==========================================
// DURABILITY
// ==========================================

pub trait Durability: Send + Sync {
    fn save(&self, snapshot: &TopicSnapshot) -> Result<(), TopicError>;
    /// `Ok(None)` when nothing was ever saved for `topic`.
    fn load(&self, topic: &str) -> Result<Option<TopicSnapshot>, TopicError>;
    /// Names of every topic with a saved snapshot.
    fn list(&self) -> Result<Vec<String>, TopicError>;
    fn remove(&self, topic: &str) -> Result<(), TopicError>;
}

pub struct FileDurability {
    base_path: PathBuf,
}

const SNAPSHOT_EXT: &str = "snapshot";

impl FileDurability {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, TopicError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn path_for(&self, topic: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", topic, SNAPSHOT_EXT))
    }
}

impl Durability for FileDurability {
    fn save(&self, snapshot: &TopicSnapshot) -> Result<(), TopicError> {
        let body = serde_json::to_vec(snapshot)?;
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let path = self.path_for(&snapshot.name);
        let tmp_path = self.base_path.join(format!("{}.{}.tmp", snapshot.name, SNAPSHOT_EXT));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&crc.to_be_bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        info!(topic = %snapshot.name, elements = snapshot.element_count(), "Snapshot saved");
        Ok(())
    }

    fn load(&self, topic: &str) -> Result<Option<TopicSnapshot>, TopicError> {
        let path = self.path_for(topic);
        if !path.exists() {
            return Ok(None);
        }

        let mut raw = Vec::new();
        File::open(&path)?.read_to_end(&mut raw)?;
        if raw.len() < 4 {
            warn!(topic, "Snapshot truncated, ignoring");
            return Ok(None);
        }

        let (crc_buf, body) = raw.split_at(4);
        let stored_crc = u32::from_be_bytes([crc_buf[0], crc_buf[1], crc_buf[2], crc_buf[3]]);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            warn!(topic, "Snapshot CRC mismatch, ignoring");
            return Ok(None);
        }

        Ok(Some(serde_json::from_slice(body)?))
    }

    fn list(&self) -> Result<Vec<String>, TopicError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, topic: &str) -> Result<(), TopicError> {
        let path = self.path_for(topic);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::topics::options::ElementCalculator;
    use bytes::Bytes;

    fn sample(name: &str) -> TopicSnapshot {
        TopicSnapshot {
            name: name.to_string(),
            channel_count: 1,
            options: TopicOptions {
                channel_count: Some(1),
                retain_consumed: Some(true),
                calculator: Some(ElementCalculator::Count),
                ..Default::default()
            },
            taken_at: 42,
            channels: vec![ChannelSnapshot {
                channel: 0,
                next_page: 2,
                last_timestamp: 7,
                pages: vec![PageSnapshot {
                    number: 1,
                    sealed: false,
                    elements: vec![StoredElement { timestamp: 7, value: Bytes::from_static(b"hello") }],
                }],
            }],
            groups: vec![GroupSnapshot {
                name: "g".into(),
                filter: None,
                converter: None,
                channels: vec![GroupChannelSnapshot {
                    committed: Position::null(0),
                    head: Position::start_of(0, 1),
                }],
            }],
        }
    }

    #[test]
    fn test_save_load_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let durability = FileDurability::new(dir.path()).unwrap();

        assert!(durability.load("orders").unwrap().is_none());
        durability.save(&sample("orders")).unwrap();
        durability.save(&sample("audit")).unwrap();

        let loaded = durability.load("orders").unwrap().unwrap();
        assert_eq!(loaded, sample("orders"));
        assert_eq!(loaded.element_count(), 1);
        assert_eq!(durability.list().unwrap(), vec!["audit".to_string(), "orders".to_string()]);

        durability.remove("orders").unwrap();
        assert!(durability.load("orders").unwrap().is_none());
    }

    #[test]
    fn test_corrupted_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let durability = FileDurability::new(dir.path()).unwrap();
        durability.save(&sample("orders")).unwrap();

        let path = dir.path().join("orders.snapshot");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(durability.load("orders").unwrap().is_none());
    }
}

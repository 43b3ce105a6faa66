use serde::{Deserialize, Serialize};

/// Kind of entry a path refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    File,
    Path,
    Link,
    Special,
    Missing,
}

impl StorageType {
    pub fn code(&self) -> char {
        match self {
            Self::File => 'f',
            Self::Path => 'p',
            Self::Link => 'l',
            Self::Special => 's',
            Self::Missing => '-',
        }
    }
}

/// Snapshot of a path's metadata.
///
/// Produced by a driver and never mutated afterwards. Fields a backend cannot
/// supply are `None` (object stores have no owner or mode; local files have
/// no entity tag).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Entry name relative to the listed path; empty for a direct `info` call.
    pub name: String,
    pub kind: StorageType,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub time_modified: i64,
    pub user_id: Option<u32>,
    pub user: Option<String>,
    pub group_id: Option<u32>,
    pub group: Option<String>,
    pub mode: Option<u32>,
    pub link_destination: Option<String>,
    pub etag: Option<String>,
    /// Provider-reported checksum (e.g. a multipart-derived etag), when available.
    pub checksum: Option<String>,
}

impl StorageInfo {
    pub fn new(kind: StorageType) -> Self {
        Self {
            name: String::new(),
            kind,
            size: 0,
            time_modified: 0,
            user_id: None,
            user: None,
            group_id: None,
            group: None,
            mode: None,
            link_destination: None,
            etag: None,
            checksum: None,
        }
    }

    pub fn missing() -> Self {
        Self::new(StorageType::Missing)
    }

    pub fn file(size: u64, time_modified: i64) -> Self {
        Self {
            size,
            time_modified,
            ..Self::new(StorageType::File)
        }
    }

    pub fn path() -> Self {
        Self::new(StorageType::Path)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn exists(&self) -> bool {
        self.kind != StorageType::Missing
    }

    pub fn is_file(&self) -> bool {
        self.kind == StorageType::File
    }

    pub fn is_path(&self) -> bool {
        self.kind == StorageType::Path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_does_not_exist() {
        assert!(!StorageInfo::missing().exists());
        assert!(StorageInfo::path().exists());
    }

    #[test]
    fn file_constructor() {
        let info = StorageInfo::file(42, 1_700_000_000).with_name("a.gz");
        assert!(info.is_file());
        assert_eq!(info.size, 42);
        assert_eq!(info.name, "a.gz");
        assert!(info.mode.is_none());
    }

    #[test]
    fn type_codes_unique() {
        let mut codes: Vec<char> = [
            StorageType::File,
            StorageType::Path,
            StorageType::Link,
            StorageType::Special,
            StorageType::Missing,
        ]
        .iter()
        .map(|t| t.code())
        .collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 5);
    }

    #[test]
    fn bincode_roundtrip() {
        let mut info = StorageInfo::file(7, 3);
        info.etag = Some("\"abc\"".into());
        let bytes = bincode::serialize(&info).unwrap();
        let back: StorageInfo = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, info);
    }
}

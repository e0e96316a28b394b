use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::LedgerError;

const STORE_EXTENSION: &str = ".sqlite";

/// Client-supplied ledger identifier, checked to stay inside the ledger root.
///
/// The identifier is kept verbatim (`marks.xlsx` stays `marks.xlsx`); the
/// backing file is `<root>/<identifier>.sqlite`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerPath {
    raw: String,
}

impl LedgerPath {
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let invalid = |reason| LedgerError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }
        if trimmed.contains('\0') {
            return Err(invalid("path contains a NUL byte"));
        }
        if trimmed.ends_with('/') || trimmed.ends_with('\\') {
            return Err(invalid("path names a directory"));
        }

        let path = Path::new(trimmed);
        if path.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
            return Err(invalid("path must be relative to the ledger root"));
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(invalid("path escapes the ledger root")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("path must be relative to the ledger root"));
                }
            }
        }
        // Windows separators are not components on unix but still traverse there.
        if trimmed.split(['/', '\\']).any(|part| part == "..") {
            return Err(invalid("path escapes the ledger root"));
        }

        Ok(Self {
            raw: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Backing store file for this ledger under `root`.
    pub fn file_in(&self, root: &Path) -> PathBuf {
        let mut file: OsString = root.join(&self.raw).into_os_string();
        file.push(STORE_EXTENSION);
        PathBuf::from(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_nested_names_are_accepted() {
        let path = LedgerPath::parse("marks.xlsx").expect("valid");
        assert_eq!(path.as_str(), "marks.xlsx");
        assert_eq!(
            path.file_in(Path::new("/data")),
            PathBuf::from("/data/marks.xlsx.sqlite")
        );

        let nested = LedgerPath::parse("class-7/term1.xlsx").expect("valid");
        assert_eq!(
            nested.file_in(Path::new("root")),
            PathBuf::from("root/class-7/term1.xlsx.sqlite")
        );
    }

    #[test]
    fn escaping_or_empty_paths_are_rejected() {
        for raw in ["", "   ", "/etc/passwd", "../marks.xlsx", "a/../../b", "dir/", "a\\..\\b"] {
            let err = LedgerPath::parse(raw).expect_err(raw);
            assert!(!err.is_persistence(), "{raw}");
        }
    }
}

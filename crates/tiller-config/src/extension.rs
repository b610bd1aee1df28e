//! Extension hook specifications.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A startup extension hook, recorded as a (file, directory) pair.
///
/// The daemon executes `directory/file` with `directory` as the working
/// directory, so hooks can ship data files alongside the executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSpec {
    /// File name of the hook executable, relative to `directory`.
    pub file: String,
    /// Directory containing the hook and its support files.
    pub directory: Utf8PathBuf,
}

/// Errors raised while splitting an extension path into a spec.
#[derive(Debug, Error)]
pub enum ExtensionSpecError {
    /// The path has no final file component.
    #[error("extension path '{path}' has no file name")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// The path has no parent directory.
    #[error("extension path '{path}' has no parent directory")]
    MissingDirectory {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

impl ExtensionSpec {
    /// Splits an absolute hook path into its (file, directory) pair.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionSpecError`] when the path lacks a file name or a
    /// parent directory.
    pub fn from_path(path: &Utf8Path) -> Result<Self, ExtensionSpecError> {
        let file = path
            .file_name()
            .ok_or_else(|| ExtensionSpecError::MissingFileName {
                path: path.to_owned(),
            })?;
        let directory = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .ok_or_else(|| ExtensionSpecError::MissingDirectory {
                path: path.to_owned(),
            })?;
        Ok(Self {
            file: file.to_owned(),
            directory: directory.to_owned(),
        })
    }

    /// Full path of the hook executable.
    #[must_use]
    pub fn executable(&self) -> Utf8PathBuf {
        self.directory.join(&self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_path() {
        let spec =
            ExtensionSpec::from_path(Utf8Path::new("/opt/hooks/identity-hook")).expect("spec");
        assert_eq!(spec.file, "identity-hook");
        assert_eq!(spec.directory, Utf8PathBuf::from("/opt/hooks"));
        assert_eq!(spec.executable(), Utf8PathBuf::from("/opt/hooks/identity-hook"));
    }

    #[test]
    fn rejects_bare_file_name() {
        let error = ExtensionSpec::from_path(Utf8Path::new("hook")).expect_err("no directory");
        assert!(matches!(error, ExtensionSpecError::MissingDirectory { .. }));
    }
}

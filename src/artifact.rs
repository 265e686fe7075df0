//! The test file being healed.

use crate::error::{HealError, Result};
use crate::framework::Framework;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A test source file plus the framework it targets.
///
/// The source text is loaded once when a session starts and is afterwards
/// changed only by the patch applicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestArtifact {
    /// Path of the test file, as given by the caller.
    pub path: PathBuf,
    /// Current source text.
    pub source: String,
    /// Framework the test is written for.
    pub framework: Framework,
}

impl TestArtifact {
    /// Create an artifact from in-memory parts.
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>, framework: Framework) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            framework,
        }
    }

    /// Load an artifact from disk.
    pub fn load(path: impl AsRef<Path>, framework: Framework) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HealError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let source = std::fs::read_to_string(path)?;
        Ok(Self::new(path, source, framework))
    }

    /// MD5 fingerprint of the current source text.
    ///
    /// ```
    /// use mender::artifact::TestArtifact;
    /// use mender::framework::Framework;
    ///
    /// let a = TestArtifact::new("a.cy.js", "cy.visit('/')", Framework::Cypress);
    /// let b = TestArtifact::new("b.cy.js", "cy.visit('/')", Framework::Cypress);
    /// assert_eq!(a.fingerprint(), b.fingerprint());
    /// ```
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!("{:x}", md5::compute(self.source.as_bytes()))
    }

    /// Identifier used in audit file names: the file name with every
    /// character outside `[A-Za-z0-9._-]` replaced by `_`.
    #[must_use]
    pub fn slug(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

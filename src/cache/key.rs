use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical identifier of a cached collection, e.g. `["entries", "list"]`.
///
/// Equality and hashing are segment-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(segments.into_iter().map(Into::into).collect())
  }

  pub fn segments(&self) -> &[String] {
    &self.0
  }

  /// Stable fixed-length hash of the key, used in logs and storage.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    for segment in &self.0 {
      // Length-prefix each segment so ["ab","c"] and ["a","bc"] differ.
      hasher.update((segment.len() as u64).to_le_bytes());
      hasher.update(segment.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for QueryKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "[{}]", self.0.join(","))
  }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for QueryKey {
  fn from(segments: [S; N]) -> Self {
    Self::new(segments)
  }
}

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A workspace-absolute path such as `/proj/src/main.rs`.
///
/// The workspace root is `/` and has no segments. A one-segment path names a
/// project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoryPath {
    segments: Vec<String>,
}

impl HistoryPath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses `s`, ignoring empty segments, so `"proj//a"` and `"/proj/a/"`
    /// both become `/proj/a`.
    pub fn new(s: &str) -> Self {
        let segments = s
            .split(['/', '\\'])
            .filter(|seg| !seg.is_empty() && *seg != ".")
            .map(str::to_string)
            .collect();
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The folder this path lives in. The root is its own parent.
    pub fn parent(&self) -> HistoryPath {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &HistoryPath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    pub fn append(&self, tail: &HistoryPath) -> HistoryPath {
        let mut segments = self.segments.clone();
        segments.extend(tail.segments.iter().cloned());
        Self { segments }
    }

    pub fn remove_first_segments(&self, count: usize) -> HistoryPath {
        Self {
            segments: self.segments.iter().skip(count).cloned().collect(),
        }
    }
}

impl fmt::Display for HistoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl From<&str> for HistoryPath {
    fn from(s: &str) -> Self {
        HistoryPath::new(s)
    }
}

impl Serialize for HistoryPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HistoryPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(HistoryPath::new(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let p = HistoryPath::new("proj//src/./main.rs/");
        assert_eq!(p.to_string(), "/proj/src/main.rs");
        assert_eq!(p.segment_count(), 3);
        assert_eq!(HistoryPath::root().to_string(), "/");
    }

    #[test]
    fn test_prefix_is_segment_aware() {
        let proj = HistoryPath::new("/proj");
        assert!(proj.is_prefix_of(&HistoryPath::new("/proj/a.txt")));
        assert!(proj.is_prefix_of(&proj));
        assert!(!proj.is_prefix_of(&HistoryPath::new("/project/a.txt")));
        assert!(HistoryPath::root().is_prefix_of(&proj));
    }

    #[test]
    fn test_rebase() {
        let src = HistoryPath::new("/proj/old");
        let dst = HistoryPath::new("/proj/new");
        let file = HistoryPath::new("/proj/old/sub/a.txt");
        let moved = dst.append(&file.remove_first_segments(src.segment_count()));
        assert_eq!(moved, HistoryPath::new("/proj/new/sub/a.txt"));
        assert_eq!(moved.parent(), HistoryPath::new("/proj/new/sub"));
    }
}

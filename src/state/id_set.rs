use indexmap::IndexSet;

/// Append-only membership set of discovered identifiers
///
/// Tracks how many entries were present at the last save so unchanged sets
/// are not rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: IndexSet<String>,
    saved_len: usize,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from a loaded checkpoint; the result counts as saved
    pub fn from_saved<I: IntoIterator<Item = String>>(ids: I) -> Self {
        let ids: IndexSet<String> = ids.into_iter().collect();
        let saved_len = ids.len();
        Self { ids, saved_len }
    }

    /// Inserts an identifier, returning true if it was new
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Returns true if entries were added since the last save
    pub fn is_dirty(&self) -> bool {
        self.ids.len() != self.saved_len
    }

    pub fn mark_saved(&mut self) {
        self.saved_len = self.ids.len();
    }
}

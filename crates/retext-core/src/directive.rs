//! Find/replace directives
//!
//! A [`DirectiveSet`] is the canonical, validated list of edits applied to a
//! document. Duplicates by `original` are merged with the last one winning;
//! the position of the first occurrence is kept so report order stays stable.

use crate::error::DirectiveError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    original: String,
    replacement: String,
    #[serde(default)]
    case_sensitive: bool,
}

impl Directive {
    pub fn new(
        original: impl Into<String>,
        replacement: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<Self, DirectiveError> {
        let original = original.into();
        if original.is_empty() {
            return Err(DirectiveError::EmptyOriginal);
        }
        Ok(Self {
            original,
            replacement: replacement.into(),
            case_sensitive,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Length of `original` in characters, used for tie-breaking.
    pub fn char_len(&self) -> usize {
        self.original.chars().count()
    }
}

/// Fold a single character for case-insensitive comparison.
///
/// Multi-character lowercase expansions keep their first character so that
/// folded text stays aligned with the source positions.
pub fn fold_char(c: char, case_sensitive: bool) -> char {
    if case_sensitive {
        c
    } else {
        c.to_lowercase().next().unwrap_or(c)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirectiveSet {
    directives: Vec<Directive>,
    notes: Vec<String>,
}

impl DirectiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-constructed directives, merging duplicates.
    pub fn from_directives(directives: impl IntoIterator<Item = Directive>) -> Self {
        let mut set = Self::new();
        for directive in directives {
            set.push(directive);
        }
        set
    }

    /// Manual mode: a mapping of original to replacement sharing one case flag.
    /// Empty originals are dropped with a note.
    pub fn from_pairs<I, A, B>(pairs: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut set = Self::new();
        for (original, replacement) in pairs {
            match Directive::new(original, replacement, case_sensitive) {
                Ok(directive) => set.push(directive),
                Err(e) => set.notes.push(format!("Dropped directive: {}", e)),
            }
        }
        set
    }

    /// Insert a directive. A directive with the same `original` replaces the
    /// earlier one in place.
    pub fn push(&mut self, directive: Directive) {
        if let Some(existing) = self
            .directives
            .iter_mut()
            .find(|d| d.original == directive.original)
        {
            self.notes.push(format!(
                "Duplicate directive for '{}': '{}' replaced by '{}'",
                directive.original, existing.replacement, directive.replacement
            ));
            *existing = directive;
        } else {
            self.directives.push(directive);
        }
    }

    /// Keep the first `len` directives. Returns how many were dropped.
    pub fn truncate(&mut self, len: usize) -> usize {
        let dropped = self.directives.len().saturating_sub(len);
        self.directives.truncate(len);
        dropped
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn get(&self, index: usize) -> Option<&Directive> {
        self.directives.get(index)
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Indices in matching order: longest `original` first, ties by input order.
    pub fn resolution_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.directives.len()).collect();
        order.sort_by(|&a, &b| {
            self.directives[b]
                .char_len()
                .cmp(&self.directives[a].char_len())
                .then(a.cmp(&b))
        });
        order
    }
}

//! Deterministic listing order.
//!
//! Rules, in precedence order:
//!
//! 1. With `directories_first`, directories precede files. Direction never
//!    inverts this; it only orders within each group.
//! 2. The chosen criterion. Directories count as size 0 and an unknown size
//!    (`-1`) sorts as the largest value.
//! 3. Name, as the tie-breaker for every other criterion.
//!
//! Names split into alternating text and digit runs that compare pairwise:
//! digit runs by value (`track2` before `track10`), text runs by ICU
//! collation at primary strength, and a digit run before a text run. Names
//! equal under that key fall back to tertiary collation of the whole name
//! and finally code-point order. Every step is a total preorder applied to
//! every pair, so the chain is a total order.

use std::cmp::Ordering;
use std::fmt;

use icu_collator::options::{CollatorOptions, Strength};
use icu_collator::{Collator, CollatorBorrowed};
use icu_locale_core::Locale;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::OrderingConfig;
use crate::error::{FsError, FsResult};
use crate::handle::{FileHandle, FileRef};

/// What to sort by.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SortCriterion {
    #[default]
    Name,
    Size,
    Date,
    Extension,
    Permissions,
    Owner,
    Group,
}

/// Criterion, direction and directory policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub criterion: SortCriterion,
    pub ascending: bool,
    pub directories_first: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            criterion: SortCriterion::Name,
            ascending: true,
            directories_first: true,
        }
    }
}

impl SortSpec {
    pub fn by(criterion: SortCriterion) -> Self {
        Self {
            criterion,
            ..Self::default()
        }
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub fn directories_first(mut self, enabled: bool) -> Self {
        self.directories_first = enabled;
        self
    }
}

/// Comparator over file handles.
pub struct FileComparator {
    spec: SortSpec,
    tertiary: CollatorBorrowed<'static>,
    primary: CollatorBorrowed<'static>,
}

impl fmt::Debug for FileComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileComparator")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

fn collator(locale: &Locale, strength: Strength) -> FsResult<CollatorBorrowed<'static>> {
    let mut options = CollatorOptions::default();
    options.strength = Some(strength);
    Collator::try_new(locale.clone().into(), options)
        .map_err(|e| FsError::backend(format!("no collation data for {locale}: {e}")))
}

impl FileComparator {
    /// Comparator for a BCP-47 locale. An unparseable locale falls back to
    /// the root collation.
    pub fn new(spec: SortSpec, locale: &str) -> FsResult<Self> {
        let locale = locale.parse::<Locale>().unwrap_or_else(|e| {
            warn!(locale, error = %e, "invalid locale, using root collation");
            Locale::UNKNOWN
        });
        Ok(Self {
            spec,
            tertiary: collator(&locale, Strength::Tertiary)?,
            primary: collator(&locale, Strength::Primary)?,
        })
    }

    /// Comparator using the configured locale and directory policy.
    pub fn from_config(
        criterion: SortCriterion,
        ascending: bool,
        config: &OrderingConfig,
    ) -> FsResult<Self> {
        let spec = SortSpec {
            criterion,
            ascending,
            directories_first: config.directories_first,
        };
        Self::new(spec, &config.locale)
    }

    pub fn spec(&self) -> SortSpec {
        self.spec
    }

    pub fn compare(&self, a: &dyn FileHandle, b: &dyn FileHandle) -> Ordering {
        if self.spec.directories_first {
            match (a.is_directory(), b.is_directory()) {
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                _ => {}
            }
        }

        let ordering = self
            .compare_criterion(a, b)
            .then_with(|| self.compare_names(a.name(), b.name()));
        if self.spec.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }

    fn compare_criterion(&self, a: &dyn FileHandle, b: &dyn FileHandle) -> Ordering {
        match self.spec.criterion {
            SortCriterion::Name => Ordering::Equal,
            SortCriterion::Size => size_key(a).cmp(&size_key(b)),
            SortCriterion::Date => a.modified().cmp(&b.modified()),
            SortCriterion::Extension => match (a.extension(), b.extension()) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => self.compare_names(x, y),
            },
            SortCriterion::Permissions => a.permissions().cmp(&b.permissions()),
            SortCriterion::Owner => self.compare_optional(a.attr().owner, b.attr().owner),
            SortCriterion::Group => self.compare_optional(a.attr().group, b.attr().group),
        }
    }

    fn compare_optional(&self, a: Option<String>, b: Option<String>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => self.compare_names(&x, &y),
        }
    }

    /// Natural, locale-aware, total name order.
    pub fn compare_names(&self, a: &str, b: &str) -> Ordering {
        self.compare_runs(a, b)
            .then_with(|| self.tertiary.compare(a, b))
            .then_with(|| a.cmp(b))
    }

    fn compare_runs(&self, a: &str, b: &str) -> Ordering {
        let (mut left, mut right) = (runs(a), runs(b));
        loop {
            let ordering = match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(Run::Digits(x)), Some(Run::Digits(y))) => compare_digits(x, y),
                (Some(Run::Digits(_)), Some(Run::Text(_))) => Ordering::Less,
                (Some(Run::Text(_)), Some(Run::Digits(_))) => Ordering::Greater,
                (Some(Run::Text(x)), Some(Run::Text(y))) => self.primary.compare(x, y),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
    }

    /// Sort in place.
    pub fn sort(&self, handles: &mut [FileRef]) {
        handles.sort_by(|a, b| self.compare(a.as_ref(), b.as_ref()));
    }
}

/// Sort `handles` with a fresh comparator.
pub fn sort_handles(handles: &mut [FileRef], spec: SortSpec, locale: &str) -> FsResult<()> {
    FileComparator::new(spec, locale)?.sort(handles);
    Ok(())
}

/// Directories weigh nothing; unknown sizes weigh the most.
fn size_key(handle: &dyn FileHandle) -> i64 {
    if handle.is_directory() {
        return 0;
    }
    match handle.size() {
        size if size < 0 => i64::MAX,
        size => size,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run<'a> {
    Digits(&'a str),
    Text(&'a str),
}

/// Split at every ASCII digit boundary. ASCII bytes never sit inside a
/// multi-byte character, so each split is on a char boundary.
fn runs(name: &str) -> impl Iterator<Item = Run<'_>> {
    let mut rest = name;
    std::iter::from_fn(move || {
        let digits = rest.bytes().next()?.is_ascii_digit();
        let end = rest
            .bytes()
            .position(|c| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        rest = tail;
        Some(if digits { Run::Digits(run) } else { Run::Text(run) })
    })
}

/// Compare digit strings by value: strip leading zeros, then length, then
/// digit by digit.
fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

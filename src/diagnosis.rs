//! Grouping of ICD-9 diagnosis codes into broad medical categories.
//!
//! Each encounter carries up to three diagnosis codes (`diag_1`, `diag_2`, `diag_3`). Raw codes
//! are too fine grained to use as predictors directly, so we map each one onto one of 17
//! categories derived from the ICD-9 chapter structure, with `Other` as the catch-all.
//!
//! Codes look like `250.83`, `V27` or `E909`. A single leading `E` or `V` is stripped, and the
//! fractional part is discarded before lookup, so `250.83` is treated as `250` (diabetes).
use crate::{
    pipeline::{Issue, Stage},
    ArcStr, Range, Record, Value,
};
use once_cell::sync::Lazy;
use std::{fmt, str::FromStr};

/// The raw diagnosis fields, in the order their category fields are appended.
pub const DIAGNOSIS_FIELDS: [&str; 3] = ["diag_1", "diag_2", "diag_3"];

/// Suffix added to a diagnosis field name to make the name of its category field.
pub const CATEGORY_SUFFIX: &str = "_category";

/// Broad diagnosis groups.
///
/// Ordering is arbitrary.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum DiagnosisCategory {
    Infectious,
    Neoplasms,
    Diabetes,
    EndocrineMetabolic,
    Blood,
    Mental,
    Nervous,
    Circulatory,
    Respiratory,
    Digestive,
    Genitourinary,
    Pregnancy,
    Skin,
    Musculoskeletal,
    Congenital,
    Injury,
    Other,
}

impl DiagnosisCategory {
    pub const ALL: [DiagnosisCategory; 17] = [
        DiagnosisCategory::Infectious,
        DiagnosisCategory::Neoplasms,
        DiagnosisCategory::Diabetes,
        DiagnosisCategory::EndocrineMetabolic,
        DiagnosisCategory::Blood,
        DiagnosisCategory::Mental,
        DiagnosisCategory::Nervous,
        DiagnosisCategory::Circulatory,
        DiagnosisCategory::Respiratory,
        DiagnosisCategory::Digestive,
        DiagnosisCategory::Genitourinary,
        DiagnosisCategory::Pregnancy,
        DiagnosisCategory::Skin,
        DiagnosisCategory::Musculoskeletal,
        DiagnosisCategory::Congenital,
        DiagnosisCategory::Injury,
        DiagnosisCategory::Other,
    ];

    /// The label used for the category in derived fields (and so in indicator names).
    pub fn label(self) -> &'static str {
        use DiagnosisCategory::*;
        match self {
            Infectious => "Infectious",
            Neoplasms => "Neoplasms",
            Diabetes => "Diabetes",
            EndocrineMetabolic => "Endocrine/Metabolic",
            Blood => "Blood",
            Mental => "Mental",
            Nervous => "Nervous",
            Circulatory => "Circulatory",
            Respiratory => "Respiratory",
            Digestive => "Digestive",
            Genitourinary => "Genitourinary",
            Pregnancy => "Pregnancy",
            Skin => "Skin",
            Musculoskeletal => "Musculoskeletal",
            Congenital => "Congenital",
            Injury => "Injury",
            Other => "Other",
        }
    }
}

impl fmt::Display for DiagnosisCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DiagnosisCategory {
    type Err = anyhow::Error;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        DiagnosisCategory::ALL
            .into_iter()
            .find(|cat| cat.label() == input.trim())
            .ok_or_else(|| anyhow::format_err!("unrecognised diagnosis category \"{}\"", input))
    }
}

/// Inclusive code span helper, so the table below reads like the ICD-9 chapter list.
fn codes(from: i32, to: i32) -> Range<i32> {
    Range::new(from, Some(to + 1))
}

fn code(code: i32) -> Range<i32> {
    codes(code, code)
}

/// Disjoint code intervals, sorted by start so we can binary search.
pub struct CodeRangeTable {
    ranges: Vec<(Range<i32>, DiagnosisCategory)>,
}

impl CodeRangeTable {
    /// The ICD-9 chapter grouping.
    ///
    /// The symptom chapter (780-799) is split between `Infectious`, the organ system categories
    /// and `Other`.
    pub fn icd9() -> Self {
        use DiagnosisCategory::*;
        Self::new(vec![
            (codes(1, 139), Infectious),
            (codes(780, 782), Infectious),
            (code(784), Infectious),
            (codes(790, 791), Infectious),
            (codes(793, 796), Infectious),
            (codes(798, 799), Infectious),
            (codes(140, 239), Neoplasms),
            (code(250), Diabetes),
            (codes(240, 249), EndocrineMetabolic),
            (codes(251, 279), EndocrineMetabolic),
            (codes(280, 289), Blood),
            (codes(290, 319), Mental),
            (codes(320, 389), Nervous),
            (codes(390, 459), Circulatory),
            (code(785), Circulatory),
            (codes(460, 519), Respiratory),
            (code(786), Respiratory),
            (codes(520, 579), Digestive),
            (code(787), Digestive),
            (codes(580, 629), Genitourinary),
            (code(788), Genitourinary),
            (codes(630, 679), Pregnancy),
            (codes(680, 709), Skin),
            (codes(710, 739), Musculoskeletal),
            (codes(740, 759), Congenital),
            (codes(800, 999), Injury),
            (codes(760, 779), Other),
            (code(783), Other),
            (code(789), Other),
            (code(792), Other),
            (code(797), Other),
        ])
    }

    /// # Panics
    ///
    /// Panics if any two ranges overlap, since then lookup would depend on table order.
    pub fn new(mut ranges: Vec<(Range<i32>, DiagnosisCategory)>) -> Self {
        ranges.sort_by_key(|(range, _)| *range.start());
        for pair in ranges.windows(2) {
            if pair[0].0.overlaps(&pair[1].0) {
                panic!(
                    "code ranges {} ({}) and {} ({}) overlap",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                );
            }
        }
        Self { ranges }
    }

    /// Find the category containing `code`, if any range does.
    pub fn lookup(&self, code: i32) -> Option<DiagnosisCategory> {
        // index of the first range starting after `code`; the candidate is the one before it.
        let idx = self
            .ranges
            .partition_point(|(range, _)| *range.start() <= code);
        let (range, category) = self.ranges.get(idx.checked_sub(1)?)?;
        range.contains(&code).then(|| *category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Range<i32>, DiagnosisCategory)> + '_ {
        self.ranges.iter().map(|(range, cat)| (range, *cat))
    }
}

static ICD9_TABLE: Lazy<CodeRangeTable> = Lazy::new(CodeRangeTable::icd9);

/// Why a code fell back to `Other` without being matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unmatched {
    /// Not an optionally-prefixed integer.
    Unparseable,
    /// A valid integer that no range contains.
    Unmapped(i32),
}

/// Parse a raw code into the integer used for lookup.
///
/// Strips one leading `E` or `V`, then truncates any fractional part. Returns `None` if what is
/// left isn't an integer made of ASCII digits with an optional `-`. Integers too large for an
/// `i32` saturate, so they are never in a range.
pub fn parse_code(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let digits = raw
        .strip_prefix('E')
        .or_else(|| raw.strip_prefix('V'))
        .unwrap_or(raw);
    let (whole, frac) = match digits.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (digits, ""),
    };
    let (negative, whole) = match whole.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, whole),
    };
    if whole.is_empty()
        || !whole.chars().all(|ch| ch.is_ascii_digit())
        || !frac.chars().all(|ch| ch.is_ascii_digit())
    {
        return None;
    }
    // only overflow can fail here.
    let magnitude: i64 = whole.parse().unwrap_or(i64::MAX);
    let code = if negative { -magnitude } else { magnitude };
    Some(code.clamp(i32::MIN.into(), i32::MAX.into()) as i32)
}

/// Classify a single diagnosis value.
///
/// Never fails: missing, unparseable and unmapped codes all give `Other`. Use
/// [`classify_value`] to find out why a code fell back.
pub fn classify(value: &Value) -> DiagnosisCategory {
    classify_value(value).unwrap_or(DiagnosisCategory::Other)
}

/// Like [`classify`], but reports unparseable or unmapped codes.
///
/// A missing value is not an error: it is `Ok(Other)`.
pub fn classify_value(value: &Value) -> Result<DiagnosisCategory, Unmatched> {
    let code = match value {
        Value::Missing => return Ok(DiagnosisCategory::Other),
        Value::Text(raw) => parse_code(raw).ok_or(Unmatched::Unparseable)?,
        // numeric columns just need truncating. `as` saturates.
        Value::Numeric(v) => v.raw().trunc() as i32,
    };
    ICD9_TABLE.lookup(code).ok_or(Unmatched::Unmapped(code))
}

/// Replaces `diag_1`, `diag_2` and `diag_3` with `diag_1_category` etc.
#[derive(Debug, Clone, Default)]
pub struct DiagnosisCodeClassifier;

impl Stage for DiagnosisCodeClassifier {
    fn name(&self) -> &'static str {
        "diagnosis categories"
    }

    fn apply(&self, record: &mut Record, issues: &mut Vec<Issue>) {
        for field in DIAGNOSIS_FIELDS {
            let Some(value) = record.remove(field) else {
                continue;
            };
            let category = match classify_value(&value) {
                Ok(category) => category,
                Err(Unmatched::Unparseable) => {
                    issues.push(Issue::UnparseableCode {
                        field: field.into(),
                        code: ArcStr::from(value.to_string()),
                    });
                    DiagnosisCategory::Other
                }
                Err(Unmatched::Unmapped(code)) => {
                    issues.push(Issue::UnmappedCode {
                        field: field.into(),
                        code,
                    });
                    DiagnosisCategory::Other
                }
            };
            record.set(
                &format!("{}{}", field, CATEGORY_SUFFIX),
                Value::text(category.label()),
            );
        }
    }
}

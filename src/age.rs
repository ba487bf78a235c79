use crate::{
    pipeline::{Issue, Stage},
    Record, Value,
};
use noisy_float::prelude::*;

/// Age is recorded in ten-year brackets. Each bracket maps to its midpoint.
pub const AGE_BRACKETS: [(&str, u8); 10] = [
    ("[0-10)", 5),
    ("[10-20)", 15),
    ("[20-30)", 25),
    ("[30-40)", 35),
    ("[40-50)", 45),
    ("[50-60)", 55),
    ("[60-70)", 65),
    ("[70-80)", 75),
    ("[80-90)", 85),
    ("[90-100)", 95),
];

pub const AGE_FIELD: &str = "age";

/// The midpoint of an age bracket, or `None` for a label we don't know.
pub fn bracket_midpoint(label: &str) -> Option<u8> {
    let label = label.trim();
    AGE_BRACKETS
        .iter()
        .find(|(bracket, _)| *bracket == label)
        .map(|(_, mid)| *mid)
}

/// Replaces the `age` bracket label with its midpoint.
///
/// Values that are already numeric are left alone, so running the stage twice is harmless.
#[derive(Debug, Clone, Default)]
pub struct AgeBinMapper;

impl Stage for AgeBinMapper {
    fn name(&self) -> &'static str {
        "age brackets"
    }

    fn apply(&self, record: &mut Record, issues: &mut Vec<Issue>) {
        let Some(slot) = record.get_mut(AGE_FIELD) else {
            return;
        };
        let Value::Text(label) = &*slot else {
            return;
        };
        let mapped = match bracket_midpoint(label) {
            Some(mid) => Value::Numeric(r64(mid as f64)),
            None => {
                issues.push(Issue::UnmappedBracket {
                    label: label.clone(),
                });
                Value::Missing
            }
        };
        *slot = mapped;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeSet;

    fn map(label: &str) -> (Value, Vec<Issue>) {
        let mut record: Record = [(AGE_FIELD, Value::text(label))].into_iter().collect();
        let mut issues = vec![];
        AgeBinMapper.apply(&mut record, &mut issues);
        (record.get(AGE_FIELD).cloned().unwrap(), issues)
    }

    #[test]
    fn known_brackets() {
        assert_eq!(map("[50-60)").0, Value::num(55.));
        assert_eq!(map("[0-10)").0, Value::num(5.));
        assert_eq!(map("[90-100)").0, Value::num(95.));
    }

    #[test]
    fn bijection() {
        let mids: BTreeSet<_> = AGE_BRACKETS.iter().map(|(_, mid)| *mid).collect();
        let labels: BTreeSet<_> = AGE_BRACKETS.iter().map(|(label, _)| *label).collect();
        assert_eq!(mids.len(), 10);
        assert_eq!(labels.len(), 10);
        for (label, mid) in AGE_BRACKETS {
            assert_eq!(bracket_midpoint(label), Some(mid));
        }
    }

    #[test]
    fn unknown_bracket_is_missing() {
        let (value, issues) = map("[100-110)");
        assert_eq!(value, Value::Missing);
        assert_eq!(
            issues,
            vec![Issue::UnmappedBracket {
                label: "[100-110)".into()
            }]
        );
    }

    #[test]
    fn numeric_and_missing_untouched() {
        for value in [Value::num(55.), Value::Missing] {
            let mut record: Record = [(AGE_FIELD, value.clone())].into_iter().collect();
            let mut issues = vec![];
            AgeBinMapper.apply(&mut record, &mut issues);
            assert_eq!(record.get(AGE_FIELD), Some(&value));
            assert!(issues.is_empty());
        }
    }
}

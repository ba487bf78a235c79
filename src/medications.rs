use crate::{
    pipeline::{Issue, Stage},
    Record, Value,
};

/// The diabetes medication fields. Each holds `No`, `Steady`, `Up` or `Down`.
pub const MEDICATIONS: [&str; 21] = [
    "metformin",
    "repaglinide",
    "nateglinide",
    "chlorpropamide",
    "glimepiride",
    "acetohexamide",
    "glipizide",
    "glyburide",
    "tolbutamide",
    "pioglitazone",
    "rosiglitazone",
    "acarbose",
    "miglitol",
    "troglitazone",
    "tolazamide",
    "insulin",
    "glyburide-metformin",
    "glipizide-metformin",
    "glimepiride-pioglitazone",
    "metformin-rosiglitazone",
    "metformin-pioglitazone",
];

pub const MED_CHANGES_FIELD: &str = "num_med_changes";

/// Count the medications whose dosage went up or down during the encounter.
///
/// Returns `None` if the record has none of the medication fields.
pub fn count_med_changes(record: &Record) -> Option<usize> {
    let mut present = false;
    let mut changes = 0;
    for med in MEDICATIONS {
        let Some(value) = record.get(med) else {
            continue;
        };
        present = true;
        if matches!(value.as_text(), Some("Up" | "Down")) {
            changes += 1;
        }
    }
    present.then(|| changes)
}

/// Adds `num_med_changes`. The medication fields themselves are kept for encoding.
#[derive(Debug, Clone, Default)]
pub struct MedicationChangeCounter;

impl Stage for MedicationChangeCounter {
    fn name(&self) -> &'static str {
        "medication changes"
    }

    fn apply(&self, record: &mut Record, _issues: &mut Vec<Issue>) {
        if let Some(changes) = count_med_changes(record) {
            record.set(MED_CHANGES_FIELD, Value::num(changes as f64));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(changed: &[(&str, &str)]) -> Record {
        MEDICATIONS
            .iter()
            .map(|med| {
                let value = changed
                    .iter()
                    .find(|(name, _)| name == med)
                    .map(|(_, v)| *v)
                    .unwrap_or("No");
                (*med, Value::text(value))
            })
            .collect()
    }

    #[test]
    fn counts_up_and_down() {
        let rec = record(&[
            ("insulin", "Up"),
            ("metformin", "Steady"),
            ("glipizide", "Down"),
        ]);
        assert_eq!(count_med_changes(&rec), Some(2));
    }

    #[test]
    fn other_values_do_not_count() {
        let mut rec = record(&[("insulin", "up"), ("acarbose", "Upward")]);
        rec.set("glyburide", Value::Missing);
        rec.set("miglitol", Value::num(1.));
        assert_eq!(count_med_changes(&rec), Some(0));
    }

    #[test]
    fn all_changed() {
        let changed: Vec<_> = MEDICATIONS.iter().map(|med| (*med, "Down")).collect();
        assert_eq!(count_med_changes(&record(&changed)), Some(21));
    }

    #[test]
    fn stage_keeps_medication_fields() {
        let mut rec = record(&[("insulin", "Up")]);
        let mut issues = vec![];
        MedicationChangeCounter.apply(&mut rec, &mut issues);
        assert_eq!(rec.len(), 22);
        assert_eq!(rec.get("insulin"), Some(&Value::text("Up")));
        assert_eq!(rec.get(MED_CHANGES_FIELD), Some(&Value::num(1.)));

        // rerunning replaces rather than duplicating.
        MedicationChangeCounter.apply(&mut rec, &mut issues);
        assert_eq!(rec.len(), 22);
    }

    #[test]
    fn noop_without_medication_fields() {
        let mut rec: Record = [("age", Value::num(55.))].into_iter().collect();
        MedicationChangeCounter.apply(&mut rec, &mut vec![]);
        assert!(!rec.contains(MED_CHANGES_FIELD));
    }
}

use crate::{
    config::MissingPolicy,
    pipeline::{Issue, Stage},
    ArcStr, Record, Value,
};

/// Prior-year visit counters, summed into `service_utilization`.
pub const UTILIZATION_COUNTERS: [&str; 3] =
    ["number_outpatient", "number_emergency", "number_inpatient"];

pub const UTILIZATION_FIELD: &str = "service_utilization";

/// Adds `service_utilization`, the total number of outpatient, emergency and inpatient visits.
///
/// A counter is missing if the field is absent, missing or not a number. How that is handled
/// depends on the policy, but it is always reported.
#[derive(Debug, Clone, Default)]
pub struct ServiceUtilizationAggregator {
    pub policy: MissingPolicy,
}

impl ServiceUtilizationAggregator {
    pub fn new(policy: MissingPolicy) -> Self {
        Self { policy }
    }

    /// The sum for one record, plus the names of any counters that were missing.
    ///
    /// Returns `None` if the record has none of the counter fields at all. A sum that overflows
    /// to infinity is missing, and flagged with `overflow`.
    pub fn aggregate(&self, record: &Record) -> Option<Utilization> {
        if !UTILIZATION_COUNTERS.iter().any(|name| record.contains(name)) {
            return None;
        }
        let mut total = 0f64;
        let mut missing = vec![];
        for name in UTILIZATION_COUNTERS {
            match record.get(name).and_then(Value::as_numeric) {
                Some(count) => total += count.raw(),
                None => missing.push(ArcStr::from(name)),
            }
        }
        let overflow = !total.is_finite();
        let value = match (self.policy, missing.is_empty()) {
            (_, true) | (MissingPolicy::Zero, false) => Value::num(total),
            (MissingPolicy::Propagate | MissingPolicy::Reject, false) => Value::Missing,
        };
        Some(Utilization {
            value,
            missing,
            overflow,
        })
    }
}

/// The outcome of summing one record's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Utilization {
    pub value: Value,
    pub missing: Vec<ArcStr>,
    pub overflow: bool,
}

impl Stage for ServiceUtilizationAggregator {
    fn name(&self) -> &'static str {
        "service utilization"
    }

    fn apply(&self, record: &mut Record, issues: &mut Vec<Issue>) {
        let Some(Utilization {
            value,
            missing,
            overflow,
        }) = self.aggregate(record)
        else {
            return;
        };
        if !missing.is_empty() {
            issues.push(Issue::MissingRequiredNumeric { fields: missing });
        }
        if overflow {
            issues.push(Issue::UtilizationOverflow);
        }
        record.set(UTILIZATION_FIELD, value);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(outpatient: Value, emergency: Value, inpatient: Value) -> Record {
        [
            ("number_outpatient", outpatient),
            ("number_emergency", emergency),
            ("number_inpatient", inpatient),
        ]
        .into_iter()
        .collect()
    }

    fn run(policy: MissingPolicy, mut rec: Record) -> (Option<Value>, Vec<Issue>) {
        let mut issues = vec![];
        ServiceUtilizationAggregator::new(policy).apply(&mut rec, &mut issues);
        (rec.get(UTILIZATION_FIELD).cloned(), issues)
    }

    #[test]
    fn sums_counters() {
        let rec = record(Value::num(2.), Value::num(1.), Value::num(0.));
        let (value, issues) = run(MissingPolicy::Propagate, rec);
        assert_eq!(value, Some(Value::num(3.)));
        assert!(issues.is_empty());
    }

    #[test]
    fn never_negative() {
        for (a, b, c) in [(0., 0., 0.), (5., 0., 12.), (1., 1., 1.)] {
            let rec = record(Value::num(a), Value::num(b), Value::num(c));
            let (value, _) = run(MissingPolicy::Propagate, rec);
            let total = value.and_then(|v| v.as_numeric()).unwrap();
            assert!(total >= 0.);
        }
    }

    #[test]
    fn missing_propagates() {
        let rec = record(Value::num(2.), Value::Missing, Value::num(1.));
        let (value, issues) = run(MissingPolicy::Propagate, rec);
        assert_eq!(value, Some(Value::Missing));
        assert_eq!(
            issues,
            vec![Issue::MissingRequiredNumeric {
                fields: vec!["number_emergency".into()]
            }]
        );
    }

    #[test]
    fn missing_imputed_as_zero() {
        let rec = record(Value::num(2.), Value::text("lots"), Value::num(1.));
        let (value, issues) = run(MissingPolicy::Zero, rec);
        assert_eq!(value, Some(Value::num(3.)));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn absent_counter_is_missing() {
        let mut rec = record(Value::num(2.), Value::num(1.), Value::num(1.));
        rec.remove("number_inpatient");
        let (value, issues) = run(MissingPolicy::Reject, rec);
        assert_eq!(value, Some(Value::Missing));
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn overflowing_sum_is_missing() {
        let rec = record(Value::num(1e308), Value::num(1e308), Value::num(0.));
        let (value, issues) = run(MissingPolicy::Propagate, rec);
        assert_eq!(value, Some(Value::Missing));
        assert_eq!(issues, vec![Issue::UtilizationOverflow]);

        let rec = record(Value::num(1e308), Value::Missing, Value::num(1e308));
        let (value, issues) = run(MissingPolicy::Zero, rec);
        assert_eq!(value, Some(Value::Missing));
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[1], Issue::UtilizationOverflow);
    }

    #[test]
    fn noop_without_counters() {
        let rec: Record = [("age", Value::num(55.))].into_iter().collect();
        let (value, issues) = run(MissingPolicy::Propagate, rec);
        assert_eq!(value, None);
        assert!(issues.is_empty());
    }
}

use super::trend;
use crate::models::{
    Condition, ConditionSet, HistoricalSeries, Logic, SensorCondition, SensorField,
    SensorSnapshot, TrendDirection,
};
use std::collections::BTreeMap;

/// True when every entry of `conditions` holds. An empty set always holds.
///
/// Missing data never satisfies a condition: an absent snapshot field, an
/// unreported soil channel or a trend without enough history all fail.
/// `soil_channels` falls back to the snapshot's own channel map.
pub fn evaluate(
    conditions: &ConditionSet,
    snapshot: &SensorSnapshot,
    soil_channels: Option<&BTreeMap<u8, f64>>,
    history: Option<&HistoricalSeries>,
) -> bool {
    let channels = soil_channels.or(snapshot.soil_channels.as_ref());

    conditions
        .entries()
        .iter()
        .all(|(field, condition)| match condition {
            Condition::Threshold { operator, value } => snapshot
                .value(*field)
                .is_some_and(|actual| operator.compare(actual, *value)),
            Condition::Trend(direction) => trend_holds(*field, *direction, history),
            Condition::MultiSensor { sensors, logic } => {
                multi_sensor_holds(sensors, *logic, channels)
            }
        })
}

fn trend_holds(
    field: SensorField,
    direction: TrendDirection,
    history: Option<&HistoricalSeries>,
) -> bool {
    let Some(history) = history else {
        return false;
    };
    match trend::slope(history.samples(field)) {
        Some(s) => match direction {
            TrendDirection::Increasing => s > 0.0,
            TrendDirection::Decreasing => s < 0.0,
        },
        None => false,
    }
}

fn multi_sensor_holds(
    sensors: &[SensorCondition],
    logic: Logic,
    channels: Option<&BTreeMap<u8, f64>>,
) -> bool {
    if sensors.is_empty() {
        return false;
    }

    let matches = |sensor: &SensorCondition| {
        channels
            .and_then(|c| c.get(&sensor.channel))
            .is_some_and(|actual| sensor.operator.compare(*actual, sensor.value))
    };

    match logic {
        Logic::And => sensors.iter().all(matches),
        Logic::Or => sensors.iter().any(matches),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComparisonOp, Sample};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()
    }

    fn snapshot() -> SensorSnapshot {
        let mut s = SensorSnapshot::new(now());
        s.rain_24h = Some(0.6);
        s.soil_moisture = Some(45.0);
        s.temperature = Some(88.0);
        s
    }

    fn set(entries: Vec<(SensorField, Condition)>) -> ConditionSet {
        ConditionSet::new(entries).unwrap()
    }

    fn sensor(channel: u8, operator: ComparisonOp, value: f64) -> SensorCondition {
        SensorCondition {
            channel,
            operator,
            value,
        }
    }

    fn channels(values: &[(u8, f64)]) -> BTreeMap<u8, f64> {
        values.iter().copied().collect()
    }

    #[test]
    fn empty_set_holds() {
        assert!(evaluate(&set(vec![]), &snapshot(), None, None));
    }

    #[test]
    fn threshold_against_snapshot() {
        let rain = set(vec![(
            SensorField::Rain24h,
            Condition::threshold(ComparisonOp::Gte, 0.5),
        )]);
        assert!(evaluate(&rain, &snapshot(), None, None));

        let dry = set(vec![(
            SensorField::Rain24h,
            Condition::threshold(ComparisonOp::Lt, 0.5),
        )]);
        assert!(!evaluate(&dry, &snapshot(), None, None));
    }

    #[test]
    fn missing_field_fails_closed() {
        let humid = set(vec![(
            SensorField::Humidity,
            Condition::threshold(ComparisonOp::Gte, 0.0),
        )]);
        assert!(!evaluate(&humid, &snapshot(), None, None));

        let not_humid = set(vec![(
            SensorField::Humidity,
            Condition::threshold(ComparisonOp::Lt, 1000.0),
        )]);
        assert!(!evaluate(&not_humid, &snapshot(), None, None));
    }

    #[test]
    fn any_failing_entry_fails_regardless_of_order() {
        let pass = (
            SensorField::Rain24h,
            Condition::threshold(ComparisonOp::Gte, 0.5),
        );
        let fail = (
            SensorField::Temperature,
            Condition::threshold(ComparisonOp::Lt, 50.0),
        );
        let also_pass = (
            SensorField::SoilMoisture,
            Condition::threshold(ComparisonOp::Gt, 40.0),
        );

        for entries in [
            vec![pass.clone(), fail.clone(), also_pass.clone()],
            vec![fail.clone(), pass.clone(), also_pass.clone()],
            vec![pass.clone(), also_pass.clone(), fail.clone()],
        ] {
            assert!(!evaluate(&set(entries), &snapshot(), None, None));
        }
        assert!(evaluate(&set(vec![pass, also_pass]), &snapshot(), None, None));
    }

    #[test]
    fn trend_uses_history_slope() {
        let mut history = HistoricalSeries::new();
        for h in 0..4 {
            history.push(
                SensorField::Pressure,
                Sample::new(now() - Duration::hours(4 - h), 1012.0 - h as f64),
            );
        }

        let falling = set(vec![(
            SensorField::Pressure,
            Condition::Trend(TrendDirection::Decreasing),
        )]);
        let rising = set(vec![(
            SensorField::Pressure,
            Condition::Trend(TrendDirection::Increasing),
        )]);

        assert!(evaluate(&falling, &snapshot(), None, Some(&history)));
        assert!(!evaluate(&rising, &snapshot(), None, Some(&history)));
    }

    #[test]
    fn trend_without_enough_history_fails() {
        let rising = set(vec![(
            SensorField::Temperature,
            Condition::Trend(TrendDirection::Increasing),
        )]);
        assert!(!evaluate(&rising, &snapshot(), None, None));

        let mut history = HistoricalSeries::new();
        history.push(SensorField::Temperature, Sample::new(now(), 80.0));
        assert!(!evaluate(&rising, &snapshot(), None, Some(&history)));
    }

    #[test]
    fn flat_trend_is_neither_direction() {
        let mut history = HistoricalSeries::new();
        history.push(SensorField::Humidity, Sample::new(now() - Duration::hours(1), 40.0));
        history.push(SensorField::Humidity, Sample::new(now(), 40.0));

        for direction in [TrendDirection::Increasing, TrendDirection::Decreasing] {
            let cond = set(vec![(SensorField::Humidity, Condition::Trend(direction))]);
            assert!(!evaluate(&cond, &snapshot(), None, Some(&history)));
        }
    }

    #[test]
    fn multi_sensor_or_and_and() {
        let probes = channels(&[(1, 35.0), (2, 18.0), (3, 40.0)]);
        let sensors = vec![
            sensor(1, ComparisonOp::Lt, 20.0),
            sensor(2, ComparisonOp::Lt, 20.0),
            sensor(3, ComparisonOp::Lt, 20.0),
        ];

        let or = set(vec![(
            SensorField::SoilMoisture,
            Condition::MultiSensor {
                sensors: sensors.clone(),
                logic: Logic::Or,
            },
        )]);
        let and = set(vec![(
            SensorField::SoilMoisture,
            Condition::MultiSensor {
                sensors,
                logic: Logic::default(),
            },
        )]);

        assert!(evaluate(&or, &snapshot(), Some(&probes), None));
        assert!(!evaluate(&and, &snapshot(), Some(&probes), None));
    }

    #[test]
    fn missing_channel_never_matches() {
        let probes = channels(&[(1, 10.0)]);
        let cond = set(vec![(
            SensorField::SoilMoisture,
            Condition::MultiSensor {
                sensors: vec![
                    sensor(1, ComparisonOp::Lt, 20.0),
                    sensor(4, ComparisonOp::Lt, 20.0),
                ],
                logic: Logic::And,
            },
        )]);
        assert!(!evaluate(&cond, &snapshot(), Some(&probes), None));
        assert!(!evaluate(&cond, &snapshot(), None, None));
    }

    #[test]
    fn empty_sensor_list_fails() {
        let cond = set(vec![(
            SensorField::SoilMoisture,
            Condition::MultiSensor {
                sensors: vec![],
                logic: Logic::Or,
            },
        )]);
        assert!(!evaluate(&cond, &snapshot(), Some(&channels(&[(1, 1.0)])), None));
    }

    #[test]
    fn snapshot_channels_used_when_none_passed() {
        let mut snap = snapshot();
        snap.soil_channels = Some(channels(&[(2, 12.0)]));
        let cond = set(vec![(
            SensorField::SoilMoisture,
            Condition::MultiSensor {
                sensors: vec![sensor(2, ComparisonOp::Lte, 12.0)],
                logic: Logic::And,
            },
        )]);
        assert!(evaluate(&cond, &snap, None, None));
    }

    #[test]
    fn plain_soil_condition_uses_aggregate() {
        let cond = set(vec![(
            SensorField::SoilMoisture,
            Condition::threshold(ComparisonOp::Eq, 45.0),
        )]);
        assert!(evaluate(&cond, &snapshot(), Some(&channels(&[(1, 10.0)])), None));
    }
}

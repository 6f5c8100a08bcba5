//! Structured events ("insights") sent to the daemon with `PUTINSIGHT`.
//!
//! ```json
//! {"metadata": {"name": "...", "timestamp": 1700000000000, "tags": {},
//!   "insightType": "EVENT"}, "data": null}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CLIENT_STARTED: &str = "dse.insights.event.insights_client_started";

const RPC_CALL_PREFIX: &str = "CALL InsightsRpc.reportInsight(";

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("insight name is required")]
    MissingName,
    #[error("invalid insight json")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightType {
    #[default]
    Event,
    Gauge,
    Counter,
    Histogram,
    Timer,
    Meter,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightMetadata {
    pub name: String,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub insight_type: InsightType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_mapping_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub metadata: InsightMetadata,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Insight {
    /// Event insight stamped with the current time.
    pub fn event(name: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            metadata: InsightMetadata {
                name: name.into(),
                timestamp: now_millis(),
                tags: BTreeMap::new(),
                insight_type: InsightType::Event,
                insight_mapping_id: None,
            },
            data,
        }
    }

    pub fn client_started() -> Self {
        Self::event(CLIENT_STARTED, None)
    }

    /// Metric insight carrying one of the `*Data` payloads of this module.
    pub fn metric<T: Serialize>(
        name: impl Into<String>,
        insight_type: InsightType,
        tags: BTreeMap<String, String>,
        data: &T,
    ) -> Result<Self, InsightError> {
        Ok(Self {
            metadata: InsightMetadata {
                name: name.into(),
                timestamp: now_millis(),
                tags,
                insight_type,
                insight_mapping_id: None,
            },
            data: Some(serde_json::to_value(data)?),
        })
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    /// Parses an insight received from a producer. Missing or non positive timestamps
    /// are replaced with the current time.
    pub fn from_json(json: &str) -> Result<Self, InsightError> {
        let mut insight: Insight = serde_json::from_str(json)?;
        if insight.metadata.name.is_empty() {
            return Err(InsightError::MissingName);
        }
        if insight.metadata.timestamp <= 0 {
            insight.metadata.timestamp = now_millis();
        }
        Ok(insight)
    }

    /// Extracts the insight passed to `CALL InsightsRpc.reportInsight('<json>')`.
    ///
    /// Returns `None` when `query` is not such a call.
    pub fn from_rpc_call(query: &str) -> Option<Result<Self, InsightError>> {
        let start = query.find(RPC_CALL_PREFIX)? + RPC_CALL_PREFIX.len();
        let end = query.rfind(')')?;
        let argument = query.get(start..end)?.trim();
        let json = argument
            .strip_prefix('\'')
            .and_then(|argument| argument.strip_suffix('\''))
            .unwrap_or(argument);
        Some(Self::from_json(json))
    }

    pub fn to_json(&self) -> Result<String, InsightError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingStats {
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub median: f64,
    pub p75: f64,
    pub p95: f64,
    pub p98: f64,
    pub p99: f64,
    pub p999: f64,
    #[serde(rename = "std_dev")]
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    #[serde(rename = "m1Rate")]
    pub m1_rate: f64,
    #[serde(rename = "m5Rate")]
    pub m5_rate: f64,
    #[serde(rename = "m15Rate")]
    pub m15_rate: f64,
    #[serde(rename = "meanRate")]
    pub mean_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramData {
    pub count: u64,
    pub sampling_stats: SamplingStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterData {
    pub count: u64,
    pub rate_stats: RateStats,
    pub rate_unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerData {
    pub count: u64,
    pub sampling_stats: SamplingStats,
    pub rate_stats: RateStats,
    pub rate_unit: String,
    pub duration_unit: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_expected_shape() {
        let mut insight = Insight::event("dse.insights.event.flush", Some(json!({"rows": 3})));
        insight.metadata.timestamp = 1_600_000_000_000;
        insight
            .metadata
            .tags
            .insert("host".to_string(), "10.0.0.1".to_string());

        let value: serde_json::Value = serde_json::from_str(&insight.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "metadata": {
                    "name": "dse.insights.event.flush",
                    "timestamp": 1_600_000_000_000i64,
                    "tags": {"host": "10.0.0.1"},
                    "insightType": "EVENT"
                },
                "data": {"rows": 3}
            })
        );
    }

    #[test]
    fn client_started_has_null_data() {
        let json = Insight::client_started().to_json().unwrap();
        assert!(json.contains(r#""name":"dse.insights.event.insights_client_started""#));
        assert!(json.contains(r#""data":null"#));
        assert!(!json.contains("insightMappingId"));
    }

    #[test]
    fn parse_fills_missing_timestamp() {
        let insight = Insight::from_json(
            r#"{"metadata":{"name":"custom","insightType":"LOG","insightMappingId":"v1"},"data":null}"#,
        )
        .unwrap();
        assert!(insight.metadata.timestamp > 0);
        assert_eq!(insight.metadata.insight_type, InsightType::Log);
        assert_eq!(insight.metadata.insight_mapping_id.as_deref(), Some("v1"));
        assert_eq!(insight.data, None);
    }

    #[test]
    fn parse_rejects_empty_name() {
        let err = Insight::from_json(r#"{"metadata":{"name":""}}"#).unwrap_err();
        assert!(matches!(err, InsightError::MissingName));
        assert!(matches!(
            Insight::from_json("not json"),
            Err(InsightError::Json(_))
        ));
    }

    #[test]
    fn extracts_insight_from_rpc_call() {
        let query = r#"CALL InsightsRpc.reportInsight('{"metadata":{"name":"n","timestamp":5},"data":{}}')"#;
        let insight = Insight::from_rpc_call(query).unwrap().unwrap();
        assert_eq!(insight.metadata.name, "n");
        assert_eq!(insight.metadata.timestamp, 5);

        assert!(Insight::from_rpc_call("SELECT * FROM system.local").is_none());
    }

    #[test]
    fn timer_data_field_names() {
        let data = TimerData {
            count: 1,
            sampling_stats: SamplingStats {
                min: 1,
                max: 2,
                mean: 1.5,
                median: 1.0,
                p75: 2.0,
                p95: 2.0,
                p98: 2.0,
                p99: 2.0,
                p999: 2.0,
                std_dev: 0.5,
            },
            rate_stats: RateStats {
                m1_rate: 0.1,
                m5_rate: 0.2,
                m15_rate: 0.3,
                mean_rate: 0.4,
            },
            rate_unit: "SECONDS".to_string(),
            duration_unit: "MICROSECONDS".to_string(),
        };
        let insight = Insight::metric("t", InsightType::Timer, BTreeMap::new(), &data).unwrap();
        let value = insight.data.unwrap();
        assert_eq!(value["samplingStats"]["std_dev"], json!(0.5));
        assert_eq!(value["rateStats"]["m15Rate"], json!(0.3));
        assert_eq!(value["durationUnit"], json!("MICROSECONDS"));
    }
}

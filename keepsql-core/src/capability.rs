/*!
Capability probing for optional engine features.

Each feature is checked with a minimal smoke test against the live engine.
Failures are recorded as telemetry and never abort startup. Probes only touch
the `temp` schema, so running them against a loaded snapshot leaves its
contents unchanged.
*/

use crate::engine::EngineHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A named smoke test
#[derive(Debug, Clone, Copy)]
pub struct FeatureProbe {
    pub feature: &'static str,
    pub statements: &'static [&'static str],
}

/// Features probed on every startup, in order
pub const FEATURE_PROBES: &[FeatureProbe] = &[
    FeatureProbe {
        feature: "fts",
        statements: &[
            "CREATE VIRTUAL TABLE temp.keepsql_fts_probe USING fts5(body)",
            "INSERT INTO temp.keepsql_fts_probe (body) VALUES ('capability probe')",
            "SELECT rowid FROM temp.keepsql_fts_probe WHERE keepsql_fts_probe MATCH 'probe'",
            "DROP TABLE temp.keepsql_fts_probe",
        ],
    },
    FeatureProbe {
        feature: "json",
        statements: &["SELECT json_extract('{\"a\":[1,2,3]}', '$.a[1]')"],
    },
    FeatureProbe {
        feature: "recursive_cte",
        statements: &[
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) SELECT SUM(x) FROM n",
        ],
    },
    FeatureProbe {
        feature: "window_functions",
        statements: &[
            "SELECT x, ROW_NUMBER() OVER (ORDER BY x) FROM (SELECT 1 AS x UNION ALL SELECT 2)",
        ],
    },
    FeatureProbe {
        feature: "rtree",
        statements: &[
            "CREATE VIRTUAL TABLE temp.keepsql_rtree_probe USING rtree(id, min_x, max_x)",
            "DROP TABLE temp.keepsql_rtree_probe",
        ],
    },
    FeatureProbe {
        feature: "math_functions",
        statements: &["SELECT sqrt(16.0), ln(1.0)"],
    },
];

/// Support status for one feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureSupport {
    pub supported: bool,
}

/// Where a probe ran, attached to every failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentContext {
    pub user_agent: String,
    pub sqlite_version: String,
    pub background_workers: bool,
    pub durable_store: bool,
}

impl EnvironmentContext {
    /// Describe the current process
    pub fn current(durable_store: bool) -> Self {
        Self {
            user_agent: format!(
                "keepsql/{} ({}; {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            sqlite_version: rusqlite::version().to_string(),
            background_workers: num_cpus::get() > 1,
            durable_store,
        }
    }
}

/// Diagnostic record for a failed probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEntry {
    pub feature: String,
    pub statement: String,
    pub error_message: String,
    pub tested_at: DateTime<Utc>,
    pub environment: EnvironmentContext,
}

/// Result of one probing pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapabilityReport {
    pub features: BTreeMap<String, FeatureSupport>,
    pub telemetry: Vec<TelemetryEntry>,
}

impl CapabilityReport {
    /// Whether `feature` passed its probe; unknown features are unsupported
    pub fn is_supported(&self, feature: &str) -> bool {
        self.features
            .get(feature)
            .map(|support| support.supported)
            .unwrap_or(false)
    }

    /// Names of features that failed
    pub fn unsupported(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, support)| !support.supported)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Runs the feature probes
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    probes: Vec<FeatureProbe>,
    environment: EnvironmentContext,
}

impl CapabilityProber {
    pub fn new(environment: EnvironmentContext) -> Self {
        Self::with_probes(FEATURE_PROBES.to_vec(), environment)
    }

    pub fn with_probes(probes: Vec<FeatureProbe>, environment: EnvironmentContext) -> Self {
        Self { probes, environment }
    }

    /// Probe every feature once
    pub fn probe(&self, engine: &EngineHandle) -> CapabilityReport {
        let mut report = CapabilityReport::default();

        for probe in &self.probes {
            let failure = probe
                .statements
                .iter()
                .find_map(|statement| {
                    engine
                        .execute(statement, &[])
                        .err()
                        .map(|e| (*statement, e.to_string()))
                });

            let supported = match failure {
                None => {
                    debug!("Capability '{}' supported", probe.feature);
                    true
                }
                Some((statement, error_message)) => {
                    warn!(
                        "Capability '{}' unavailable: {}",
                        probe.feature, error_message
                    );
                    report.telemetry.push(TelemetryEntry {
                        feature: probe.feature.to_string(),
                        statement: statement.to_string(),
                        error_message,
                        tested_at: Utc::now(),
                        environment: self.environment.clone(),
                    });
                    false
                }
            };
            report
                .features
                .insert(probe.feature.to_string(), FeatureSupport { supported });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{build_fresh, CURRENT_SCHEMA_VERSION};

    fn prober() -> CapabilityProber {
        CapabilityProber::new(EnvironmentContext::current(true))
    }

    #[test]
    fn test_bundled_engine_supports_core_features() {
        let engine = EngineHandle::create_empty().unwrap();
        let report = prober().probe(&engine);

        assert_eq!(report.features.len(), FEATURE_PROBES.len());
        for feature in ["fts", "json", "recursive_cte", "window_functions"] {
            assert!(report.is_supported(feature), "{feature} should be supported");
        }
        assert!(!report.is_supported("not_a_feature"));
    }

    #[test]
    fn test_failed_probe_becomes_telemetry() {
        let probes = vec![
            FeatureProbe {
                feature: "json",
                statements: &["SELECT json('[]')"],
            },
            FeatureProbe {
                feature: "teleport",
                statements: &["SELECT 1", "SELECT teleport('here', 'there')"],
            },
        ];
        let engine = EngineHandle::create_empty().unwrap();
        let report = CapabilityProber::with_probes(probes, EnvironmentContext::current(false))
            .probe(&engine);

        assert!(report.is_supported("json"));
        assert_eq!(report.unsupported(), vec!["teleport"]);
        assert_eq!(report.telemetry.len(), 1);

        let entry = &report.telemetry[0];
        assert_eq!(entry.feature, "teleport");
        assert_eq!(entry.statement, "SELECT teleport('here', 'there')");
        assert!(entry.error_message.contains("teleport"));
        assert!(!entry.environment.durable_store);
        assert!(entry.environment.user_agent.starts_with("keepsql/"));
    }

    #[test]
    fn test_probing_leaves_data_untouched() {
        let engine = build_fresh(CURRENT_SCHEMA_VERSION).unwrap();
        let before = engine.export_image().unwrap();

        prober().probe(&engine);

        let tables = engine
            .execute(
                "SELECT name FROM temp.sqlite_master WHERE name LIKE 'keepsql_%'",
                &[],
            )
            .unwrap()
            .rows;
        assert!(tables.is_empty());
        assert_eq!(engine.export_image().unwrap().len(), before.len());
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let engine = EngineHandle::create_empty().unwrap();
        let probes = vec![FeatureProbe {
            feature: "broken",
            statements: &["SELEC 1"],
        }];
        let report = CapabilityProber::with_probes(probes, EnvironmentContext::current(true))
            .probe(&engine);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["features"]["broken"]["supported"], false);
        assert!(json["telemetry"][0]["errorMessage"].is_string());
        assert!(json["telemetry"][0]["environment"]["durableStore"].as_bool().unwrap());
    }
}

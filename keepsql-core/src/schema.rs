/*!
Bundled schema, sample data and baseline reference data.
*/

use crate::engine::EngineHandle;
use crate::Result;
use std::borrow::Cow;
use tracing::{debug, info};

/// Schema version compiled into this build
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Tables every accepted database must contain
pub const REQUIRED_TABLES: [&str; 5] = ["nodes", "edges", "facets", "notebook_cards", "settings"];

/// Table layout for fresh builds
pub const BUNDLED_SCHEMA: &str = include_str!("../sql/schema.sql");

/// Sample rows for fresh builds
pub const BUNDLED_SAMPLE_DATA: &str = include_str!("../sql/sample_data.sql");

/// Insert-if-absent reference data applied on every startup
pub const BASELINE_DATA: &str = include_str!("../sql/baseline.sql");

/// The default required-table list as owned strings
pub fn default_required_tables() -> Vec<String> {
    REQUIRED_TABLES.iter().map(|t| t.to_string()).collect()
}

/// SQL scripts used to build and seed a database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundledScripts {
    pub schema: Cow<'static, str>,
    pub sample_data: Cow<'static, str>,
    pub baseline: Cow<'static, str>,
}

impl Default for BundledScripts {
    fn default() -> Self {
        Self {
            schema: Cow::Borrowed(BUNDLED_SCHEMA),
            sample_data: Cow::Borrowed(BUNDLED_SAMPLE_DATA),
            baseline: Cow::Borrowed(BASELINE_DATA),
        }
    }
}

impl BundledScripts {
    /// Build a new engine from the schema and sample data, stamped with
    /// `schema_version`.
    pub fn build_fresh(&self, schema_version: u32) -> Result<EngineHandle> {
        let engine = EngineHandle::create_empty()?;
        engine.execute_batch(&format!(
            "BEGIN;\n{}\n{}\nCOMMIT;",
            self.schema, self.sample_data
        ))?;
        engine.stamp_schema_version(schema_version)?;
        info!(
            "Built fresh database {} at schema version {}",
            engine.id(),
            schema_version
        );
        Ok(engine)
    }

    /// Make sure the baseline reference rows exist
    ///
    /// Safe to run on every startup: rows are only inserted when missing and
    /// rows a user edited are left alone.
    pub fn ensure_baseline(&self, engine: &EngineHandle) -> Result<()> {
        if self.baseline.trim().is_empty() {
            return Ok(());
        }
        engine.execute_batch(&format!("BEGIN;\n{}\nCOMMIT;", self.baseline))?;
        debug!("Baseline reference data ensured on {}", engine.id());
        Ok(())
    }
}

/// [`BundledScripts::build_fresh`] with the compiled-in scripts
pub fn build_fresh(schema_version: u32) -> Result<EngineHandle> {
    BundledScripts::default().build_fresh(schema_version)
}

/// [`BundledScripts::ensure_baseline`] with the compiled-in scripts
pub fn ensure_baseline(engine: &EngineHandle) -> Result<()> {
    BundledScripts::default().ensure_baseline(engine)
}

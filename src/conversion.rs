//! Unit-of-measure conversion factors, memoized per unit id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::telemetry::TelemetryError;

pub trait CanonicalFactorSource: Send + Sync {
    fn canonical_factor(&self, unit_id: &str) -> Result<f64, TelemetryError>;
}

/// Factors are fetched on first use and kept until the next `refresh_all`.
pub struct ConversionFactorCache {
    source: Arc<dyn CanonicalFactorSource>,
    factors: RwLock<HashMap<String, f64>>,
}

impl ConversionFactorCache {
    pub fn new(source: Arc<dyn CanonicalFactorSource>) -> Self {
        Self {
            source,
            factors: RwLock::new(HashMap::new()),
        }
    }

    /// Tags without a unit are taken as already canonical.
    pub fn factor(&self, unit_id: Option<&str>) -> Result<f64, TelemetryError> {
        let Some(unit_id) = unit_id.filter(|id| !id.trim().is_empty()) else {
            return Ok(1.0);
        };

        if let Some(factor) = self
            .factors
            .read()
            .expect("conversion factor lock should not be poisoned")
            .get(unit_id)
        {
            return Ok(*factor);
        }

        let factor = self.source.canonical_factor(unit_id)?;
        self.factors
            .write()
            .expect("conversion factor lock should not be poisoned")
            .insert(unit_id.to_string(), factor);
        debug!(
            component = "conversion",
            event = "conversion.factor.loaded",
            unit_id,
            factor
        );
        Ok(factor)
    }

    /// Re-reads every known factor. A unit whose refresh fails keeps its
    /// previous value. Returns how many units were refreshed.
    pub fn refresh_all(&self) -> usize {
        let units: Vec<String> = self
            .factors
            .read()
            .expect("conversion factor lock should not be poisoned")
            .keys()
            .cloned()
            .collect();

        let mut refreshed = 0;
        for unit_id in &units {
            match self.source.canonical_factor(unit_id) {
                Ok(factor) => {
                    self.factors
                        .write()
                        .expect("conversion factor lock should not be poisoned")
                        .insert(unit_id.clone(), factor);
                    refreshed += 1;
                }
                Err(err) => warn!(
                    component = "conversion",
                    event = "conversion.refresh.failed",
                    unit_id = %unit_id,
                    error = %err
                ),
            }
        }

        info!(
            component = "conversion",
            event = "conversion.refresh.finish",
            known_units = units.len(),
            refreshed
        );
        refreshed
    }

    pub fn known_units(&self) -> usize {
        self.factors
            .read()
            .expect("conversion factor lock should not be poisoned")
            .len()
    }
}

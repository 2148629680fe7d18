use async_trait::async_trait;
use dashmap::DashMap;
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{FrequencyPlan, SubBand};

/// Source of frequency plans by id.
#[async_trait]
pub trait FrequencyPlansStore: Send + Sync + 'static {
    /// Plan with `id`; `FrequencyPlanNotFound` when unknown.
    async fn get_by_id(&self, id: &str) -> GSResult<FrequencyPlan>;

    /// Resolves every id, failing on the first unknown one.
    async fn get_all(&self, ids: &[String]) -> GSResult<Vec<FrequencyPlan>> {
        let mut plans = Vec::with_capacity(ids.len());
        for id in ids {
            plans.push(self.get_by_id(id).await?);
        }
        Ok(plans)
    }
}

/// Frequency plans held in memory, keyed by plan id.
#[derive(Default)]
pub struct InMemoryFrequencyPlans {
    plans: DashMap<String, FrequencyPlan>,
}

impl InMemoryFrequencyPlans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the EU 863-870 and US 902-928 plans.
    pub fn with_defaults() -> Self {
        let store = Self::new();
        store.insert(eu_863_870());
        store.insert(us_902_928());
        store
    }

    /// Adds `plan`, replacing a plan with the same id.
    pub fn insert(&self, plan: FrequencyPlan) {
        self.plans.insert(plan.id.clone(), plan);
    }
}

#[async_trait]
impl FrequencyPlansStore for InMemoryFrequencyPlans {
    async fn get_by_id(&self, id: &str) -> GSResult<FrequencyPlan> {
        self.plans
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| GSError::FrequencyPlanNotFound(id.to_string()))
    }
}

/// EU 863-870 MHz plan with the ETSI duty-cycle sub-bands.
pub fn eu_863_870() -> FrequencyPlan {
    let sb = |min_frequency, max_frequency, duty_cycle| SubBand {
        min_frequency,
        max_frequency,
        duty_cycle,
    };
    FrequencyPlan {
        id: "EU_863_870".into(),
        band_id: "EU_863_870".into(),
        sub_bands: vec![
            sb(863_000_000, 865_000_000, 0.001),
            sb(865_000_000, 868_000_000, 0.01),
            sb(868_000_001, 868_600_000, 0.01),
            sb(868_700_000, 869_200_000, 0.001),
            sb(869_400_000, 869_650_000, 0.1),
            sb(869_700_000, 870_000_000, 0.01),
        ],
    }
}

pub fn us_902_928() -> FrequencyPlan {
    FrequencyPlan {
        id: "US_902_928_FSB_2".into(),
        band_id: "US_902_928".into(),
        sub_bands: vec![SubBand {
            min_frequency: 902_000_000,
            max_frequency: 928_000_000,
            duty_cycle: 1.0,
        }],
    }
}

use serde::{Deserialize, Serialize};

/// Regulatory sub-band with its downlink duty-cycle ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBand {
    pub min_frequency: u64,
    pub max_frequency: u64,
    /// Fraction of time the gateway may emit, e.g. `0.01` for 1%.
    pub duty_cycle: f32,
}

impl SubBand {
    /// Whether `frequency` lies within the sub-band, bounds inclusive.
    #[inline]
    pub fn contains(&self, frequency: u64) -> bool {
        (self.min_frequency..=self.max_frequency).contains(&frequency)
    }
}

/// Regional frequency plan: the sub-bands a gateway may transmit in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPlan {
    pub id: String,
    pub band_id: String,
    #[serde(default)]
    pub sub_bands: Vec<SubBand>,
}

impl FrequencyPlan {
    /// Sub-band containing `frequency`.
    pub fn sub_band(&self, frequency: u64) -> Option<&SubBand> {
        self.sub_bands.iter().find(|sb| sb.contains(frequency))
    }
}

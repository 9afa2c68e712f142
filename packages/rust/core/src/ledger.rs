//! Per-stage usage accounting and cost estimates.

use std::collections::BTreeMap;
use std::sync::Mutex;

use recordflow_shared::{PricingConfig, Rate, Stage, Usage};

/// Dollar rates per stage, falling back to a default rate.
#[derive(Debug, Clone)]
pub struct PricingTable {
    default: Rate,
    stages: BTreeMap<String, Rate>,
}

impl PricingTable {
    pub fn rate_for(&self, stage: Stage) -> Rate {
        self.stages
            .get(stage.as_str())
            .copied()
            .unwrap_or(self.default)
    }

    /// Estimated USD cost of `usage` at `stage`'s rate.
    pub fn cost(&self, stage: Stage, usage: Usage) -> f64 {
        let rate = self.rate_for(stage);
        (usage.input_tokens as f64 / 1_000_000.0) * rate.input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * rate.output_per_million
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::from(&PricingConfig::default())
    }
}

impl From<&PricingConfig> for PricingTable {
    fn from(config: &PricingConfig) -> Self {
        Self {
            default: config.default,
            stages: config.stages.clone(),
        }
    }
}

/// Thread-safe accumulator of usage units per stage.
#[derive(Debug, Default)]
pub struct CostLedger {
    totals: Mutex<BTreeMap<Stage, Usage>>,
    pricing: PricingTable,
}

impl CostLedger {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            totals: Mutex::new(BTreeMap::new()),
            pricing,
        }
    }

    /// Add a call's usage. Calls that reported nothing are ignored.
    pub fn add(&self, stage: Stage, usage: Option<Usage>) {
        let Some(usage) = usage else {
            return;
        };
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        *totals.entry(stage).or_default() += usage;
    }

    /// Copy of the per-stage totals, in stage order.
    pub fn snapshot(&self) -> BTreeMap<Stage, Usage> {
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Estimated cost of everything recorded so far.
    pub fn total_cost(&self) -> f64 {
        self.snapshot()
            .into_iter()
            .map(|(stage, usage)| self.pricing.cost(stage, usage))
            .sum()
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn usage(input: u64, output: u64) -> Option<Usage> {
        Some(Usage {
            input_tokens: input,
            output_tokens: output,
        })
    }

    #[test]
    fn stage_override_and_default_rate() {
        let mut config = PricingConfig::default();
        config.stages.insert(
            "finalize".into(),
            Rate {
                input_per_million: 2.0,
                output_per_million: 10.0,
            },
        );
        let table = PricingTable::from(&config);

        let one_million = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        assert!((table.cost(Stage::Research, one_million) - 3.5).abs() < 1e-9);
        assert!((table.cost(Stage::Finalize, one_million) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn usage_accumulates_per_stage() {
        let ledger = CostLedger::default();
        ledger.add(Stage::Research, usage(100, 10));
        ledger.add(Stage::Research, usage(50, 5));
        ledger.add(Stage::Finalize, usage(1, 1));
        ledger.add(Stage::Crawl, None);

        let totals = ledger.snapshot();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[&Stage::Research].input_tokens, 150);
        assert_eq!(totals[&Stage::Research].output_tokens, 15);
        assert!(ledger.total_cost() > 0.0);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let ledger = Arc::new(CostLedger::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ledger.add(Stage::Crawl, usage(1, 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let totals = ledger.snapshot();
        assert_eq!(totals[&Stage::Crawl].input_tokens, 8000);
        assert_eq!(totals[&Stage::Crawl].output_tokens, 16000);
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use factory_types::{UsageDelta, UsageStats};

/// USD price per million tokens for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub provider: String,
    pub model: String,
    pub input_per_m_tokens_usd: f64,
    pub output_per_m_tokens_usd: f64,
}

impl ModelPrice {
    pub fn new(provider: &str, model: &str, input: f64, output: f64) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            input_per_m_tokens_usd: input,
            output_per_m_tokens_usd: output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
}

fn price_key(provider: &str, model: &str) -> String {
    format!("{}:{}", provider.trim().to_lowercase(), model.trim().to_lowercase())
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(vec![
            ModelPrice::new("openai", "gpt-4o-mini", 0.15, 0.60),
            ModelPrice::new("openai", "gpt-4o", 5.0, 15.0),
            ModelPrice::new("openai", "gpt-3.5-turbo", 0.5, 1.5),
        ])
    }
}

impl PricingTable {
    pub fn new(prices: Vec<ModelPrice>) -> Self {
        let prices = prices
            .into_iter()
            .map(|p| (price_key(&p.provider, &p.model), p))
            .collect();
        Self { prices }
    }

    /// Defaults plus overrides; an override replaces the same provider/model.
    pub fn with_overrides(overrides: Vec<ModelPrice>) -> Self {
        let mut table = Self::default();
        for price in overrides {
            table.prices.insert(price_key(&price.provider, &price.model), price);
        }
        table
    }

    pub fn lookup(&self, provider: &str, model: &str) -> Option<&ModelPrice> {
        self.prices.get(&price_key(provider, model))
    }

    /// Cost in USD rounded to 8 decimals, `None` for unpriced models.
    pub fn estimate_cost(&self, provider: &str, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
        let price = self.lookup(provider, model)?;
        let raw = (prompt_tokens as f64 / 1e6) * price.input_per_m_tokens_usd
            + (completion_tokens as f64 / 1e6) * price.output_per_m_tokens_usd;
        Some((raw * 1e8).round() / 1e8)
    }
}

/// Per-run usage accumulator with an optional spending ceiling.
pub struct UsageGuard {
    stats: Mutex<UsageStats>,
    budget_usd: Option<f64>,
    tripped: AtomicBool,
}

impl UsageGuard {
    pub fn new(budget_usd: Option<f64>) -> Self {
        Self {
            stats: Mutex::new(UsageStats::default()),
            budget_usd: budget_usd.filter(|b| b.is_finite() && *b >= 0.0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn budget_usd(&self) -> Option<f64> {
        self.budget_usd
    }

    /// Merge a delta and return the new totals.
    pub fn add(&self, delta: &UsageDelta) -> UsageStats {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.merge(delta);
        stats.clone()
    }

    pub fn snapshot(&self) -> UsageStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Returns `(budget, cost)` the first time accumulated cost exceeds the
    /// ceiling; `None` afterwards and whenever within budget.
    pub fn check_budget(&self) -> Option<(f64, f64)> {
        let budget = self.budget_usd?;
        let cost = self.snapshot().cost_usd;
        if cost > budget && !self.tripped.swap(true, Ordering::SeqCst) {
            return Some((budget, cost));
        }
        None
    }
}

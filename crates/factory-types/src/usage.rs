use serde::{Deserialize, Serialize};

/// Accumulated usage for one run. Every counter only grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
}

/// One usage report to be merged into a run's [`UsageStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDelta {
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    /// Falls back to prompt + completion when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, rename = "costUSD", skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl UsageDelta {
    pub fn tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            requests: 1,
            prompt_tokens,
            completion_tokens,
            total_tokens: None,
            cost_usd: None,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}

impl UsageStats {
    /// Merge a delta. Negative or non-finite costs are ignored so the totals
    /// never decrease.
    pub fn merge(&mut self, delta: &UsageDelta) {
        self.requests = self.requests.saturating_add(delta.requests);
        self.prompt_tokens = self.prompt_tokens.saturating_add(delta.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(delta.completion_tokens);
        let total = delta
            .total_tokens
            .unwrap_or_else(|| delta.prompt_tokens.saturating_add(delta.completion_tokens));
        self.total_tokens = self.total_tokens.saturating_add(total);
        if let Some(cost) = delta.cost_usd {
            if cost.is_finite() && cost > 0.0 {
                self.cost_usd += cost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_and_derives_total() {
        let mut stats = UsageStats::default();
        stats.merge(&UsageDelta::tokens(100, 20).with_cost(0.002));
        stats.merge(&UsageDelta {
            requests: 1,
            prompt_tokens: 5,
            completion_tokens: 5,
            total_tokens: Some(12),
            cost_usd: None,
        });
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.prompt_tokens, 105);
        assert_eq!(stats.completion_tokens, 25);
        assert_eq!(stats.total_tokens, 132);
        assert!((stats.cost_usd - 0.002).abs() < 1e-12);
    }

    #[test]
    fn merge_ignores_negative_and_nan_costs() {
        let mut stats = UsageStats::default();
        stats.merge(&UsageDelta::tokens(1, 1).with_cost(0.5));
        stats.merge(&UsageDelta::tokens(0, 0).with_cost(-1.0));
        stats.merge(&UsageDelta::tokens(0, 0).with_cost(f64::NAN));
        assert!((stats.cost_usd - 0.5).abs() < 1e-12);
    }

    #[test]
    fn usage_serializes_with_cost_usd_key() {
        let value = serde_json::to_value(UsageStats::default()).expect("serialize");
        assert!(value.get("costUSD").is_some());
        assert!(value.get("totalTokens").is_some());
    }
}

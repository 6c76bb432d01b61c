//! Provider billing client: fetches authoritative usage totals.
//!
//! The provider reports aggregate usage in cents for a date range; the
//! reconciler treats the total as opaque ground truth.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::instrument;

use crate::error::{Error, Result};

/// Authoritative usage for a date window, converted to USD.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderUsage {
    pub total_usage: Decimal,
    pub daily_costs: Vec<DailyProviderCost>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyProviderCost {
    pub date: NaiveDate,
    pub cost: Decimal,
}

/// Abstract billing fetch, so the reconciler can run against a fake in tests.
#[async_trait]
pub trait BillingClient: Send + Sync {
    /// Fetch the authoritative total usage cost for `[start, end]`.
    async fn fetch_provider_usage(&self, start: NaiveDate, end: NaiveDate) -> Result<ProviderUsage>;
}

// Wire shapes, as returned by the provider's dashboard billing endpoint.
// All amounts are in cents.
#[derive(Deserialize)]
struct UsageResponse {
    total_usage: f64,
    #[serde(default)]
    daily_costs: Vec<DailyCostEntry>,
}

#[derive(Deserialize)]
struct DailyCostEntry {
    timestamp: f64,
    #[serde(default)]
    line_items: Vec<LineItem>,
}

#[derive(Deserialize)]
struct LineItem {
    #[allow(dead_code)]
    name: Option<String>,
    cost: f64,
}

fn cents_to_usd(cents: f64) -> Decimal {
    Decimal::from_f64(cents).unwrap_or_default() / Decimal::from(100)
}

/// HTTP implementation against the provider's billing API.
pub struct HttpBillingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpBillingClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl BillingClient for HttpBillingClient {
    #[instrument(skip(self), err)]
    async fn fetch_provider_usage(&self, start: NaiveDate, end: NaiveDate) -> Result<ProviderUsage> {
        let url = format!("{}/v1/dashboard/billing/usage", self.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("start_date", start.format("%Y-%m-%d").to_string()),
                ("end_date", end.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::reconciliation(format!("provider usage fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::reconciliation(format!("provider usage fetch failed: {e}")))?;

        let body: UsageResponse = response
            .json()
            .await
            .map_err(|e| Error::reconciliation(format!("provider usage response malformed: {e}")))?;

        let daily_costs = body
            .daily_costs
            .into_iter()
            .filter_map(|entry| {
                let date = chrono::DateTime::from_timestamp(entry.timestamp as i64, 0)?.date_naive();
                let cents: f64 = entry.line_items.iter().map(|item| item.cost).sum();
                Some(DailyProviderCost {
                    date,
                    cost: cents_to_usd(cents),
                })
            })
            .collect();

        Ok(ProviderUsage {
            total_usage: cents_to_usd(body.total_usage),
            daily_costs,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn fetches_and_converts_cents_to_usd() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/dashboard/billing/usage"))
            .and(query_param("start_date", "2026-03-13"))
            .and(query_param("end_date", "2026-03-14"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "total_usage": 1234.5,
                "daily_costs": [
                    {
                        "timestamp": 1776988800.0,
                        "line_items": [
                            {"name": "gpt-realtime", "cost": 1000.0},
                            {"name": "whisper", "cost": 234.5}
                        ]
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpBillingClient::new(server.uri(), "sk-test");
        let usage = client
            .fetch_provider_usage(
                NaiveDate::from_ymd_opt(2026, 3, 13).unwrap(),
                NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(usage.total_usage, Decimal::new(12345, 3)); // $12.345
        assert_eq!(usage.daily_costs.len(), 1);
        assert_eq!(usage.daily_costs[0].cost, Decimal::new(12345, 3));
    }

    #[tokio::test]
    async fn upstream_error_surfaces_as_reconciliation_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/dashboard/billing/usage"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpBillingClient::new(server.uri(), "sk-test");
        let err = client
            .fetch_provider_usage(
                NaiveDate::from_ymd_opt(2026, 3, 13).unwrap(),
                NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Reconciliation { .. }));
    }
}

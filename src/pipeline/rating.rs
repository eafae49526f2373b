//! Rating gateway
//!
//! Quotes the monetary cost of a delta from an external tariff service.
//! The service is slow and sometimes down; callers degrade to zero cost.
//!
//! ## API Reference
//!
//! Request: `POST {RATING_URL}`
//! ```json
//! { "units": 120, "phase": 1 }
//! ```
//! Returns: total plus optional itemisation
//! ```json
//! { "total": 512.4, "fixed_charge": 85.0, "energy_charge": 390.0, "duty": 39.0 }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::{CostBreakdown, GatewayError, Phase};

#[derive(Debug, Clone, Serialize)]
struct QuoteRequest {
    units: u64,
    phase: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub total: f64,
    pub fixed_charge: Option<f64>,
    pub energy_charge: Option<f64>,
    pub tod_charge: Option<f64>,
    pub duty: Option<f64>,
    pub subsidy: Option<f64>,
}

/// Priced delta
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub amount: f64,
    /// Present only when the service itemised the bill
    pub breakdown: Option<CostBreakdown>,
}

impl Quote {
    pub fn amount_only(amount: f64) -> Self {
        Self {
            amount,
            breakdown: None,
        }
    }
}

impl From<QuoteResponse> for Quote {
    fn from(resp: QuoteResponse) -> Self {
        let itemised = resp.fixed_charge.is_some()
            || resp.energy_charge.is_some()
            || resp.tod_charge.is_some()
            || resp.duty.is_some()
            || resp.subsidy.is_some();

        let amount = round2(resp.total);
        let breakdown = itemised.then(|| CostBreakdown {
            fixed_charge: resp.fixed_charge.unwrap_or(0.0),
            energy_charge: resp.energy_charge.unwrap_or(0.0),
            tod_charge: resp.tod_charge.unwrap_or(0.0),
            duty: resp.duty.unwrap_or(0.0),
            subsidy: resp.subsidy.unwrap_or(0.0),
            total: amount,
        });

        Self { amount, breakdown }
    }
}

#[async_trait]
pub trait RatingGateway: Send + Sync {
    async fn quote(&self, delta_units: f64, phase: Phase) -> Result<Quote, GatewayError>;
}

/// HTTP client for the tariff quote service
pub struct HttpRatingGateway {
    client: reqwest::Client,
    url: String,
}

impl HttpRatingGateway {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        log::info!("✅ Initialized rating gateway");
        log::info!("   └─ Endpoint: {}", url);

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RatingGateway for HttpRatingGateway {
    async fn quote(&self, delta_units: f64, phase: Phase) -> Result<Quote, GatewayError> {
        let response = self
            .client
            .post(&self.url)
            .json(&QuoteRequest {
                units: whole_units(delta_units),
                phase: phase.selector(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Status(response.status().as_u16()));
        }

        let body: QuoteResponse = response.json().await?;
        if !body.total.is_finite() || body.total < 0.0 {
            return Err(GatewayError::Malformed(format!("invalid total {}", body.total)));
        }

        Ok(body.into())
    }
}

/// The tariff service bills whole units only
pub fn whole_units(delta: f64) -> u64 {
    if delta.is_finite() && delta > 0.0 {
        delta.trunc() as u64
    } else {
        0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

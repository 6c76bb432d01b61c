//! Pure cost model: converts usage quantities into USD amounts.
//!
//! Audio usage is reported by the voice channel in seconds; token counts are
//! derived through a fixed tokens-per-minute constant rather than measured.
//! This is a deliberate approximation carried over from the provider's own
//! guidance for realtime audio pricing.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fixed conversion constant for deriving audio tokens from seconds.
pub const AUDIO_TOKENS_PER_MINUTE: f64 = 1667.0;

/// Per-token unit prices for the four usage categories, in USD.
///
/// Audio is priced two orders of magnitude above text, mirroring the
/// provider's realtime pricing asymmetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub text_input_per_token: Decimal,
    pub text_output_per_token: Decimal,
    pub audio_input_per_token: Decimal,
    pub audio_output_per_token: Decimal,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            text_input_per_token: Decimal::new(5, 6),   // $0.000005
            text_output_per_token: Decimal::new(2, 5),  // $0.00002
            audio_input_per_token: Decimal::new(1, 4),  // $0.0001
            audio_output_per_token: Decimal::new(2, 4), // $0.0002
        }
    }
}

/// Raw usage quantities for one session, as reported by the voice channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUsage {
    pub duration_seconds: i64,
    pub text_input_tokens: i64,
    pub text_output_tokens: i64,
    pub audio_input_seconds: f64,
    pub audio_output_seconds: f64,
}

/// Cost components for one session. `total_cost` is always the exact sum of
/// the four components; rounding to cents happens only at display boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCosts {
    pub text_input_tokens: i64,
    pub text_output_tokens: i64,
    pub audio_input_tokens: i64,
    pub audio_output_tokens: i64,
    pub text_input_cost: Decimal,
    pub text_output_cost: Decimal,
    pub audio_input_cost: Decimal,
    pub audio_output_cost: Decimal,
    pub total_cost: Decimal,
}

/// Derive an audio token count from a duration in seconds.
pub fn audio_tokens_for_seconds(seconds: f64) -> i64 {
    (seconds.max(0.0) * AUDIO_TOKENS_PER_MINUTE / 60.0).round() as i64
}

/// Compute the per-category and total cost for a session's usage.
///
/// Pure and deterministic: no I/O, no error cases. Negative inputs are
/// clamped to zero (defensive defaulting of missing quantities).
pub fn calculate_session_cost(pricing: &PricingTable, usage: &SessionUsage) -> SessionCosts {
    let text_input_tokens = usage.text_input_tokens.max(0);
    let text_output_tokens = usage.text_output_tokens.max(0);
    let audio_input_tokens = audio_tokens_for_seconds(usage.audio_input_seconds);
    let audio_output_tokens = audio_tokens_for_seconds(usage.audio_output_seconds);

    let text_input_cost = pricing.text_input_per_token * Decimal::from(text_input_tokens);
    let text_output_cost = pricing.text_output_per_token * Decimal::from(text_output_tokens);
    let audio_input_cost = pricing.audio_input_per_token * Decimal::from(audio_input_tokens);
    let audio_output_cost = pricing.audio_output_per_token * Decimal::from(audio_output_tokens);

    let total_cost = text_input_cost + text_output_cost + audio_input_cost + audio_output_cost;

    SessionCosts {
        text_input_tokens,
        text_output_tokens,
        audio_input_tokens,
        audio_output_tokens,
        text_input_cost,
        text_output_cost,
        audio_input_cost,
        audio_output_cost,
        total_cost,
    }
}

/// Default USD to EUR conversion rate used when the caller does not supply one.
pub fn default_usd_eur_rate() -> Decimal {
    Decimal::new(85, 2) // 0.85
}

/// Convert a USD amount to EUR at a caller-supplied rate.
///
/// This is a plain multiplication, not a live exchange-rate lookup.
pub fn usd_to_eur(amount: Decimal, rate: Decimal) -> Decimal {
    amount * rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_cost_is_sum_of_components() {
        let pricing = PricingTable::default();
        let usage = SessionUsage {
            duration_seconds: 300,
            text_input_tokens: 1200,
            text_output_tokens: 3400,
            audio_input_seconds: 120.0,
            audio_output_seconds: 95.5,
        };

        let costs = calculate_session_cost(&pricing, &usage);

        assert_eq!(
            costs.total_cost,
            costs.text_input_cost + costs.text_output_cost + costs.audio_input_cost + costs.audio_output_cost
        );
    }

    #[test]
    fn zero_usage_yields_zero_costs() {
        let costs = calculate_session_cost(&PricingTable::default(), &SessionUsage::default());

        assert_eq!(costs.total_cost, Decimal::ZERO);
        assert_eq!(costs.text_input_cost, Decimal::ZERO);
        assert_eq!(costs.text_output_cost, Decimal::ZERO);
        assert_eq!(costs.audio_input_cost, Decimal::ZERO);
        assert_eq!(costs.audio_output_cost, Decimal::ZERO);
        assert_eq!(costs.audio_input_tokens, 0);
        assert_eq!(costs.audio_output_tokens, 0);
    }

    #[test]
    fn audio_token_derivation_is_deterministic() {
        // 120 seconds at 1667 tokens/minute = 3334 tokens
        let tokens = audio_tokens_for_seconds(120.0);
        assert!((tokens - 3334).abs() <= 1, "got {tokens}");

        assert_eq!(audio_tokens_for_seconds(0.0), 0);
        assert_eq!(audio_tokens_for_seconds(-5.0), 0);
        assert_eq!(audio_tokens_for_seconds(60.0), 1667);
    }

    #[test]
    fn negative_token_counts_are_clamped() {
        let usage = SessionUsage {
            text_input_tokens: -10,
            text_output_tokens: -1,
            ..Default::default()
        };
        let costs = calculate_session_cost(&PricingTable::default(), &usage);
        assert_eq!(costs.total_cost, Decimal::ZERO);
    }

    #[test]
    fn usd_to_eur_is_plain_multiplication() {
        let eur = usd_to_eur(Decimal::new(100, 0), default_usd_eur_rate());
        assert_eq!(eur, Decimal::new(85, 0));

        let eur = usd_to_eur(Decimal::new(1234, 2), Decimal::new(9, 1));
        assert_eq!(eur, Decimal::new(11106, 3)); // 12.34 * 0.9 = 11.106
    }
}

//! Live valuation of orders against the fiat market rate.

use crate::btc::Sats;
use crate::order::Order;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("market price request failed: {0}")]
    Fetch(String),
    #[error("no market rate for currency {0}")]
    UnknownCurrency(String),
    #[error("order is missing its price inputs")]
    MissingAmount,
}

/// Source of fiat exchange rates, in fiat units per whole bitcoin.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn exchange_rate(&self, currency: &str) -> Result<f64, RateError>;
}

/// Ticker-style public price API: one JSON object keyed by currency code,
/// each entry carrying the latest trade price.
pub struct MarketPriceApi {
    client: reqwest::Client,
    url: Url,
}

#[derive(Debug, serde::Deserialize)]
struct Ticker {
    last: f64,
}

impl MarketPriceApi {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl RateSource for MarketPriceApi {
    async fn exchange_rate(&self, currency: &str) -> Result<f64, RateError> {
        let tickers: HashMap<String, Ticker> = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| RateError::Fetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| RateError::Fetch(e.to_string()))?;
        tickers
            .get(currency)
            .map(|ticker| ticker.last)
            .ok_or_else(|| RateError::UnknownCurrency(currency.to_owned()))
    }
}

const SATS_PER_BTC: f64 = 100_000_000.0;
const SIGNIFICANT_DIGITS: i32 = 6;

/// Current size of the trade in satoshis. Explicit orders carry their amount;
/// relative orders are valued against the live rate at the order's premium.
pub async fn satoshis_now(rates: &dyn RateSource, order: &Order) -> Result<Sats, RateError> {
    if order.is_explicit {
        return order.satoshis.ok_or(RateError::MissingAmount);
    }
    let rate = rates.exchange_rate(&order.currency).await?;
    Ok(satoshis_at_rate(fiat_amount(order)?, order.premium, rate))
}

/// Live price and premium of an order, with the price rounded to six
/// significant figures.
pub async fn price_and_premium_now(
    rates: &dyn RateSource,
    order: &Order,
) -> Result<(f64, f64), RateError> {
    let rate = rates.exchange_rate(&order.currency).await?;
    price_and_premium_at_rate(order, rate)
}

pub(crate) fn satoshis_at_rate(amount: f64, premium: f64, rate: f64) -> Sats {
    let effective = rate * (1.0 + premium / 100.0);
    Sats(((amount / effective) * SATS_PER_BTC) as i64)
}

pub(crate) fn price_and_premium_at_rate(order: &Order, rate: f64) -> Result<(f64, f64), RateError> {
    if order.is_explicit {
        let satoshis = order.satoshis.ok_or(RateError::MissingAmount)?;
        let order_rate = fiat_amount(order)? / (satoshis.0 as f64 / SATS_PER_BTC);
        let premium = (100.0 * (order_rate / rate - 1.0)).round();
        Ok((
            round_to_significant_figures(order_rate, SIGNIFICANT_DIGITS),
            premium,
        ))
    } else {
        let price = rate * (1.0 + order.premium / 100.0);
        Ok((
            round_to_significant_figures(price, SIGNIFICANT_DIGITS),
            order.premium,
        ))
    }
}

fn fiat_amount(order: &Order) -> Result<f64, RateError> {
    order
        .amount
        .as_ref()
        .and_then(Decimal::to_f64)
        .ok_or(RateError::MissingAmount)
}

/// Rounds the mantissa so the value keeps `figures` significant digits.
/// log10 is undefined at zero, so zero maps to zero.
fn round_to_significant_figures(x: f64, figures: i32) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    let magnitude = x.abs().log10().floor() as i32;
    let factor = 10f64.powi(figures - 1 - magnitude);
    (x * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{NewOrder, Order, Type};
    use crate::user;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn explicit_order(amount: &str, satoshis: i64) -> Order {
        Order::create(
            user::Id(Uuid::from_u128(1)),
            NewOrder {
                order_type: Type::Sell,
                currency: "USD".to_owned(),
                amount: Some(amount.parse().unwrap()),
                satoshis: Some(Sats(satoshis)),
                is_explicit: true,
                premium: 0.0,
            },
            Sats(satoshis),
            Utc::now() + Duration::minutes(5),
        )
    }

    #[test]
    fn relative_order_is_valued_at_the_premium_rate() {
        // 100 USD at 25_000 USD/BTC is 400_000 sats at par.
        assert_eq!(satoshis_at_rate(100.0, 0.0, 25_000.0), Sats(400_000));
        // A 3% premium shrinks the satoshi amount, floored.
        assert_eq!(satoshis_at_rate(100.0, 3.0, 25_000.0), Sats(388_349));
        // A negative premium grows it.
        assert_eq!(satoshis_at_rate(100.0, -3.0, 25_000.0), Sats(412_371));
    }

    #[test]
    fn explicit_order_premium_is_derived_from_its_own_rate() {
        // 105 USD for 400_000 sats is 26_250 USD/BTC, 5% over a 25_000 market.
        let order = explicit_order("105", 400_000);
        let (price, premium) = price_and_premium_at_rate(&order, 25_000.0).unwrap();
        assert_eq!(price, 26_250.0);
        assert_eq!(premium, 5.0);
    }

    #[test]
    fn price_is_rounded_to_six_significant_figures() {
        let order = explicit_order("123.456789", 1_000_000);
        let (price, _) = price_and_premium_at_rate(&order, 12_000.0).unwrap();
        // order rate is 12_345.6789, which rounds to 12_345.7
        assert_eq!(price, 12_345.7);
    }

    #[test]
    fn rounding_handles_small_and_zero_values() {
        assert_eq!(round_to_significant_figures(0.012345678, 6), 0.0123457);
        assert_eq!(round_to_significant_figures(0.0, 6), 0.0);
        assert_eq!(round_to_significant_figures(987654.321, 6), 987654.0);
    }
}

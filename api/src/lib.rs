//! This library contains definitions for the API layer.

use app::{
    database::Database, ln::Lightning, pricing::MarketPriceApi, trade::TradeConfig,
    user::PlatformIdentity,
};
use rocket::{Build, Rocket};
use state::RocketState;

mod access;
mod error;
mod rate_limit;
mod routes;
mod state;

pub use rate_limit::RateLimit;

pub fn register(
    rocket: Rocket<Build>,
    db: Database,
    lightning: Lightning,
    rates: MarketPriceApi,
    trade: TradeConfig,
    platform: PlatformIdentity,
    rate_limit: RateLimit,
) -> Rocket<Build> {
    routes::register(
        rocket,
        RocketState {
            db,
            lightning,
            rates,
            trade,
            platform,
            rate_limit,
        },
    )
}

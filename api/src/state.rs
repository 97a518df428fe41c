use app::{
    database::Database, ln::Lightning, pricing::MarketPriceApi, trade::TradeConfig,
    user::PlatformIdentity,
};

use crate::rate_limit::RateLimit;

pub struct RocketState {
    pub db: Database,
    pub lightning: Lightning,
    pub rates: MarketPriceApi,
    pub trade: TradeConfig,
    pub platform: PlatformIdentity,
    pub rate_limit: RateLimit,
}

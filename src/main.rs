use std::time::Duration;

use app::btc::Sats;
use app::database::{self, run_migrations, seed_development_data};
use app::ln::{self, Lightning};
use app::pricing::MarketPriceApi;
use app::seconds::Seconds;
use app::trade::TradeConfig;
use rocket::{launch, Build, Rocket};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
struct Config {
    database_url: Url,
    lnd: LndConfig,
    trade: TradeParams,
    market_price_api: Url,
    escrow_username: String,
    rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize)]
struct LndConfig {
    url: Url,
    macaroon_path: String,
    cert_path: String,
}

#[derive(Debug, Deserialize)]
struct TradeParams {
    fee: f64,
    bond_size: f64,
    min_trade_sats: i64,
    max_trade_sats: i64,
    exp_maker_bond_invoice_mins: i64,
    exp_taker_bond_invoice_mins: i64,
    exp_trade_escrow_invoice_mins: i64,
    bond_expiry_hours: i64,
    escrow_expiry_hours: i64,
    penalty_timeout_secs: i64,
}

impl TradeParams {
    fn into_trade_config(self) -> TradeConfig {
        TradeConfig {
            fee: self.fee,
            bond_size: self.bond_size,
            min_trade: Sats(self.min_trade_sats),
            max_trade: Sats(self.max_trade_sats),
            exp_maker_bond_invoice: self.exp_maker_bond_invoice_mins,
            exp_taker_bond_invoice: self.exp_taker_bond_invoice_mins,
            exp_trade_escrow_invoice: self.exp_trade_escrow_invoice_mins,
            bond_expiry: self.bond_expiry_hours,
            escrow_expiry: self.escrow_expiry_hours,
            penalty_timeout: Seconds(self.penalty_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitConfig {
    limit: usize,
    span: Duration,
}

impl RateLimitConfig {
    fn into_rate_limit(self) -> api::RateLimit {
        api::RateLimit::new(self.limit, self.span)
    }
}

#[launch]
async fn rocket() -> _ {
    start_server().await
}

async fn start_server() -> Rocket<Build> {
    env_logger::init();

    let rocket = Rocket::build();
    let config: Config = rocket.figment().extract().unwrap();

    let db = database::connect(&config.database_url).await;
    let lightning = Lightning::new(ln::Config {
        endpoint: config.lnd.url,
        macaroon_path: config.lnd.macaroon_path,
        cert_path: config.lnd.cert_path,
    });

    run_migrations(&db).await;
    #[cfg(debug_assertions)]
    seed_development_data(&db).await;

    let platform = app::user::ensure_platform_identity(&db, &config.escrow_username).await;
    let trade_config = config.trade.into_trade_config();
    app::trade::start_worker(db.clone(), &lightning, trade_config.clone()).await;

    api::register(
        rocket,
        db,
        lightning,
        MarketPriceApi::new(config.market_price_api),
        trade_config,
        platform,
        config.rate_limit.into_rate_limit(),
    )
}

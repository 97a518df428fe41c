use crate::{
    access,
    error::{self, JsonError, JsonResult},
    state::RocketState,
};
use app::btc::Sats;
use app::{ln, order, trade};
use chrono::{DateTime, Utc};
use rocket::{get, post, serde::json::Json, State};
use rocket_okapi::openapi;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(super) enum OrderTypeModel {
    Buy,
    Sell,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub(super) struct OrderRequest {
    /// The maker's side of the trade.
    order_type: OrderTypeModel,
    /// Fiat currency code, e.g. "EUR".
    currency: String,
    /// Fiat amount for relative pricing, as a decimal string.
    amount: Option<String>,
    /// True to trade a fixed satoshi amount instead of a fiat amount.
    is_explicit: bool,
    /// Fixed satoshi amount, when explicit.
    satoshis: Option<i64>,
    /// Premium over the market rate, in percent.
    premium: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub(super) struct InvoiceRequest {
    /// BOLT11 payout invoice for the buyer.
    invoice: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub(super) struct RatingRequest {
    /// Rating for the counterparty, 0 to 5.
    rating: i32,
}

#[derive(Debug, Serialize, JsonSchema)]
pub(super) struct OrderResponse {
    order: OrderModel,
}

#[derive(Debug, Serialize, JsonSchema)]
pub(super) struct OrderModel {
    id: Uuid,
    /// Current state of the trade.
    status: &'static str,
    order_type: &'static str,
    currency: String,
    /// Fiat amount, when priced relative to the market.
    amount: Option<String>,
    /// Fixed satoshi amount, when explicit.
    satoshis: Option<i64>,
    premium: f64,
    /// Satoshi value of the order when it was created.
    t0_satoshis: i64,
    /// Trade size frozen at taker-bond time.
    last_satoshis: Option<i64>,
    is_fiat_sent: bool,
    /// True when one party has asked for a collaborative cancellation.
    is_pending_cancel: bool,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub(super) struct BondResponse {
    /// Hold invoice to pay for the bond.
    bond_invoice: String,
    bond_satoshis: i64,
}

#[derive(Debug, Serialize, JsonSchema)]
pub(super) struct EscrowResponse {
    /// Hold invoice to pay for the trade escrow.
    escrow_invoice: String,
    escrow_satoshis: i64,
}

#[derive(Debug, Serialize, JsonSchema)]
pub(super) struct CancelResponse {
    outcome: &'static str,
}

#[derive(Debug, Serialize, JsonSchema)]
pub(super) struct OkResponse {
    ok: bool,
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(super) enum Error {
    /// Order id is not a valid UUID.
    InvalidOrderId,
    /// Order does not exist.
    OrderNotFound,
    /// Fiat amount is not a valid decimal.
    InvalidAmount,
    /// Caller already participates in an order.
    AlreadyInOrder,
    /// Caller is under a cancellation penalty.
    Penalized { seconds: i64 },
    /// Order size is outside the platform limits.
    SizeOutOfLimits,
    /// Amounts must be positive.
    AmountNotPositive,
    /// Order is not public.
    NotPublic,
    /// Makers cannot take their own orders.
    SelfTake,
    /// Order or invoice window expired.
    Expired,
    /// The bond or escrow is already locked.
    AlreadyLocked,
    /// Caller has the wrong role for this operation.
    WrongParty,
    /// The operation does not apply to the order's current state.
    WrongPhase,
    /// Bonds are not locked yet.
    BondsNotLocked,
    /// The buyer has not confirmed the fiat yet.
    FiatNotSent,
    /// The escrow does not cover the payout.
    EscrowImbalance,
    /// The escrow is not settled on the node.
    EscrowNotSettled,
    /// The node refused to settle a hold invoice.
    SettleFailed,
    /// This order cannot be cancelled by this caller right now.
    CannotCancel,
    /// The trade is not finished yet.
    CannotRateYet,
    /// Ratings go from 0 to 5.
    InvalidRating,
    /// The market price source is unavailable.
    PricingUnavailable,
    /// The submitted invoice failed validation.
    InvalidInvoice,
    /// The payout failed on the Lightning side.
    PaymentFailed,
    /// Concurrent mutation could not be reconciled.
    Conflict,
}

impl OrderModel {
    fn from_entity(order: &order::Order) -> Self {
        Self {
            id: order.id.0,
            status: status_label(order.status),
            order_type: match order.order_type {
                order::Type::Buy => "BUY",
                order::Type::Sell => "SELL",
            },
            currency: order.currency.clone(),
            amount: order.amount.map(|amount| amount.to_string()),
            satoshis: order.satoshis.map(|sats| sats.0),
            premium: order.premium,
            t0_satoshis: order.t0_satoshis.0,
            last_satoshis: order.last_satoshis.map(|sats| sats.0),
            is_fiat_sent: order.is_fiat_sent,
            is_pending_cancel: order.is_pending_cancel(),
            created_at: order.created_at,
            expires_at: order.expires_at,
        }
    }
}

fn status_label(status: order::Status) -> &'static str {
    match status {
        order::Status::WaitingForMakerBond => "WAITING_FOR_MAKER_BOND",
        order::Status::Public => "PUBLIC",
        order::Status::Taken => "TAKEN",
        order::Status::WaitingForBoth => "WAITING_FOR_BOTH",
        order::Status::WaitingForEscrow => "WAITING_FOR_ESCROW",
        order::Status::WaitingForInvoice => "WAITING_FOR_INVOICE",
        order::Status::Chat => "CHAT",
        order::Status::FiatSent => "FIAT_SENT",
        order::Status::PayingBuyer => "PAYING_BUYER",
        order::Status::Success => "SUCCESS",
        order::Status::Cancelled => "CANCELLED",
        order::Status::Expired => "EXPIRED",
        order::Status::Disputed => "DISPUTED",
    }
}

fn map_error(e: trade::Error) -> JsonError<Error> {
    let description = e.to_string();
    let status = match e {
        trade::Error::AlreadyMaker | trade::Error::AlreadyTaker => Error::AlreadyInOrder,
        trade::Error::Penalized(seconds) => Error::Penalized { seconds },
        trade::Error::OrderTooBig { .. } | trade::Error::OrderTooSmall { .. } => {
            Error::SizeOutOfLimits
        }
        trade::Error::AmountNotPositive => Error::AmountNotPositive,
        trade::Error::OrderNotFound => Error::OrderNotFound,
        trade::Error::NotPublic => Error::NotPublic,
        trade::Error::SelfTake => Error::SelfTake,
        trade::Error::OrderExpired
        | trade::Error::TakerBondInvoiceExpired
        | trade::Error::EscrowInvoiceExpired => Error::Expired,
        trade::Error::BondAlreadyLocked | trade::Error::EscrowAlreadyLocked => {
            Error::AlreadyLocked
        }
        trade::Error::NotMaker
        | trade::Error::NotTaker
        | trade::Error::NotBuyer
        | trade::Error::NotSeller
        | trade::Error::NotParticipant => Error::WrongParty,
        trade::Error::NotTakenYet | trade::Error::WrongPhase => Error::WrongPhase,
        trade::Error::BondsNotLocked => Error::BondsNotLocked,
        trade::Error::CannotConfirmFiat => Error::WrongPhase,
        trade::Error::FiatNotSent => Error::FiatNotSent,
        trade::Error::EscrowImbalance => Error::EscrowImbalance,
        trade::Error::EscrowNotSettled => Error::EscrowNotSettled,
        trade::Error::SettleFailed => Error::SettleFailed,
        trade::Error::CannotCancel => Error::CannotCancel,
        trade::Error::CannotRateYet => Error::CannotRateYet,
        trade::Error::InvalidRating => Error::InvalidRating,
        trade::Error::CannotDispute => Error::WrongPhase,
        trade::Error::Pricing(_) => Error::PricingUnavailable,
        trade::Error::InvalidInvoice(_) => Error::InvalidInvoice,
        trade::Error::Payment(_) => Error::PaymentFailed,
        trade::Error::Conflict(_) => return error::concurrency_error(Error::Conflict),
    };
    error::bad_request(status, description)
}

fn parse_order_id(order_id: &str) -> Result<order::Id, JsonError<Error>> {
    Uuid::from_str(order_id)
        .map(order::Id)
        .map_err(|_| error::bad_request(Error::InvalidOrderId, "not a valid order id".to_owned()))
}

/// Create a new order. The order stays off the book until the maker bond is
/// locked.
#[openapi(tag = "Orders")]
#[post("/orders", data = "<req>")]
pub(super) async fn post(
    state: &State<RocketState>,
    session: access::Session,
    req: Json<OrderRequest>,
) -> JsonResult<OrderResponse, Error> {
    let amount = match &req.amount {
        Some(amount) => Some(Decimal::from_str(amount).map_err(|_| {
            error::bad_request(Error::InvalidAmount, "amount is not a decimal".to_owned())
        })?),
        None => None,
    };
    let new = order::NewOrder {
        order_type: match req.order_type {
            OrderTypeModel::Buy => order::Type::Buy,
            OrderTypeModel::Sell => order::Type::Sell,
        },
        currency: req.currency.clone(),
        amount,
        satoshis: req.satoshis.map(Sats),
        is_explicit: req.is_explicit,
        premium: req.premium.unwrap_or(0.0),
    };
    app::trade::make(
        &state.db,
        &state.rates,
        &state.trade,
        session.user_id(),
        new,
    )
    .await
    .map(|order| {
        Json(OrderResponse {
            order: OrderModel::from_entity(&order),
        })
    })
    .map_err(map_error)
}

/// Get order details.
#[openapi(tag = "Orders")]
#[get("/orders/<order_id>")]
pub(super) async fn get(
    state: &State<RocketState>,
    _session: access::Session,
    order_id: String,
) -> Option<Json<OrderResponse>> {
    match Uuid::from_str(&order_id) {
        Ok(order_id) => app::order::get(&state.db, order::Id(order_id))
            .await
            .map(|order| {
                Json(OrderResponse {
                    order: OrderModel::from_entity(&order),
                })
            }),
        Err(_) => None,
    }
}

/// Take a public order.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/take")]
pub(super) async fn take(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<OrderResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::take(&state.db, order_id, session.user_id())
        .await
        .map(|order| {
            Json(OrderResponse {
                order: OrderModel::from_entity(&order),
            })
        })
        .map_err(map_error)
}

/// Fetch the maker bond hold invoice, generating it on first call.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/maker-bond")]
pub(super) async fn maker_bond(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<BondResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::gen_maker_hold_invoice(
        &state.db,
        &state.lightning,
        &state.rates,
        &state.trade,
        state.platform,
        order_id,
        session.user_id(),
    )
    .await
    .map(|bond| {
        Json(BondResponse {
            bond_invoice: bond.invoice.0,
            bond_satoshis: bond.bond_satoshis.0,
        })
    })
    .map_err(map_error)
}

/// Fetch the taker bond hold invoice, generating it on first call. This
/// freezes the trade size.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/taker-bond")]
pub(super) async fn taker_bond(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<BondResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::gen_taker_hold_invoice(
        &state.db,
        &state.lightning,
        &state.rates,
        &state.trade,
        state.platform,
        order_id,
        session.user_id(),
    )
    .await
    .map(|bond| {
        Json(BondResponse {
            bond_invoice: bond.invoice.0,
            bond_satoshis: bond.bond_satoshis.0,
        })
    })
    .map_err(map_error)
}

/// Fetch the trade escrow hold invoice for the seller, generating it on
/// first call.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/escrow")]
pub(super) async fn escrow(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<EscrowResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::gen_escrow_hold_invoice(
        &state.db,
        &state.lightning,
        &state.trade,
        state.platform,
        order_id,
        session.user_id(),
    )
    .await
    .map(|escrow| {
        Json(EscrowResponse {
            escrow_invoice: escrow.invoice.0,
            escrow_satoshis: escrow.escrow_satoshis.0,
        })
    })
    .map_err(map_error)
}

/// Submit or replace the buyer payout invoice.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/invoice", data = "<req>")]
pub(super) async fn submit_invoice(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
    req: Json<InvoiceRequest>,
) -> JsonResult<OkResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::update_invoice(
        &state.db,
        &state.trade,
        state.platform,
        order_id,
        session.user_id(),
        ln::RawInvoice(req.invoice.clone()),
    )
    .await
    .map(|()| Json(OkResponse { ok: true }))
    .map_err(map_error)
}

/// Cancel an order. The effect depends on how far the trade has progressed.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/cancel")]
pub(super) async fn cancel(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<CancelResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::cancel_order(
        &state.db,
        &state.lightning,
        &state.trade,
        order_id,
        session.user_id(),
    )
    .await
    .map(|outcome| {
        Json(CancelResponse {
            outcome: match outcome {
                trade::CancelOutcome::Cancelled => "CANCELLED",
                trade::CancelOutcome::Republished => "REPUBLISHED",
                trade::CancelOutcome::CancelPending => "CANCEL_PENDING",
            },
        })
    })
    .map_err(map_error)
}

/// Confirm the fiat payment. Buyers confirm sending, sellers confirm
/// receiving; the seller's confirmation releases the payout.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/confirm-fiat")]
pub(super) async fn confirm_fiat(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<OkResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::confirm_fiat(&state.db, &state.lightning, order_id, session.user_id())
        .await
        .map(|()| Json(OkResponse { ok: true }))
        .map_err(map_error)
}

/// Open a dispute on an active trade.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/dispute")]
pub(super) async fn dispute(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
) -> JsonResult<OkResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::open_dispute(&state.db, order_id, session.user_id())
        .await
        .map(|()| Json(OkResponse { ok: true }))
        .map_err(map_error)
}

/// Rate the counterparty after the trade finished.
#[openapi(tag = "Orders")]
#[post("/orders/<order_id>/rate", data = "<req>")]
pub(super) async fn rate(
    state: &State<RocketState>,
    session: access::Session,
    order_id: String,
    req: Json<RatingRequest>,
) -> JsonResult<OkResponse, Error> {
    let order_id = parse_order_id(&order_id)?;
    app::trade::rate_counterparty(&state.db, order_id, session.user_id(), req.rating)
        .await
        .map(|()| Json(OkResponse { ok: true }))
        .map_err(map_error)
}

//! The trade pipeline: order lifecycle, collateral orchestration and the
//! economic rules tying them together.
//!
//! Every operation follows the same discipline: snapshot the order, check
//! legality, perform the Lightning side effects, then commit a reconciled
//! mutation that re-verifies its preconditions under the order's revision
//! lock. The long node RPCs never run inside a commit.

use crate::btc::Sats;
use crate::concurrency::{self, ConflictError};
use crate::database::Database;
use crate::ln::{self, Lightning};
use crate::seconds::Seconds;
use crate::{order, payment, pricing, user, worker};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::time::Duration as StdDuration;
use thiserror::Error;

/// Economic and timing parameters of the trade pipeline.
#[derive(Debug, Clone)]
pub struct TradeConfig {
    /// Fractional trading fee charged on the buyer payout.
    pub fee: f64,
    /// Fractional bond size relative to the trade amount.
    pub bond_size: f64,
    pub min_trade: Sats,
    pub max_trade: Sats,
    /// Minutes a generated bond or escrow invoice may stay unlocked before
    /// the order falls back.
    pub exp_maker_bond_invoice: i64,
    pub exp_taker_bond_invoice: i64,
    pub exp_trade_escrow_invoice: i64,
    /// Hold-invoice expiries handed to the node, in hours.
    pub bond_expiry: i64,
    pub escrow_expiry: i64,
    /// Lock-out after abandoning a taken order.
    pub penalty_timeout: Seconds,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("you are already maker of an order")]
    AlreadyMaker,
    #[error("you are already taker of an order")]
    AlreadyTaker,
    #[error("you need to wait {0} seconds to make or take an order")]
    Penalized(i64),
    #[error("your order is too big, it is worth {actual} sats now but the limit is {limit} sats")]
    OrderTooBig { actual: i64, limit: i64 },
    #[error(
        "your order is too small, it is worth {actual} sats now but the limit is {limit} sats"
    )]
    OrderTooSmall { actual: i64, limit: i64 },
    #[error("the order must name a positive amount")]
    AmountNotPositive,
    #[error("order not found")]
    OrderNotFound,
    #[error("this order is not public")]
    NotPublic,
    #[error("you cannot take your own order")]
    SelfTake,
    #[error("invoice expired, you did not confirm publishing the order in time, make a new order")]
    OrderExpired,
    #[error("invoice expired, you did not confirm taking the order in time")]
    TakerBondInvoiceExpired,
    #[error("invoice expired, you did not lock the trade escrow in time")]
    EscrowInvoiceExpired,
    #[error("the bond is already locked")]
    BondAlreadyLocked,
    #[error("the escrow is already locked")]
    EscrowAlreadyLocked,
    #[error("only the maker of this order can do that")]
    NotMaker,
    #[error("only the taker of this order can do that")]
    NotTaker,
    #[error("only the buyer of this order can provide a payout invoice")]
    NotBuyer,
    #[error("only the seller of this order can do that")]
    NotSeller,
    #[error("you are not a participant of this order")]
    NotParticipant,
    #[error("wait for your order to be taken")]
    NotTakenYet,
    #[error("you cannot submit an invoice while the bonds are not locked")]
    BondsNotLocked,
    #[error("you cannot confirm the fiat payment at this stage")]
    CannotConfirmFiat,
    #[error("the buyer has not confirmed sending the fiat yet")]
    FiatNotSent,
    #[error("the escrow does not cover the payout, report this in the public channels")]
    EscrowImbalance,
    #[error("the escrow is not settled")]
    EscrowNotSettled,
    #[error("the hold invoice could not be settled")]
    SettleFailed,
    #[error("you cannot cancel this order")]
    CannotCancel,
    #[error("you cannot rate your counterparty yet")]
    CannotRateYet,
    #[error("ratings go from 0 to 5")]
    InvalidRating,
    #[error("you cannot open a dispute at this stage")]
    CannotDispute,
    #[error("this operation does not apply to the order's current state")]
    WrongPhase,
    #[error("market price is unavailable")]
    Pricing(#[from] pricing::RateError),
    #[error("{0}")]
    InvalidInvoice(#[from] ln::InvoiceError),
    #[error("the payout failed: {0}")]
    Payment(#[from] ln::PaymentError),
    #[error("{0:?}")]
    Conflict(#[from] ConflictError),
}

#[derive(Debug)]
pub struct BondInvoice {
    pub invoice: ln::RawInvoice,
    pub bond_satoshis: Sats,
}

#[derive(Debug)]
pub struct EscrowInvoice {
    pub invoice: ln::RawInvoice,
    pub escrow_satoshis: Sats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The order is cancelled for good.
    Cancelled,
    /// The order went back on the book.
    Republished,
    /// Collaborative cancellation recorded; waiting for the counterparty.
    CancelPending,
}

/// Remaining penalty seconds, if the user is currently locked out.
pub async fn is_penalized(db: &Database, user: user::Id) -> Option<i64> {
    user::profile(db, user).await.penalty_remaining(Utc::now())
}

/// Creates an order. The satoshi value at creation time must fall within the
/// platform trade limits.
pub async fn make(
    db: &Database,
    rates: &dyn pricing::RateSource,
    cfg: &TradeConfig,
    maker: user::Id,
    new: order::NewOrder,
) -> Result<order::Order, Error> {
    if let Some(seconds) = is_penalized(db, maker).await {
        return Err(Error::Penalized(seconds));
    }
    match order::active_role_of(db, maker).await {
        Some(order::Role::Maker) => return Err(Error::AlreadyMaker),
        Some(order::Role::Taker) => return Err(Error::AlreadyTaker),
        None => {}
    }
    if new.is_explicit && new.satoshis.unwrap_or_default() <= Sats(0) {
        return Err(Error::AmountNotPositive);
    }
    if !new.is_explicit && new.amount.unwrap_or_default() <= Decimal::ZERO {
        return Err(Error::AmountNotPositive);
    }

    let expires_at = Utc::now() + Duration::minutes(cfg.exp_maker_bond_invoice);
    let mut order = order::Order::create(maker, new, Sats(0), expires_at);
    let t0_satoshis = pricing::satoshis_now(rates, &order).await?;
    if t0_satoshis > cfg.max_trade {
        return Err(Error::OrderTooBig {
            actual: t0_satoshis.0,
            limit: cfg.max_trade.0,
        });
    }
    if t0_satoshis < cfg.min_trade {
        return Err(Error::OrderTooSmall {
            actual: t0_satoshis.0,
            limit: cfg.min_trade.0,
        });
    }
    order.t0_satoshis = t0_satoshis;

    let mut data_tx = db.begin().await.unwrap();
    order::insert(&mut data_tx, &order).await;
    data_tx.commit().await.unwrap();
    Ok(order)
}

/// Takes a public order.
pub async fn take(
    db: &Database,
    order_id: order::Id,
    user: user::Id,
) -> Result<order::Order, Error> {
    if let Some(seconds) = is_penalized(db, user).await {
        return Err(Error::Penalized(seconds));
    }
    match order::active_role_of(db, user).await {
        Some(order::Role::Maker) => return Err(Error::AlreadyMaker),
        Some(order::Role::Taker) => return Err(Error::AlreadyTaker),
        None => {}
    }
    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if order.status != order::Status::Public {
            return Err(Error::NotPublic);
        }
        if order.maker == Some(user) {
            return Err(Error::SelfTake);
        }
        order.set_taker(user);
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(order)
    })
    .await
}

/// Generates (or re-fetches) the maker bond hold invoice. Calling again while
/// the invoice is unpaid returns the same invoice.
pub async fn gen_maker_hold_invoice(
    db: &Database,
    lightning: &Lightning,
    rates: &dyn pricing::RateSource,
    cfg: &TradeConfig,
    platform: user::PlatformIdentity,
    order_id: order::Id,
    user: user::Id,
) -> Result<BondInvoice, Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if order.maker != Some(user) {
        return Err(Error::NotMaker);
    }
    if order.status == order::Status::WaitingForMakerBond && order.expires_at < Utc::now() {
        expire_order(db, order_id).await?;
        return Err(Error::OrderExpired);
    }
    if let Some(bond_id) = order.maker_bond {
        let bond = payment::get(db, bond_id)
            .await
            .expect("linked maker bond record missing");
        if bond.status == payment::Status::Generated {
            // the lock may have landed since the last poll
            let mut node = lightning.create_node().await;
            if node.validate_hold_invoice_locked(&bond.payment_hash).await {
                apply_hold_locked(db, lightning, order_id, bond_id).await?;
                return Err(Error::BondAlreadyLocked);
            }
            return Ok(BondInvoice {
                invoice: bond.invoice,
                bond_satoshis: bond.amount,
            });
        }
        return Err(Error::BondAlreadyLocked);
    }
    if order.status != order::Status::WaitingForMakerBond {
        return Err(Error::WrongPhase);
    }

    let last_satoshis = pricing::satoshis_now(rates, &order).await?;
    let bond_satoshis = bond_satoshis(last_satoshis, cfg.bond_size);
    let description = format!(
        "Publishing order {}. This maker bond freezes in your wallet and returns automatically. It is charged if you cheat or cancel.",
        order.id.0
    );
    let mut node = lightning.create_node().await;
    let hold = node
        .gen_hold_invoice(bond_satoshis, description.clone(), Seconds::hours(cfg.bond_expiry))
        .await;
    let bond = payment::LnPayment::new_hold(
        payment::Concept::MakerBond,
        user,
        platform.user_id,
        hold,
        bond_satoshis,
        description,
    );
    let deadline = bond.created_at + Duration::minutes(cfg.exp_maker_bond_invoice);

    let result = concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if let Some(existing_id) = order.maker_bond {
            // a concurrent request won; hand out its invoice instead
            let existing = payment::get_in_tx(&mut data_tx, existing_id)
                .await
                .expect("linked maker bond record missing");
            return match existing.status {
                payment::Status::Generated => Ok(BondInvoice {
                    invoice: existing.invoice,
                    bond_satoshis: existing.amount,
                }),
                _ => Err(Error::BondAlreadyLocked),
            };
        }
        if order.status != order::Status::WaitingForMakerBond {
            return Err(Error::WrongPhase);
        }
        payment::upsert(&mut data_tx, &bond).await;
        order.last_satoshis = Some(last_satoshis);
        order.maker_bond = Some(bond.id);
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(BondInvoice {
            invoice: bond.invoice.clone(),
            bond_satoshis,
        })
    })
    .await?;
    spawn_lock_watcher(
        db.clone(),
        lightning.clone(),
        order_id,
        bond.id,
        bond.payment_hash.clone(),
        deadline,
    );
    Ok(result)
}

/// Generates (or re-fetches) the taker bond hold invoice. This is the
/// amount-locking point of the trade: the size is valued here and frozen for
/// the rest of the flow.
pub async fn gen_taker_hold_invoice(
    db: &Database,
    lightning: &Lightning,
    rates: &dyn pricing::RateSource,
    cfg: &TradeConfig,
    platform: user::PlatformIdentity,
    order_id: order::Id,
    user: user::Id,
) -> Result<BondInvoice, Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if order.taker != Some(user) {
        return Err(Error::NotTaker);
    }
    if let Some(bond_id) = order.taker_bond {
        let bond = payment::get(db, bond_id)
            .await
            .expect("linked taker bond record missing");
        if bond.status != payment::Status::Generated {
            return Err(Error::BondAlreadyLocked);
        }
        if bond.created_at + Duration::minutes(cfg.exp_taker_bond_invoice) < Utc::now() {
            execute_cancel(db, lightning, cfg, order_id, user, order::CancelPhase::TakerPreBond)
                .await?;
            return Err(Error::TakerBondInvoiceExpired);
        }
        return Ok(BondInvoice {
            invoice: bond.invoice,
            bond_satoshis: bond.amount,
        });
    }
    if order.status != order::Status::Taken {
        return Err(Error::WrongPhase);
    }

    // locks the amount of satoshis for the trade
    let last_satoshis = pricing::satoshis_now(rates, &order).await?;
    let bond_satoshis = bond_satoshis(last_satoshis, cfg.bond_size);
    let description = format!(
        "Taking order {}. This taker bond freezes in your wallet and returns automatically. It is charged if you cheat or cancel.",
        order.id.0
    );
    let mut node = lightning.create_node().await;
    let hold = node
        .gen_hold_invoice(bond_satoshis, description.clone(), Seconds::hours(cfg.bond_expiry))
        .await;
    let bond = payment::LnPayment::new_hold(
        payment::Concept::TakerBond,
        user,
        platform.user_id,
        hold,
        bond_satoshis,
        description,
    );
    let deadline = bond.created_at + Duration::minutes(cfg.exp_taker_bond_invoice);

    let result = concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if let Some(existing_id) = order.taker_bond {
            let existing = payment::get_in_tx(&mut data_tx, existing_id)
                .await
                .expect("linked taker bond record missing");
            return match existing.status {
                payment::Status::Generated => Ok(BondInvoice {
                    invoice: existing.invoice,
                    bond_satoshis: existing.amount,
                }),
                _ => Err(Error::BondAlreadyLocked),
            };
        }
        if order.status != order::Status::Taken || order.taker != Some(user) {
            return Err(Error::WrongPhase);
        }
        payment::upsert(&mut data_tx, &bond).await;
        order.last_satoshis = Some(last_satoshis);
        order.taker_bond = Some(bond.id);
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(BondInvoice {
            invoice: bond.invoice.clone(),
            bond_satoshis,
        })
    })
    .await?;
    spawn_lock_watcher(
        db.clone(),
        lightning.clone(),
        order_id,
        bond.id,
        bond.payment_hash.clone(),
        deadline,
    );
    Ok(result)
}

/// Generates (or re-fetches) the trade escrow hold invoice for the seller.
/// The escrow amount is the trade size frozen at taker-bond time.
pub async fn gen_escrow_hold_invoice(
    db: &Database,
    lightning: &Lightning,
    cfg: &TradeConfig,
    platform: user::PlatformIdentity,
    order_id: order::Id,
    user: user::Id,
) -> Result<EscrowInvoice, Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if !order.is_seller(user) {
        return Err(Error::NotSeller);
    }
    if let Some(escrow_id) = order.trade_escrow {
        let escrow = payment::get(db, escrow_id)
            .await
            .expect("linked escrow record missing");
        if escrow.status != payment::Status::Generated {
            return Err(Error::EscrowAlreadyLocked);
        }
        if escrow.created_at + Duration::minutes(cfg.exp_trade_escrow_invoice) < Utc::now() {
            let phase = order.cancel_phase(user).ok_or(Error::CannotCancel)?;
            execute_cancel(db, lightning, cfg, order_id, user, phase).await?;
            return Err(Error::EscrowInvoiceExpired);
        }
        return Ok(EscrowInvoice {
            invoice: escrow.invoice,
            escrow_satoshis: escrow.amount,
        });
    }
    if !matches!(
        order.status,
        order::Status::WaitingForBoth | order::Status::WaitingForEscrow
    ) {
        return Err(Error::WrongPhase);
    }
    let escrow_satoshis = order.last_satoshis.ok_or(Error::WrongPhase)?;
    let description = format!(
        "Escrow amount for order {}. It is released to the buyer once you confirm receiving the fiat, and returns automatically if the buyer does not pay.",
        order.id.0
    );
    let mut node = lightning.create_node().await;
    let hold = node
        .gen_hold_invoice(
            escrow_satoshis,
            description.clone(),
            Seconds::hours(cfg.escrow_expiry),
        )
        .await;
    let escrow = payment::LnPayment::new_hold(
        payment::Concept::TradeEscrow,
        user,
        platform.user_id,
        hold,
        escrow_satoshis,
        description,
    );
    let deadline = escrow.created_at + Duration::minutes(cfg.exp_trade_escrow_invoice);

    let result = concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if let Some(existing_id) = order.trade_escrow {
            let existing = payment::get_in_tx(&mut data_tx, existing_id)
                .await
                .expect("linked escrow record missing");
            return match existing.status {
                payment::Status::Generated => Ok(EscrowInvoice {
                    invoice: existing.invoice,
                    escrow_satoshis: existing.amount,
                }),
                _ => Err(Error::EscrowAlreadyLocked),
            };
        }
        if !matches!(
            order.status,
            order::Status::WaitingForBoth | order::Status::WaitingForEscrow
        ) {
            return Err(Error::WrongPhase);
        }
        payment::upsert(&mut data_tx, &escrow).await;
        order.trade_escrow = Some(escrow.id);
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(EscrowInvoice {
            invoice: escrow.invoice.clone(),
            escrow_satoshis,
        })
    })
    .await?;
    spawn_lock_watcher(
        db.clone(),
        lightning.clone(),
        order_id,
        escrow.id,
        escrow.payment_hash.clone(),
        deadline,
    );
    Ok(result)
}

/// Accepts (or replaces) the buyer's payout invoice. The amount must equal
/// the frozen trade size minus the trading fee, exactly.
pub async fn update_invoice(
    db: &Database,
    cfg: &TradeConfig,
    platform: user::PlatformIdentity,
    order_id: order::Id,
    user: user::Id,
    invoice: ln::RawInvoice,
) -> Result<(), Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if !order.is_buyer(user) {
        return Err(Error::NotBuyer);
    }
    let taker_bond_id = order.taker_bond.ok_or(Error::NotTakenYet)?;
    let maker_bond_id = order.maker_bond.ok_or(Error::BondsNotLocked)?;
    for bond_id in [maker_bond_id, taker_bond_id] {
        let bond = payment::get(db, bond_id)
            .await
            .expect("linked bond record missing");
        if bond.status != payment::Status::Locked {
            return Err(Error::BondsNotLocked);
        }
    }
    let last_satoshis = order
        .last_satoshis
        .expect("amount is frozen once the taker bond exists");
    let num_satoshis = payout_satoshis(last_satoshis, cfg.fee);
    // validate eagerly so a bad invoice never reaches the commit path
    ln::validate_ln_invoice(&invoice, num_satoshis)?;

    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if !order.is_buyer(user) {
            return Err(Error::NotBuyer);
        }
        let validated = ln::validate_ln_invoice(&invoice, num_satoshis)?;
        let escrow_locked = match order.trade_escrow {
            Some(escrow_id) => {
                let escrow = payment::get_in_tx(&mut data_tx, escrow_id)
                    .await
                    .expect("linked escrow record missing");
                escrow.status == payment::Status::Locked
            }
            None => false,
        };
        let buyer_invoice = match order.buyer_invoice {
            // replacement: the buyer may swap invoices until the seller acts
            Some(existing_id) => {
                let mut existing = payment::get_in_tx(&mut data_tx, existing_id)
                    .await
                    .expect("linked buyer invoice record missing");
                if existing.status != payment::Status::Validated {
                    return Err(Error::WrongPhase);
                }
                existing.replace_invoice(invoice.clone(), validated, num_satoshis);
                existing
            }
            None => payment::LnPayment::new_buyer_invoice(
                platform.user_id,
                user,
                invoice.clone(),
                validated,
                num_satoshis,
            ),
        };
        match order.status {
            order::Status::WaitingForBoth
            | order::Status::WaitingForEscrow
            | order::Status::WaitingForInvoice
            | order::Status::Chat
            | order::Status::FiatSent => order.buyer_invoice_accepted(escrow_locked),
            _ => return Err(Error::WrongPhase),
        }
        payment::upsert(&mut data_tx, &buyer_invoice).await;
        order.buyer_invoice = Some(buyer_invoice.id);
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(())
    })
    .await
}

/// Cancels an order on behalf of a participant, applying the phase rules.
pub async fn cancel_order(
    db: &Database,
    lightning: &Lightning,
    cfg: &TradeConfig,
    order_id: order::Id,
    user: user::Id,
) -> Result<CancelOutcome, Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    let phase = order.cancel_phase(user).ok_or(Error::CannotCancel)?;
    execute_cancel(db, lightning, cfg, order_id, user, phase).await
}

/// Confirms the fiat leg. The buyer's confirmation settles the escrow; the
/// seller's confirmation releases the payout.
pub async fn confirm_fiat(
    db: &Database,
    lightning: &Lightning,
    order_id: order::Id,
    user: user::Id,
) -> Result<(), Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if !matches!(
        order.status,
        order::Status::Chat | order::Status::FiatSent
    ) {
        return Err(Error::CannotConfirmFiat);
    }
    if order.is_buyer(user) {
        confirm_fiat_sent(db, lightning, &order).await
    } else if order.is_seller(user) {
        confirm_fiat_received(db, lightning, &order).await
    } else {
        Err(Error::NotParticipant)
    }
}

/// Buyer side: settle the escrow (the irreversible preimage reveal) and mark
/// the fiat as sent.
async fn confirm_fiat_sent(
    db: &Database,
    lightning: &Lightning,
    order: &order::Order,
) -> Result<(), Error> {
    let escrow_id = order.trade_escrow.ok_or(Error::CannotConfirmFiat)?;
    let escrow = payment::get(db, escrow_id)
        .await
        .expect("linked escrow record missing");
    let preimage = escrow
        .preimage
        .clone()
        .expect("hold invoices carry their preimage");
    let mut node = lightning.create_node().await;
    if !node.settle_hold_invoice(&preimage).await {
        return Err(Error::SettleFailed);
    }
    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order.id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if !matches!(
            order.status,
            order::Status::Chat | order::Status::FiatSent
        ) {
            return Err(Error::CannotConfirmFiat);
        }
        let mut escrow = payment::get_in_tx(&mut data_tx, escrow_id)
            .await
            .expect("linked escrow record missing");
        escrow.settle();
        order.fiat_sent();
        payment::upsert(&mut data_tx, &escrow).await;
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(())
    })
    .await
}

/// Seller side: verify the escrow really settled, then pay the buyer.
async fn confirm_fiat_received(
    db: &Database,
    lightning: &Lightning,
    order: &order::Order,
) -> Result<(), Error> {
    if !order.is_fiat_sent {
        return Err(Error::FiatNotSent);
    }
    let escrow_id = order.trade_escrow.ok_or(Error::CannotConfirmFiat)?;
    let invoice_id = order.buyer_invoice.ok_or(Error::CannotConfirmFiat)?;
    let escrow = payment::get(db, escrow_id)
        .await
        .expect("linked escrow record missing");
    let buyer_invoice = payment::get(db, invoice_id)
        .await
        .expect("linked buyer invoice record missing");
    if escrow.amount < buyer_invoice.amount {
        log::error!(
            "order {:?} escrow {} sats does not cover payout {} sats",
            order.id,
            escrow.amount.0,
            buyer_invoice.amount.0
        );
        return Err(Error::EscrowImbalance);
    }
    let mut node = lightning.create_node().await;
    if !node.double_check_htlc_is_settled(&escrow.payment_hash).await {
        return Err(Error::EscrowNotSettled);
    }
    node.pay_invoice(&buyer_invoice.invoice, buyer_invoice.amount)
        .await?;
    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order.id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if order.status != order::Status::FiatSent {
            return Err(Error::CannotConfirmFiat);
        }
        let mut buyer_invoice = payment::get_in_tx(&mut data_tx, invoice_id)
            .await
            .expect("linked buyer invoice record missing");
        buyer_invoice.start_paying();
        order.paying_buyer();
        payment::upsert(&mut data_tx, &buyer_invoice).await;
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(())
    })
    .await
}

/// Rates the counterparty once the trade is past the payout.
pub async fn rate_counterparty(
    db: &Database,
    order_id: order::Id,
    user: user::Id,
    rating: i32,
) -> Result<(), Error> {
    if !(0..=5).contains(&rating) {
        return Err(Error::InvalidRating);
    }
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if order.status <= order::Status::PayingBuyer {
        return Err(Error::CannotRateYet);
    }
    let counterparty = match order.role_of(user) {
        Some(order::Role::Maker) => order.taker,
        Some(order::Role::Taker) => order.maker,
        None => return Err(Error::NotParticipant),
    }
    .ok_or(Error::CannotRateYet)?;
    let mut data_tx = db.begin().await.unwrap();
    let mut profile = user::profile_in_tx(&mut data_tx, counterparty).await;
    profile.add_rating(rating);
    user::update_profile(&mut data_tx, &profile).await;
    data_tx.commit().await.unwrap();
    Ok(())
}

/// Records a dispute. Arbitration happens outside this core.
pub async fn open_dispute(
    db: &Database,
    order_id: order::Id,
    user: user::Id,
) -> Result<(), Error> {
    let order = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    if order.role_of(user).is_none() {
        return Err(Error::NotParticipant);
    }
    if !matches!(
        order.status,
        order::Status::Chat | order::Status::FiatSent
    ) {
        return Err(Error::CannotDispute);
    }
    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if !matches!(
            order.status,
            order::Status::Chat | order::Status::FiatSent
        ) {
            return Err(Error::CannotDispute);
        }
        order.dispute();
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(())
    })
    .await
}

/// Bond collateral for a trade size, floored.
fn bond_satoshis(trade: Sats, bond_size: f64) -> Sats {
    Sats((trade.0 as f64 * bond_size) as i64)
}

/// Buyer payout for a trade size after the trading fee, floored.
fn payout_satoshis(trade: Sats, fee: f64) -> Sats {
    Sats((trade.0 as f64 * (1.0 - fee)) as i64)
}

/// Which Lightning effect a cancellation applies to a linked payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldAction {
    /// Settle the bond; the canceller loses it to the platform.
    Forfeit,
    /// Cancel the hold; the collateral returns to its payer.
    Release,
    /// The invoice was never used; mark it garbage.
    Discard,
}

/// Applies one row of the phased cancellation table. The Lightning side
/// effects run first; the commit then re-verifies the phase under the
/// revision lock and mutates the order and its payment records together.
async fn execute_cancel(
    db: &Database,
    lightning: &Lightning,
    cfg: &TradeConfig,
    order_id: order::Id,
    user: user::Id,
    phase: order::CancelPhase,
) -> Result<CancelOutcome, Error> {
    use order::CancelPhase::*;

    let snapshot = order::get(db, order_id).await.ok_or(Error::OrderNotFound)?;
    let mut plan: Vec<(payment::Id, HoldAction)> = Vec::new();
    let mut planned_finalize = false;
    match phase {
        AlreadyCancelled => return Ok(CancelOutcome::Cancelled),
        MakerPreBond => {
            if let Some(id) = snapshot.maker_bond {
                plan.push((id, HoldAction::Discard));
            }
        }
        MakerPublic => {
            let bond_id = snapshot.maker_bond.ok_or(Error::CannotCancel)?;
            plan.push((bond_id, HoldAction::Forfeit));
        }
        TakerPreBond => {
            if let Some(id) = snapshot.taker_bond {
                plan.push((id, HoldAction::Discard));
            }
        }
        MakerMidTrade => {
            let bond_id = snapshot.maker_bond.ok_or(Error::CannotCancel)?;
            plan.push((bond_id, HoldAction::Forfeit));
            if let Some(id) = snapshot.taker_bond {
                plan.push((id, HoldAction::Release));
            }
            if let Some(id) = snapshot.trade_escrow {
                plan.push((id, HoldAction::Release));
            }
            if let Some(id) = snapshot.buyer_invoice {
                plan.push((id, HoldAction::Discard));
            }
        }
        TakerMidTrade => {
            let bond_id = snapshot.taker_bond.ok_or(Error::CannotCancel)?;
            plan.push((bond_id, HoldAction::Forfeit));
            if let Some(id) = snapshot.trade_escrow {
                plan.push((id, HoldAction::Release));
            }
            if let Some(id) = snapshot.buyer_invoice {
                plan.push((id, HoldAction::Discard));
            }
        }
        Collaborative => {
            planned_finalize =
                snapshot.pending_cancel_by.is_some() && snapshot.pending_cancel_by != Some(user);
            if planned_finalize {
                // both parties agreed: each loses their bond, the escrow
                // returns to the seller
                if let Some(id) = snapshot.maker_bond {
                    plan.push((id, HoldAction::Forfeit));
                }
                if let Some(id) = snapshot.taker_bond {
                    plan.push((id, HoldAction::Forfeit));
                }
                if let Some(id) = snapshot.trade_escrow {
                    plan.push((id, HoldAction::Release));
                }
                if let Some(id) = snapshot.buyer_invoice {
                    plan.push((id, HoldAction::Discard));
                }
            }
        }
    }
    let plan = prepare_hold_actions(db, lightning, plan).await?;

    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if order.status == order::Status::Cancelled {
            return Ok(CancelOutcome::Cancelled);
        }
        if order.cancel_phase(user) != Some(phase) {
            return Err(Error::Conflict(ConflictError));
        }
        for (id, action) in &plan {
            apply_hold_action(&mut data_tx, *id, *action).await;
        }
        let outcome = match phase {
            AlreadyCancelled => unreachable!("handled before the commit"),
            MakerPreBond | MakerPublic | MakerMidTrade => {
                order.cancelled_by_maker();
                CancelOutcome::Cancelled
            }
            TakerPreBond => {
                let mut profile = user::profile_in_tx(&mut data_tx, user).await;
                profile.penalize_until(Utc::now() + Duration::seconds(cfg.penalty_timeout.0));
                user::update_profile(&mut data_tx, &profile).await;
                order.republish();
                CancelOutcome::Republished
            }
            TakerMidTrade => {
                order.republish();
                CancelOutcome::Republished
            }
            Collaborative => {
                let finalized = order.request_cancel(user);
                if finalized != planned_finalize {
                    // the counterparty asked in the meantime; redo the
                    // Lightning side with a fresh snapshot
                    return Err(Error::Conflict(ConflictError));
                }
                if finalized {
                    order.cancelled_collaboratively();
                    CancelOutcome::Cancelled
                } else {
                    CancelOutcome::CancelPending
                }
            }
        };
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(outcome)
    })
    .await
}

/// Performs the Lightning side of a cancellation plan. Forfeits settle the
/// hold, releases cancel it. Entries that no longer apply are downgraded or
/// dropped; a failed release is dropped and left for the operator.
async fn prepare_hold_actions(
    db: &Database,
    lightning: &Lightning,
    plan: Vec<(payment::Id, HoldAction)>,
) -> Result<Vec<(payment::Id, HoldAction)>, Error> {
    let mut node = None;
    let mut prepared = Vec::new();
    for (id, action) in plan {
        let record = payment::get(db, id)
            .await
            .expect("linked payment record missing");
        match (action, record.status) {
            (HoldAction::Forfeit, payment::Status::Locked) => {
                let preimage = record
                    .preimage
                    .clone()
                    .expect("hold invoices carry their preimage");
                if node.is_none() {
                    node = Some(lightning.create_node().await);
                }
                if !node.as_mut().unwrap().settle_hold_invoice(&preimage).await {
                    return Err(Error::SettleFailed);
                }
                prepared.push((id, HoldAction::Forfeit));
            }
            (HoldAction::Forfeit, payment::Status::Generated)
            | (HoldAction::Release, payment::Status::Generated) => {
                prepared.push((id, HoldAction::Discard));
            }
            (HoldAction::Release, payment::Status::Locked) => {
                if node.is_none() {
                    node = Some(lightning.create_node().await);
                }
                if node
                    .as_mut()
                    .unwrap()
                    .cancel_hold_invoice(&record.payment_hash)
                    .await
                {
                    prepared.push((id, HoldAction::Release));
                } else {
                    log::error!("could not release hold payment {:?}", id);
                }
            }
            (HoldAction::Discard, payment::Status::Generated)
            | (HoldAction::Discard, payment::Status::Validated) => {
                prepared.push((id, HoldAction::Discard));
            }
            _ => {}
        }
    }
    Ok(prepared)
}

/// Records the outcome of a prepared hold action inside the order commit.
async fn apply_hold_action(
    data_tx: &mut crate::database::Transaction,
    id: payment::Id,
    action: HoldAction,
) {
    let mut record = payment::get_in_tx(data_tx, id)
        .await
        .expect("linked payment record missing");
    match (action, record.status) {
        (HoldAction::Forfeit, payment::Status::Locked) => record.settle(),
        (HoldAction::Release, payment::Status::Locked) => record.return_collateral(),
        (HoldAction::Discard, payment::Status::Generated)
        | (HoldAction::Discard, payment::Status::Validated) => record.expire(),
        _ => return,
    }
    payment::upsert(data_tx, &record).await;
}

/// Releases a hold back to its payer: cancels locked HTLCs on the node and
/// marks the record accordingly.
async fn release_hold(db: &Database, lightning: &Lightning, payment_id: payment::Id) {
    let hold = payment::get(db, payment_id)
        .await
        .expect("linked hold record missing");
    let released = match hold.status {
        payment::Status::Locked => {
            let mut node = lightning.create_node().await;
            node.cancel_hold_invoice(&hold.payment_hash).await
        }
        payment::Status::Generated => true,
        _ => return,
    };
    if !released {
        log::error!("could not release hold payment {:?}", payment_id);
        return;
    }
    let mut data_tx = db.begin().await.unwrap();
    let mut hold = payment::get_in_tx(&mut data_tx, payment_id)
        .await
        .expect("linked hold record missing");
    match hold.status {
        payment::Status::Locked => hold.return_collateral(),
        payment::Status::Generated => hold.expire(),
        _ => return,
    }
    payment::upsert(&mut data_tx, &hold).await;
    data_tx.commit().await.unwrap();
}

async fn expire_if_generated(data_tx: &mut crate::database::Transaction, id: payment::Id) {
    let mut record = payment::get_in_tx(data_tx, id)
        .await
        .expect("linked payment record missing");
    if record.status == payment::Status::Generated {
        record.expire();
        payment::upsert(data_tx, &record).await;
    }
}

/// Expires an order still waiting for its maker bond.
async fn expire_order(db: &Database, order_id: order::Id) -> Result<(), Error> {
    concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        if order.status != order::Status::WaitingForMakerBond {
            return Ok(());
        }
        if let Some(bond_id) = order.maker_bond {
            expire_if_generated(&mut data_tx, bond_id).await;
        }
        order.expire();
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(())
    })
    .await
}

/// Records a locked hold invoice and advances its order. A lock landing on an
/// order that has already moved on is released back to the payer.
async fn apply_hold_locked(
    db: &Database,
    lightning: &Lightning,
    order_id: order::Id,
    payment_id: payment::Id,
) -> Result<(), Error> {
    let orphaned = concurrency::retry_loop(|| async {
        let mut data_tx = db.begin().await.unwrap();
        let mut order = order::get_in_tx(&mut data_tx, order_id)
            .await
            .ok_or(Error::OrderNotFound)?;
        let mut hold = payment::get_in_tx(&mut data_tx, payment_id)
            .await
            .expect("hold payment record missing");
        if hold.status != payment::Status::Generated {
            return Ok::<bool, Error>(false);
        }
        if order.status.is_terminal() || !order.links_payment(payment_id) {
            return Ok(true);
        }
        hold.lock();
        match hold.concept {
            payment::Concept::MakerBond
                if order.status == order::Status::WaitingForMakerBond =>
            {
                order.publish();
            }
            payment::Concept::TakerBond if order.status == order::Status::Taken => {
                order.bonds_locked();
            }
            payment::Concept::TradeEscrow
                if matches!(
                    order.status,
                    order::Status::WaitingForBoth | order::Status::WaitingForEscrow
                ) =>
            {
                order.escrow_locked();
            }
            // the lock is recorded; the order state machine already moved
            // past this event
            _ => {}
        }
        payment::upsert(&mut data_tx, &hold).await;
        order::update(&mut data_tx, &order).await?;
        data_tx.commit().await.unwrap();
        Ok(false)
    })
    .await?;
    if orphaned {
        release_hold(db, lightning, payment_id).await;
    }
    Ok(())
}

/// Watches a single hold invoice until it locks or its window closes.
fn spawn_lock_watcher(
    db: Database,
    lightning: Lightning,
    order_id: order::Id,
    payment_id: payment::Id,
    payment_hash: ln::PaymentHash,
    deadline: DateTime<Utc>,
) {
    tokio::spawn(async move {
        let mut node = lightning.create_node().await;
        if node.check_until_invoice_locked(&payment_hash, deadline).await {
            if let Err(e) = apply_hold_locked(&db, &lightning, order_id, payment_id).await {
                log::error!("failed to record a locked hold invoice: {}", e);
            }
        }
    });
}

/// Starts the reconciliation worker: it expires overdue orders, probes
/// pending hold invoices against the node, applies the implicit cancel paths
/// for lapsed invoice windows, and completes orders whose payout settled.
pub async fn start_worker(db: Database, lightning: &Lightning, cfg: TradeConfig) {
    worker::start(TradeWatcher {
        db,
        lightning: lightning.clone(),
        cfg,
    });
}

struct TradeWatcher {
    db: Database,
    lightning: Lightning,
    cfg: TradeConfig,
}

#[async_trait]
impl worker::Worker for TradeWatcher {
    async fn run(&mut self) {
        self.expire_overdue_orders().await;
        self.reconcile_pending_holds().await;
        self.complete_paid_orders().await;
    }

    fn interval() -> StdDuration {
        StdDuration::from_secs(5)
    }
}

impl TradeWatcher {
    async fn expire_overdue_orders(&self) {
        for order in order::overdue_maker_bond_orders(&self.db).await {
            if let Err(e) = expire_order(&self.db, order.id).await {
                log::error!("failed to expire order {:?}: {}", order.id, e);
            }
        }
    }

    async fn reconcile_pending_holds(&self) {
        let mut node = self.lightning.create_node().await;
        for hold in payment::pending_holds(&self.db).await {
            let order = match order::find_by_payment(&self.db, hold.id).await {
                Some(order) => order,
                None => {
                    // not referenced by any order (e.g. a lost creation race);
                    // garbage once its invoice window closed
                    if hold.expires_at < Utc::now() {
                        let mut data_tx = self.db.begin().await.unwrap();
                        expire_if_generated(&mut data_tx, hold.id).await;
                        data_tx.commit().await.unwrap();
                    }
                    continue;
                }
            };
            if node.validate_hold_invoice_locked(&hold.payment_hash).await {
                if let Err(e) =
                    apply_hold_locked(&self.db, &self.lightning, order.id, hold.id).await
                {
                    log::error!("failed to record a locked hold invoice: {}", e);
                }
                continue;
            }
            if let Err(e) = self.handle_overdue_hold(&order, &hold).await {
                log::error!(
                    "implicit cancel of order {:?} failed: {}",
                    order.id,
                    e
                );
            }
        }
    }

    /// A hold invoice whose window lapsed without locking rolls the order
    /// back along the corresponding cancel path.
    async fn handle_overdue_hold(
        &self,
        order: &order::Order,
        hold: &payment::LnPayment,
    ) -> Result<(), Error> {
        let now = Utc::now();
        match hold.concept {
            payment::Concept::MakerBond => {
                if order.status == order::Status::WaitingForMakerBond
                    && hold.created_at + Duration::minutes(self.cfg.exp_maker_bond_invoice) < now
                {
                    expire_order(&self.db, order.id).await?;
                }
            }
            payment::Concept::TakerBond => {
                if order.status == order::Status::Taken
                    && hold.created_at + Duration::minutes(self.cfg.exp_taker_bond_invoice) < now
                {
                    let taker = order.taker.ok_or(Error::CannotCancel)?;
                    execute_cancel(
                        &self.db,
                        &self.lightning,
                        &self.cfg,
                        order.id,
                        taker,
                        order::CancelPhase::TakerPreBond,
                    )
                    .await?;
                }
            }
            payment::Concept::TradeEscrow => {
                if matches!(
                    order.status,
                    order::Status::WaitingForBoth | order::Status::WaitingForEscrow
                ) && hold.created_at + Duration::minutes(self.cfg.exp_trade_escrow_invoice) < now
                {
                    let seller = order.seller().ok_or(Error::CannotCancel)?;
                    let phase = order.cancel_phase(seller).ok_or(Error::CannotCancel)?;
                    execute_cancel(
                        &self.db,
                        &self.lightning,
                        &self.cfg,
                        order.id,
                        seller,
                        phase,
                    )
                    .await?;
                }
            }
            payment::Concept::PayBuyer => {}
        }
        Ok(())
    }

    async fn complete_paid_orders(&self) {
        let mut node = self.lightning.create_node().await;
        for order in order::paying_orders(&self.db).await {
            let invoice_id = match order.buyer_invoice {
                Some(id) => id,
                None => continue,
            };
            let buyer_invoice = payment::get(&self.db, invoice_id)
                .await
                .expect("linked buyer invoice record missing");
            if !node.check_payment_settled(&buyer_invoice.payment_hash).await {
                continue;
            }
            let result = concurrency::retry_loop(|| async {
                let mut data_tx = self.db.begin().await.unwrap();
                let mut order = order::get_in_tx(&mut data_tx, order.id)
                    .await
                    .ok_or(Error::OrderNotFound)?;
                if order.status != order::Status::PayingBuyer {
                    return Ok::<(), Error>(());
                }
                order.complete();
                order::update(&mut data_tx, &order).await?;
                data_tx.commit().await.unwrap();
                Ok(())
            })
            .await;
            if let Err(e) = result {
                log::error!("failed to complete order {:?}: {}", order.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bond_is_a_floored_fraction_of_the_trade() {
        assert_eq!(bond_satoshis(Sats(200_000), 0.01), Sats(2_000));
        assert_eq!(bond_satoshis(Sats(12_345), 0.01), Sats(123));
    }

    #[test]
    fn payout_deducts_the_trading_fee_floored() {
        assert_eq!(payout_satoshis(Sats(200_000), 0.002), Sats(199_600));
        assert_eq!(payout_satoshis(Sats(12_345), 0.002), Sats(12_320));
    }

    #[test]
    fn zero_fee_pays_the_full_trade() {
        assert_eq!(payout_satoshis(Sats(200_000), 0.0), Sats(200_000));
    }
}

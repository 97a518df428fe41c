use crate::concurrency::ConflictError;
use crate::database::{Database, Transaction};
use crate::{payment, user};

mod entities;

pub use entities::{CancelPhase, Id, NewOrder, Order, Role, Status, Type};

pub async fn get(db: &Database, id: Id) -> Option<Order> {
    queries::get(db, id).await
}

pub(crate) async fn get_in_tx(data_tx: &mut Transaction, id: Id) -> Option<Order> {
    queries::get_in_tx(data_tx, id).await
}

pub(crate) async fn insert(data_tx: &mut Transaction, order: &Order) {
    queries::insert(data_tx, order).await
}

/// Commits an order mutation. The write is compare-and-swap on the revision
/// column; losing the race yields a [`ConflictError`] and the caller re-reads
/// and retries.
pub(crate) async fn update(data_tx: &mut Transaction, order: &Order) -> Result<(), ConflictError> {
    queries::update(data_tx, order).await
}

/// Whether the user participates in any order that is not finished yet.
pub(crate) async fn active_role_of(db: &Database, user: user::Id) -> Option<Role> {
    if queries::count_active(db, user, "maker_id").await > 0 {
        Some(Role::Maker)
    } else if queries::count_active(db, user, "taker_id").await > 0 {
        Some(Role::Taker)
    } else {
        None
    }
}

/// The order a hold payment belongs to, through any of its payment slots.
pub(crate) async fn find_by_payment(db: &Database, payment_id: payment::Id) -> Option<Order> {
    queries::find_by_payment(db, payment_id).await
}

/// Orders still waiting for their maker bond past the order deadline.
pub(crate) async fn overdue_maker_bond_orders(db: &Database) -> Vec<Order> {
    queries::with_status_past_deadline(db, Status::WaitingForMakerBond).await
}

/// Orders whose buyer payout is in flight.
pub(crate) async fn paying_orders(db: &Database) -> Vec<Order> {
    queries::with_status(db, Status::PayingBuyer).await
}

mod queries {
    use super::{Id, Order, Status, Type};
    use crate::btc::Sats;
    use crate::concurrency::ConflictError;
    use crate::database::{CountRow, Database, Transaction};
    use crate::{payment, user};
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    const COLUMNS: &str = "id, order_type, currency, amount, satoshis, is_explicit, premium, t0_satoshis, last_satoshis, is_fiat_sent, pending_cancel_by, status, maker_id, taker_id, maker_bond_id, taker_bond_id, trade_escrow_id, buyer_invoice_id, created, expiration, revision";

    pub(super) async fn insert(data_tx: &mut Transaction, order: &Order) {
        sqlx::query(&format!(
            r#"INSERT INTO orders ({})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"#,
            COLUMNS
        ))
        .bind(order.id.0)
        .bind(type_to_i32(order.order_type))
        .bind(&order.currency)
        .bind(order.amount)
        .bind(order.satoshis.map(|sats| sats.0))
        .bind(order.is_explicit)
        .bind(order.premium)
        .bind(order.t0_satoshis.0)
        .bind(order.last_satoshis.map(|sats| sats.0))
        .bind(order.is_fiat_sent)
        .bind(order.pending_cancel_by.map(|user| user.0))
        .bind(order.status.index())
        .bind(order.maker.map(|user| user.0))
        .bind(order.taker.map(|user| user.0))
        .bind(order.maker_bond.map(|id| id.0))
        .bind(order.taker_bond.map(|id| id.0))
        .bind(order.trade_escrow.map(|id| id.0))
        .bind(order.buyer_invoice.map(|id| id.0))
        .bind(order.created_at)
        .bind(order.expires_at)
        .bind(order.revision)
        .execute(&mut *data_tx)
        .await
        .unwrap();
    }

    pub(super) async fn update(
        data_tx: &mut Transaction,
        order: &Order,
    ) -> Result<(), ConflictError> {
        sqlx::query(
            r#"UPDATE orders SET amount = $2, satoshis = $3, premium = $4, last_satoshis = $5,
                is_fiat_sent = $6, pending_cancel_by = $7, status = $8, maker_id = $9, taker_id = $10,
                maker_bond_id = $11, taker_bond_id = $12, trade_escrow_id = $13, buyer_invoice_id = $14,
                expiration = $15, revision = $16
                WHERE id = $1 AND revision = $17 RETURNING id"#,
        )
        .bind(order.id.0)
        .bind(order.amount)
        .bind(order.satoshis.map(|sats| sats.0))
        .bind(order.premium)
        .bind(order.last_satoshis.map(|sats| sats.0))
        .bind(order.is_fiat_sent)
        .bind(order.pending_cancel_by.map(|user| user.0))
        .bind(order.status.index())
        .bind(order.maker.map(|user| user.0))
        .bind(order.taker.map(|user| user.0))
        .bind(order.maker_bond.map(|id| id.0))
        .bind(order.taker_bond.map(|id| id.0))
        .bind(order.trade_escrow.map(|id| id.0))
        .bind(order.buyer_invoice.map(|id| id.0))
        .bind(order.expires_at)
        .bind(order.revision + 1)
        .bind(order.revision)
        .fetch_optional(&mut *data_tx)
        .await
        .unwrap()
        .map(|_: sqlx::postgres::PgRow| ())
        .ok_or(ConflictError)
    }

    pub(super) async fn get(db: &Database, id: Id) -> Option<Order> {
        sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders WHERE id = $1", COLUMNS))
            .bind(id.0)
            .fetch_optional(db)
            .await
            .unwrap()
            .map(|row| row.into_entity())
    }

    pub(super) async fn get_in_tx(data_tx: &mut Transaction, id: Id) -> Option<Order> {
        sqlx::query_as::<_, OrderRow>(&format!("SELECT {} FROM orders WHERE id = $1", COLUMNS))
            .bind(id.0)
            .fetch_optional(data_tx)
            .await
            .unwrap()
            .map(|row| row.into_entity())
    }

    pub(super) async fn count_active(db: &Database, user: user::Id, role_column: &str) -> i64 {
        sqlx::query_as::<_, CountRow>(&format!(
            "SELECT COUNT(*) AS count FROM orders WHERE {} = $1 AND status <= $2",
            role_column
        ))
        .bind(user.0)
        .bind(Status::PayingBuyer.index())
        .fetch_one(db)
        .await
        .unwrap()
        .count
    }

    pub(super) async fn find_by_payment(db: &Database, payment_id: payment::Id) -> Option<Order> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r#"SELECT {} FROM orders
                WHERE maker_bond_id = $1 OR taker_bond_id = $1 OR trade_escrow_id = $1 OR buyer_invoice_id = $1"#,
            COLUMNS
        ))
        .bind(payment_id.0)
        .fetch_optional(db)
        .await
        .unwrap()
        .map(|row| row.into_entity())
    }

    pub(super) async fn with_status(db: &Database, status: Status) -> Vec<Order> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE status = $1 ORDER BY created",
            COLUMNS
        ))
        .bind(status.index())
        .fetch_all(db)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.into_entity())
        .collect()
    }

    pub(super) async fn with_status_past_deadline(db: &Database, status: Status) -> Vec<Order> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE status = $1 AND expiration < $2 ORDER BY created",
            COLUMNS
        ))
        .bind(status.index())
        .bind(Utc::now())
        .fetch_all(db)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.into_entity())
        .collect()
    }

    #[derive(sqlx::FromRow, Debug)]
    struct OrderRow {
        id: Uuid,
        order_type: i32,
        currency: String,
        amount: Option<Decimal>,
        satoshis: Option<i64>,
        is_explicit: bool,
        premium: f64,
        t0_satoshis: i64,
        last_satoshis: Option<i64>,
        is_fiat_sent: bool,
        pending_cancel_by: Option<Uuid>,
        status: i32,
        maker_id: Option<Uuid>,
        taker_id: Option<Uuid>,
        maker_bond_id: Option<Uuid>,
        taker_bond_id: Option<Uuid>,
        trade_escrow_id: Option<Uuid>,
        buyer_invoice_id: Option<Uuid>,
        created: DateTime<Utc>,
        expiration: DateTime<Utc>,
        revision: i64,
    }

    impl OrderRow {
        fn into_entity(self) -> Order {
            Order {
                id: Id(self.id),
                order_type: match self.order_type {
                    0 => Type::Buy,
                    1 => Type::Sell,
                    other => unreachable!("invalid order type {:?}", other),
                },
                currency: self.currency,
                amount: self.amount,
                satoshis: self.satoshis.map(Sats),
                is_explicit: self.is_explicit,
                premium: self.premium,
                t0_satoshis: Sats(self.t0_satoshis),
                last_satoshis: self.last_satoshis.map(Sats),
                is_fiat_sent: self.is_fiat_sent,
                pending_cancel_by: self.pending_cancel_by.map(user::Id),
                status: Status::from_index(self.status),
                maker: self.maker_id.map(user::Id),
                taker: self.taker_id.map(user::Id),
                maker_bond: self.maker_bond_id.map(payment::Id),
                taker_bond: self.taker_bond_id.map(payment::Id),
                trade_escrow: self.trade_escrow_id.map(payment::Id),
                buyer_invoice: self.buyer_invoice_id.map(payment::Id),
                created_at: self.created,
                expires_at: self.expiration,
                revision: self.revision,
            }
        }
    }

    fn type_to_i32(order_type: Type) -> i32 {
        match order_type {
            Type::Buy => 0,
            Type::Sell => 1,
        }
    }
}

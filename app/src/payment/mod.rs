use crate::database::{Database, Transaction};

mod entities;

pub use entities::{Concept, Id, Kind, LnPayment, Status};

pub async fn get(db: &Database, id: Id) -> Option<LnPayment> {
    queries::get(db, id).await
}

pub(crate) async fn get_in_tx(data_tx: &mut Transaction, id: Id) -> Option<LnPayment> {
    queries::get_in_tx(data_tx, id).await
}

pub(crate) async fn upsert(data_tx: &mut Transaction, payment: &LnPayment) {
    queries::upsert(data_tx, payment).await
}

/// Hold invoices that were generated but not yet observed locked. The
/// reconciliation worker probes these against the node.
pub(crate) async fn pending_holds(db: &Database) -> Vec<LnPayment> {
    queries::pending_holds(db).await
}

mod queries {
    use super::{Concept, Id, Kind, LnPayment, Status};
    use crate::btc::Sats;
    use crate::database::{Database, Transaction};
    use crate::{ln, user};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    const COLUMNS: &str = "id, concept, kind, status, sender_id, receiver_id, invoice, payment_hash, preimage, amount_sats, description, created, expiration";

    pub(super) async fn upsert(data_tx: &mut Transaction, payment: &LnPayment) {
        sqlx::query(&format!(
            r#"INSERT INTO ln_payments ({})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) ON CONFLICT (id) DO UPDATE SET
                concept = $2, kind = $3, status = $4, sender_id = $5, receiver_id = $6, invoice = $7,
                payment_hash = $8, preimage = $9, amount_sats = $10, description = $11, created = $12, expiration = $13"#,
            COLUMNS
        ))
        .bind(payment.id.0)
        .bind(concept_to_i32(payment.concept))
        .bind(kind_to_i32(payment.kind))
        .bind(status_to_i32(payment.status))
        .bind(payment.sender.0)
        .bind(payment.receiver.0)
        .bind(&payment.invoice.0)
        .bind(payment.payment_hash.to_hex())
        .bind(payment.preimage.as_ref().map(|preimage| preimage.to_hex()))
        .bind(payment.amount.0)
        .bind(&payment.description)
        .bind(payment.created_at)
        .bind(payment.expires_at)
        .execute(&mut *data_tx)
        .await
        .unwrap();
    }

    pub(super) async fn get(db: &Database, id: Id) -> Option<LnPayment> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM ln_payments WHERE id = $1",
            COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(db)
        .await
        .unwrap()
        .map(|row| row.into_entity())
    }

    pub(super) async fn get_in_tx(data_tx: &mut Transaction, id: Id) -> Option<LnPayment> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM ln_payments WHERE id = $1",
            COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(data_tx)
        .await
        .unwrap()
        .map(|row| row.into_entity())
    }

    pub(super) async fn pending_holds(db: &Database) -> Vec<LnPayment> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM ln_payments WHERE status = $1 AND kind = $2 ORDER BY created",
            COLUMNS
        ))
        .bind(status_to_i32(Status::Generated))
        .bind(kind_to_i32(Kind::Hold))
        .fetch_all(db)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.into_entity())
        .collect()
    }

    #[derive(sqlx::FromRow, Debug)]
    struct PaymentRow {
        id: Uuid,
        concept: i32,
        kind: i32,
        status: i32,
        sender_id: Uuid,
        receiver_id: Uuid,
        invoice: String,
        payment_hash: String,
        preimage: Option<String>,
        amount_sats: i64,
        description: String,
        created: DateTime<Utc>,
        expiration: DateTime<Utc>,
    }

    impl PaymentRow {
        fn into_entity(self) -> LnPayment {
            LnPayment {
                id: Id(self.id),
                concept: match self.concept {
                    0 => Concept::MakerBond,
                    1 => Concept::TakerBond,
                    2 => Concept::TradeEscrow,
                    3 => Concept::PayBuyer,
                    other => unreachable!("invalid payment concept {:?}", other),
                },
                kind: match self.kind {
                    0 => Kind::Hold,
                    1 => Kind::Norm,
                    other => unreachable!("invalid payment kind {:?}", other),
                },
                status: match self.status {
                    0 => Status::Generated,
                    1 => Status::Locked,
                    2 => Status::Settled,
                    3 => Status::Returned,
                    4 => Status::Validated,
                    5 => Status::Paying,
                    6 => Status::Expired,
                    other => unreachable!("invalid payment status {:?}", other),
                },
                sender: user::Id(self.sender_id),
                receiver: user::Id(self.receiver_id),
                invoice: ln::RawInvoice(self.invoice),
                payment_hash: ln::PaymentHash::from_hex(&self.payment_hash),
                preimage: self.preimage.as_deref().map(ln::Preimage::from_hex),
                amount: Sats(self.amount_sats),
                description: self.description,
                created_at: self.created,
                expires_at: self.expiration,
            }
        }
    }

    fn concept_to_i32(concept: Concept) -> i32 {
        match concept {
            Concept::MakerBond => 0,
            Concept::TakerBond => 1,
            Concept::TradeEscrow => 2,
            Concept::PayBuyer => 3,
        }
    }

    fn kind_to_i32(kind: Kind) -> i32 {
        match kind {
            Kind::Hold => 0,
            Kind::Norm => 1,
        }
    }

    pub(crate) fn status_to_i32(status: Status) -> i32 {
        match status {
            Status::Generated => 0,
            Status::Locked => 1,
            Status::Settled => 2,
            Status::Returned => 3,
            Status::Validated => 4,
            Status::Paying => 5,
            Status::Expired => 6,
        }
    }
}

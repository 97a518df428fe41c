//! Ledger records for the Lightning payments the platform holds or makes:
//! the party bonds, the trade escrow and the buyer payout.

use crate::{btc::Sats, ln, user};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Id(pub Uuid);

/// What a payment is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concept {
    MakerBond,
    TakerBond,
    TradeEscrow,
    PayBuyer,
}

/// Hold invoices lock collateral in the payer's wallet; normal invoices move
/// funds outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Hold,
    Norm,
}

/// Lifecycle of a payment record. Transitions are monotone; there is no way
/// back out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Hold invoice generated, HTLCs not locked yet.
    Generated,
    /// HTLCs locked in; the collateral is held.
    Locked,
    /// Preimage revealed; the funds moved to the platform.
    Settled,
    /// Locked collateral released back to the payer.
    Returned,
    /// Externally supplied invoice that passed validation.
    Validated,
    /// Outbound payout handed to the node.
    Paying,
    /// Generated or validated but never used; garbage.
    Expired,
}

#[derive(Debug)]
pub struct LnPayment {
    pub id: Id,
    pub concept: Concept,
    pub kind: Kind,
    pub status: Status,
    pub sender: user::Id,
    pub receiver: user::Id,
    pub invoice: ln::RawInvoice,
    pub payment_hash: ln::PaymentHash,
    pub preimage: Option<ln::Preimage>,
    pub amount: Sats,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LnPayment {
    /// Creates the record for a freshly generated hold invoice.
    pub(crate) fn new_hold(
        concept: Concept,
        sender: user::Id,
        receiver: user::Id,
        hold: ln::HoldInvoice,
        amount: Sats,
        description: String,
    ) -> Self {
        Self {
            id: Id(Uuid::new_v4()),
            concept,
            kind: Kind::Hold,
            status: Status::Generated,
            sender,
            receiver,
            invoice: hold.invoice,
            payment_hash: hold.payment_hash,
            preimage: Some(hold.preimage),
            amount,
            description,
            created_at: hold.created_at,
            expires_at: hold.expires_at,
        }
    }

    /// Creates the record for a validated buyer payout invoice.
    pub(crate) fn new_buyer_invoice(
        sender: user::Id,
        receiver: user::Id,
        invoice: ln::RawInvoice,
        validated: ln::ValidatedInvoice,
        amount: Sats,
    ) -> Self {
        Self {
            id: Id(Uuid::new_v4()),
            concept: Concept::PayBuyer,
            kind: Kind::Norm,
            status: Status::Validated,
            sender,
            receiver,
            invoice,
            payment_hash: validated.payment_hash,
            preimage: None,
            amount,
            description: validated.description,
            created_at: validated.created_at,
            expires_at: validated.expires_at,
        }
    }

    /// The buyer may replace their payout invoice until the seller acts on
    /// it; the record keeps its identity and slot.
    pub(crate) fn replace_invoice(
        &mut self,
        invoice: ln::RawInvoice,
        validated: ln::ValidatedInvoice,
        amount: Sats,
    ) {
        if self.status != Status::Validated {
            panic!(
                "payment {:?} can no longer be replaced from {:?}",
                self.id, self.status
            );
        }
        self.invoice = invoice;
        self.payment_hash = validated.payment_hash;
        self.description = validated.description;
        self.created_at = validated.created_at;
        self.expires_at = validated.expires_at;
        self.amount = amount;
    }

    pub(crate) fn lock(&mut self) {
        if self.status != Status::Generated {
            panic!("payment {:?} cannot lock from {:?}", self.id, self.status);
        }
        self.status = Status::Locked;
    }

    /// Marks the hold settled. Settling twice is a no-op; the node reports
    /// success for repeated settles of the same hash.
    pub(crate) fn settle(&mut self) {
        match self.status {
            Status::Locked => self.status = Status::Settled,
            Status::Settled => {}
            other => panic!("payment {:?} cannot settle from {:?}", self.id, other),
        }
    }

    /// Marks locked collateral as released back to its payer.
    pub(crate) fn return_collateral(&mut self) {
        match self.status {
            Status::Locked => self.status = Status::Returned,
            Status::Returned => {}
            other => panic!(
                "payment {:?} cannot return collateral from {:?}",
                self.id, other
            ),
        }
    }

    /// Marks a record as garbage: an invoice that was generated or validated
    /// but never used.
    pub(crate) fn expire(&mut self) {
        match self.status {
            Status::Generated | Status::Validated => self.status = Status::Expired,
            other => panic!("payment {:?} cannot expire from {:?}", self.id, other),
        }
    }

    pub(crate) fn start_paying(&mut self) {
        if self.status != Status::Validated {
            panic!(
                "payment {:?} cannot start paying from {:?}",
                self.id, self.status
            );
        }
        self.status = Status::Paying;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold_payment() -> LnPayment {
        let preimage = ln::Preimage(vec![1u8; 32]);
        let payment_hash = preimage.payment_hash();
        LnPayment::new_hold(
            Concept::MakerBond,
            user::Id(Uuid::from_u128(1)),
            user::Id(Uuid::from_u128(2)),
            ln::HoldInvoice {
                invoice: ln::RawInvoice("lnbc1fake".to_owned()),
                preimage,
                payment_hash,
                created_at: Utc::now(),
                expires_at: Utc::now(),
            },
            Sats(2_000),
            "bond".to_owned(),
        )
    }

    #[test]
    fn hold_lifecycle_is_generated_locked_settled() {
        let mut payment = hold_payment();
        assert_eq!(payment.status, Status::Generated);
        payment.lock();
        assert_eq!(payment.status, Status::Locked);
        payment.settle();
        assert_eq!(payment.status, Status::Settled);
        // settling twice is tolerated, the node reports success either way
        payment.settle();
        assert_eq!(payment.status, Status::Settled);
    }

    #[test]
    #[should_panic(expected = "cannot settle")]
    fn unlocked_hold_cannot_settle() {
        hold_payment().settle();
    }

    #[test]
    #[should_panic(expected = "cannot lock")]
    fn settled_hold_cannot_relock() {
        let mut payment = hold_payment();
        payment.lock();
        payment.settle();
        payment.lock();
    }

    #[test]
    #[should_panic(expected = "cannot expire")]
    fn locked_hold_is_not_garbage() {
        let mut payment = hold_payment();
        payment.lock();
        payment.expire();
    }
}

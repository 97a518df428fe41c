//! The trade aggregate and its state machine.

use crate::{btc::Sats, payment, user};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Id(pub Uuid);

/// The maker's side of the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Buy,
    Sell,
}

/// Order states in trade-progress order. The declaration order is load
/// bearing: the phased cancellation rules compare states numerically, so
/// `Ord` must follow trade progress, with the terminal non-success states at
/// the end. Persisted through [`Status::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Waiting for the maker bond to be locked.
    WaitingForMakerBond,
    /// Published in the book.
    Public,
    /// Taken; waiting for the taker bond invoice.
    Taken,
    /// Taker bond locked; escrow and buyer invoice both outstanding.
    WaitingForBoth,
    /// Buyer invoice accepted; escrow outstanding.
    WaitingForEscrow,
    /// Escrow locked; buyer invoice outstanding.
    WaitingForInvoice,
    /// All collateral posted; fiat exchange in progress.
    Chat,
    /// Buyer asserted the fiat was sent; escrow settled.
    FiatSent,
    /// Buyer payout in flight.
    PayingBuyer,
    /// Trade finished successfully.
    Success,
    /// Cancelled by its participants.
    Cancelled,
    /// Expired before the collateral was posted.
    Expired,
    /// In dispute.
    Disputed,
}

impl Status {
    pub fn index(self) -> i32 {
        self as i32
    }

    pub fn from_index(index: i32) -> Self {
        match index {
            0 => Self::WaitingForMakerBond,
            1 => Self::Public,
            2 => Self::Taken,
            3 => Self::WaitingForBoth,
            4 => Self::WaitingForEscrow,
            5 => Self::WaitingForInvoice,
            6 => Self::Chat,
            7 => Self::FiatSent,
            8 => Self::PayingBuyer,
            9 => Self::Success,
            10 => Self::Cancelled,
            11 => Self::Expired,
            12 => Self::Disputed,
            other => unreachable!("invalid order status {:?}", other),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Cancelled | Self::Expired | Self::Disputed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Maker,
    Taker,
}

/// Which row of the phased cancellation table applies to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPhase {
    /// Maker backs out before bonding; free.
    MakerPreBond,
    /// Maker takes a public order down; the bond is forfeit.
    MakerPublic,
    /// Taker backs out before bonding; timeout penalty.
    TakerPreBond,
    /// Maker abandons an ongoing trade; the bond is forfeit.
    MakerMidTrade,
    /// Taker abandons an ongoing trade; the bond is forfeit and the order is
    /// republished.
    TakerMidTrade,
    /// Collateral fully posted; both parties must agree.
    Collaborative,
    /// Already cancelled; nothing left to do.
    AlreadyCancelled,
}

/// Inputs for creating an order.
#[derive(Debug)]
pub struct NewOrder {
    pub order_type: Type,
    pub currency: String,
    pub amount: Option<Decimal>,
    pub satoshis: Option<Sats>,
    pub is_explicit: bool,
    pub premium: f64,
}

#[derive(Debug)]
pub struct Order {
    pub id: Id,
    pub order_type: Type,
    pub currency: String,
    pub amount: Option<Decimal>,
    pub satoshis: Option<Sats>,
    pub is_explicit: bool,
    pub premium: f64,
    pub t0_satoshis: Sats,
    /// Trade size frozen at taker-bond time; never changes while the bond
    /// stays linked.
    pub last_satoshis: Option<Sats>,
    pub is_fiat_sent: bool,
    pub pending_cancel_by: Option<user::Id>,
    pub status: Status,
    pub maker: Option<user::Id>,
    pub taker: Option<user::Id>,
    pub maker_bond: Option<payment::Id>,
    pub taker_bond: Option<payment::Id>,
    pub trade_escrow: Option<payment::Id>,
    pub buyer_invoice: Option<payment::Id>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub(crate) revision: i64,
}

impl Order {
    pub(crate) fn create(
        maker: user::Id,
        new: NewOrder,
        t0_satoshis: Sats,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Id(Uuid::new_v4()),
            order_type: new.order_type,
            currency: new.currency,
            amount: new.amount,
            satoshis: new.satoshis,
            is_explicit: new.is_explicit,
            premium: new.premium,
            t0_satoshis,
            last_satoshis: None,
            is_fiat_sent: false,
            pending_cancel_by: None,
            status: Status::WaitingForMakerBond,
            maker: Some(maker),
            taker: None,
            maker_bond: None,
            taker_bond: None,
            trade_escrow: None,
            buyer_invoice: None,
            created_at: Utc::now(),
            expires_at,
            revision: 0,
        }
    }

    pub fn role_of(&self, user: user::Id) -> Option<Role> {
        if self.maker == Some(user) {
            Some(Role::Maker)
        } else if self.taker == Some(user) {
            Some(Role::Taker)
        } else {
            None
        }
    }

    /// The buyer is the maker of a BUY order or the taker of a SELL order.
    pub fn is_buyer(&self, user: user::Id) -> bool {
        match self.role_of(user) {
            Some(Role::Maker) => self.order_type == Type::Buy,
            Some(Role::Taker) => self.order_type == Type::Sell,
            None => false,
        }
    }

    pub fn is_seller(&self, user: user::Id) -> bool {
        match self.role_of(user) {
            Some(Role::Maker) => self.order_type == Type::Sell,
            Some(Role::Taker) => self.order_type == Type::Buy,
            None => false,
        }
    }

    pub fn seller(&self) -> Option<user::Id> {
        match self.order_type {
            Type::Sell => self.maker,
            Type::Buy => self.taker,
        }
    }

    pub fn buyer(&self) -> Option<user::Id> {
        match self.order_type {
            Type::Buy => self.maker,
            Type::Sell => self.taker,
        }
    }

    pub fn is_pending_cancel(&self) -> bool {
        self.pending_cancel_by.is_some()
    }

    /// Whether any of the four payment slots points at this payment.
    pub fn links_payment(&self, id: payment::Id) -> bool {
        [
            self.maker_bond,
            self.taker_bond,
            self.trade_escrow,
            self.buyer_invoice,
        ]
        .contains(&Some(id))
    }

    /// Classifies a cancel request. `None` means the combination of caller
    /// and state cannot cancel at all.
    pub fn cancel_phase(&self, user: user::Id) -> Option<CancelPhase> {
        if self.status == Status::Cancelled {
            return Some(CancelPhase::AlreadyCancelled);
        }
        let role = self.role_of(user)?;
        match (role, self.status) {
            (Role::Maker, Status::WaitingForMakerBond) => Some(CancelPhase::MakerPreBond),
            (Role::Maker, Status::Public) => Some(CancelPhase::MakerPublic),
            (Role::Taker, Status::Taken) => Some(CancelPhase::TakerPreBond),
            (Role::Maker, status) if status > Status::Public && status < Status::Chat => {
                Some(CancelPhase::MakerMidTrade)
            }
            (Role::Taker, status) if status > Status::Taken && status < Status::Chat => {
                Some(CancelPhase::TakerMidTrade)
            }
            (_, status) if status >= Status::Chat && status < Status::Success => {
                Some(CancelPhase::Collaborative)
            }
            _ => None,
        }
    }

    pub(crate) fn set_taker(&mut self, taker: user::Id) {
        if self.status != Status::Public {
            panic!("order {:?} cannot be taken from {:?}", self.id, self.status);
        }
        if self.maker == Some(taker) {
            panic!("order {:?} cannot be taken by its maker", self.id);
        }
        self.taker = Some(taker);
        self.status = Status::Taken;
    }

    /// Maker bond locked; the order goes on the book.
    pub(crate) fn publish(&mut self) {
        self.assert_status(Status::WaitingForMakerBond, "publish");
        self.status = Status::Public;
    }

    /// Taker bond locked; both collateral legs are now outstanding.
    pub(crate) fn bonds_locked(&mut self) {
        self.assert_status(Status::Taken, "lock bonds");
        self.status = Status::WaitingForBoth;
    }

    /// Trade escrow locked. Moves to chat when the buyer invoice is already
    /// in, otherwise waits for it.
    pub(crate) fn escrow_locked(&mut self) {
        match self.status {
            Status::WaitingForBoth => self.status = Status::WaitingForInvoice,
            Status::WaitingForEscrow => self.status = Status::Chat,
            other => panic!("order {:?} cannot lock escrow from {:?}", self.id, other),
        }
    }

    /// Buyer invoice accepted. Moves to chat once the escrow is locked,
    /// otherwise waits for it. Replacements while chatting change nothing.
    pub(crate) fn buyer_invoice_accepted(&mut self, escrow_locked: bool) {
        match self.status {
            Status::WaitingForBoth => {
                self.status = if escrow_locked {
                    Status::Chat
                } else {
                    Status::WaitingForEscrow
                };
            }
            Status::WaitingForEscrow | Status::WaitingForInvoice if escrow_locked => {
                self.status = Status::Chat;
            }
            Status::WaitingForEscrow => {}
            Status::Chat | Status::FiatSent => {}
            other => panic!(
                "order {:?} cannot accept a buyer invoice from {:?}",
                self.id, other
            ),
        }
    }

    /// Buyer confirmed sending the fiat; the escrow was settled.
    pub(crate) fn fiat_sent(&mut self) {
        match self.status {
            Status::Chat | Status::FiatSent => {
                self.status = Status::FiatSent;
                self.is_fiat_sent = true;
            }
            other => panic!("order {:?} cannot mark fiat sent from {:?}", self.id, other),
        }
    }

    /// Seller confirmed receiving the fiat; the payout is in flight.
    pub(crate) fn paying_buyer(&mut self) {
        self.assert_status(Status::FiatSent, "start the payout");
        self.status = Status::PayingBuyer;
    }

    /// Payout observed settled on the node.
    pub(crate) fn complete(&mut self) {
        self.assert_status(Status::PayingBuyer, "complete");
        self.status = Status::Success;
    }

    pub(crate) fn expire(&mut self) {
        self.maker = None;
        self.taker = None;
        self.status = Status::Expired;
    }

    pub(crate) fn dispute(&mut self) {
        match self.status {
            Status::Chat | Status::FiatSent => self.status = Status::Disputed,
            other => panic!("order {:?} cannot be disputed from {:?}", self.id, other),
        }
    }

    pub(crate) fn cancelled_by_maker(&mut self) {
        self.maker = None;
        self.status = Status::Cancelled;
    }

    pub(crate) fn cancelled_collaboratively(&mut self) {
        self.status = Status::Cancelled;
    }

    /// Puts the order back on the book after its taker left. The taker-side
    /// slots are detached so the next taker can post fresh collateral, and
    /// the trade size unfreezes until a new taker bond is generated.
    pub(crate) fn republish(&mut self) {
        self.taker = None;
        self.taker_bond = None;
        self.trade_escrow = None;
        self.buyer_invoice = None;
        self.last_satoshis = None;
        self.is_fiat_sent = false;
        self.pending_cancel_by = None;
        self.status = Status::Public;
    }

    /// Records a collaborative cancel request. Returns true when the other
    /// party had already asked, which makes the cancellation final.
    pub(crate) fn request_cancel(&mut self, user: user::Id) -> bool {
        match self.pending_cancel_by {
            Some(requester) if requester != user => true,
            Some(_) => false,
            None => {
                self.pending_cancel_by = Some(user);
                false
            }
        }
    }

    fn assert_status(&self, expected: Status, action: &str) {
        if self.status != expected {
            panic!(
                "order {:?} cannot {} from {:?}",
                self.id, action, self.status
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn maker() -> user::Id {
        user::Id(Uuid::from_u128(1))
    }

    fn taker() -> user::Id {
        user::Id(Uuid::from_u128(2))
    }

    fn stranger() -> user::Id {
        user::Id(Uuid::from_u128(3))
    }

    fn sell_order() -> Order {
        Order::create(
            maker(),
            NewOrder {
                order_type: Type::Sell,
                currency: "EUR".to_owned(),
                amount: Some("50".parse().unwrap()),
                satoshis: None,
                is_explicit: false,
                premium: 2.0,
            },
            Sats(200_000),
            Utc::now() + Duration::minutes(5),
        )
    }

    fn order_in(status: Status) -> Order {
        let mut order = sell_order();
        order.status = status;
        if status > Status::Public {
            order.taker = Some(taker());
        }
        order
    }

    #[test]
    fn status_ordinals_round_trip_and_follow_trade_progress() {
        for index in 0..=12 {
            assert_eq!(Status::from_index(index).index(), index);
        }
        assert!(Status::WaitingForMakerBond < Status::Public);
        assert!(Status::Public < Status::Taken);
        assert!(Status::Taken < Status::Chat);
        assert!(Status::Chat < Status::FiatSent);
        assert!(Status::FiatSent < Status::PayingBuyer);
        assert!(Status::Success > Status::PayingBuyer);
        assert!(Status::Cancelled > Status::Success);
    }

    #[test]
    fn buyer_and_seller_follow_the_order_type() {
        let mut order = order_in(Status::WaitingForBoth);
        assert!(order.is_seller(maker()));
        assert!(order.is_buyer(taker()));
        assert!(!order.is_buyer(stranger()));
        order.order_type = Type::Buy;
        assert!(order.is_buyer(maker()));
        assert!(order.is_seller(taker()));
        assert_eq!(order.seller(), Some(taker()));
        assert_eq!(order.buyer(), Some(maker()));
    }

    #[test]
    fn happy_path_transitions_in_order() {
        let mut order = sell_order();
        order.publish();
        assert_eq!(order.status, Status::Public);
        order.set_taker(taker());
        assert_eq!(order.status, Status::Taken);
        order.bonds_locked();
        assert_eq!(order.status, Status::WaitingForBoth);
        order.buyer_invoice_accepted(false);
        assert_eq!(order.status, Status::WaitingForEscrow);
        order.escrow_locked();
        assert_eq!(order.status, Status::Chat);
        order.fiat_sent();
        assert_eq!(order.status, Status::FiatSent);
        order.paying_buyer();
        assert_eq!(order.status, Status::PayingBuyer);
        order.complete();
        assert_eq!(order.status, Status::Success);
    }

    #[test]
    fn escrow_first_path_waits_for_the_invoice() {
        let mut order = order_in(Status::WaitingForBoth);
        order.escrow_locked();
        assert_eq!(order.status, Status::WaitingForInvoice);
        order.buyer_invoice_accepted(true);
        assert_eq!(order.status, Status::Chat);
    }

    #[test]
    fn invoice_in_waiting_for_both_with_locked_escrow_skips_ahead() {
        let mut order = order_in(Status::WaitingForBoth);
        order.buyer_invoice_accepted(true);
        assert_eq!(order.status, Status::Chat);
    }

    #[test]
    #[should_panic(expected = "cannot be taken")]
    fn self_take_is_rejected() {
        let mut order = sell_order();
        order.publish();
        order.set_taker(maker());
    }

    #[test]
    #[should_panic(expected = "cannot be taken")]
    fn take_requires_a_public_order() {
        sell_order().set_taker(taker());
    }

    #[test]
    fn cancel_phase_follows_the_table() {
        assert_eq!(
            order_in(Status::WaitingForMakerBond).cancel_phase(maker()),
            Some(CancelPhase::MakerPreBond)
        );
        assert_eq!(
            order_in(Status::Public).cancel_phase(maker()),
            Some(CancelPhase::MakerPublic)
        );
        assert_eq!(
            order_in(Status::Taken).cancel_phase(taker()),
            Some(CancelPhase::TakerPreBond)
        );
        for status in [
            Status::Taken,
            Status::WaitingForBoth,
            Status::WaitingForEscrow,
            Status::WaitingForInvoice,
        ] {
            assert_eq!(
                order_in(status).cancel_phase(maker()),
                Some(CancelPhase::MakerMidTrade),
                "maker cancelling in {:?}",
                status
            );
        }
        for status in [
            Status::WaitingForBoth,
            Status::WaitingForEscrow,
            Status::WaitingForInvoice,
        ] {
            assert_eq!(
                order_in(status).cancel_phase(taker()),
                Some(CancelPhase::TakerMidTrade),
                "taker cancelling in {:?}",
                status
            );
        }
        for status in [Status::Chat, Status::FiatSent, Status::PayingBuyer] {
            assert_eq!(
                order_in(status).cancel_phase(maker()),
                Some(CancelPhase::Collaborative)
            );
            assert_eq!(
                order_in(status).cancel_phase(taker()),
                Some(CancelPhase::Collaborative)
            );
        }
        assert_eq!(
            order_in(Status::Cancelled).cancel_phase(maker()),
            Some(CancelPhase::AlreadyCancelled)
        );
        assert_eq!(order_in(Status::Public).cancel_phase(stranger()), None);
        assert_eq!(order_in(Status::Success).cancel_phase(maker()), None);
        assert_eq!(order_in(Status::Expired).cancel_phase(maker()), None);
    }

    #[test]
    fn collaborative_cancel_needs_both_parties() {
        let mut order = order_in(Status::Chat);
        assert!(!order.request_cancel(maker()));
        assert!(order.is_pending_cancel());
        // asking again does not finalize
        assert!(!order.request_cancel(maker()));
        // the counterparty's request does
        assert!(order.request_cancel(taker()));
    }

    #[test]
    fn republish_detaches_the_taker_side() {
        let mut order = order_in(Status::WaitingForEscrow);
        order.taker_bond = Some(payment::Id(Uuid::from_u128(10)));
        order.trade_escrow = Some(payment::Id(Uuid::from_u128(11)));
        order.buyer_invoice = Some(payment::Id(Uuid::from_u128(12)));
        order.last_satoshis = Some(Sats(200_000));
        order.republish();
        assert_eq!(order.status, Status::Public);
        assert_eq!(order.taker, None);
        assert_eq!(order.taker_bond, None);
        assert_eq!(order.trade_escrow, None);
        assert_eq!(order.buyer_invoice, None);
        assert_eq!(order.last_satoshis, None);
    }

    #[test]
    fn expire_clears_both_parties() {
        let mut order = order_in(Status::WaitingForMakerBond);
        order.expire();
        assert_eq!(order.status, Status::Expired);
        assert_eq!(order.maker, None);
        assert_eq!(order.taker, None);
    }
}

use super::{HoldInvoice, PaymentHash, Preimage, RawInvoice};
use crate::btc::Sats;
use crate::seconds::Seconds;
use chrono::{DateTime, Duration, Utc};
use fedimint_tonic_lnd::invoicesrpc::{
    AddHoldInvoiceRequest, CancelInvoiceMsg, SettleInvoiceMsg, SubscribeSingleInvoiceRequest,
};
use fedimint_tonic_lnd::lnrpc;
use fedimint_tonic_lnd::lnrpc::invoice::InvoiceState;
use fedimint_tonic_lnd::lnrpc::payment::PaymentStatus;
use fedimint_tonic_lnd::lnrpc::PaymentFailureReason;
use fedimint_tonic_lnd::routerrpc::{SendPaymentRequest, TrackPaymentRequest};
use fedimint_tonic_lnd::tonic::{Response, Status, Streaming};
use thiserror::Error;
use url::Url;

/// Provides an interface for communicating with our Lightning node. We
/// currently run an LND node, so this type is implemented against LND.
pub struct Node {
    client: fedimint_tonic_lnd::Client,
}

impl Node {
    const PAY_TIMEOUT_SECS: i32 = 30;
    /// Routing budget for buyer payouts, in parts per million of the amount.
    const ROUTING_FEE_LIMIT_PPM: i64 = 2000;

    pub(super) async fn connect(endpoint: &Url, cert_path: &str, macaroon_path: &str) -> Self {
        let client = fedimint_tonic_lnd::connect(
            endpoint.to_string(),
            cert_path.to_owned(),
            macaroon_path.to_owned(),
        )
        .await
        .unwrap();
        Node { client }
    }

    /// Generates a hold invoice for the given amount. The preimage is created
    /// here and only ever revealed through [`Node::settle_hold_invoice`].
    pub async fn gen_hold_invoice(
        &mut self,
        amount: Sats,
        description: String,
        expiry: Seconds,
    ) -> HoldInvoice {
        let preimage = Preimage::generate();
        let payment_hash = preimage.payment_hash();
        let resp = self
            .client
            .invoices()
            .add_hold_invoice(AddHoldInvoiceRequest {
                memo: description,
                hash: payment_hash.0.clone(),
                value: amount.0,
                expiry: expiry.0,
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        let created_at = Utc::now();
        HoldInvoice {
            invoice: RawInvoice(resp.payment_request),
            preimage,
            payment_hash,
            created_at,
            expires_at: created_at + Duration::seconds(expiry.0),
        }
    }

    /// Blocks until the invoice HTLCs are locked in, or the deadline passes.
    pub async fn check_until_invoice_locked(
        &mut self,
        payment_hash: &PaymentHash,
        deadline: DateTime<Utc>,
    ) -> bool {
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        matches!(
            tokio::time::timeout(wait, self.wait_for_accept(payment_hash)).await,
            Ok(true)
        )
    }

    async fn wait_for_accept(&mut self, payment_hash: &PaymentHash) -> bool {
        let mut stream = self
            .client
            .invoices()
            .subscribe_single_invoice(SubscribeSingleInvoiceRequest {
                r_hash: payment_hash.0.clone(),
            })
            .await
            .unwrap()
            .into_inner();
        while let Ok(Some(update)) = stream.message().await {
            match update.state() {
                InvoiceState::Accepted | InvoiceState::Settled => return true,
                InvoiceState::Canceled => return false,
                InvoiceState::Open => {}
            }
        }
        false
    }

    /// Non-blocking probe for whether a hold invoice is currently locked.
    pub async fn validate_hold_invoice_locked(&mut self, payment_hash: &PaymentHash) -> bool {
        matches!(
            self.invoice_state(payment_hash).await,
            InvoiceState::Accepted
        )
    }

    /// The node is the source of truth for settlement. A payout must never
    /// start unless the escrow it draws from reports settled here.
    pub async fn double_check_htlc_is_settled(&mut self, payment_hash: &PaymentHash) -> bool {
        matches!(self.invoice_state(payment_hash).await, InvoiceState::Settled)
    }

    async fn invoice_state(&mut self, payment_hash: &PaymentHash) -> InvoiceState {
        let invoice = self
            .client
            .lightning()
            .lookup_invoice(lnrpc::PaymentHash {
                r_hash: payment_hash.0.clone(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        invoice.state()
    }

    /// Reveals the preimage, settling the hold invoice. Settling an already
    /// settled hold reports success.
    pub async fn settle_hold_invoice(&mut self, preimage: &Preimage) -> bool {
        match self
            .client
            .invoices()
            .settle_invoice(SettleInvoiceMsg {
                preimage: preimage.0.clone(),
            })
            .await
        {
            Ok(_) => true,
            Err(status) if status.message().to_lowercase().contains("already settled") => true,
            Err(status) => {
                log::error!("failed to settle hold invoice: {:?}", status);
                false
            }
        }
    }

    /// Cancels a hold invoice, releasing any locked HTLCs back to the payer.
    pub async fn cancel_hold_invoice(&mut self, payment_hash: &PaymentHash) -> bool {
        match self
            .client
            .invoices()
            .cancel_invoice(CancelInvoiceMsg {
                payment_hash: payment_hash.0.clone(),
            })
            .await
        {
            Ok(_) => true,
            Err(status) if status.message().to_lowercase().contains("already canceled") => true,
            Err(status) => {
                log::error!("failed to cancel hold invoice: {:?}", status);
                false
            }
        }
    }

    /// Attempts to route a payment for the invoice. Paying an invoice that
    /// was already paid reports success.
    pub async fn pay_invoice(
        &mut self,
        invoice: &RawInvoice,
        amount: Sats,
    ) -> Result<(), PaymentError> {
        let fee_limit_msat =
            (amount.msats().0 * Self::ROUTING_FEE_LIMIT_PPM / 1_000_000).max(1_000);
        let resp = self
            .client
            .router()
            .send_payment_v2(SendPaymentRequest {
                payment_request: invoice.0.clone(),
                no_inflight_updates: true,
                timeout_seconds: Self::PAY_TIMEOUT_SECS,
                fee_limit_msat,
                allow_self_payment: true,
                ..Default::default()
            })
            .await;
        let resp = match Self::handle_payment_error(resp) {
            Err(PaymentError::InvoiceAlreadyPaid) => return Ok(()),
            other => other?,
        };
        let payment = resp.into_inner().message().await.unwrap();
        Self::handle_payment_status(payment)
    }

    /// Whether an outbound payment with this hash has reached its terminal
    /// succeeded state.
    pub async fn check_payment_settled(&mut self, payment_hash: &PaymentHash) -> bool {
        let resp = self
            .client
            .router()
            .track_payment_v2(TrackPaymentRequest {
                payment_hash: payment_hash.0.clone(),
                no_inflight_updates: true,
            })
            .await;
        match resp {
            Ok(stream) => matches!(
                stream.into_inner().message().await,
                Ok(Some(payment)) if payment.status() == PaymentStatus::Succeeded
            ),
            Err(status) => {
                log::error!("failed to track payment: {:?}", status);
                false
            }
        }
    }

    fn handle_payment_error(
        resp: Result<Response<Streaming<lnrpc::Payment>>, Status>,
    ) -> Result<Response<Streaming<lnrpc::Payment>>, PaymentError> {
        resp.map_err(|e| {
            let msg = e.message().to_lowercase();
            if msg.contains("invoice is already paid") {
                PaymentError::InvoiceAlreadyPaid
            } else if msg.contains("invoice expired") {
                PaymentError::InvoiceExpired
            } else {
                panic!("{:?}", e);
            }
        })
    }

    fn handle_payment_status(payment: Option<lnrpc::Payment>) -> Result<(), PaymentError> {
        match payment {
            Some(payment) => match payment.status() {
                PaymentStatus::Unknown => Err(PaymentError::Unknown),
                PaymentStatus::Failed => match payment.failure_reason() {
                    PaymentFailureReason::FailureReasonTimeout => Err(PaymentError::TimedOut),
                    PaymentFailureReason::FailureReasonNoRoute => Err(PaymentError::NoRouteFound),
                    PaymentFailureReason::FailureReasonIncorrectPaymentDetails => {
                        Err(PaymentError::InvalidPaymentDetails)
                    }
                    PaymentFailureReason::FailureReasonInsufficientBalance => {
                        log::error!("insufficient liquidity error");
                        Err(PaymentError::InsufficientLiquidity)
                    }
                    PaymentFailureReason::FailureReasonNone => Err(PaymentError::Unknown),
                    PaymentFailureReason::FailureReasonError => Err(PaymentError::Unknown),
                },
                PaymentStatus::InFlight => Err(PaymentError::Unknown),
                PaymentStatus::Succeeded => Ok(()),
            },
            None => Err(PaymentError::Unknown),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum PaymentError {
    #[error("payment outcome is unknown")]
    Unknown,
    #[error("invoice has expired")]
    InvoiceExpired,
    #[error("invoice has already been paid")]
    InvoiceAlreadyPaid,
    #[error("payment timed out")]
    TimedOut,
    #[error("payment could not be routed")]
    NoRouteFound,
    #[error("invalid payment details")]
    InvalidPaymentDetails,
    #[error("insufficient node liquidity")]
    InsufficientLiquidity,
}

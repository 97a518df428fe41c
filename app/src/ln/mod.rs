//! Integration with the Lightning network. [`Node`] is the gateway the trade
//! pipeline drives; [`Lightning`] opens connections to it. BOLT11 validation
//! is local parsing and needs no node round trip.

use crate::btc::Sats;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

mod node;

pub(crate) use lightning_invoice::Invoice as ParsedInvoice;
pub use node::{Node, PaymentError};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvoiceError(pub String);

/// An unparsed BOLT11 invoice. These are also commonly referred to as
/// "payment requests".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInvoice(pub String);

impl RawInvoice {
    pub(crate) fn parse(&self) -> Result<ParsedInvoice, InvoiceError> {
        ParsedInvoice::from_str(&self.0).map_err(|e| InvoiceError(e.to_string()))
    }
}

/// Payment hash of an invoice, stored hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentHash(pub Vec<u8>);

impl PaymentHash {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Self {
        Self(hex::decode(s).unwrap())
    }
}

/// Hold-invoice preimage. Revealing it to the node settles the HTLC
/// irreversibly, so it never leaves this service until settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preimage(pub Vec<u8>);

impl Preimage {
    pub(crate) fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(bytes.to_vec())
    }

    pub(crate) fn payment_hash(&self) -> PaymentHash {
        PaymentHash(Sha256::digest(&self.0).to_vec())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Self {
        Self(hex::decode(s).unwrap())
    }
}

/// Result bag for a freshly generated hold invoice.
#[derive(Debug)]
pub struct HoldInvoice {
    pub invoice: RawInvoice,
    pub preimage: Preimage,
    pub payment_hash: PaymentHash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// An externally supplied BOLT11 invoice that passed validation.
#[derive(Debug)]
pub struct ValidatedInvoice {
    pub description: String,
    pub payment_hash: PaymentHash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Validates an externally supplied invoice: it must parse, name exactly the
/// expected amount and not be expired.
pub fn validate_ln_invoice(
    invoice: &RawInvoice,
    expected: Sats,
) -> Result<ValidatedInvoice, InvoiceError> {
    let parsed = invoice.parse()?;
    let msats = parsed.amount_milli_satoshis().unwrap_or(0);
    if msats == 0 {
        return Err(InvoiceError(
            "the invoice does not name an amount".to_owned(),
        ));
    }
    if msats != expected.msats().0 as u64 {
        return Err(InvoiceError(format!(
            "the invoice amount is {} millisats, expected exactly {} sats",
            msats, expected.0
        )));
    }
    if parsed.is_expired() {
        return Err(InvoiceError("the invoice is already expired".to_owned()));
    }
    let description = match parsed.description() {
        lightning_invoice::InvoiceDescription::Direct(d) => d.clone().into_inner(),
        lightning_invoice::InvoiceDescription::Hash(_) => String::new(),
    };
    let created_at = DateTime::<Utc>::from(parsed.timestamp());
    let expires_at = created_at
        + Duration::from_std(parsed.expiry_time()).unwrap_or_else(|_| Duration::seconds(3600));
    Ok(ValidatedInvoice {
        description,
        payment_hash: PaymentHash(parsed.payment_hash().iter().copied().collect()),
        created_at,
        expires_at,
    })
}

pub struct Config {
    pub endpoint: Url,
    pub macaroon_path: String,
    pub cert_path: String,
}

/// Represents a gateway into the Lightning network.
#[derive(Debug, Clone)]
pub struct Lightning {
    endpoint: Url,
    macaroon_path: String,
    cert_path: String,
}

impl Lightning {
    pub fn new(config: Config) -> Self {
        Self {
            endpoint: config.endpoint,
            macaroon_path: config.macaroon_path,
            cert_path: config.cert_path,
        }
    }

    /// Opens a new connection to our node.
    pub async fn create_node(&self) -> Node {
        Node::connect(&self.endpoint, &self.cert_path, &self.macaroon_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BOLT11 test vector: 2_500_000 millibitcoin (250_000 sats), long expired.
    const VECTOR: &str = "lnbc2500u1pvjluezpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdq5xysxxatsyp3k7enxv4jsxqzpuaztrnwngzn3kdzw5hydlzf03qdgm2hdq27cqv3agm2awhz5se903vruatfhq77w3ls4evs3ch9zw97j25emudupq63nyw24cg27h2rspfj9srp";

    #[test]
    fn amount_mismatch_is_rejected() {
        let err = validate_ln_invoice(&RawInvoice(VECTOR.to_owned()), Sats(250_001)).unwrap_err();
        assert!(err.0.contains("expected exactly 250001 sats"));
    }

    #[test]
    fn expired_invoice_is_rejected() {
        let err = validate_ln_invoice(&RawInvoice(VECTOR.to_owned()), Sats(250_000)).unwrap_err();
        assert!(err.0.contains("expired"));
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(validate_ln_invoice(&RawInvoice("lnbc1notaninvoice".to_owned()), Sats(1)).is_err());
    }

    #[test]
    fn preimage_hash_round_trips_through_hex() {
        let preimage = Preimage::generate();
        let hash = preimage.payment_hash();
        assert_eq!(hash.0.len(), 32);
        assert_eq!(PaymentHash::from_hex(&hash.to_hex()), hash);
        assert_eq!(Preimage::from_hex(&preimage.to_hex()), preimage);
    }
}

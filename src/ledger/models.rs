use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::TradeDetails;

/// Per-trade running balance for the automated settlement policy.
///
/// Balance arithmetic and settlement checks are exact decimal
/// operations; floats never touch these fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub trade_hash: String,
    pub fiat_balance: Decimal,
    pub expected_fiat_amount: Decimal,
    pub expected_fiat_currency: String,
    pub expected_payment_reference: String,
    pub crypto_released: bool,
}

impl LedgerRecord {
    /// The payment reference buyers are asked to quote is the trade
    /// hash itself.
    pub fn payment_reference(trade_hash: &str) -> String {
        trade_hash.to_string()
    }

    pub fn open(details: &TradeDetails) -> Self {
        Self {
            trade_hash: details.trade_hash.clone(),
            fiat_balance: Decimal::ZERO,
            expected_fiat_amount: details.fiat_amount_requested,
            expected_fiat_currency: details.fiat_currency_code.clone(),
            expected_payment_reference: Self::payment_reference(&details.trade_hash),
            crypto_released: false,
        }
    }

    /// Settled iff the accumulated balance covers the expected
    /// amount. Exact comparison; `99.99` never settles `100.00`.
    pub fn is_settled(&self) -> bool {
        self.fiat_balance >= self.expected_fiat_amount
    }
}

//! Price and settlement bookkeeping fed from CSMS replies
//!
//! Replies may carry `customData.pricePermWh`, `customData.transactionId` and
//! `customData.totalPrice`. The board keeps the latest price and the settlements
//! not yet claimed, so each port can report the amount owed when its transaction ends.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::types::ReplyCustomData;

/// Price per Wh used before the CSMS publishes one
pub const DEFAULT_PRICE_PER_WH: f64 = 10.0;

/// Unclaimed settlements kept before the oldest is dropped
const MAX_PENDING_SETTLEMENTS: usize = 16;

/// Amount settled for a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub transaction_id: Option<String>,
    pub amount: f64,
}

#[derive(Debug)]
struct PriceState {
    price_per_wh: f64,
    last_transaction_id: Option<String>,
    pending: VecDeque<Settlement>,
}

/// Shared view of the latest price and settlement
#[derive(Debug)]
pub struct PriceBoard {
    state: Mutex<PriceState>,
    settled: Notify,
}

impl Default for PriceBoard {
    fn default() -> Self {
        Self {
            state: Mutex::new(PriceState {
                price_per_wh: DEFAULT_PRICE_PER_WH,
                last_transaction_id: None,
                pending: VecDeque::new(),
            }),
            settled: Notify::new(),
        }
    }
}

impl PriceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Board starting from a configured price
    pub fn with_price(price_per_wh: f64) -> Self {
        let board = Self::default();
        board.state.lock().price_per_wh = price_per_wh;
        board
    }

    pub fn price_per_wh(&self) -> f64 {
        self.state.lock().price_per_wh
    }

    pub fn last_transaction_id(&self) -> Option<String> {
        self.state.lock().last_transaction_id.clone()
    }

    /// Fold reply custom data into the board. `context_tx` is the transaction
    /// the reply belongs to, used when the reply names none itself.
    ///
    /// Returns the new price when it changed.
    pub fn absorb(&self, custom: &ReplyCustomData, context_tx: Option<&str>) -> Option<f64> {
        let mut changed = None;
        let mut settled = false;

        {
            let mut state = self.state.lock();

            if let Some(price) = custom.price_perm_wh {
                if price != state.price_per_wh {
                    state.price_per_wh = price;
                    changed = Some(price);
                }
            }

            let tx = custom
                .transaction_label()
                .or_else(|| context_tx.map(str::to_string));

            if let Some(label) = custom.transaction_label() {
                state.last_transaction_id = Some(label);
            }

            if let Some(amount) = custom.total_price {
                // A newer total for the same transaction replaces the older one
                state.pending.retain(|s| s.transaction_id != tx);
                state.pending.push_back(Settlement {
                    transaction_id: tx,
                    amount,
                });
                if state.pending.len() > MAX_PENDING_SETTLEMENTS {
                    if let Some(dropped) = state.pending.pop_front() {
                        debug!(?dropped, "Dropping unclaimed settlement");
                    }
                }
                settled = true;
            }
        }

        if let Some(price) = changed {
            info!(price, "Price updated");
        }
        if settled {
            self.settled.notify_waiters();
        }

        changed
    }

    /// Take the settlement for `transaction_id` if one has arrived.
    /// A settlement naming no transaction is claimed by the first taker.
    pub fn take_settlement(&self, transaction_id: &str) -> Option<f64> {
        let mut state = self.state.lock();
        let idx = state
            .pending
            .iter()
            .position(|s| s.transaction_id.as_deref() == Some(transaction_id))
            .or_else(|| state.pending.iter().position(|s| s.transaction_id.is_none()))?;
        state.pending.remove(idx).map(|s| s.amount)
    }

    /// Wait up to `bound` for the settlement of `transaction_id`
    pub async fn wait_settlement(&self, transaction_id: &str, bound: Duration) -> Option<f64> {
        let deadline = Instant::now() + bound;

        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(amount) = self.take_settlement(transaction_id) {
                return Some(amount);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

//! Crossing and Price Selection
//!
//! The pure order-book rules: when a (buy, sell) pair crosses, what price a
//! match executes at, and which candidate a scan of the sorted book picks.

use rust_decimal::Decimal;

use super::types::MatchCandidate;
use crate::models::Order;
use crate::services::read_model::MIN_REMAINING;

/// A buy and a sell cross when both still have real remaining quantity and
/// the buyer's acceptable price reaches the seller's ask. A market order on
/// either side crosses anything.
pub fn crosses(buy: &Order, sell: &Order) -> bool {
    if buy.remaining() <= MIN_REMAINING || sell.remaining() <= MIN_REMAINING {
        return false;
    }
    match (buy.price, sell.price) {
        (Some(bid), Some(ask)) => bid >= ask,
        // Market orders (no price) cross anything
        _ => true,
    }
}

/// Execution price under the maker-price rule: the resting sell's limit when
/// both sides are Limit, the priced side when the other is Market. Two
/// market orders fall back to the pair's last trade price; without one there
/// is no price to execute at.
pub fn execution_price(buy: &Order, sell: &Order, last_trade: Option<Decimal>) -> Option<Decimal> {
    match (buy.price, sell.price) {
        (Some(_), Some(ask)) => Some(ask),
        (None, Some(ask)) => Some(ask),
        (Some(bid), None) => Some(bid),
        (None, None) => last_trade,
    }
}

/// Scan sorted `buys` x `sells` best-first and return the first crossing
/// candidate not suppressed by the re-match guard. At most one candidate is
/// selected per call, which bounds each cycle to one match per pair.
pub fn select_match<F>(
    buys: &[Order],
    sells: &[Order],
    recently_matched: F,
    last_trade: Option<Decimal>,
) -> Option<MatchCandidate>
where
    F: Fn(&str, &str) -> bool,
{
    for buy in buys {
        for sell in sells {
            if recently_matched(&buy.contract_id, &sell.contract_id) {
                continue;
            }
            if !crosses(buy, sell) {
                continue;
            }
            let price = match execution_price(buy, sell, last_trade) {
                Some(price) => price,
                // Two market orders against an empty trade history; nothing
                // to price the match with this cycle
                None => continue,
            };
            let quantity = buy.remaining().min(sell.remaining());
            return Some(MatchCandidate {
                buy: buy.clone(),
                sell: sell.clone(),
                quantity,
                price,
            });
        }
    }
    None
}

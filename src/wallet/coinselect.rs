//! Coin selection: choosing which owned outputs fund a spend.

use crate::chain::transaction::OutPoint;
use crate::primitives::Script;

/// A spendable output candidate offered to a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub outpoint: OutPoint,
    pub value: i64,
    pub script_pubkey: Script,
    /// Confirmation height; `None` while unconfirmed.
    pub height: Option<u32>,
    /// True when the creating transaction was authored by this wallet.
    pub from_self: bool,
    pub coinbase: bool,
}

impl Candidate {
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        match self.height {
            Some(h) if h <= tip_height => tip_height - h + 1,
            _ => 0,
        }
    }
}

/// Strategy interface: pick candidates summing to at least `target`.
/// Returns the chosen subset, or all-it-could-find when the total falls
/// short (the caller turns that into `InsufficientMoney`).
pub trait CoinSelector: Send + Sync {
    fn select(&self, target: i64, candidates: Vec<Candidate>, tip_height: u32) -> Vec<Candidate>;
}

/// Default policy: confirmed coins oldest-first, then unconfirmed
/// change we authored ourselves. Unconfirmed coins from other parties
/// are never selected, and immature coinbases are skipped.
#[derive(Debug, Clone)]
pub struct DefaultCoinSelector {
    pub min_confirmations: u32,
    pub coinbase_maturity: u32,
}

impl DefaultCoinSelector {
    pub fn new(min_confirmations: u32, coinbase_maturity: u32) -> Self {
        DefaultCoinSelector {
            min_confirmations,
            coinbase_maturity,
        }
    }
}

impl CoinSelector for DefaultCoinSelector {
    fn select(&self, target: i64, candidates: Vec<Candidate>, tip_height: u32) -> Vec<Candidate> {
        let mut eligible: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| {
                let confs = c.confirmations(tip_height);
                if c.coinbase && confs < self.coinbase_maturity {
                    return false;
                }
                if confs >= self.min_confirmations && confs > 0 {
                    return true;
                }
                // Unconfirmed: only self-authored change is trusted.
                c.from_self
            })
            .collect();

        // Oldest first; unconfirmed (height None) sorts last. Value
        // breaks ties so selection is deterministic.
        eligible.sort_by_key(|c| (c.height.unwrap_or(u32::MAX), std::cmp::Reverse(c.value)));

        let mut selected = Vec::new();
        let mut total: i64 = 0;
        for candidate in eligible {
            if total >= target {
                break;
            }
            total += candidate.value;
            selected.push(candidate);
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Hash160, Sha256dHash};

    fn candidate(value: i64, height: Option<u32>, from_self: bool, coinbase: bool) -> Candidate {
        Candidate {
            outpoint: OutPoint::new(Sha256dHash::digest(&value.to_le_bytes()), 0),
            value,
            script_pubkey: Script::pay_to_pubkey_hash(&Hash160([1; 20])),
            height,
            from_self,
            coinbase,
        }
    }

    #[test]
    fn oldest_confirmed_first() {
        let selector = DefaultCoinSelector::new(1, 100);
        let picked = selector.select(
            1500,
            vec![
                candidate(1000, Some(90), false, false),
                candidate(1000, Some(10), false, false),
            ],
            100,
        );
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].height, Some(10));
    }

    #[test]
    fn refuses_unconfirmed_from_others() {
        let selector = DefaultCoinSelector::new(1, 100);
        let picked = selector.select(500, vec![candidate(1000, None, false, false)], 100);
        assert!(picked.is_empty());
    }

    #[test]
    fn accepts_unconfirmed_from_self_as_fallback() {
        let selector = DefaultCoinSelector::new(1, 100);
        let picked = selector.select(
            1500,
            vec![
                candidate(1000, Some(50), false, false),
                candidate(1000, None, true, false),
            ],
            100,
        );
        assert_eq!(picked.len(), 2);
        // Confirmed coin is taken first.
        assert_eq!(picked[0].height, Some(50));
        assert_eq!(picked[1].height, None);
    }

    #[test]
    fn immature_coinbase_skipped() {
        let selector = DefaultCoinSelector::new(1, 100);
        let picked = selector.select(
            100,
            vec![candidate(5000, Some(950), false, true)],
            1000, // 51 confirmations < 100
        );
        assert!(picked.is_empty());

        let picked = selector.select(100, vec![candidate(5000, Some(900), false, true)], 1000);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn stops_once_target_met() {
        let selector = DefaultCoinSelector::new(1, 100);
        let picked = selector.select(
            900,
            vec![
                candidate(1000, Some(1), false, false),
                candidate(1000, Some(2), false, false),
                candidate(1000, Some(3), false, false),
            ],
            10,
        );
        assert_eq!(picked.len(), 1);
    }
}

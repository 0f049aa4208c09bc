//! Address book: candidate peers with per-address exponential backoff
//! and temporary bans.

use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Gossiped addresses older than this are not worth keeping.
pub const MAX_ADDR_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);
/// Book size cap; older entries are evicted first.
const MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone)]
struct AddrInfo {
    /// Unix time the address was last vouched for.
    last_seen: u64,
    failures: u32,
    not_before: Instant,
    banned_until: Option<Instant>,
}

/// Backoff policy: `start * 2^failures`, capped, with ±20% jitter.
#[derive(Debug, Clone)]
pub struct AddressBook {
    entries: HashMap<SocketAddr, AddrInfo>,
    backoff_start: Duration,
    backoff_cap: Duration,
    ban_duration: Duration,
}

impl AddressBook {
    pub fn new(backoff_start: Duration, backoff_cap: Duration, ban_duration: Duration) -> Self {
        AddressBook {
            entries: HashMap::new(),
            backoff_start,
            backoff_cap,
            ban_duration,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, addr: SocketAddr, last_seen: u64) {
        if self.entries.len() >= MAX_ENTRIES && !self.entries.contains_key(&addr) {
            // Evict the stalest entry to make room.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, info)| info.last_seen)
                .map(|(a, _)| *a)
            {
                self.entries.remove(&oldest);
            }
        }
        let entry = self.entries.entry(addr).or_insert(AddrInfo {
            last_seen,
            failures: 0,
            not_before: Instant::now(),
            banned_until: None,
        });
        entry.last_seen = entry.last_seen.max(last_seen);
    }

    /// Up to `count` connectable addresses, freshest first, excluding
    /// everything backed off, banned, or in `exclude`.
    pub fn pick(&self, count: usize, exclude: &[SocketAddr]) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut usable: Vec<(&SocketAddr, &AddrInfo)> = self
            .entries
            .iter()
            .filter(|(addr, info)| {
                !exclude.contains(addr)
                    && info.not_before <= now
                    && info.banned_until.map(|t| t <= now).unwrap_or(true)
            })
            .collect();
        usable.sort_by_key(|(_, info)| std::cmp::Reverse(info.last_seen));
        usable.into_iter().take(count).map(|(a, _)| *a).collect()
    }

    pub fn record_success(&mut self, addr: SocketAddr) {
        if let Some(info) = self.entries.get_mut(&addr) {
            info.failures = 0;
            info.not_before = Instant::now();
            info.banned_until = None;
        }
    }

    pub fn record_failure(&mut self, addr: SocketAddr) {
        let backoff_start = self.backoff_start;
        let backoff_cap = self.backoff_cap;
        let info = self.entries.entry(addr).or_insert(AddrInfo {
            last_seen: 0,
            failures: 0,
            not_before: Instant::now(),
            banned_until: None,
        });
        let exp = info.failures.min(21); // 1s << 21 is past any sane cap
        let base = backoff_start
            .saturating_mul(1u32 << exp)
            .min(backoff_cap);
        // ±20% jitter keeps a herd of wallets from thundering.
        let jitter = 0.8 + rand::thread_rng().gen::<f64>() * 0.4;
        info.not_before = Instant::now() + base.mul_f64(jitter);
        info.failures += 1;
    }

    /// Misbehavior ban for the configured duration.
    pub fn ban(&mut self, addr: SocketAddr) {
        let ban_duration = self.ban_duration;
        let info = self.entries.entry(addr).or_insert(AddrInfo {
            last_seen: 0,
            failures: 0,
            not_before: Instant::now(),
            banned_until: None,
        });
        info.banned_until = Some(Instant::now() + ban_duration);
        log::warn!("banned {} for {:?}", addr, ban_duration);
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.entries
            .get(addr)
            .and_then(|i| i.banned_until)
            .map(|t| t > Instant::now())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:8333", n).parse().unwrap()
    }

    fn book() -> AddressBook {
        AddressBook::new(
            Duration::from_secs(1),
            Duration::from_secs(1800),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn pick_prefers_freshest_and_excludes() {
        let mut book = book();
        book.add(addr(1), 100);
        book.add(addr(2), 300);
        book.add(addr(3), 200);

        let picked = book.pick(2, &[addr(2)]);
        assert_eq!(picked, vec![addr(3), addr(1)]);
    }

    #[test]
    fn failure_backs_off_and_success_resets() {
        let mut book = book();
        book.add(addr(1), 100);
        book.record_failure(addr(1));
        assert!(book.pick(5, &[]).is_empty());

        book.record_success(addr(1));
        assert_eq!(book.pick(5, &[]), vec![addr(1)]);
    }

    #[test]
    fn backoff_grows_but_caps() {
        let mut book = book();
        book.add(addr(1), 100);
        for _ in 0..40 {
            book.record_failure(addr(1));
        }
        let info = book.entries.get(&addr(1)).unwrap();
        // Even with jitter the delay stays at or under cap * 1.2.
        let delay = info.not_before.duration_since(Instant::now());
        assert!(delay <= Duration::from_secs(1800).mul_f64(1.21));
        assert!(delay >= Duration::from_secs(1800).mul_f64(0.79));
    }

    #[test]
    fn banned_addresses_never_picked() {
        let mut book = book();
        book.add(addr(1), 100);
        book.ban(addr(1));
        assert!(book.is_banned(&addr(1)));
        assert!(book.pick(5, &[]).is_empty());
    }

    #[test]
    fn book_is_bounded() {
        let mut book = book();
        for i in 0..=255u8 {
            for j in 0..4u8 {
                let a: SocketAddr = format!("10.0.{}.{}:8333", j, i).parse().unwrap();
                book.add(a, (i as u64) * 4 + j as u64);
            }
        }
        assert!(book.len() <= MAX_ENTRIES);
    }
}

//! Mapping records kept by the client, and the refresh-timer discipline.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::protocol::Protocol;

/// When the next refresh for a mapping is due, and how many times it has
/// gone unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTime {
    /// Consecutive refreshes without a confirming response. Reset to 0 by
    /// every successful map or peer response.
    pub attempt: u32,
    /// Instant at which the next refresh is due.
    pub time: Instant,
}

impl RefreshTime {
    /// Floor for the delay until the next refresh.
    const MIN_DELAY: Duration = Duration::from_secs(4);

    /// Picks the next refresh instant for a mapping of the given lifetime.
    ///
    /// Per [RFC 6887 §11.2.1], the delay is drawn uniformly from
    /// `[lifetime / 2^(attempt+1), 5 * lifetime / 2^(attempt+3))`, so the
    /// first refresh lands between one half and five eighths of the
    /// lifetime, and retries back off towards the mapping's expiry. Empty or
    /// too-short intervals collapse to a four second delay.
    ///
    /// [RFC 6887 §11.2.1]: https://datatracker.ietf.org/doc/html/rfc6887#section-11.2.1
    pub fn next<R: Rng>(attempt: u32, lifetime_seconds: u32, rng: &mut R) -> RefreshTime {
        let lifetime = u64::from(lifetime_seconds);
        let lower = lifetime.checked_shr(attempt + 1).unwrap_or_default();
        let upper = (5 * lifetime).checked_shr(attempt + 3).unwrap_or_default();
        let delay = if upper > lower {
            rng.gen_range(lower..upper)
        } else {
            0
        };
        let delay = Duration::from_secs(delay).max(Self::MIN_DELAY);
        RefreshTime {
            attempt,
            time: Instant::now() + delay,
        }
    }

    /// Whether the refresh is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.time <= now
    }
}

/// A port mapping negotiated (or being negotiated) with the gateway.
///
/// External fields are the client's suggestion until the mapping is
/// [`active`](PortMapping::active); after the first successful response they
/// hold what the server actually assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    /// Internal (client side) port; key of the mapping.
    pub internal_port: u16,
    pub external_port: u16,
    pub external_addr: IpAddr,
    /// False until the server confirms the mapping.
    pub active: bool,
    /// Lifetime in seconds. The server's returned value once active.
    pub lifetime_seconds: u32,
    pub refresh: RefreshTime,
}

/// A [`PortMapping`] narrowed to a single remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMapping {
    pub mapping: PortMapping,
    pub remote_port: u16,
    pub remote_addr: IpAddr,
}

/// The two keyed mapping tables owned by the client engine.
///
/// The tables are disjoint: a map and a peer mapping may share an internal
/// port, they identify distinct flows. No locking here; the engine task is
/// the only mutator.
#[derive(Debug, Default)]
pub(crate) struct MappingStore {
    pub maps: HashMap<u16, PortMapping>,
    pub peers: HashMap<u16, PeerMapping>,
}

impl MappingStore {
    /// Internal ports of port mappings with a due refresh.
    pub fn due_maps(&self, now: Instant) -> Vec<u16> {
        self.maps
            .values()
            .filter(|m| m.active && m.refresh.is_due(now))
            .map(|m| m.internal_port)
            .collect()
    }

    /// Internal ports of peer mappings with a due refresh.
    pub fn due_peers(&self, now: Instant) -> Vec<u16> {
        self.peers
            .values()
            .filter(|p| p.mapping.active && p.mapping.refresh.is_due(now))
            .map(|p| p.mapping.internal_port)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn first_refresh_is_between_half_and_five_eighths() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            let now = Instant::now();
            let refresh = RefreshTime::next(0, 3600, &mut rng);
            let delay = refresh.time.duration_since(now).as_secs();
            assert!((1800..2250).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn retries_back_off_towards_expiry() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            let now = Instant::now();
            let refresh = RefreshTime::next(1, 3600, &mut rng);
            let delay = refresh.time.duration_since(now).as_secs();
            assert!((900..1125).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn short_lifetimes_hit_the_floor() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        // empty interval: lower 0, upper 0
        let now = Instant::now();
        let refresh = RefreshTime::next(0, 0, &mut rng);
        assert_eq!(refresh.time.duration_since(now).as_secs(), 4);

        // tiny lifetime collapses below the floor
        let now = Instant::now();
        let refresh = RefreshTime::next(0, 7, &mut rng);
        assert!(refresh.time.duration_since(now).as_secs() >= 4);

        // very large attempts must not panic on the shift
        let refresh = RefreshTime::next(70, 3600, &mut rng);
        assert_eq!(refresh.attempt, 70);
    }

    #[test]
    fn due_scan_skips_inactive_and_future_mappings() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut store = MappingStore::default();
        let template = PortMapping {
            protocol: Protocol::Tcp,
            internal_port: 1,
            external_port: 0,
            external_addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            active: true,
            lifetime_seconds: 3600,
            refresh: RefreshTime::next(0, 3600, &mut rng),
        };

        let now = Instant::now();
        let due = RefreshTime { attempt: 0, time: now };

        store.maps.insert(1, PortMapping { refresh: due, ..template.clone() });
        store.maps.insert(
            2,
            PortMapping {
                internal_port: 2,
                active: false,
                refresh: due,
                ..template.clone()
            },
        );
        store.maps.insert(3, PortMapping { internal_port: 3, ..template });

        assert_eq!(store.due_maps(now), vec![1]);
    }
}

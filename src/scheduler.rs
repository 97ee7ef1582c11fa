//! Connection scheduler.
//!
//! Decides which scanned peripheral each free slot should connect to,
//! throttles connection attempts, enforces the connect watchdog and
//! resolves reachability overlap between slots.

use std::collections::BTreeSet;

use crate::controller::Effect;
use crate::scanner::CandidatePool;
use crate::session::MeshSession;

/// Scan settling time before the first connection attempt.
const STARTUP_DELAY_MS: u64 = 10_000;
/// Cooldown while no session is up.
const RELAXED_COOLDOWN_MS: u64 = 5_000;
/// Cooldown that forces a retry even while connected, so an extra slot
/// can pick up mesh ids the current ones do not reach.
const FORCED_COOLDOWN_MS: u64 = 20_000;

/// What a scheduler pass decided.
#[derive(Debug, Default)]
pub struct SchedulerOutcome {
    pub effects: Vec<Effect>,
    /// Mesh ids orphaned by a dropped slot; the controller marks these
    /// offline.
    pub offline_ids: Vec<u16>,
    /// Slots whose connection state changed, prompting a status publish.
    pub dropped_slots: Vec<usize>,
}

pub struct ConnectionScheduler {
    min_rssi: i16,
    last_attempt: u64,
}

impl ConnectionScheduler {
    pub fn new(min_rssi: i16) -> Self {
        Self {
            min_rssi,
            last_attempt: 0,
        }
    }

    /// One pass of the scheduling loop.
    pub fn tick(
        &mut self,
        now: u64,
        sessions: &mut [MeshSession],
        pool: &mut CandidatePool,
    ) -> SchedulerOutcome {
        let mut outcome = SchedulerOutcome::default();

        self.run_watchdog(now, sessions, pool, &mut outcome);

        if now < STARTUP_DELAY_MS || pool.is_empty() {
            return outcome;
        }

        let since_last_attempt = now.saturating_sub(self.last_attempt);
        let any_established = sessions.iter().any(|s| s.is_established());
        let relaxed = !any_established && since_last_attempt > RELAXED_COOLDOWN_MS;
        if !relaxed && since_last_attempt <= FORCED_COOLDOWN_MS {
            return outcome;
        }

        self.resolve_overlap(sessions, pool, &mut outcome);

        let union_reachable: BTreeSet<u16> = sessions
            .iter()
            .filter(|s| s.is_established())
            .flat_map(|s| s.reachable().iter().copied())
            .collect();

        // One connection attempt per pass, on the first free slot.
        let Some(session) = sessions.iter_mut().find(|s| s.is_free()) else {
            return outcome;
        };
        let Some(found) = pool.best_candidate(self.min_rssi, &union_reachable) else {
            return outcome;
        };

        let found = found.clone();
        self.last_attempt = now;
        session.connect_to(&found, now);
        pool.set_connected(found.address, true);
        outcome.effects.push(Effect::Connect {
            slot: session.slot(),
            address: found.address,
        });

        outcome
    }

    /// Frees slots whose connect attempt never reached the established
    /// state within the watchdog window.
    fn run_watchdog(
        &self,
        now: u64,
        sessions: &mut [MeshSession],
        pool: &mut CandidatePool,
        outcome: &mut SchedulerOutcome,
    ) {
        for session in sessions.iter_mut() {
            if !session.watchdog_expired(now) {
                continue;
            }
            tracing::info!(
                "[{}] [{}] connect watchdog expired, freeing slot",
                session.slot(),
                session.address_str()
            );
            let slot = session.slot();
            let address = session.address();
            outcome.effects.push(Effect::Disconnect { slot });
            outcome.offline_ids.extend(session.on_disconnected());
            outcome.dropped_slots.push(slot);
            pool.set_connected(address, false);
        }
    }

    /// Two slots must not redundantly cover the same mesh ids. For each
    /// adjacent established pair, the slot with the larger reach is the
    /// redundant one and gets dropped.
    fn resolve_overlap(
        &self,
        sessions: &mut [MeshSession],
        pool: &mut CandidatePool,
        outcome: &mut SchedulerOutcome,
    ) {
        for i in 0..sessions.len().saturating_sub(1) {
            let (a, b) = (&sessions[i], &sessions[i + 1]);
            if !a.is_established() || !b.is_established() {
                continue;
            }
            let overlap: Vec<u16> = a
                .reachable()
                .intersection(b.reachable())
                .copied()
                .collect();
            if overlap.is_empty() {
                continue;
            }

            let drop_index = if a.reachable().len() >= b.reachable().len() {
                i
            } else {
                i + 1
            };
            tracing::info!(
                "slots {} and {} overlap on {:?}, dropping slot {}",
                i,
                i + 1,
                overlap,
                drop_index
            );

            let session = &mut sessions[drop_index];
            let address = session.address();
            outcome.offline_ids.extend(session.take_reachable());
            session.begin_disconnect();
            outcome.effects.push(Effect::Disconnect {
                slot: session.slot(),
            });
            outcome.dropped_slots.push(session.slot());
            pool.set_connected(address, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, combine_credentials};
    use crate::session::PairOutcome;

    fn sessions(n: usize) -> Vec<MeshSession> {
        let combined = combine_credentials("meshA", "p");
        (0..n).map(|i| MeshSession::new(i, combined, 180)).collect()
    }

    fn pool_with(entries: &[(u64, &str, i16)], now: u64) -> CandidatePool {
        let mut pool = CandidatePool::new("A4:C1", &[]);
        for (address, mac, rssi) in entries {
            assert!(pool.observe(*address, mac, *rssi, now));
        }
        pool
    }

    fn establish(session: &mut MeshSession, pool: &mut CandidatePool, address: u64, now: u64) {
        let found = pool.get(address).expect("entry").clone();
        session.connect_to(&found, now);
        pool.set_connected(address, true);
        session.on_connected(now);
        let mut reply = vec![crypto::PAIR_GRANTED];
        reply.extend_from_slice(&[0; 8]);
        assert_eq!(session.on_pair_response(&reply), PairOutcome::Established);
    }

    #[test]
    fn waits_for_startup_delay() {
        let mut scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(1);
        let mut pool = pool_with(&[(1, "A4:C1:00:00:00:01", -60)], 5_000);

        let outcome = scheduler.tick(9_999, &mut sessions, &mut pool);
        assert!(outcome.effects.is_empty());

        let outcome = scheduler.tick(10_001, &mut sessions, &mut pool);
        assert!(matches!(
            outcome.effects[..],
            [Effect::Connect { slot: 0, address: 1 }]
        ));
        assert_eq!(sessions[0].address(), 1);
        assert!(pool.get(1).unwrap().connected);
    }

    #[test]
    fn one_attempt_per_tick_and_cooldown() {
        let mut scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(2);
        let mut pool = pool_with(
            &[
                (1, "A4:C1:00:00:00:01", -50),
                (2, "A4:C1:00:00:00:02", -60),
            ],
            5_000,
        );

        let outcome = scheduler.tick(11_000, &mut sessions, &mut pool);
        assert_eq!(outcome.effects.len(), 1);

        // Cooldown: the second slot has to wait for the relaxed window.
        let outcome = scheduler.tick(11_050, &mut sessions, &mut pool);
        assert!(outcome.effects.is_empty());

        let outcome = scheduler.tick(16_100, &mut sessions, &mut pool);
        assert!(matches!(
            outcome.effects[..],
            [Effect::Connect { slot: 1, address: 2 }]
        ));
    }

    #[test]
    fn forced_cooldown_retries_while_connected() {
        let mut scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(2);
        let mut pool = pool_with(
            &[
                (1, "A4:C1:00:00:00:01", -50),
                (2, "A4:C1:00:00:00:02", -60),
            ],
            5_000,
        );

        let outcome = scheduler.tick(11_000, &mut sessions, &mut pool);
        assert_eq!(outcome.effects.len(), 1);
        establish(&mut sessions[0], &mut pool, 1, 11_000);
        pool.observe(2, "A4:C1:00:00:00:02", -60, 11_000);

        // Relaxed window does not apply while a session is up.
        let outcome = scheduler.tick(17_000, &mut sessions, &mut pool);
        assert!(outcome.effects.is_empty());

        // The forced window does.
        pool.observe(2, "A4:C1:00:00:00:02", -60, 31_000);
        let outcome = scheduler.tick(31_100, &mut sessions, &mut pool);
        assert!(matches!(
            outcome.effects[..],
            [Effect::Connect { slot: 1, address: 2 }]
        ));
    }

    #[test]
    fn stale_candidates_are_skipped() {
        let mut scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(1);
        let mut pool = pool_with(&[(1, "A4:C1:00:00:00:01", -60)], 0);
        pool.refresh(20_001);

        let outcome = scheduler.tick(20_100, &mut sessions, &mut pool);
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn watchdog_frees_stuck_slot() {
        let mut scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(1);
        let mut pool = pool_with(&[(1, "A4:C1:00:00:00:01", -60)], 5_000);

        scheduler.tick(10_001, &mut sessions, &mut pool);
        assert!(!sessions[0].is_free());

        // Never establishes and stops advertising; 20 s later the slot
        // is reclaimed and the stale entry is no longer retried.
        pool.refresh(30_002);
        let outcome = scheduler.tick(30_002, &mut sessions, &mut pool);
        assert!(outcome
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Disconnect { slot: 0 })));
        assert!(!outcome
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Connect { .. })));
        assert!(sessions[0].is_free());
        assert!(!pool.get(1).unwrap().connected);
    }

    #[test]
    fn overlap_drops_the_larger_reach() {
        let scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(2);
        let mut pool = pool_with(
            &[
                (1, "A4:C1:00:00:00:01", -50),
                (2, "A4:C1:00:00:00:02", -60),
            ],
            5_000,
        );
        establish(&mut sessions[0], &mut pool, 1, 11_000);
        establish(&mut sessions[1], &mut pool, 2, 12_000);

        for id in [1u16, 2, 3, 4] {
            sessions[0].insert_reachable(id);
        }
        for id in [3u16, 4] {
            sessions[1].insert_reachable(id);
        }

        let mut outcome = SchedulerOutcome::default();
        scheduler.resolve_overlap(&mut sessions, &mut pool, &mut outcome);

        assert!(matches!(
            outcome.effects[..],
            [Effect::Disconnect { slot: 0 }]
        ));
        assert_eq!(outcome.offline_ids, vec![1, 2, 3, 4]);
        assert!(sessions[0].reachable().is_empty());
        assert_eq!(sessions[1].reachable().len(), 2);
    }

    #[test]
    fn overlap_tie_drops_the_first_slot() {
        let scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(2);
        let mut pool = pool_with(
            &[
                (1, "A4:C1:00:00:00:01", -50),
                (2, "A4:C1:00:00:00:02", -60),
            ],
            5_000,
        );
        establish(&mut sessions[0], &mut pool, 1, 11_000);
        establish(&mut sessions[1], &mut pool, 2, 12_000);
        sessions[0].insert_reachable(3);
        sessions[1].insert_reachable(3);

        let mut outcome = SchedulerOutcome::default();
        scheduler.resolve_overlap(&mut sessions, &mut pool, &mut outcome);
        assert!(matches!(
            outcome.effects[..],
            [Effect::Disconnect { slot: 0 }]
        ));
    }

    #[test]
    fn disjoint_slots_are_left_alone() {
        let scheduler = ConnectionScheduler::new(-90);
        let mut sessions = sessions(2);
        let mut pool = pool_with(
            &[
                (1, "A4:C1:00:00:00:01", -50),
                (2, "A4:C1:00:00:00:02", -60),
            ],
            5_000,
        );
        establish(&mut sessions[0], &mut pool, 1, 11_000);
        establish(&mut sessions[1], &mut pool, 2, 12_000);
        sessions[0].insert_reachable(1);
        sessions[1].insert_reachable(2);

        let mut outcome = SchedulerOutcome::default();
        scheduler.resolve_overlap(&mut sessions, &mut pool, &mut outcome);
        assert!(outcome.effects.is_empty());
    }
}

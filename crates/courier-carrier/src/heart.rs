/// Heart — passive liveness monitoring.
///
/// Pure state machine: the owner calls [`Heart::tick`] once per beat
/// interval and acts on the returned deaths. Because a single event loop
/// owns the heart, a ping accepted before a death decision is always
/// ordered before it.
use std::collections::HashMap;
use std::hash::Hash;

/// Error from [`Heart::ping`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("entity not monitored")]
pub struct NotMonitored;

struct Entity {
    /// Consecutive beats without a ping.
    strikes: u32,
    /// Whether a ping arrived since the previous beat.
    pinged: bool,
}

/// A set of watched identifiers with per-beat strike counting.
///
/// An entity is alive iff it received at least one ping within the last
/// `kill_threshold` beats. On reaching the threshold it is removed and
/// reported dead exactly once.
pub struct Heart<I> {
    entities: HashMap<I, Entity>,
    kill_threshold: u32,
}

impl<I: Eq + Hash + Clone> Heart<I> {
    pub fn new(kill_threshold: u32) -> Self {
        Self {
            entities: HashMap::new(),
            kill_threshold,
        }
    }

    /// Begin tracking an identifier. Re-monitoring resets its state.
    pub fn monitor(&mut self, id: I) {
        self.entities.insert(
            id,
            Entity {
                strikes: 0,
                pinged: true,
            },
        );
    }

    /// Stop tracking an identifier. Succeeds silently if absent.
    pub fn unmonitor(&mut self, id: &I) {
        self.entities.remove(id);
    }

    /// Record a liveness ping. Fails only if the id is not monitored.
    pub fn ping(&mut self, id: &I) -> Result<(), NotMonitored> {
        let entity = self.entities.get_mut(id).ok_or(NotMonitored)?;
        entity.pinged = true;
        entity.strikes = 0;
        Ok(())
    }

    /// Advance one beat; returns the identifiers that died this beat.
    ///
    /// Death is checked before strike accounting, so an entity that
    /// reached the threshold on the previous beat is reported now and
    /// never again.
    pub fn tick(&mut self) -> Vec<I> {
        let threshold = self.kill_threshold;
        let mut dead = Vec::new();

        self.entities.retain(|id, entity| {
            if entity.strikes >= threshold {
                dead.push(id.clone());
                return false;
            }
            if entity.pinged {
                entity.strikes = 0;
            } else {
                entity.strikes += 1;
            }
            entity.pinged = false;
            true
        });

        dead
    }

    /// Whether an identifier is currently tracked.
    pub fn monitored(&self, id: &I) -> bool {
        self.entities.contains_key(id)
    }

    /// Number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinged_entity_never_dies() {
        let mut heart: Heart<u32> = Heart::new(3);
        heart.monitor(1);

        for _ in 0..20 {
            heart.ping(&1).unwrap();
            assert!(heart.tick().is_empty());
        }
        assert!(heart.monitored(&1));
    }

    #[test]
    fn silent_entity_dies_exactly_once() {
        let mut heart: Heart<u32> = Heart::new(3);
        heart.monitor(1);

        let mut deaths = Vec::new();
        for beat in 0..10 {
            for id in heart.tick() {
                deaths.push((beat, id));
            }
        }

        assert_eq!(deaths.len(), 1);
        let (beat, id) = deaths[0];
        assert_eq!(id, 1);
        // Death within [threshold - 1, threshold + 1] beats.
        assert!((2..=4).contains(&beat), "died at beat {beat}");
        assert!(!heart.monitored(&1));
    }

    #[test]
    fn ping_resets_strikes() {
        let mut heart: Heart<u32> = Heart::new(2);
        heart.monitor(1);

        // Miss one beat, then ping: the strike counter must restart.
        assert!(heart.tick().is_empty());
        assert!(heart.tick().is_empty());
        heart.ping(&1).unwrap();
        assert!(heart.tick().is_empty());
        assert!(heart.tick().is_empty());
        assert!(heart.tick().is_empty());
        // Strikes reached the threshold on the previous beat; death is
        // reported on the one after.
        assert_eq!(heart.tick(), vec![1]);
    }

    #[test]
    fn ping_unmonitored_fails() {
        let mut heart: Heart<u32> = Heart::new(3);
        assert_eq!(heart.ping(&9), Err(NotMonitored));
    }

    #[test]
    fn unmonitor_is_silent_when_absent() {
        let mut heart: Heart<u32> = Heart::new(3);
        heart.unmonitor(&9);
        assert!(heart.is_empty());
    }

    #[test]
    fn unmonitored_entity_never_reported() {
        let mut heart: Heart<u32> = Heart::new(2);
        heart.monitor(1);
        heart.tick();
        heart.unmonitor(&1);

        for _ in 0..10 {
            assert!(heart.tick().is_empty());
        }
    }

    #[test]
    fn independent_entities() {
        let mut heart: Heart<u32> = Heart::new(2);
        heart.monitor(1);
        heart.monitor(2);

        // Keep 1 alive, let 2 die.
        let mut dead = Vec::new();
        for _ in 0..6 {
            heart.ping(&1).unwrap();
            dead.extend(heart.tick());
        }
        assert_eq!(dead, vec![2]);
        assert!(heart.monitored(&1));
    }

    #[test]
    fn remonitor_resets_strikes() {
        let mut heart: Heart<u32> = Heart::new(2);
        heart.monitor(1);
        heart.tick();
        heart.tick();
        heart.monitor(1);

        // Fresh state: takes the full threshold again.
        assert!(heart.tick().is_empty());
        assert!(heart.tick().is_empty());
        assert!(heart.tick().is_empty());
        assert_eq!(heart.tick(), vec![1]);
    }
}

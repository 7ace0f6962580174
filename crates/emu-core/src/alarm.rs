//! Cycle clock and alarm scheduler.
//!
//! The clock is a single monotonic 64-bit cycle counter. Subsystems create
//! alarms once at init and arm them with an absolute target cycle. When the
//! clock is advanced past a target, the owner's handler is called with the
//! number of cycles the alarm fired late (`offset`).
//!
//! # Ordering
//!
//! | Rule | Behaviour |
//! |------|-----------|
//! | Order | Due alarms fire in ascending target order; equal targets in arming order |
//! | Pending | At most one pending target per alarm; `set` replaces it |
//! | Firing | The pending flag is cleared before the handler runs |
//! | Re-entrancy | Alarms armed by a handler fire on a later `tick`, never the current pass |
//!
//! Pending entries live in a min-heap. Replacing or cancelling an alarm
//! leaves its old heap entry behind; entries whose sequence number no
//! longer matches the alarm's are discarded when they surface. Once the
//! heap holds more than twice as many entries as there are alarms it is
//! rebuilt from the pending targets.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::Ticks;

/// Handle to an alarm created with [`AlarmContext::new_alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmId(usize);

impl AlarmId {
    /// Index of the alarm in creation order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Alarm {
    name: &'static str,
    /// Target cycle and sequence number of the live heap entry.
    pending: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    cycle: u64,
    seq: u64,
    alarm: usize,
}

/// Receiver of fired alarms.
///
/// The owner of an [`AlarmContext`] implements this to route each fired
/// alarm to the subsystem that created it.
pub trait AlarmHandler {
    /// The scheduler driving this handler.
    fn alarm_context(&mut self) -> &mut AlarmContext;

    /// Called once per fired alarm. `offset` is how many cycles past its
    /// target the clock already is.
    fn handle_alarm(&mut self, alarm: AlarmId, offset: u64);
}

/// The machine clock plus every alarm armed against it.
#[derive(Debug, Default)]
pub struct AlarmContext {
    clk: u64,
    alarms: Vec<Alarm>,
    heap: BinaryHeap<Reverse<Entry>>,
    /// Entries set during the pass in progress, held back until it ends.
    deferred: Vec<Entry>,
    seq: u64,
}

impl AlarmContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current clock value.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clk
    }

    /// Create an alarm. Alarms live as long as the context.
    pub fn new_alarm(&mut self, name: &'static str) -> AlarmId {
        self.alarms.push(Alarm {
            name,
            pending: None,
        });
        AlarmId(self.alarms.len() - 1)
    }

    /// Name given at creation.
    #[must_use]
    pub fn name(&self, alarm: AlarmId) -> &'static str {
        self.alarms[alarm.0].name
    }

    /// Arm `alarm` to fire once the clock reaches `cycle`, replacing any
    /// pending target.
    pub fn set(&mut self, alarm: AlarmId, cycle: u64) {
        let seq = self.seq;
        self.seq += 1;
        self.alarms[alarm.0].pending = Some((cycle, seq));
        self.heap.push(Reverse(Entry {
            cycle,
            seq,
            alarm: alarm.0,
        }));
        if self.heap.len() > 2 * self.alarms.len() {
            self.compact();
        }
    }

    /// Drop stale heap entries. Entries held back by the pass in progress
    /// go back on the heap and are held back again when they surface.
    fn compact(&mut self) {
        self.deferred.clear();
        self.heap = self
            .alarms
            .iter()
            .enumerate()
            .filter_map(|(alarm, a)| {
                a.pending
                    .map(|(cycle, seq)| Reverse(Entry { cycle, seq, alarm }))
            })
            .collect();
    }

    /// Cancel `alarm`. No-op if it is not pending.
    pub fn unset(&mut self, alarm: AlarmId) {
        self.alarms[alarm.0].pending = None;
    }

    /// Target cycle of `alarm`, if armed.
    #[must_use]
    pub fn pending(&self, alarm: AlarmId) -> Option<u64> {
        self.alarms[alarm.0].pending.map(|(cycle, _)| cycle)
    }

    #[must_use]
    pub fn is_pending(&self, alarm: AlarmId) -> bool {
        self.alarms[alarm.0].pending.is_some()
    }

    /// Earliest target among all armed alarms.
    #[must_use]
    pub fn next_pending(&self) -> Option<u64> {
        self.alarms
            .iter()
            .filter_map(|a| a.pending.map(|(cycle, _)| cycle))
            .min()
    }

    /// Clock to zero, every alarm disarmed.
    pub fn reset(&mut self) {
        self.restore(0);
    }

    /// Set the clock to `clk` and disarm every alarm. Used when loading a
    /// snapshot; owners re-arm their alarms from the saved state.
    pub fn restore(&mut self, clk: u64) {
        self.clk = clk;
        self.heap.clear();
        self.deferred.clear();
        for alarm in &mut self.alarms {
            alarm.pending = None;
        }
    }

    /// Advance the clock by `cycles` and fire every alarm that became due.
    pub fn tick<H: AlarmHandler + ?Sized>(handler: &mut H, cycles: Ticks) {
        let ctx = handler.alarm_context();
        ctx.clk += cycles.get();
        let pass = ctx.seq;

        loop {
            let Some((alarm, offset)) = handler.alarm_context().pop_due(pass) else {
                break;
            };
            handler.handle_alarm(alarm, offset);
        }

        handler.alarm_context().end_pass();
    }

    /// Pop the next alarm due in the pass that started at sequence `pass`.
    fn pop_due(&mut self, pass: u64) -> Option<(AlarmId, u64)> {
        while let Some(&Reverse(entry)) = self.heap.peek() {
            if entry.cycle > self.clk {
                return None;
            }
            self.heap.pop();

            let alarm = &mut self.alarms[entry.alarm];
            if alarm.pending != Some((entry.cycle, entry.seq)) {
                continue;
            }
            if entry.seq >= pass {
                self.deferred.push(entry);
                continue;
            }

            alarm.pending = None;
            return Some((AlarmId(entry.alarm), self.clk - entry.cycle));
        }
        None
    }

    fn end_pass(&mut self) {
        for entry in self.deferred.drain(..) {
            self.heap.push(Reverse(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Records fired alarms; optionally re-arms one alarm (at an absolute
    /// cycle) from its handler.
    struct Recorder {
        ctx: AlarmContext,
        fired: Vec<(AlarmId, u64, u64)>,
        rearm: Option<(AlarmId, u64)>,
    }

    impl AlarmHandler for Recorder {
        fn alarm_context(&mut self) -> &mut AlarmContext {
            &mut self.ctx
        }

        fn handle_alarm(&mut self, alarm: AlarmId, offset: u64) {
            let target = self.ctx.now() - offset;
            self.fired.push((alarm, target, self.ctx.now()));
            if let Some((id, cycle)) = self.rearm {
                if id == alarm {
                    self.ctx.set(id, cycle);
                }
            }
        }
    }

    fn make_recorder() -> Recorder {
        Recorder {
            ctx: AlarmContext::new(),
            fired: Vec::new(),
            rearm: None,
        }
    }

    #[test]
    fn fires_in_ascending_target_order() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        let b = r.ctx.new_alarm("b");
        let c = r.ctx.new_alarm("c");
        r.ctx.set(a, 100);
        r.ctx.set(b, 50);
        r.ctx.set(c, 75);

        AlarmContext::tick(&mut r, Ticks::new(200));

        let order: Vec<u64> = r.fired.iter().map(|&(_, target, _)| target).collect();
        assert_eq!(order, vec![50, 75, 100]);
        assert!(!r.ctx.is_pending(a));
        assert_eq!(r.ctx.next_pending(), None);
    }

    #[test]
    fn offset_reports_lateness() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        r.ctx.set(a, 10);
        AlarmContext::tick(&mut r, Ticks::new(25));
        assert_eq!(r.fired, vec![(a, 10, 25)]);
    }

    #[test]
    fn set_replaces_pending_target() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        r.ctx.set(a, 10);
        r.ctx.set(a, 30);
        assert_eq!(r.ctx.pending(a), Some(30));

        AlarmContext::tick(&mut r, Ticks::new(20));
        assert!(r.fired.is_empty());

        AlarmContext::tick(&mut r, Ticks::new(10));
        assert_eq!(r.fired.len(), 1);
    }

    #[test]
    fn unset_cancels() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        r.ctx.set(a, 10);
        r.ctx.unset(a);
        r.ctx.unset(a);
        AlarmContext::tick(&mut r, Ticks::new(100));
        assert!(r.fired.is_empty());
    }

    #[test]
    fn rearm_inside_handler_waits_for_next_tick() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        r.ctx.set(a, 10);
        // Re-armed for a cycle that is already due: must wait a tick.
        r.rearm = Some((a, 10));

        AlarmContext::tick(&mut r, Ticks::new(10));
        assert_eq!(r.fired.len(), 1);
        assert_eq!(r.ctx.pending(a), Some(10));

        r.rearm = None;
        AlarmContext::tick(&mut r, Ticks::new(1));
        assert_eq!(r.fired.len(), 2);
        assert_eq!(r.fired[1], (a, 10, 11));
    }

    #[test]
    fn older_alarms_still_fire_behind_a_deferred_one() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        let b = r.ctx.new_alarm("b");
        r.ctx.set(a, 10);
        r.ctx.set(b, 40);
        // a re-arms itself at 12, ahead of b's target.
        r.rearm = Some((a, 12));

        AlarmContext::tick(&mut r, Ticks::new(50));
        let ids: Vec<AlarmId> = r.fired.iter().map(|&(id, _, _)| id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(r.ctx.pending(a), Some(12));
    }

    #[test]
    fn rearming_keeps_heap_bounded() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        let b = r.ctx.new_alarm("b");
        r.ctx.set(b, 500);
        for cycle in 0..10_000 {
            r.ctx.set(a, 1_000_000 + cycle);
            r.ctx.unset(a);
            r.ctx.set(a, 1_000_000 + cycle);
        }
        assert!(r.ctx.heap.len() <= 4);

        AlarmContext::tick(&mut r, Ticks::new(2_000_000));
        assert_eq!(r.fired, vec![(b, 500, 2_000_000), (a, 1_009_999, 2_000_000)]);
    }

    #[test]
    fn compaction_mid_pass_still_holds_back_rearmed_alarm() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        r.ctx.set(a, 10);
        r.ctx.clk = 10;
        let pass = r.ctx.seq;
        assert_eq!(r.ctx.pop_due(pass), Some((a, 0)));

        r.ctx.set(a, 10);
        assert_eq!(r.ctx.pop_due(pass), None);
        r.ctx.compact();
        assert_eq!(r.ctx.pop_due(pass), None);
        r.ctx.end_pass();
        assert_eq!(r.ctx.heap.len(), 1);

        AlarmContext::tick(&mut r, Ticks::new(1));
        assert_eq!(r.fired, vec![(a, 10, 11)]);
    }

    #[test]
    fn equal_targets_fire_in_arming_order() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        let b = r.ctx.new_alarm("b");
        r.ctx.set(b, 5);
        r.ctx.set(a, 5);
        AlarmContext::tick(&mut r, Ticks::new(5));
        let ids: Vec<AlarmId> = r.fired.iter().map(|&(id, _, _)| id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn restore_disarms_everything() {
        let mut r = make_recorder();
        let a = r.ctx.new_alarm("a");
        r.ctx.set(a, 10);
        r.ctx.restore(1000);
        assert_eq!(r.ctx.now(), 1000);
        assert_eq!(r.ctx.pending(a), None);
        AlarmContext::tick(&mut r, Ticks::new(1));
        assert!(r.fired.is_empty());
        assert_eq!(r.ctx.name(a), "a");
    }

    proptest! {
        #[test]
        fn clock_monotonic_and_never_early(
            targets in proptest::collection::vec(0u64..5_000, 1..20),
            steps in proptest::collection::vec(1u64..700, 1..30),
        ) {
            let mut r = make_recorder();
            for &t in &targets {
                let id = r.ctx.new_alarm("p");
                r.ctx.set(id, t);
            }

            let mut last_now = r.ctx.now();
            for &s in &steps {
                AlarmContext::tick(&mut r, Ticks::new(s));
                prop_assert!(r.ctx.now() >= last_now);
                last_now = r.ctx.now();
            }

            let mut last = (0, 0);
            for &(_, target, fired_at) in &r.fired {
                prop_assert!(fired_at >= target);
                if fired_at == last.1 {
                    prop_assert!(target >= last.0);
                }
                last = (target, fired_at);
            }

            let total: u64 = steps.iter().sum();
            let expected = targets.iter().filter(|&&t| t <= total).count();
            prop_assert_eq!(r.fired.len(), expected);
        }
    }
}

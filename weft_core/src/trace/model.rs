//! Trace container and mutators
//!
//! A `Trace` maps each routine to its ordered event sequence and offers a
//! global iterator in ascending `t_sort`, plus the mutators the rewriter
//! builds on: shorten, remove, the shift family and replay markers.
//!
//! Partner resolution never uses pointers. `TraceIndex` is rebuilt from
//! the stable ids after load or mutation and resolves rendezvous partners
//! by `(channel, op_id)` lookup.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{WeftError, WeftResult};
use crate::trace::event::{
    ChannelOpKind, Event, EventKey, EventKind, ObjectId, RoutineId, Time,
};

/// Routine id used for control markers such as `ReplayEnd`
pub const CONTROL_ROUTINE: RoutineId = 0;

/// Totally ordered multiset of events, viewable per routine or globally
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    routines: BTreeMap<RoutineId, Vec<Event>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to its owning routine's sequence. O(1).
    ///
    /// Rejects events that would break the strictly increasing per-routine
    /// `t_pre` order (caller's contract violation).
    pub fn add(&mut self, event: Event) -> WeftResult<()> {
        let seq = self.routines.entry(event.routine).or_default();
        if let Some(last) = seq.last() {
            if event.t_pre <= last.t_pre {
                return Err(WeftError::trace(format!(
                    "routine {}: event at t_pre {} would not follow t_pre {}",
                    event.routine, event.t_pre, last.t_pre
                )));
            }
        }
        seq.push(event);
        Ok(())
    }

    /// Number of events across all routines
    pub fn len(&self) -> usize {
        self.routines.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.values().all(Vec::is_empty)
    }

    /// Ids of all routines with at least one event
    pub fn routine_ids(&self) -> impl Iterator<Item = RoutineId> + '_ {
        self.routines
            .iter()
            .filter(|(_, seq)| !seq.is_empty())
            .map(|(id, _)| *id)
    }

    /// The event sequence of one routine
    pub fn events_of(&self, routine: RoutineId) -> &[Event] {
        self.routines.get(&routine).map_or(&[], Vec::as_slice)
    }

    /// Look up an event by its stable key
    pub fn event(&self, key: EventKey) -> Option<&Event> {
        let seq = self.routines.get(&key.routine)?;
        let idx = seq
            .binary_search_by_key(&key.t_pre, |e| e.t_pre)
            .ok()?;
        seq.get(idx)
    }

    fn event_mut(&mut self, key: EventKey) -> Option<&mut Event> {
        let seq = self.routines.get_mut(&key.routine)?;
        let idx = seq
            .binary_search_by_key(&key.t_pre, |e| e.t_pre)
            .ok()?;
        seq.get_mut(idx)
    }

    /// Largest `t_sort` in the trace
    pub fn last_time(&self) -> Time {
        self.iter_sorted().map(|e| e.t_sort()).max().unwrap_or(0)
    }

    /// Iterate all events in ascending `t_sort`, ties broken by routine id
    /// (events within one routine keep their insertion order).
    pub fn iter_sorted(&self) -> TraceIter<'_> {
        TraceIter::new(self)
    }

    /// Drop every event whose `t_sort` exceeds `cutoff`. With
    /// `keep_cutoff` false, events exactly at the cutoff are dropped too.
    pub fn shorten(&mut self, cutoff: Time, keep_cutoff: bool) {
        for seq in self.routines.values_mut() {
            seq.retain(|e| {
                let t = e.t_sort();
                if keep_cutoff {
                    t <= cutoff
                } else {
                    t < cutoff
                }
            });
        }
        self.routines.retain(|_, seq| !seq.is_empty());
    }

    /// Delete a specific event
    pub fn remove_event(&mut self, key: EventKey) -> Option<Event> {
        let seq = self.routines.get_mut(&key.routine)?;
        let idx = seq
            .binary_search_by_key(&key.t_pre, |e| e.t_pre)
            .ok()?;
        let removed = seq.remove(idx);
        if seq.is_empty() {
            self.routines.remove(&key.routine);
        }
        Some(removed)
    }

    /// Delete every event acting on the given primitive id, everywhere
    pub fn remove_element(&mut self, id: ObjectId) {
        for seq in self.routines.values_mut() {
            seq.retain(|e| e.object_id() != Some(id));
        }
        self.routines.retain(|_, seq| !seq.is_empty());
    }

    /// Advance the `t_sort` of every event selected by `matches` so it
    /// lands at or after `reference_time + 1`.
    ///
    /// All selected events move by one common positive delta, so relative
    /// ordering among them (and within each routine) is preserved. The
    /// selection must be suffix-closed per routine: if an event is
    /// selected, every later event of the same routine must be too,
    /// otherwise the per-routine order would invert and the call is
    /// rejected.
    pub fn shift_events_to_after<F>(&mut self, reference_time: Time, matches: F) -> WeftResult<()>
    where
        F: Fn(&Event) -> bool,
    {
        let mut min_selected: Option<Time> = None;
        for seq in self.routines.values() {
            let mut seen_selected = false;
            for event in seq {
                if matches(event) {
                    seen_selected = true;
                    let t = event.t_sort();
                    min_selected = Some(min_selected.map_or(t, |m: Time| m.min(t)));
                } else if seen_selected {
                    return Err(WeftError::trace(format!(
                        "shift selection not suffix-closed in routine {}",
                        event.routine
                    )));
                }
            }
        }

        let Some(min_selected) = min_selected else {
            return Ok(());
        };
        if min_selected > reference_time {
            return Ok(());
        }
        let delta = (reference_time + 1 - min_selected) as i64;
        for seq in self.routines.values_mut() {
            for event in seq.iter_mut() {
                if matches(event) {
                    event.shift(delta);
                }
            }
        }
        Ok(())
    }

    /// Add `delta` to the timestamps of every event of `routine` whose
    /// `t_sort` is at least `from_time`.
    pub fn shift_routine(&mut self, routine: RoutineId, from_time: Time, delta: i64) {
        if let Some(seq) = self.routines.get_mut(&routine) {
            for event in seq.iter_mut() {
                if event.t_sort() >= from_time {
                    event.shift(delta);
                }
            }
        }
    }

    /// Insert a `ReplayEnd` control marker at the given time
    pub fn add_replay_marker(&mut self, time: Time, exit_code: i32) {
        let marker = Event {
            routine: CONTROL_ROUTINE,
            t_pre: time,
            t_post: time,
            pos: Default::default(),
            kind: EventKind::ReplayEnd { exit_code },
        };
        let seq = self.routines.entry(CONTROL_ROUTINE).or_default();
        seq.push(marker);
        seq.sort_by_key(|e| e.t_pre);
    }

    /// The replay end marker, if the trace carries one
    pub fn replay_marker(&self) -> Option<&Event> {
        self.routines
            .get(&CONTROL_ROUTINE)
            .and_then(|seq| {
                seq.iter()
                    .find(|e| matches!(e.kind, EventKind::ReplayEnd { .. }))
            })
    }

    /// Global 1-based occurrence number of an event's source position in
    /// `t_sort` order, matching how replay gates count arrivals.
    pub fn occurrence_of(&self, key: EventKey) -> Option<u64> {
        let target = self.event(key)?;
        let pos_key = target.pos.key();
        let mut occurrence = 0;
        for event in self.iter_sorted() {
            if event.pos.key() == pos_key {
                occurrence += 1;
                if event.key() == key {
                    return Some(occurrence);
                }
            }
        }
        None
    }

    /// Mutate an event in place. The callback must not touch `t_pre`
    /// (it is the event's identity); `t_post` and payload are fair game.
    pub fn update_event<F>(&mut self, key: EventKey, f: F) -> bool
    where
        F: FnOnce(&mut Event),
    {
        match self.event_mut(key) {
            Some(event) => {
                let t_pre = event.t_pre;
                f(event);
                debug_assert_eq!(event.t_pre, t_pre);
                true
            }
            None => false,
        }
    }

    /// Count events matching a predicate
    pub fn count_matching<F: Fn(&Event) -> bool>(&self, pred: F) -> usize {
        self.routines
            .values()
            .flat_map(|seq| seq.iter())
            .filter(|e| pred(e))
            .count()
    }

    /// Internal accessor for bulk construction (trace I/O)
    pub(crate) fn insert_routine(&mut self, routine: RoutineId, mut events: Vec<Event>) {
        events.sort_by_key(|e| e.t_pre);
        self.routines.insert(routine, events);
    }
}

/// Merge iterator over per-routine heads, keyed on `t_sort`
pub struct TraceIter<'t> {
    cursors: Vec<(RoutineId, &'t [Event], usize)>,
}

impl<'t> TraceIter<'t> {
    fn new(trace: &'t Trace) -> Self {
        let cursors = trace
            .routines
            .iter()
            .filter(|(_, seq)| !seq.is_empty())
            .map(|(id, seq)| (*id, seq.as_slice(), 0usize))
            .collect();
        Self { cursors }
    }
}

impl<'t> Iterator for TraceIter<'t> {
    type Item = &'t Event;

    fn next(&mut self) -> Option<&'t Event> {
        let mut best: Option<(usize, Time, RoutineId)> = None;
        for (i, (routine, seq, pos)) in self.cursors.iter().enumerate() {
            if let Some(event) = seq.get(*pos) {
                let t = event.t_sort();
                let better = match best {
                    None => true,
                    Some((_, bt, br)) => t < bt || (t == bt && *routine < br),
                };
                if better {
                    best = Some((i, t, *routine));
                }
            }
        }
        let (i, _, _) = best?;
        let (_, seq, pos) = &mut self.cursors[i];
        let slice: &'t [Event] = *seq;
        let event = &slice[*pos];
        *pos += 1;
        Some(event)
    }
}

/// Auxiliary index: primitive id and rendezvous lookups over a trace.
///
/// Rebuilt on demand; never holds references into the trace, only stable
/// keys, so it survives serialization boundaries.
#[derive(Debug, Default)]
pub struct TraceIndex {
    /// Primitive id -> events acting on it, in t_sort order
    by_object: HashMap<ObjectId, Vec<EventKey>>,
    /// (channel, op_id, op) -> event, for partner resolution
    rendezvous: HashMap<(ObjectId, u64, ChannelOpKind), EventKey>,
}

impl TraceIndex {
    /// Build the index for a trace
    pub fn build(trace: &Trace) -> Self {
        let mut index = TraceIndex::default();
        for event in trace.iter_sorted() {
            if let Some(id) = event.object_id() {
                index.by_object.entry(id).or_default().push(event.key());
            }
            match &event.kind {
                EventKind::Channel { id, op, op_id, .. }
                    if *op != ChannelOpKind::Close && event.t_post != 0 =>
                {
                    index
                        .rendezvous
                        .insert((*id, *op_id, *op), event.key());
                }
                EventKind::Select { .. } => {
                    if let Some(case) = event.chosen_case() {
                        if case.t_post != 0 {
                            index
                                .rendezvous
                                .insert((case.channel, case.op_id, case.op), event.key());
                        }
                    }
                }
                _ => {}
            }
        }
        index
    }

    /// All events acting on a primitive
    pub fn events_of_object(&self, id: ObjectId) -> &[EventKey] {
        self.by_object.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Resolve the rendezvous partner of a channel operation or of the
    /// chosen case of a select.
    pub fn partner_of(&self, event: &Event) -> Option<EventKey> {
        let (id, op, op_id) = match &event.kind {
            EventKind::Channel { id, op, op_id, .. } => (*id, *op, *op_id),
            EventKind::Select { .. } => {
                let case = event.chosen_case()?;
                (case.channel, case.op, case.op_id)
            }
            _ => return None,
        };
        if event.t_post == 0 {
            return None;
        }
        let partner_op = op.opposite()?;
        let partner = self.rendezvous.get(&(id, op_id, partner_op)).copied()?;
        if partner == event.key() {
            return None;
        }
        Some(partner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::event::Position;

    fn channel_event(
        routine: RoutineId,
        t_pre: Time,
        t_post: Time,
        id: ObjectId,
        op: ChannelOpKind,
        op_id: u64,
    ) -> Event {
        Event {
            routine,
            t_pre,
            t_post,
            pos: Position::new("main.go", 10 + routine as u32),
            kind: EventKind::Channel {
                id,
                op,
                closed: false,
                op_id,
                qsize: 0,
                qcount: 0,
            },
        }
    }

    fn exit_event(routine: RoutineId, t: Time) -> Event {
        Event {
            routine,
            t_pre: t,
            t_post: t,
            pos: Position::default(),
            kind: EventKind::RoutineExit,
        }
    }

    #[test]
    fn test_add_rejects_order_violation() {
        let mut trace = Trace::new();
        trace.add(exit_event(1, 10)).unwrap();
        assert!(trace.add(exit_event(1, 10)).is_err());
        assert!(trace.add(exit_event(1, 4)).is_err());
        assert!(trace.add(exit_event(2, 4)).is_ok());
    }

    #[test]
    fn test_iter_sorted_merges_by_t_sort() {
        let mut trace = Trace::new();
        trace
            .add(channel_event(1, 2, 8, 5, ChannelOpKind::Send, 1))
            .unwrap();
        trace.add(exit_event(1, 20)).unwrap();
        trace
            .add(channel_event(2, 4, 6, 5, ChannelOpKind::Recv, 1))
            .unwrap();
        let order: Vec<Time> = trace.iter_sorted().map(|e| e.t_sort()).collect();
        assert_eq!(order, vec![6, 8, 20]);
    }

    #[test]
    fn test_iter_sorted_blocked_uses_t_pre() {
        let mut trace = Trace::new();
        trace
            .add(channel_event(1, 2, 0, 5, ChannelOpKind::Send, 0))
            .unwrap();
        trace.add(exit_event(2, 4)).unwrap();
        let order: Vec<RoutineId> = trace.iter_sorted().map(|e| e.routine).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_shorten() {
        let mut trace = Trace::new();
        trace.add(exit_event(1, 4)).unwrap();
        trace.add(exit_event(2, 8)).unwrap();
        trace.add(exit_event(3, 12)).unwrap();
        let mut keep = trace.clone();
        keep.shorten(8, true);
        assert_eq!(keep.len(), 2);
        let mut drop_eq = trace.clone();
        drop_eq.shorten(8, false);
        assert_eq!(drop_eq.len(), 1);
    }

    #[test]
    fn test_remove_element_everywhere() {
        let mut trace = Trace::new();
        trace
            .add(channel_event(1, 2, 8, 5, ChannelOpKind::Send, 1))
            .unwrap();
        trace
            .add(channel_event(2, 4, 8, 5, ChannelOpKind::Recv, 1))
            .unwrap();
        trace
            .add(channel_event(2, 10, 12, 6, ChannelOpKind::Send, 1))
            .unwrap();
        trace.remove_element(5);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.iter_sorted().next().unwrap().object_id(), Some(6));
    }

    #[test]
    fn test_shift_events_to_after() {
        let mut trace = Trace::new();
        trace.add(exit_event(1, 4)).unwrap();
        trace.add(exit_event(2, 6)).unwrap();
        trace.add(exit_event(3, 8)).unwrap();
        // shift routines 2 and 3 to after time 20
        trace
            .shift_events_to_after(20, |e| e.routine >= 2)
            .unwrap();
        let times: Vec<(RoutineId, Time)> =
            trace.iter_sorted().map(|e| (e.routine, e.t_sort())).collect();
        assert_eq!(times[0], (1, 4));
        assert!(times[1].1 >= 21);
        // relative order preserved
        assert_eq!(times[1].0, 2);
        assert_eq!(times[2].0, 3);
    }

    #[test]
    fn test_shift_rejects_non_suffix_selection() {
        let mut trace = Trace::new();
        trace.add(exit_event(1, 4)).unwrap();
        trace.add(exit_event(1, 6)).unwrap();
        // selecting an earlier event but not a later one of the same routine
        let result = trace.shift_events_to_after(20, |e| e.t_pre == 4);
        assert!(result.is_err());
    }

    #[test]
    fn test_shift_routine_from_time() {
        let mut trace = Trace::new();
        trace.add(exit_event(1, 4)).unwrap();
        trace.add(exit_event(1, 10)).unwrap();
        trace.shift_routine(1, 10, 6);
        let times: Vec<Time> = trace.events_of(1).iter().map(|e| e.t_sort()).collect();
        assert_eq!(times, vec![4, 16]);
    }

    #[test]
    fn test_replay_marker() {
        let mut trace = Trace::new();
        trace.add(exit_event(1, 4)).unwrap();
        trace.add_replay_marker(30, 41);
        let marker = trace.replay_marker().unwrap();
        assert_eq!(marker.t_post, 30);
        assert!(matches!(
            marker.kind,
            EventKind::ReplayEnd { exit_code: 41 }
        ));
        // marker comes last in iteration order
        assert_eq!(trace.iter_sorted().last().unwrap().routine, CONTROL_ROUTINE);
    }

    #[test]
    fn test_partner_resolution() {
        let mut trace = Trace::new();
        trace
            .add(channel_event(1, 2, 8, 5, ChannelOpKind::Send, 3))
            .unwrap();
        trace
            .add(channel_event(2, 4, 8, 5, ChannelOpKind::Recv, 3))
            .unwrap();
        let index = TraceIndex::build(&trace);
        let send = trace.event(EventKey::new(1, 2)).unwrap();
        let partner = index.partner_of(send).unwrap();
        assert_eq!(partner, EventKey::new(2, 4));
        let recv = trace.event(partner).unwrap();
        assert_eq!(index.partner_of(recv).unwrap(), EventKey::new(1, 2));
    }

    #[test]
    fn test_partner_absent_for_blocked_op() {
        let mut trace = Trace::new();
        trace
            .add(channel_event(1, 2, 0, 5, ChannelOpKind::Send, 0))
            .unwrap();
        let index = TraceIndex::build(&trace);
        let send = trace.event(EventKey::new(1, 2)).unwrap();
        assert!(index.partner_of(send).is_none());
    }
}

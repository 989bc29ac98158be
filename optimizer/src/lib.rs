use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// An enumeration of the errors that abort an optimization run
///
/// All four are fatal: none of them is caught or retried internally, and each
/// one carries the identifiers needed to track the problem back to the input
/// tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignErr {
    #[error("User {user} has more than one preference row for slot {slot}")]
    DuplicateSlotPreference { user: String, slot: String },
    #[error("Session {session} in preferences for user {user} not found in session capacities")]
    UnknownSession { user: String, session: String },
    #[error("Slot {slot} for session {session} in preferences for user {user} not found in session capacities")]
    UnknownSlotForSession {
        user: String,
        session: String,
        slot: String,
    },
    #[error("Could not assign user {user} to any session for slot {slot}")]
    UnassignableUser { user: String, slot: String },
}

/// One row of the raw preference table: a user's ranked session choices for
/// one slot.
#[derive(Debug, Clone)]
pub struct PreferenceRow {
    pub user_id: String,
    pub slot: String,
    /// `(rank, session)` pairs; ranks a user left blank are simply omitted.
    pub choices: Vec<(u32, String)>,
}

/// One row of the raw capacity table: the number of seats a session offers in
/// a slot.
#[derive(Debug, Clone)]
pub struct CapacityRow {
    pub session_id: String,
    pub slot: String,
    pub capacity: u32,
}

/// Remaining seats per (session, slot) offering.
///
/// Built once from the capacity rows and never mutated; every trial works on
/// its own clone so capacity spent in one trial is invisible to the others.
#[derive(Debug, Clone, Default)]
pub struct CapacityTable {
    sessions: HashSet<String>,
    seats: HashMap<(String, String), u32>,
}

impl CapacityTable {
    pub fn from_rows(rows: &[CapacityRow]) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.sessions.insert(row.session_id.clone());
            // A repeated (session, slot) row overwrites the earlier one
            table
                .seats
                .insert((row.session_id.clone(), row.slot.clone()), row.capacity);
        }
        table
    }

    /// Whether the session is offered in any slot at all.
    pub fn has_session(&self, session: &str) -> bool {
        self.sessions.contains(session)
    }

    pub fn has_offering(&self, session: &str, slot: &str) -> bool {
        self.seats
            .contains_key(&(session.to_owned(), slot.to_owned()))
    }

    /// Remaining seats for an offering, or `None` if the (session, slot) pair
    /// is not offered.
    pub fn seats_left(&self, session: &str, slot: &str) -> Option<u32> {
        self.seats
            .get(&(session.to_owned(), slot.to_owned()))
            .copied()
    }

    /// Claims one seat. Returns false when the offering is unknown or full.
    pub fn take_seat(&mut self, session: &str, slot: &str) -> bool {
        match self.seats.get_mut(&(session.to_owned(), slot.to_owned())) {
            Some(seats) if *seats > 0 => {
                *seats -= 1;
                true
            }
            _ => false,
        }
    }
}

/// A user's ranked choices for a single slot, rank ascending.
#[derive(Debug, Clone)]
pub struct SlotPreferences {
    pub slot: String,
    pub choices: Vec<(u32, String)>,
}

#[derive(Debug, Clone)]
pub struct UserPreferences {
    pub user_id: String,
    /// Slots in the order the user's preference rows were declared.
    pub slots: Vec<SlotPreferences>,
}

/// The preference table grouped per user, users in first-appearance order.
///
/// Built once from the raw rows and immutable afterwards; trials only read it.
#[derive(Debug, Clone, Default)]
pub struct PreferenceIndex {
    pub users: Vec<UserPreferences>,
}

impl PreferenceIndex {
    /// Groups the raw rows per user, keeping users in first-appearance order
    /// and each user's slots in declared order.
    ///
    /// # Errors
    /// `DuplicateSlotPreference` if the same (user, slot) pair appears in more
    /// than one row.
    pub fn from_rows(rows: &[PreferenceRow]) -> Result<Self, AssignErr> {
        let mut users: Vec<UserPreferences> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for row in rows {
            let user_idx = match by_id.get(&row.user_id) {
                Some(&idx) => idx,
                None => {
                    by_id.insert(row.user_id.clone(), users.len());
                    users.push(UserPreferences {
                        user_id: row.user_id.clone(),
                        slots: Vec::new(),
                    });
                    users.len() - 1
                }
            };

            let user = &mut users[user_idx];
            if user.slots.iter().any(|prefs| prefs.slot == row.slot) {
                return Err(AssignErr::DuplicateSlotPreference {
                    user: row.user_id.clone(),
                    slot: row.slot.clone(),
                });
            }

            let mut choices = row.choices.clone();
            choices.sort_by_key(|&(rank, _)| rank);
            user.slots.push(SlotPreferences {
                slot: row.slot.clone(),
                choices,
            });
        }

        Ok(Self { users })
    }

    /// Total number of (user, slot) pairs the assignment must cover.
    pub fn pair_count(&self) -> usize {
        self.users.iter().map(|user| user.slots.len()).sum()
    }
}

/// One resolved (user, slot) pair of a completed assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentEntry {
    pub user_id: String,
    pub slot: String,
    pub session: String,
    /// The preference rank that was satisfied, 1 = first choice.
    pub rank: u32,
}

/// A complete assignment for one trial, one entry per (user, slot) pair in
/// the order the preference rows were declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub entries: Vec<AssignmentEntry>,
    pub score: i64,
}

/// Rank-based reward for a completed assignment: a rank-1 pick earns
/// `n_prefs` points, the last rank earns 1. No normalization; totals are only
/// comparable between trials over the same user/slot population.
pub fn score_assignment(entries: &[AssignmentEntry], n_prefs: u32) -> i64 {
    entries
        .iter()
        .map(|entry| i64::from(n_prefs) - i64::from(entry.rank) + 1)
        .sum()
}

/// Runs one greedy pass over the users in `order` (indices into
/// `index.users`, normally a permutation of all of them).
///
/// For each user, for each of their slots in declared order, walk the ranked
/// choices ascending and take the first session that still has a seat and
/// that the user does not already hold in another slot. The capacity clone is
/// consumed; the caller keeps the pristine base table.
///
/// # Errors
/// `UnknownSession` / `UnknownSlotForSession` if a preference points outside
/// the capacity table, `UnassignableUser` if a user's ranked choices are
/// exhausted without a seat.
pub fn greedy_assign(
    index: &PreferenceIndex,
    mut capacity: CapacityTable,
    n_prefs: u32,
    order: &[usize],
) -> Result<Assignment, AssignErr> {
    // One entry per (user, slot) pair in index layout, filled in permutation
    // order and read back in declared order at the end.
    let mut chosen: Vec<Vec<Option<(String, u32)>>> = index
        .users
        .iter()
        .map(|user| vec![None; user.slots.len()])
        .collect();

    for &user_idx in order {
        let user = &index.users[user_idx];
        for (slot_idx, slot_prefs) in user.slots.iter().enumerate() {
            for &(rank, ref session) in &slot_prefs.choices {
                if !capacity.has_session(session) {
                    return Err(AssignErr::UnknownSession {
                        user: user.user_id.clone(),
                        session: session.clone(),
                    });
                }
                if !capacity.has_offering(session, &slot_prefs.slot) {
                    return Err(AssignErr::UnknownSlotForSession {
                        user: user.user_id.clone(),
                        session: session.clone(),
                        slot: slot_prefs.slot.clone(),
                    });
                }

                // A user never holds the same session in two slots
                let already_held = chosen[user_idx]
                    .iter()
                    .flatten()
                    .any(|(held, _)| held == session);
                if already_held {
                    continue;
                }

                if capacity.take_seat(session, &slot_prefs.slot) {
                    chosen[user_idx][slot_idx] = Some((session.clone(), rank));
                    break;
                }
            }

            if chosen[user_idx][slot_idx].is_none() {
                return Err(AssignErr::UnassignableUser {
                    user: user.user_id.clone(),
                    slot: slot_prefs.slot.clone(),
                });
            }
        }
    }

    // Shape the result in declared row order, independent of the permutation
    let mut entries = Vec::with_capacity(index.pair_count());
    for (user_idx, user) in index.users.iter().enumerate() {
        for (slot_idx, slot_prefs) in user.slots.iter().enumerate() {
            match chosen[user_idx][slot_idx].take() {
                Some((session, rank)) => entries.push(AssignmentEntry {
                    user_id: user.user_id.clone(),
                    slot: slot_prefs.slot.clone(),
                    session,
                    rank,
                }),
                // Reached when `order` skipped this user entirely
                None => {
                    return Err(AssignErr::UnassignableUser {
                        user: user.user_id.clone(),
                        slot: slot_prefs.slot.clone(),
                    });
                }
            }
        }
    }

    let score = score_assignment(&entries, n_prefs);
    Ok(Assignment { entries, score })
}

/// Randomized greedy search over user orderings.
///
/// Runs `n_iter` independent trials, each over a fresh random permutation of
/// the users and a fresh clone of the capacity table, and keeps the
/// best-scoring complete assignment. Ties keep the earlier trial. Each trial
/// derives its own rng from the run seed and the trial index, so a fixed seed
/// replays the same result no matter how the trials are scheduled.
#[derive(Debug, Clone)]
pub struct Optimizer {
    pub n_iter: u32,
    pub n_prefs: u32,
    /// Seed for reproducible runs; drawn from the thread rng when `None`.
    pub seed: Option<u64>,
}

type TrialOutcome = Result<(u32, Assignment), (u32, AssignErr)>;

impl Optimizer {
    pub fn new(n_iter: u32, n_prefs: u32) -> Self {
        Self {
            n_iter,
            n_prefs,
            seed: None,
        }
    }

    /// Runs the trials and returns the retained best assignment.
    ///
    /// # Errors
    /// The first failing trial (in trial order) aborts the whole run; no
    /// partial result is produced.
    pub fn run(
        &self,
        index: &PreferenceIndex,
        capacity: &CapacityTable,
    ) -> Result<Assignment, AssignErr> {
        let seed = match self.seed {
            Some(seed) => seed,
            None => rand::rng().random(),
        };
        // Always run at least one trial
        let n_iter = self.n_iter.max(1);
        tracing::info!(n_iter, seed, "running randomized assignment trials");

        let outcome = (0..n_iter)
            .into_par_iter()
            .map(|trial| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(trial)));
                let mut order: Vec<usize> = (0..index.users.len()).collect();
                order.shuffle(&mut rng);

                match greedy_assign(index, capacity.clone(), self.n_prefs, &order) {
                    Ok(assignment) => {
                        tracing::trace!(trial, score = assignment.score, "trial complete");
                        Ok((trial, assignment))
                    }
                    Err(err) => Err((trial, err)),
                }
            })
            .reduce_with(keep_best);

        match outcome {
            Some(Ok((best_trial, best))) => {
                tracing::debug!(best_trial, score = best.score, "best score after all trials");
                Ok(best)
            }
            Some(Err((trial, err))) => {
                tracing::debug!(trial, %err, "trial failed, aborting run");
                Err(err)
            }
            // n_iter is clamped to at least one trial above
            None => unreachable!(),
        }
    }
}

// Pure max-by-score fold over trial results. Rayon combines adjacent results
// in sequence order, so keeping the left side on ties retains the
// first-found best, and any error beats any success (lowest failing trial
// surfaces, matching a sequential abort).
fn keep_best(left: TrialOutcome, right: TrialOutcome) -> TrialOutcome {
    match (left, right) {
        (Err(left), Err(right)) => Err(if right.0 < left.0 { right } else { left }),
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
        (Ok(left), Ok(right)) => Ok(if right.1.score > left.1.score { right } else { left }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod common {
        use super::*;

        pub(crate) fn pref_row(user: &str, slot: &str, sessions: &[&str]) -> PreferenceRow {
            PreferenceRow {
                user_id: user.to_string(),
                slot: slot.to_string(),
                choices: sessions
                    .iter()
                    .enumerate()
                    .map(|(i, session)| (i as u32 + 1, session.to_string()))
                    .collect(),
            }
        }

        pub(crate) fn cap_row(session: &str, slot: &str, capacity: u32) -> CapacityRow {
            CapacityRow {
                session_id: session.to_string(),
                slot: slot.to_string(),
                capacity,
            }
        }

        pub(crate) fn build(
            prefs: &[PreferenceRow],
            caps: &[CapacityRow],
        ) -> (PreferenceIndex, CapacityTable) {
            (
                PreferenceIndex::from_rows(prefs).unwrap(),
                CapacityTable::from_rows(caps),
            )
        }

        /// Three users fighting over two single-seat sessions with a roomy
        /// fallback. Four of the six user orderings reach the optimum of 7,
        /// the other two reach 6.
        pub(crate) fn contested_problem() -> (PreferenceIndex, CapacityTable) {
            build(
                &[
                    pref_row("u1", "am", &["a", "b", "c"]),
                    pref_row("u2", "am", &["b", "a", "c"]),
                    pref_row("u3", "am", &["a", "b", "c"]),
                ],
                &[
                    cap_row("a", "am", 1),
                    cap_row("b", "am", 1),
                    cap_row("c", "am", 3),
                ],
            )
        }
    }

    mod unit_tests {
        use super::{common::*, *};
        use std::collections::HashMap;

        #[test]
        fn test_single_user_gets_first_choice() {
            let (index, caps) = build(
                &[pref_row("u1", "am", &["a", "b"])],
                &[cap_row("a", "am", 1), cap_row("b", "am", 1)],
            );

            let best = Optimizer::new(1, 2).run(&index, &caps).unwrap();

            assert_eq!(
                best.entries,
                vec![AssignmentEntry {
                    user_id: "u1".to_string(),
                    slot: "am".to_string(),
                    session: "a".to_string(),
                    rank: 1,
                }]
            );
            assert_eq!(best.score, 2);
        }

        #[test]
        fn test_contested_session_without_fallback_aborts() {
            let (index, caps) = build(
                &[pref_row("u1", "am", &["a"]), pref_row("u2", "am", &["a"])],
                &[cap_row("a", "am", 1)],
            );

            let err = Optimizer::new(1, 1).run(&index, &caps).unwrap_err();
            assert!(matches!(
                err,
                AssignErr::UnassignableUser { ref slot, .. } if slot == "am"
            ));
        }

        #[test]
        fn test_unknown_session_aborts() {
            let (index, caps) = build(
                &[pref_row("u1", "am", &["z"])],
                &[cap_row("a", "am", 1)],
            );

            let err = Optimizer::new(3, 1).run(&index, &caps).unwrap_err();
            assert_eq!(
                err,
                AssignErr::UnknownSession {
                    user: "u1".to_string(),
                    session: "z".to_string(),
                }
            );
        }

        #[test]
        fn test_unknown_slot_for_session_aborts() {
            // z exists, but only as a pm offering
            let (index, caps) = build(
                &[pref_row("u1", "am", &["z"])],
                &[cap_row("z", "pm", 5)],
            );

            let err = Optimizer::new(3, 1).run(&index, &caps).unwrap_err();
            assert_eq!(
                err,
                AssignErr::UnknownSlotForSession {
                    user: "u1".to_string(),
                    session: "z".to_string(),
                    slot: "am".to_string(),
                }
            );
        }

        #[test]
        fn test_zero_capacity_everywhere_aborts() {
            let (index, caps) = build(
                &[pref_row("u1", "am", &["a", "b"])],
                &[cap_row("a", "am", 0), cap_row("b", "am", 0)],
            );

            let err = Optimizer::new(1, 2).run(&index, &caps).unwrap_err();
            assert_eq!(
                err,
                AssignErr::UnassignableUser {
                    user: "u1".to_string(),
                    slot: "am".to_string(),
                }
            );
        }

        #[test]
        fn test_duplicate_slot_preference_rejected() {
            let rows = [
                pref_row("u1", "am", &["a"]),
                pref_row("u1", "am", &["b"]),
            ];

            let err = PreferenceIndex::from_rows(&rows).unwrap_err();
            assert_eq!(
                err,
                AssignErr::DuplicateSlotPreference {
                    user: "u1".to_string(),
                    slot: "am".to_string(),
                }
            );
        }

        #[test]
        fn test_user_never_holds_same_session_twice() {
            // Both slots prefer a first; the second slot has to fall back to b
            let (index, caps) = build(
                &[
                    pref_row("u1", "am", &["a", "b"]),
                    pref_row("u1", "pm", &["a", "b"]),
                ],
                &[
                    cap_row("a", "am", 1),
                    cap_row("a", "pm", 1),
                    cap_row("b", "am", 1),
                    cap_row("b", "pm", 1),
                ],
            );

            let best = Optimizer::new(1, 2).run(&index, &caps).unwrap();

            assert_eq!(best.entries[0].session, "a");
            assert_eq!(best.entries[0].rank, 1);
            assert_eq!(best.entries[1].session, "b");
            assert_eq!(best.entries[1].rank, 2);
            assert_eq!(best.score, 3);
        }

        #[test]
        fn test_capacity_invariant_and_completeness() {
            let users: Vec<PreferenceRow> = (0..4)
                .map(|i| pref_row(&format!("u{i}"), "am", &["x", "y"]))
                .collect();
            let (index, caps) = build(
                &users,
                &[cap_row("x", "am", 2), cap_row("y", "am", 2)],
            );

            let mut optimizer = Optimizer::new(10, 2);
            optimizer.seed = Some(42);
            let best = optimizer.run(&index, &caps).unwrap();

            // Exactly one entry per (user, slot) pair, in declared order
            assert_eq!(best.entries.len(), index.pair_count());
            for (entry, user) in best.entries.iter().zip(index.users.iter()) {
                assert_eq!(entry.user_id, user.user_id);
            }

            // No (session, slot) pair over its declared capacity
            let mut seats_used: HashMap<(String, String), u32> = HashMap::new();
            for entry in &best.entries {
                *seats_used
                    .entry((entry.session.clone(), entry.slot.clone()))
                    .or_insert(0) += 1;
            }
            for (offering, used) in seats_used {
                assert!(used <= 2, "offering {offering:?} got {used} users");
            }
        }

        #[test]
        fn test_determinism_under_fixed_seed() {
            let (index, caps) = contested_problem();

            let mut optimizer = Optimizer::new(10, 3);
            optimizer.seed = Some(1234);

            let first = optimizer.run(&index, &caps).unwrap();
            let second = optimizer.run(&index, &caps).unwrap();

            assert_eq!(first, second);
        }

        #[test]
        fn test_tied_scores_keep_first_trial() {
            // Every ordering scores 3 but assigns differently, so the
            // retained best must be whatever trial 0 produced
            let (index, caps) = build(
                &[
                    pref_row("u1", "am", &["a", "b"]),
                    pref_row("u2", "am", &["a", "b"]),
                ],
                &[cap_row("a", "am", 1), cap_row("b", "am", 1)],
            );

            let mut one_trial = Optimizer::new(1, 2);
            one_trial.seed = Some(7);
            let mut many_trials = Optimizer::new(25, 2);
            many_trials.seed = Some(7);

            let first = one_trial.run(&index, &caps).unwrap();
            let retained = many_trials.run(&index, &caps).unwrap();

            assert_eq!(first.score, 3);
            assert_eq!(retained, first);
        }

        #[test]
        fn test_best_score_monotone_in_trial_count() {
            let (index, caps) = contested_problem();

            // Trials are seeded per index, so growing n_iter only extends the
            // pool the best is drawn from
            let mut last = i64::MIN;
            for n_iter in [1, 3, 10, 30] {
                let mut optimizer = Optimizer::new(n_iter, 3);
                optimizer.seed = Some(99);
                let best = optimizer.run(&index, &caps).unwrap();
                assert!(best.score >= last);
                last = best.score;
            }
        }

        #[test]
        fn test_score_assignment_rewards_by_rank() {
            let entries = vec![
                AssignmentEntry {
                    user_id: "u1".to_string(),
                    slot: "am".to_string(),
                    session: "a".to_string(),
                    rank: 1,
                },
                AssignmentEntry {
                    user_id: "u1".to_string(),
                    slot: "pm".to_string(),
                    session: "b".to_string(),
                    rank: 2,
                },
                AssignmentEntry {
                    user_id: "u2".to_string(),
                    slot: "am".to_string(),
                    session: "c".to_string(),
                    rank: 5,
                },
            ];

            // 5 + 4 + 1
            assert_eq!(score_assignment(&entries, 5), 10);
        }

        #[test]
        fn test_capacity_table_seat_accounting() {
            let mut table = CapacityTable::from_rows(&[cap_row("a", "am", 1)]);

            assert!(table.has_session("a"));
            assert!(!table.has_session("b"));
            assert!(table.has_offering("a", "am"));
            assert_eq!(table.seats_left("a", "am"), Some(1));
            assert_eq!(table.seats_left("a", "pm"), None);

            assert!(table.take_seat("a", "am"));
            assert_eq!(table.seats_left("a", "am"), Some(0));
            assert!(!table.take_seat("a", "am"));
            assert!(!table.take_seat("b", "am"));
        }

        #[test]
        fn test_greedy_assign_follows_order() {
            let (index, caps) = build(
                &[
                    pref_row("u1", "am", &["a", "b"]),
                    pref_row("u2", "am", &["a", "b"]),
                ],
                &[cap_row("a", "am", 1), cap_row("b", "am", 1)],
            );

            let first = greedy_assign(&index, caps.clone(), 2, &[0, 1]).unwrap();
            assert_eq!(first.entries[0].session, "a");
            assert_eq!(first.entries[1].session, "b");

            let second = greedy_assign(&index, caps, 2, &[1, 0]).unwrap();
            assert_eq!(second.entries[0].session, "b");
            assert_eq!(second.entries[1].session, "a");
        }

        #[test]
        fn test_index_groups_interleaved_rows_per_user() {
            let rows = [
                pref_row("u1", "am", &["a"]),
                pref_row("u2", "am", &["a"]),
                pref_row("u1", "pm", &["b"]),
            ];

            let index = PreferenceIndex::from_rows(&rows).unwrap();

            assert_eq!(index.users.len(), 2);
            assert_eq!(index.users[0].user_id, "u1");
            assert_eq!(index.users[0].slots.len(), 2);
            assert_eq!(index.users[0].slots[0].slot, "am");
            assert_eq!(index.users[0].slots[1].slot, "pm");
            assert_eq!(index.users[1].user_id, "u2");
            assert_eq!(index.pair_count(), 3);
        }

        #[test]
        fn test_empty_preference_table() {
            let (index, caps) = build(&[], &[cap_row("a", "am", 1)]);

            let best = Optimizer::new(5, 3).run(&index, &caps).unwrap();

            assert!(best.entries.is_empty());
            assert_eq!(best.score, 0);
        }
    }

    mod optimizer_quality_tests {
        use super::{common::*, *};

        #[test]
        fn test_enough_trials_reach_the_optimum() {
            let (index, caps) = contested_problem();

            let mut optimizer = Optimizer::new(100, 3);
            optimizer.seed = Some(5);
            let best = optimizer.run(&index, &caps).unwrap();

            // u1/u3 on a and c (either way), u2 on b
            assert_eq!(best.score, 7);
        }
    }
}

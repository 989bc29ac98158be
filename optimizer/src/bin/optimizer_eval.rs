use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use optimizer::{
    Assignment, CapacityRow, CapacityTable, Optimizer, PreferenceIndex, PreferenceRow,
    greedy_assign,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::sync::Mutex;

const N_PREFS: u32 = 3;

struct SampledResults {
    scores: Vec<i64>,
    samples: usize,
}

struct BruteForceResults {
    scores: Vec<i64>,
    best_assignment: Option<Assignment>,
    best_score: i64,
    orderings: usize,
}

fn main() {
    compare_strategies();
}

fn compare_strategies() {
    let (index, capacity) = make_eval_problem();

    let sampled = run_sampled_orderings(&index, &capacity, 100);
    print_sampled_results(&sampled);

    let brute_force = run_brute_force(&index, &capacity);
    print_brute_force_results(&brute_force);

    let mut optimizer = Optimizer::new(100, N_PREFS);
    optimizer.seed = Some(0);
    match optimizer.run(&index, &capacity) {
        Ok(best) => println!(
            "\nOptimizer best over 100 trials: {} (enumerated optimum: {})",
            best.score, brute_force.best_score
        ),
        Err(err) => println!("\nOptimizer run failed: {err}"),
    }
}

/// Six users contending for three two-seat sessions in one slot. Seats match
/// users exactly and everyone ranks every session, so every user ordering is
/// feasible; the identity ordering happens to give everyone their first
/// choice.
fn make_eval_problem() -> (PreferenceIndex, CapacityTable) {
    let sessions = ["intro", "deep-dive", "workshop"];

    let pref_rows: Vec<PreferenceRow> = (0..6)
        .map(|user| PreferenceRow {
            user_id: format!("user-{user}"),
            slot: "morning".to_string(),
            choices: (0..sessions.len())
                .map(|rank| {
                    (
                        rank as u32 + 1,
                        sessions[(user + rank) % sessions.len()].to_string(),
                    )
                })
                .collect(),
        })
        .collect();

    let cap_rows: Vec<CapacityRow> = sessions
        .iter()
        .map(|session| CapacityRow {
            session_id: session.to_string(),
            slot: "morning".to_string(),
            capacity: 2,
        })
        .collect();

    let index = PreferenceIndex::from_rows(&pref_rows).expect("no duplicate rows in eval data");
    let capacity = CapacityTable::from_rows(&cap_rows);
    (index, capacity)
}

fn run_sampled_orderings(
    index: &PreferenceIndex,
    capacity: &CapacityTable,
    samples: usize,
) -> SampledResults {
    let mut rng = StdRng::seed_from_u64(0);
    let mut order: Vec<usize> = (0..index.users.len()).collect();

    let mut scores = Vec::with_capacity(samples);
    for _ in 0..samples {
        order.shuffle(&mut rng);
        let assignment = greedy_assign(index, capacity.clone(), N_PREFS, &order)
            .expect("eval problem is feasible for every ordering");
        scores.push(assignment.score);
    }

    SampledResults { scores, samples }
}

fn run_brute_force(index: &PreferenceIndex, capacity: &CapacityTable) -> BruteForceResults {
    println!("\n=== BRUTE FORCE EVALUATION ===");

    let user_count = index.users.len();
    let orderings: Vec<Vec<usize>> = (0..user_count).permutations(user_count).collect();
    println!(
        "Evaluating {} user orderings",
        orderings.len().to_formatted_string(&Locale::en)
    );

    let best = Mutex::new((i64::MIN, None::<Assignment>));

    let scores: Vec<i64> = orderings
        .par_iter()
        .map(|order| {
            let assignment = greedy_assign(index, capacity.clone(), N_PREFS, order)
                .expect("eval problem is feasible for every ordering");
            let score = assignment.score;

            {
                let mut best = best.lock().unwrap();
                if score > best.0 {
                    *best = (score, Some(assignment));
                }
            }

            score
        })
        .collect();

    let (best_score, best_assignment) = best.into_inner().unwrap();

    BruteForceResults {
        scores,
        best_assignment,
        best_score,
        orderings: orderings.len(),
    }
}

fn print_sampled_results(results: &SampledResults) {
    let sum: i64 = results.scores.iter().sum();
    let max = results.scores.iter().max().unwrap();
    let min = results.scores.iter().min().unwrap();
    let avg = sum as f64 / results.samples as f64;

    println!("=== SAMPLED ORDERINGS ({} samples) ===", results.samples);
    println!("Average score: {avg:.2}");
    println!("Minimum score: {min}");
    println!("Maximum score: {max}");
}

fn print_brute_force_results(results: &BruteForceResults) {
    let sum: i64 = results.scores.iter().sum();
    let max = results.scores.iter().max().unwrap();
    let min = results.scores.iter().min().unwrap();
    let avg = sum as f64 / results.scores.len() as f64;

    println!(
        "Number of orderings scored: {}",
        results.orderings.to_formatted_string(&Locale::en)
    );
    println!("Average score: {avg:.2}");
    println!("Minimum score: {min}");
    println!("Maximum score: {max}");

    if let Some(assignment) = &results.best_assignment {
        println!(
            "Best ordering (score {}):\n{}",
            results.best_score,
            format_assignment(assignment)
        );
    }
}

fn format_assignment(assignment: &Assignment) -> String {
    assignment
        .entries
        .iter()
        .map(|entry| {
            format!(
                "{} {} -> {} (rank {})",
                entry.user_id, entry.slot, entry.session, entry.rank
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

//! Bounded parallel execution of one-shot tasks.
//!
//! Wraps rayon to run a batch of independent closures in parallel while
//! limiting how many are in flight at once (e.g. to cap memory pressure
//! when every task holds a working buffer).

use rayon::prelude::*;

pub type Task<'a, E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'a>;

/// Runs every task, at most `max_in_flight` concurrently, and blocks until
/// all started tasks have finished.
///
/// Tasks are consumed in chunks of `max_in_flight`; the first error stops
/// submission of later chunks. Tasks within the failing chunk may still run
/// in parallel, and the call does not return before the chunk has drained.
///
/// # Panics
///
/// Panics if `max_in_flight` is 0.
pub fn try_run_limited<'a, E>(tasks: Vec<Task<'a, E>>, max_in_flight: usize) -> Result<(), E>
where
    E: Send,
{
    assert!(max_in_flight > 0, "max_in_flight must be > 0");

    let mut tasks = tasks;
    while !tasks.is_empty() {
        let rest = tasks.split_off(tasks.len().min(max_in_flight));
        let chunk = std::mem::replace(&mut tasks, rest);
        chunk
            .into_par_iter()
            .map(|task| task())
            .collect::<Result<Vec<()>, E>>()?;
    }
    Ok(())
}

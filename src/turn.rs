//! Turns where every bot moves at the same time.

use std::{thread, time::Instant};

use tracing::{debug, instrument};

use crate::{
    error::SupervisorError,
    supervisor::{BotStatus, BotSupervisor, TurnOutcome},
};

/// Send `state` to every active bot and collect their moves against one shared `deadline`.
///
/// Bots are served in parallel, so a slow bot does not eat into the time of the others.
/// Results are in the order of `bots`. A bot that is not [`BotStatus::Active`] gets an error,
/// and nothing is sent to it.
#[instrument(skip_all, fields(bots = bots.len(), len = state.len()))]
pub fn simultaneous_turn(
    bots: &mut [BotSupervisor],
    state: &[u8],
    deadline: Instant,
) -> Vec<Result<TurnOutcome, SupervisorError>> {
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = bots
            .iter_mut()
            .map(|bot| scope.spawn(move || play(bot, state, deadline)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });
    let moves = results
        .iter()
        .filter(|r| matches!(r, Ok(TurnOutcome::Move(_))))
        .count();
    debug!(moves, "simultaneous turn done");
    results
}

fn play(
    bot: &mut BotSupervisor,
    state: &[u8],
    deadline: Instant,
) -> Result<TurnOutcome, SupervisorError> {
    if bot.status() != BotStatus::Active {
        return Err(SupervisorError::not_allowed(bot.status()));
    }
    bot.update_state_until(state, deadline)?;
    bot.request_move(deadline)
}

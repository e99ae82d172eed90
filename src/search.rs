use tracing::{debug, info};

use crate::directory::UserId;
use crate::protocol::ServerMessage;
use crate::state::ServerState;

/// Background matchmaker. Sleeps until a user starts searching.
pub async fn run(state: ServerState) {
    loop {
        state.search.notified().await;

        let matched = match_searching(&state);
        debug!(pairs = matched.len(), "search pass");
    }
}

/// Pair searching users two at a time in id order.
///
/// The lower id acts as the inviter: the higher id gets the usual invitation
/// and answers it with accept or refuse. Matched users stop searching.
/// The lower id is not told about the match; it first hears of it from the
/// duel start (op 1) or refusal (op 5).
pub fn match_searching(state: &ServerState) -> Vec<(UserId, UserId)> {
    let dir = &state.directory;
    let mut matched = Vec::new();
    let mut waiting: Option<UserId> = None;

    for id in dir.searching() {
        if state.pairings.is_paired(id) {
            continue;
        }

        let Some(first) = waiting.take() else {
            waiting = Some(id);
            continue;
        };

        let Some(from) = dir.name_of(first) else {
            waiting = Some(id);
            continue;
        };

        if !state.pairings.try_pair(first, id) {
            waiting = still_free(state, first, id);
            continue;
        }

        dir.clear_positions(first, id);

        if !dir.send_to(id, ServerMessage::Invitation { from }) {
            state.pairings.unpair(first, id);
            waiting = Some(first);
            continue;
        }

        dir.update(first, |u| u.searching = false);
        dir.update(id, |u| u.searching = false);

        info!(first, second = id, "matched searching users");
        matched.push((first, id));
    }

    matched
}

/// After a failed pairing, whichever of the two is still unpaired keeps waiting.
fn still_free(state: &ServerState, first: UserId, second: UserId) -> Option<UserId> {
    [first, second]
        .into_iter()
        .find(|id| !state.pairings.is_paired(*id))
}

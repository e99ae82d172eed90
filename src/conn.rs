use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::arena::Point;
use crate::directory::{OUTBOX_CAPACITY, Outbox, UserId};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::ServerState;

/// Read size for the name sent right after connect.
const NAME_BUF_LEN: usize = 30;
/// Read size for every later message. One read is one message.
const MSG_BUF_LEN: usize = 50;

pub async fn handle(state: ServerState, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    let (mut reader, writer) = socket.into_split();

    let mut buf = [0u8; NAME_BUF_LEN];
    let n = reader.read(&mut buf).await?;

    if n == 0 {
        debug!(%peer, "closed before sending a name");
        return Ok(());
    }

    let name = buf[..n].to_vec();
    let (outbox, rx) = Outbox::channel(OUTBOX_CAPACITY);
    let overflow = outbox.overflow();
    let writer_task = tokio::spawn(write_loop(writer, rx, peer));

    let id = state.directory.register(name, outbox);
    info!(%peer, id, name = %String::from_utf8_lossy(&buf[..n]), "registered");

    let session = Session::new(state, id);
    let result = read_loop(&session, &mut reader, overflow).await;

    // Removing the user drops its outbox, which lets the writer drain and stop.
    session.teardown();

    match result {
        Ok(Closed::Stalled) => {
            warn!(%peer, id, "peer stopped reading, dropping connection");
            writer_task.abort();
        }
        _ => {
            let _ = writer_task.await;
        }
    }

    info!(%peer, id, "disconnected");

    result.map(|_| ())
}

/// Why a read loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Peer,
    /// Outbound queue filled up.
    Stalled,
}

async fn read_loop(
    session: &Session,
    reader: &mut OwnedReadHalf,
    overflow: Arc<Notify>,
) -> Result<Closed> {
    let mut buf = [0u8; MSG_BUF_LEN];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = overflow.notified() => return Ok(Closed::Stalled),
        };

        if n == 0 {
            return Ok(Closed::Peer);
        }

        let msg = ClientMessage::decode(&buf[..n])?;

        debug!(id = session.id(), ?msg, "message");

        session.dispatch(msg);
    }
}

/// Sole writer of the socket; each message goes out in one `write_all`.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ServerMessage>,
    peer: SocketAddr,
) {
    while let Some(msg) = rx.recv().await {
        let bytes = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(%peer, "dropping connection: {e}");
                break;
            }
        };

        if let Err(e) = writer.write_all(&bytes).await {
            debug!(%peer, "write failed: {e}");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Protocol state machine for one registered user.
pub struct Session {
    state: ServerState,
    id: UserId,
}

impl Session {
    pub fn new(state: ServerState, id: UserId) -> Self {
        Self { state, id }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn dispatch(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::ListUsers => self.list_users(),
            ClientMessage::Invite(target) => self.invite(target),
            ClientMessage::SearchStart => self.set_searching(true),
            ClientMessage::Accept => self.accept(),
            ClientMessage::PickPistol => self.pick_pistol(),
            ClientMessage::Shoot { x, y } => self.shoot(Point { x, y }),
            ClientMessage::Refuse => self.refuse(),
            ClientMessage::SearchStop => self.set_searching(false),
        }
    }

    fn list_users(&self) {
        let users = self
            .state
            .directory
            .list_others(self.id, &self.state.pairings);

        self.state
            .directory
            .send_to(self.id, ServerMessage::UserList(users));
    }

    fn invite(&self, target: UserId) {
        let dir = &self.state.directory;

        if !dir.contains(target) {
            debug!(id = self.id, target, "invite to unknown user");
            return;
        }

        let Some(from) = dir.name_of(self.id) else {
            return;
        };

        if !self.state.pairings.try_pair(self.id, target) {
            debug!(id = self.id, target, "invite target busy");
            return;
        }

        info!(from = self.id, to = target, "invitation");
        dir.clear_positions(self.id, target);

        // Target left between the lookup and the pairing.
        if !dir.send_to(target, ServerMessage::Invitation { from }) {
            self.state.pairings.unpair(self.id, target);
        }
    }

    fn accept(&self) {
        let Some(opponent) = self.state.pairings.opponent_of(self.id) else {
            return;
        };

        let dir = &self.state.directory;
        let mine = self.state.arena.spawn_point();
        let theirs = self.state.arena.spawn_point();

        if dir.update(opponent, |u| u.position = Some(theirs)).is_none() {
            return;
        }
        dir.update(self.id, |u| u.position = Some(mine));

        info!(id = self.id, ?mine, opponent, ?theirs, "duel started");

        dir.send_to(self.id, ServerMessage::DuelStart { x: theirs.x, y: theirs.y });
        dir.send_to(opponent, ServerMessage::DuelStart { x: mine.x, y: mine.y });
    }

    fn pick_pistol(&self) {
        self.state.directory.update(self.id, |u| u.pistol_armed = true);

        if let Some(opponent) = self.state.pairings.opponent_of(self.id) {
            self.state
                .directory
                .send_to(opponent, ServerMessage::OpponentArmed);
        }
    }

    fn shoot(&self, shot: Point) {
        let dir = &self.state.directory;

        let armed = dir.get(self.id).is_some_and(|u| u.pistol_armed);
        if !armed {
            return;
        }

        let Some(opponent) = self.state.pairings.opponent_of(self.id) else {
            return;
        };

        let Some(target) = dir.get(opponent).and_then(|u| u.position) else {
            return;
        };

        if !self.state.arena.is_hit(shot, target) {
            debug!(id = self.id, ?shot, ?target, "miss");
            return;
        }

        // Both players may fire at once; only the one that clears the pairing wins.
        if !self.state.pairings.unpair(self.id, opponent) {
            return;
        }

        info!(winner = self.id, loser = opponent, "duel resolved");
        dir.clear_positions(self.id, opponent);

        dir.send_to(opponent, ServerMessage::Lost);
        dir.send_to(self.id, ServerMessage::Won);
    }

    fn refuse(&self) {
        if let Some(opponent) = self.state.pairings.dissolve(self.id) {
            debug!(id = self.id, opponent, "invitation refused");

            let dir = &self.state.directory;
            dir.clear_positions(self.id, opponent);
            dir.send_to(opponent, ServerMessage::PairingCleared);
        }
    }

    fn set_searching(&self, on: bool) {
        self.state.directory.update(self.id, |u| u.searching = on);

        if on {
            self.state.search.notify_one();
        }
    }

    /// Drop the user and release its opponent, if any.
    pub fn teardown(&self) {
        self.state.directory.remove(self.id);

        if let Some(opponent) = self.state.pairings.dissolve(self.id) {
            let dir = &self.state.directory;
            dir.clear_positions(self.id, opponent);
            dir.send_to(opponent, ServerMessage::PairingCleared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::Receiver;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    fn join(state: &ServerState, name: &str) -> (Session, Receiver<ServerMessage>) {
        let (tx, rx) = Outbox::channel(OUTBOX_CAPACITY);
        let id = state.directory.register(name.as_bytes().to_vec(), tx);

        (Session::new(state.clone(), id), rx)
    }

    fn assert_silent(rx: &mut Receiver<ServerMessage>) {
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    fn duel_start(rx: &mut Receiver<ServerMessage>) -> Point {
        match rx.try_recv().unwrap() {
            ServerMessage::DuelStart { x, y } => Point { x, y },
            other => panic!("expected duel start, got {other:?}"),
        }
    }

    /// Alice invites Bob and Bob accepts.
    fn dueling_pair() -> (
        ServerState,
        (Session, Receiver<ServerMessage>),
        (Session, Receiver<ServerMessage>),
    ) {
        let state = ServerState::default();
        let (alice, mut a_rx) = join(&state, "Alice");
        let (bob, mut b_rx) = join(&state, "Bob");

        alice.dispatch(ClientMessage::Invite(bob.id()));
        assert_eq!(
            b_rx.try_recv().unwrap(),
            ServerMessage::Invitation { from: b"Alice".to_vec() }
        );

        bob.dispatch(ClientMessage::Accept);
        duel_start(&mut a_rx);
        duel_start(&mut b_rx);

        (state, (alice, a_rx), (bob, b_rx))
    }

    #[test]
    fn listing_hides_self() {
        let state = ServerState::default();
        let (alice, mut a_rx) = join(&state, "Alice");
        let (bob, _b_rx) = join(&state, "Bob");

        alice.dispatch(ClientMessage::ListUsers);

        match a_rx.try_recv().unwrap() {
            ServerMessage::UserList(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, bob.id());
                assert_eq!(list[0].name, "Bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invite_to_busy_user_is_silent() {
        let state = ServerState::default();
        let (alice, mut a_rx) = join(&state, "Alice");
        let (bob, mut b_rx) = join(&state, "Bob");
        let (carol, mut c_rx) = join(&state, "Carol");

        alice.dispatch(ClientMessage::Invite(bob.id()));
        b_rx.try_recv().unwrap();

        carol.dispatch(ClientMessage::Invite(bob.id()));
        assert_silent(&mut b_rx);
        assert_silent(&mut c_rx);
        assert_silent(&mut a_rx);
        assert_eq!(state.pairings.opponent_of(carol.id()), None);
        assert_eq!(state.pairings.opponent_of(bob.id()), Some(alice.id()));
    }

    #[test]
    fn invite_to_unknown_or_self_is_ignored() {
        let state = ServerState::default();
        let (alice, mut a_rx) = join(&state, "Alice");

        alice.dispatch(ClientMessage::Invite(17));
        alice.dispatch(ClientMessage::Invite(alice.id()));

        assert_silent(&mut a_rx);
        assert!(state.pairings.is_empty());
    }

    #[test]
    fn accept_places_both_players_in_bounds() {
        let (state, (alice, _a_rx), (bob, _b_rx)) = dueling_pair();

        let a_pos = state.directory.get(alice.id()).unwrap().position.unwrap();
        let b_pos = state.directory.get(bob.id()).unwrap().position.unwrap();

        for p in [a_pos, b_pos] {
            assert!((10..790).contains(&p.x));
            assert!((10..590).contains(&p.y));
        }
    }

    #[test]
    fn duel_start_carries_opponent_coordinates() {
        let state = ServerState::default();
        let (alice, mut a_rx) = join(&state, "Alice");
        let (bob, mut b_rx) = join(&state, "Bob");

        alice.dispatch(ClientMessage::Invite(bob.id()));
        b_rx.try_recv().unwrap();
        bob.dispatch(ClientMessage::Accept);

        let seen_by_alice = duel_start(&mut a_rx);
        let seen_by_bob = duel_start(&mut b_rx);

        assert_eq!(Some(seen_by_alice), state.directory.get(bob.id()).unwrap().position);
        assert_eq!(Some(seen_by_bob), state.directory.get(alice.id()).unwrap().position);
    }

    #[test]
    fn refuse_clears_pairing_and_notifies_inviter() {
        let state = ServerState::default();
        let (alice, mut a_rx) = join(&state, "Alice");
        let (bob, mut b_rx) = join(&state, "Bob");

        alice.dispatch(ClientMessage::Invite(bob.id()));
        b_rx.try_recv().unwrap();

        bob.dispatch(ClientMessage::Refuse);

        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::PairingCleared);
        assert_silent(&mut b_rx);
        assert!(state.pairings.is_empty());

        bob.dispatch(ClientMessage::Refuse);
        assert_silent(&mut a_rx);
    }

    #[test]
    fn pistol_pickup_notifies_opponent() {
        let (state, (_alice, mut a_rx), (bob, mut b_rx)) = dueling_pair();

        bob.dispatch(ClientMessage::PickPistol);

        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::OpponentArmed);
        assert_silent(&mut b_rx);
        assert!(state.directory.get(bob.id()).unwrap().pistol_armed);
    }

    #[test]
    fn unarmed_shot_never_resolves() {
        let (state, (alice, mut a_rx), (bob, mut b_rx)) = dueling_pair();
        let target = state.directory.get(bob.id()).unwrap().position.unwrap();

        alice.dispatch(ClientMessage::Shoot { x: target.x, y: target.y });

        assert_silent(&mut a_rx);
        assert_silent(&mut b_rx);
        assert_eq!(state.pairings.opponent_of(alice.id()), Some(bob.id()));
    }

    #[test]
    fn shot_at_radius_hits_and_one_past_misses() {
        let (state, (alice, mut a_rx), (bob, mut b_rx)) = dueling_pair();
        let target = Point { x: 400, y: 300 };
        state.directory.update(bob.id(), |u| u.position = Some(target));

        alice.dispatch(ClientMessage::PickPistol);
        b_rx.try_recv().unwrap();

        alice.dispatch(ClientMessage::Shoot { x: target.x + 21, y: target.y });
        assert_silent(&mut a_rx);
        assert_silent(&mut b_rx);
        assert!(state.pairings.is_paired(alice.id()));

        alice.dispatch(ClientMessage::Shoot { x: target.x + 20, y: target.y });
        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::Lost);
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::Won);
        assert!(state.pairings.is_empty());

        // duel is over, further shots do nothing
        alice.dispatch(ClientMessage::Shoot { x: target.x, y: target.y });
        assert_silent(&mut a_rx);
        assert_silent(&mut b_rx);
    }

    #[test]
    fn search_flag_toggles() {
        let state = ServerState::default();
        let (alice, _a_rx) = join(&state, "Alice");

        alice.dispatch(ClientMessage::SearchStart);
        assert_eq!(state.directory.searching(), vec![alice.id()]);

        alice.dispatch(ClientMessage::SearchStop);
        assert!(state.directory.searching().is_empty());
    }

    #[test]
    fn teardown_releases_opponent() {
        let (state, (alice, mut a_rx), (bob, _b_rx)) = dueling_pair();

        bob.teardown();

        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::PairingCleared);
        assert!(!state.directory.contains(bob.id()));
        assert!(state.pairings.is_empty());

        alice.dispatch(ClientMessage::ListUsers);
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::UserList(Vec::new()));
    }

    #[test]
    fn extreme_shot_coordinates_miss() {
        let (state, (alice, mut a_rx), (bob, mut b_rx)) = dueling_pair();
        state.directory.update(bob.id(), |u| u.position = Some(Point { x: 10, y: 10 }));

        alice.dispatch(ClientMessage::PickPistol);
        b_rx.try_recv().unwrap();

        for (x, y) in [(u32::MAX, u32::MAX), (u32::MAX, 10), (10, u32::MAX), (1 << 31, 0)] {
            alice.dispatch(ClientMessage::Shoot { x, y });
        }

        assert_silent(&mut a_rx);
        assert_silent(&mut b_rx);
        assert_eq!(state.pairings.opponent_of(alice.id()), Some(bob.id()));
    }

    #[test]
    fn rematch_needs_a_fresh_accept() {
        let (state, (alice, mut a_rx), (bob, mut b_rx)) = dueling_pair();
        let old = state.directory.get(bob.id()).unwrap().position.unwrap();

        alice.dispatch(ClientMessage::PickPistol);
        b_rx.try_recv().unwrap();
        alice.dispatch(ClientMessage::Shoot { x: old.x, y: old.y });
        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::Lost);
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::Won);

        alice.dispatch(ClientMessage::Invite(bob.id()));
        assert_eq!(
            b_rx.try_recv().unwrap(),
            ServerMessage::Invitation { from: b"Alice".to_vec() }
        );
        assert!(state.directory.get(bob.id()).unwrap().position.is_none());

        // invited but not accepted: old coordinates are gone
        alice.dispatch(ClientMessage::Shoot { x: old.x, y: old.y });
        assert_silent(&mut a_rx);
        assert_silent(&mut b_rx);
        assert!(state.pairings.is_paired(bob.id()));

        bob.dispatch(ClientMessage::Accept);
        let target = duel_start(&mut a_rx);
        duel_start(&mut b_rx);

        // the pistol stays armed across duels
        alice.dispatch(ClientMessage::Shoot { x: target.x, y: target.y });
        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::Lost);
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::Won);
    }

    #[test]
    fn refusal_clears_positions() {
        let (state, (alice, mut a_rx), (bob, _b_rx)) = dueling_pair();

        bob.dispatch(ClientMessage::Refuse);
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::PairingCleared);

        for id in [alice.id(), bob.id()] {
            assert!(state.directory.get(id).unwrap().position.is_none());
        }
    }

    #[tokio::test]
    async fn stalled_reader_overflows_its_outbox() {
        let state = ServerState::default();
        let (outbox, _alice_rx) = Outbox::channel(OUTBOX_CAPACITY);
        let overflow = outbox.overflow();
        let alice = Session::new(state.clone(), state.directory.register(b"Alice".to_vec(), outbox));
        let (bob, _b_rx) = join(&state, "Bob");

        alice.dispatch(ClientMessage::Invite(bob.id()));

        // Alice never reads; Bob keeps picking up the pistol
        for _ in 0..OUTBOX_CAPACITY + 1 {
            bob.dispatch(ClientMessage::PickPistol);
        }

        timeout(Duration::from_secs(1), overflow.notified())
            .await
            .expect("overflow signalled");
    }

    #[tokio::test]
    async fn read_loop_stops_on_overflow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = socket.into_split();

        let state = ServerState::default();
        let (alice, _a_rx) = join(&state, "Alice");

        let overflow = Arc::new(Notify::new());
        overflow.notify_one();

        let closed = timeout(Duration::from_secs(1), read_loop(&alice, &mut reader, overflow))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(closed, Closed::Stalled);
    }
}

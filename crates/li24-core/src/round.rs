//! Round engine
//!
//! A protocol is a tagged enum of its rounds implementing [`Round`]. A
//! [`Session`] owns the party set, the current round, a mailbox buffering
//! messages for rounds not reached yet, and the outbox of produced messages.
//! Inbound messages are verified before they are stored, and a round is
//! finalized exactly once, after every expected message has been stored.

use crate::{Curve, Error, PartyId, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Round index, starting at 1
pub type RoundNumber = u8;

/// Check `0 <= threshold <= n - 1`
pub fn validate_threshold(threshold: usize, n: usize) -> bool {
    n > 0 && threshold < n && threshold <= u32::MAX as usize
}

/// Static description of a protocol run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    party_ids: Vec<PartyId>,
    self_id: PartyId,
    threshold: usize,
    curve: Curve,
}

impl Info {
    /// Sorts the party set; duplicates, a missing self id or an out of range
    /// threshold are rejected.
    pub fn new(party_ids: &[PartyId], self_id: PartyId, threshold: usize) -> Result<Self> {
        let mut sorted = party_ids.to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Precondition("Duplicate party id".into()));
        }
        if sorted.binary_search(&self_id).is_err() {
            return Err(Error::Precondition(format!(
                "Party {} is not in the party set",
                self_id
            )));
        }
        if !validate_threshold(threshold, sorted.len()) {
            return Err(Error::Precondition(format!(
                "Threshold {} is invalid for {} parties",
                threshold,
                sorted.len()
            )));
        }
        Ok(Self {
            party_ids: sorted,
            self_id,
            threshold,
            curve: Curve::Secp256k1,
        })
    }

    /// Sorted party ids
    pub fn party_ids(&self) -> &[PartyId] {
        &self.party_ids
    }

    pub fn other_party_ids(&self) -> impl Iterator<Item = PartyId> + '_ {
        let me = self.self_id;
        self.party_ids.iter().copied().filter(move |id| *id != me)
    }

    pub fn self_id(&self) -> PartyId {
        self.self_id
    }

    /// Position in the sorted party list
    pub fn index_of(&self, id: PartyId) -> Option<usize> {
        self.party_ids.binary_search(&id).ok()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn n(&self) -> usize {
        self.party_ids.len()
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn contains(&self, id: PartyId) -> bool {
        self.index_of(id).is_some()
    }
}

/// Message payload of a protocol; knows which round it belongs to
pub trait Content: Clone + fmt::Debug {
    fn round(&self) -> RoundNumber;
}

/// A protocol message; `to == None` marks a broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct Message<C> {
    pub from: PartyId,
    pub to: Option<PartyId>,
    pub content: C,
}

impl<C> Message<C> {
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Messages produced by a finalizing round
#[derive(Debug)]
pub struct Outbox<C> {
    from: PartyId,
    messages: Vec<Message<C>>,
}

impl<C> Outbox<C> {
    fn new(from: PartyId) -> Self {
        Self {
            from,
            messages: Vec::new(),
        }
    }

    /// Queue a message for every other party
    pub fn broadcast(&mut self, content: C) {
        self.messages.push(Message {
            from: self.from,
            to: None,
            content,
        });
    }

    /// Queue a point-to-point message
    pub fn send(&mut self, to: PartyId, content: C) {
        self.messages.push(Message {
            from: self.from,
            to: Some(to),
            content,
        });
    }
}

/// Result of finalizing a round
pub enum Transition<R: Round> {
    Next(R),
    Output(R::Output),
}

/// One round of a protocol
///
/// `finalize` consumes the round; an error from any method aborts the
/// session.
pub trait Round: Sized {
    type Content: Content;
    type Output;

    /// Number of the last round
    const FINAL_ROUND: RoundNumber;

    fn number(&self) -> RoundNumber;

    /// Whether every other party sends a broadcast in this round
    fn expects_broadcast(&self) -> bool {
        false
    }

    /// Whether every other party sends a point-to-point message in this round
    fn expects_direct(&self) -> bool {
        false
    }

    /// Structural checks on a point-to-point message, before it is stored
    fn verify_message(&self, _info: &Info, _msg: &Message<Self::Content>) -> Result<()> {
        Ok(())
    }

    fn store_message(&mut self, _info: &Info, msg: Message<Self::Content>) -> Result<()> {
        Err(Error::invalid_message(msg.from, "unexpected direct message"))
    }

    fn store_broadcast_message(&mut self, _info: &Info, msg: Message<Self::Content>) -> Result<()> {
        Err(Error::invalid_message(msg.from, "unexpected broadcast message"))
    }

    fn finalize(self, info: &Info, outbox: &mut Outbox<Self::Content>) -> Result<Transition<Self>>;
}

/// Lifecycle of a session
pub enum State<R: Round> {
    Active(R),
    Finished(R::Output),
    Aborted(Error),
}

#[derive(Debug)]
enum Pending<C> {
    Empty,
    Queued(Message<C>),
    Stored,
}

impl<C> Pending<C> {
    fn is_empty(&self) -> bool {
        matches!(self, Pending::Empty)
    }

    fn is_stored(&self) -> bool {
        matches!(self, Pending::Stored)
    }

    fn take(&mut self) -> Option<Message<C>> {
        match std::mem::replace(self, Pending::Stored) {
            Pending::Queued(msg) => Some(msg),
            other => {
                *self = other;
                None
            }
        }
    }
}

#[derive(Debug)]
struct Slot<C> {
    broadcast: Pending<C>,
    direct: Pending<C>,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            broadcast: Pending::Empty,
            direct: Pending::Empty,
        }
    }
}

/// Per (round, sender) buffer of inbound messages
#[derive(Debug)]
struct Mailbox<C> {
    slots: BTreeMap<(RoundNumber, PartyId), Slot<C>>,
}

impl<C> Mailbox<C> {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// Returns false if a message of the same kind was already received
    fn push(&mut self, round: RoundNumber, msg: Message<C>) -> bool {
        let slot = self.slots.entry((round, msg.from)).or_default();
        let pending = if msg.is_broadcast() {
            &mut slot.broadcast
        } else {
            &mut slot.direct
        };
        if !pending.is_empty() {
            return false;
        }
        *pending = Pending::Queued(msg);
        true
    }

    fn is_complete(
        &self,
        round: RoundNumber,
        senders: impl Iterator<Item = PartyId>,
        broadcast: bool,
        direct: bool,
    ) -> bool {
        senders.into_iter().all(|from| match self.slots.get(&(round, from)) {
            Some(slot) => {
                (!broadcast || slot.broadcast.is_stored()) && (!direct || slot.direct.is_stored())
            }
            None => !broadcast && !direct,
        })
    }

    fn clear_round(&mut self, round: RoundNumber) {
        self.slots.retain(|(r, _), _| *r != round);
    }
}

/// One party's run of a protocol
pub struct Session<R: Round> {
    info: Info,
    state: State<R>,
    mailbox: Mailbox<R::Content>,
    outgoing: Vec<Message<R::Content>>,
}

impl<R: Round> Session<R> {
    /// Start a session at its first round
    ///
    /// A first round that waits for no messages finalizes immediately, so
    /// its outgoing messages are available right away.
    pub fn new(info: Info, first: R) -> Self {
        let mut session = Self {
            info,
            state: State::Active(first),
            mailbox: Mailbox::new(),
            outgoing: Vec::new(),
        };
        // an abort here is recorded in the session state
        let _ = session.advance();
        session
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn state(&self) -> &State<R> {
        &self.state
    }

    /// Current round, `None` once terminal
    pub fn round_number(&self) -> Option<RoundNumber> {
        match &self.state {
            State::Active(round) => Some(round.number()),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, State::Active(_))
    }

    pub fn output(&self) -> Option<&R::Output> {
        match &self.state {
            State::Finished(output) => Some(output),
            _ => None,
        }
    }

    pub fn abort_reason(&self) -> Option<&Error> {
        match &self.state {
            State::Aborted(e) => Some(e),
            _ => None,
        }
    }

    /// Drain the messages produced so far
    pub fn take_outgoing(&mut self) -> Vec<Message<R::Content>> {
        std::mem::take(&mut self.outgoing)
    }

    /// Consume the session, returning the output or the abort error
    pub fn into_result(self) -> Result<R::Output> {
        match self.state {
            State::Finished(output) => Ok(output),
            State::Aborted(e) => Err(e),
            State::Active(round) => Err(Error::Internal(format!(
                "Session still waiting in round {}",
                round.number()
            ))),
        }
    }

    /// Deliver one inbound message
    ///
    /// Messages for a later round are buffered; stale or duplicate messages
    /// are dropped. Any validation failure aborts the session and is returned.
    pub fn handle(&mut self, msg: Message<R::Content>) -> Result<()> {
        let current = match &self.state {
            State::Active(round) => round.number(),
            _ => return Err(Error::SessionTerminated),
        };

        if let Err(e) = self.check_addressing(&msg) {
            self.abort(e.clone());
            return Err(e);
        }

        let round = msg.content.round();
        if round < current {
            warn!(from = msg.from, round, current, "Dropping stale message");
            return Ok(());
        }

        let from = msg.from;
        if !self.mailbox.push(round, msg) {
            warn!(from, round, "Dropping duplicate message");
            return Ok(());
        }

        self.advance()
    }

    fn check_addressing(&self, msg: &Message<R::Content>) -> Result<()> {
        if msg.from == self.info.self_id() || !self.info.contains(msg.from) {
            return Err(Error::invalid_message(msg.from, "unknown sender"));
        }
        if let Some(to) = msg.to {
            if to != self.info.self_id() {
                return Err(Error::invalid_message(
                    msg.from,
                    format!("message addressed to party {}", to),
                ));
            }
        }
        let round = msg.content.round();
        if round == 0 || round > R::FINAL_ROUND {
            return Err(Error::invalid_message(
                msg.from,
                format!("invalid round number {}", round),
            ));
        }
        Ok(())
    }

    fn abort(&mut self, error: Error) {
        warn!(party_id = self.info.self_id(), %error, "Session aborted");
        self.state = State::Aborted(error);
    }

    /// Store every queued message of the current round, then finalize while
    /// rounds are complete.
    fn advance(&mut self) -> Result<()> {
        loop {
            let round = match &mut self.state {
                State::Active(round) => round,
                _ => return Ok(()),
            };
            let number = round.number();

            if let Err(e) = Self::store_queued(&self.info, &mut self.mailbox, round) {
                self.abort(e.clone());
                return Err(e);
            }

            let complete = self.mailbox.is_complete(
                number,
                self.info.other_party_ids(),
                round.expects_broadcast(),
                round.expects_direct(),
            );
            if !complete {
                return Ok(());
            }

            let round = match std::mem::replace(&mut self.state, State::Aborted(Error::SessionTerminated)) {
                State::Active(round) => round,
                other => {
                    self.state = other;
                    return Ok(());
                }
            };

            let mut outbox = Outbox::new(self.info.self_id());
            match round.finalize(&self.info, &mut outbox) {
                Ok(Transition::Next(next)) => {
                    debug!(
                        party_id = self.info.self_id(),
                        finished = number,
                        sent = outbox.messages.len(),
                        "Round finalized"
                    );
                    self.outgoing.extend(outbox.messages);
                    self.mailbox.clear_round(number);
                    self.state = State::Active(next);
                }
                Ok(Transition::Output(output)) => {
                    debug!(party_id = self.info.self_id(), "Session finished");
                    self.outgoing.extend(outbox.messages);
                    self.mailbox = Mailbox::new();
                    self.state = State::Finished(output);
                    return Ok(());
                }
                Err(e) => {
                    self.abort(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn store_queued(info: &Info, mailbox: &mut Mailbox<R::Content>, round: &mut R) -> Result<()> {
        let number = round.number();
        for from in info.other_party_ids() {
            let slot = match mailbox.slots.get_mut(&(number, from)) {
                Some(slot) => slot,
                None => continue,
            };
            if let Some(msg) = slot.broadcast.take() {
                if !round.expects_broadcast() {
                    return Err(Error::invalid_message(from, "unexpected broadcast message"));
                }
                round.store_broadcast_message(info, msg)?;
            }
            if let Some(msg) = slot.direct.take() {
                if !round.expects_direct() {
                    return Err(Error::invalid_message(from, "unexpected direct message"));
                }
                round.verify_message(info, &msg)?;
                round.store_message(info, msg)?;
            }
        }
        Ok(())
    }
}

/// Deliver messages between in-process sessions until none are left
///
/// `tamper` sees every message before delivery. Used by tests and local
/// simulations; a real deployment moves messages over a
/// [`Relay`](crate::mpc::Relay).
pub fn run_local<R, F>(sessions: &mut [Session<R>], mut tamper: F)
where
    R: Round,
    F: FnMut(&mut Message<R::Content>),
{
    loop {
        let mut pending = Vec::new();
        for session in sessions.iter_mut() {
            pending.extend(session.take_outgoing());
        }
        if pending.is_empty() {
            return;
        }
        for mut msg in pending {
            tamper(&mut msg);
            for session in sessions.iter_mut() {
                let id = session.info().self_id();
                if id == msg.from || msg.to.map_or(false, |to| to != id) {
                    continue;
                }
                // aborts stay visible in the session state
                let _ = session.handle(msg.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-round toy protocol: round 1 broadcasts self id and sends self id
    /// squared directly, round 2 sums what it received.
    #[derive(Debug, Clone, PartialEq)]
    enum ToyContent {
        Id(usize),
        Square(usize),
    }

    impl Content for ToyContent {
        fn round(&self) -> RoundNumber {
            2
        }
    }

    enum Toy {
        One,
        Two { ids: usize, squares: usize },
    }

    impl Round for Toy {
        type Content = ToyContent;
        type Output = (usize, usize);

        const FINAL_ROUND: RoundNumber = 2;

        fn number(&self) -> RoundNumber {
            match self {
                Toy::One => 1,
                Toy::Two { .. } => 2,
            }
        }

        fn expects_broadcast(&self) -> bool {
            matches!(self, Toy::Two { .. })
        }

        fn expects_direct(&self) -> bool {
            matches!(self, Toy::Two { .. })
        }

        fn verify_message(&self, _info: &Info, msg: &Message<ToyContent>) -> Result<()> {
            match msg.content {
                ToyContent::Square(v) if v == msg.from * msg.from => Ok(()),
                _ => Err(Error::invalid_message(msg.from, "bad square")),
            }
        }

        fn store_message(&mut self, _info: &Info, msg: Message<ToyContent>) -> Result<()> {
            if let (Toy::Two { squares, .. }, ToyContent::Square(v)) = (self, msg.content) {
                *squares += v;
            }
            Ok(())
        }

        fn store_broadcast_message(&mut self, _info: &Info, msg: Message<ToyContent>) -> Result<()> {
            if let (Toy::Two { ids, .. }, ToyContent::Id(v)) = (self, msg.content) {
                *ids += v;
            }
            Ok(())
        }

        fn finalize(self, info: &Info, outbox: &mut Outbox<ToyContent>) -> Result<Transition<Self>> {
            match self {
                Toy::One => {
                    let me = info.self_id();
                    outbox.broadcast(ToyContent::Id(me));
                    for id in info.other_party_ids() {
                        outbox.send(id, ToyContent::Square(me * me));
                    }
                    Ok(Transition::Next(Toy::Two { ids: 0, squares: 0 }))
                }
                Toy::Two { ids, squares } => Ok(Transition::Output((ids, squares))),
            }
        }
    }

    fn sessions(ids: &[PartyId]) -> Vec<Session<Toy>> {
        ids.iter()
            .map(|id| Session::new(Info::new(ids, *id, 1).unwrap(), Toy::One))
            .collect()
    }

    #[test]
    fn test_info_validation() {
        let info = Info::new(&[3, 1, 2], 1, 2).unwrap();
        assert_eq!(info.party_ids(), &[1, 2, 3]);
        assert_eq!(info.other_party_ids().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(info.index_of(3), Some(2));

        assert!(matches!(Info::new(&[1, 2, 2], 1, 1), Err(Error::Precondition(_))));
        assert!(matches!(Info::new(&[1, 2, 3], 4, 1), Err(Error::Precondition(_))));
        assert!(matches!(Info::new(&[1, 2, 3], 1, 3), Err(Error::Precondition(_))));
        assert!(matches!(Info::new(&[1, 2, 3], 1, usize::MAX), Err(Error::Precondition(_))));
        assert!(Info::new(&[1, 2, 3], 1, 0).is_ok());
    }

    #[test]
    fn test_first_round_finalizes_immediately() {
        let mut s = sessions(&[0, 1, 2]);
        assert_eq!(s[0].round_number(), Some(2));
        let out = s[0].take_outgoing();
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().filter(|m| m.is_broadcast()).count(), 1);
    }

    #[test]
    fn test_run_to_completion() {
        let mut s = sessions(&[0, 1, 2]);
        run_local(&mut s, |_| {});
        for session in &s {
            let me = session.info().self_id();
            let expected_ids: usize = [0, 1, 2].iter().filter(|id| **id != me).sum();
            let expected_squares: usize = [0usize, 1, 4].iter().enumerate()
                .filter(|(id, _)| *id != me)
                .map(|(_, sq)| sq)
                .sum();
            assert_eq!(session.output(), Some(&(expected_ids, expected_squares)));
        }
    }

    #[test]
    fn test_reordered_delivery_is_buffered() {
        let mut s = sessions(&[0, 1, 2]);
        let mut all: Vec<_> = s.iter_mut().flat_map(|x| x.take_outgoing()).collect();
        all.reverse();
        for msg in all {
            for session in s.iter_mut() {
                let id = session.info().self_id();
                if id != msg.from && msg.to.map_or(true, |to| to == id) {
                    session.handle(msg.clone()).unwrap();
                }
            }
        }
        assert!(s.iter().all(|x| x.output().is_some()));
    }

    #[test]
    fn test_invalid_message_aborts() {
        let mut s = sessions(&[0, 1, 2]);
        let err = s[0]
            .handle(Message { from: 2, to: Some(0), content: ToyContent::Square(5) })
            .unwrap_err();
        assert!(matches!(err, Error::MessageValidation { from: 2, .. }));
        assert!(s[0].is_terminal());
        assert!(s[0].abort_reason().is_some());
        assert_eq!(
            s[0].handle(Message { from: 1, to: None, content: ToyContent::Id(1) }),
            Err(Error::SessionTerminated)
        );
    }

    #[test]
    fn test_misaddressed_message_aborts() {
        let mut s = sessions(&[0, 1, 2]);
        assert!(s[0]
            .handle(Message { from: 7, to: None, content: ToyContent::Id(7) })
            .is_err());
        let mut s = sessions(&[0, 1, 2]);
        assert!(s[0]
            .handle(Message { from: 1, to: Some(2), content: ToyContent::Square(1) })
            .is_err());
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let mut s = sessions(&[0, 1, 2]);
        let msg = Message { from: 1, to: None, content: ToyContent::Id(1) };
        s[0].handle(msg.clone()).unwrap();
        s[0].handle(Message { from: 1, to: None, content: ToyContent::Id(100) }).unwrap();
        s[0].handle(Message { from: 1, to: Some(0), content: ToyContent::Square(1) }).unwrap();
        s[0].handle(Message { from: 2, to: None, content: ToyContent::Id(2) }).unwrap();
        s[0].handle(Message { from: 2, to: Some(0), content: ToyContent::Square(4) }).unwrap();
        assert_eq!(s[0].output(), Some(&(3, 5)));
    }
}

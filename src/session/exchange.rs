//! In-flight exchange state machines
//!
//! Every QoS level has its own transition table. [`Handshake::advance`] is
//! pure: it maps (state, input) to the next state and a [`Step`] describing
//! what the caller must do. Sessions turn steps into packets and timer
//! operations; nothing in this file touches I/O or time.

use std::time::{Duration, Instant};

use smallvec::SmallVec;

use super::error::DeliveryError;
use super::packet_id::Direction;
use crate::protocol::{Message, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::retry::TimerKey;

/// QoS 1 sender states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos1Sender {
    /// PUBLISH sent, waiting for PUBACK
    AwaitingAck,
    Complete,
}

/// QoS 2 sender states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2Sender {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingReceived,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitingCompleted,
    Complete,
}

/// QoS 2 receiver states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2Receiver {
    /// PUBREC sent, waiting for PUBREL
    AwaitingRelease,
    /// Released and delivered; only answers retransmissions
    Complete,
}

/// Handshake of one exchange, tagged by QoS level and role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Qos0,
    Qos1Sender(Qos1Sender),
    Qos1Receiver,
    Qos2Sender(Qos2Sender),
    Qos2Receiver(Qos2Receiver),
}

/// Event fed into a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    /// The retransmission deadline elapsed
    Timeout,
}

/// Packet the caller must send in response to a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Publish { dup: bool },
    PubAck,
    PubRec,
    PubRel,
    PubComp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    Keep,
    Rearm,
    Cancel,
}

/// Outcome of a single transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub reply: Option<Reply>,
    pub deliver: bool,
    pub timer: TimerOp,
    pub terminal: bool,
    /// The handshake moved forward, so the retry budget starts over
    pub progressed: bool,
}

impl Step {
    fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            deliver: false,
            timer: TimerOp::Keep,
            terminal: false,
            progressed: false,
        }
    }

    fn retransmit(reply: Reply) -> Self {
        Self {
            timer: TimerOp::Rearm,
            ..Self::reply(reply)
        }
    }

    fn complete() -> Self {
        Self {
            reply: None,
            deliver: false,
            timer: TimerOp::Cancel,
            terminal: true,
            progressed: true,
        }
    }
}

impl Handshake {
    /// Initial state for a locally sent message
    pub fn sender(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Handshake::Qos0,
            QoS::AtLeastOnce => Handshake::Qos1Sender(Qos1Sender::AwaitingAck),
            QoS::ExactlyOnce => Handshake::Qos2Sender(Qos2Sender::AwaitingReceived),
        }
    }

    /// Initial state for a message received from the peer
    pub fn receiver(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Handshake::Qos0,
            QoS::AtLeastOnce => Handshake::Qos1Receiver,
            QoS::ExactlyOnce => Handshake::Qos2Receiver(Qos2Receiver::AwaitingRelease),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Handshake::Qos1Sender(Qos1Sender::Complete)
                | Handshake::Qos2Sender(Qos2Sender::Complete)
                | Handshake::Qos2Receiver(Qos2Receiver::Complete)
        )
    }

    /// Apply `input`. Returns `None` when the input has no meaning in the
    /// current state; the state is left untouched in that case.
    pub fn advance(&mut self, input: Input) -> Option<Step> {
        use Input::*;

        let step = match (*self, input) {
            // Fire and forget: delivered on receipt, nothing to wait for
            (Handshake::Qos0, Publish) => Step {
                deliver: true,
                ..Step::complete()
            },

            (Handshake::Qos1Sender(Qos1Sender::AwaitingAck), PubAck) => {
                *self = Handshake::Qos1Sender(Qos1Sender::Complete);
                Step::complete()
            }
            (Handshake::Qos1Sender(Qos1Sender::AwaitingAck), Timeout) => {
                Step::retransmit(Reply::Publish { dup: true })
            }

            // Every copy is delivered and acknowledged
            (Handshake::Qos1Receiver, Publish) => Step {
                reply: Some(Reply::PubAck),
                deliver: true,
                ..Step::complete()
            },

            (Handshake::Qos2Sender(Qos2Sender::AwaitingReceived), PubRec) => {
                *self = Handshake::Qos2Sender(Qos2Sender::AwaitingCompleted);
                Step {
                    progressed: true,
                    ..Step::retransmit(Reply::PubRel)
                }
            }
            (Handshake::Qos2Sender(Qos2Sender::AwaitingReceived), Timeout) => {
                Step::retransmit(Reply::Publish { dup: true })
            }
            (Handshake::Qos2Sender(Qos2Sender::AwaitingCompleted), PubRec) => {
                Step::reply(Reply::PubRel)
            }
            (Handshake::Qos2Sender(Qos2Sender::AwaitingCompleted), PubComp) => {
                *self = Handshake::Qos2Sender(Qos2Sender::Complete);
                Step::complete()
            }
            (Handshake::Qos2Sender(Qos2Sender::AwaitingCompleted), Timeout) => {
                Step::retransmit(Reply::PubRel)
            }

            (Handshake::Qos2Receiver(Qos2Receiver::AwaitingRelease), Publish) => {
                Step::reply(Reply::PubRec)
            }
            (Handshake::Qos2Receiver(Qos2Receiver::AwaitingRelease), PubRel) => {
                *self = Handshake::Qos2Receiver(Qos2Receiver::Complete);
                Step {
                    reply: Some(Reply::PubComp),
                    deliver: true,
                    ..Step::complete()
                }
            }
            (Handshake::Qos2Receiver(Qos2Receiver::AwaitingRelease), Timeout) => {
                Step::retransmit(Reply::PubRec)
            }
            (Handshake::Qos2Receiver(Qos2Receiver::Complete), Publish | PubRel) => {
                Step::reply(Reply::PubComp)
            }

            _ => return None,
        };

        Some(step)
    }
}

/// One message in flight on a connection
#[derive(Debug, Clone)]
pub struct InFlightExchange {
    pub packet_id: u16,
    pub qos: QoS,
    pub direction: Direction,
    pub handshake: Handshake,
    pub retry_count: u32,
    /// When the last packet of this exchange went out
    pub last_sent: Instant,
    /// Token of the currently armed deadline; expiries carrying another
    /// token are stale
    pub timer_token: u64,
    /// Creation order within the session
    pub sequence: u64,
    pub message: Message,
}

impl InFlightExchange {
    pub fn new(
        packet_id: u16,
        qos: QoS,
        direction: Direction,
        message: Message,
        now: Instant,
    ) -> Self {
        let handshake = match direction {
            Direction::Outbound => Handshake::sender(qos),
            Direction::Inbound => Handshake::receiver(qos),
        };
        Self {
            packet_id,
            qos,
            direction,
            handshake,
            retry_count: 0,
            last_sent: now,
            timer_token: 0,
            sequence: 0,
            message,
        }
    }

    pub fn timer_key(&self) -> TimerKey {
        TimerKey::Retransmit(self.direction, self.packet_id)
    }

    /// Materialize a reply as a wire packet for this exchange
    pub fn packet(&self, reply: Reply) -> Packet {
        let id = self.packet_id;
        match reply {
            Reply::Publish { dup } => {
                let mut publish = Publish::from_message(&self.message, self.qos, Some(id));
                publish.dup = dup;
                Packet::Publish(publish)
            }
            Reply::PubAck => Packet::PubAck(PubAck::new(id)),
            Reply::PubRec => Packet::PubRec(PubRec::new(id)),
            Reply::PubRel => Packet::PubRel(PubRel::new(id)),
            Reply::PubComp => Packet::PubComp(PubComp::new(id)),
        }
    }
}

/// Side effect requested by a session
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write a packet to the peer
    Send(Packet),
    /// Hand a released message to the local delivery sink
    Deliver(Message),
    ArmTimer {
        key: TimerKey,
        after: Duration,
        token: u64,
    },
    CancelTimer {
        key: TimerKey,
    },
    /// The exchange ran out of retries and was dropped
    Abandoned(DeliveryError),
}

pub type Actions = SmallVec<[Action; 4]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos1_sender_table() {
        let mut hs = Handshake::sender(QoS::AtLeastOnce);
        let step = hs.advance(Input::Timeout).unwrap();
        assert_eq!(step.reply, Some(Reply::Publish { dup: true }));
        assert_eq!(step.timer, TimerOp::Rearm);
        assert!(!step.terminal);

        assert_eq!(hs.advance(Input::PubRec), None);
        let step = hs.advance(Input::PubAck).unwrap();
        assert!(step.terminal);
        assert_eq!(step.timer, TimerOp::Cancel);
        assert!(hs.is_complete());

        // A second PUBACK never advances again
        assert_eq!(hs.advance(Input::PubAck), None);
    }

    #[test]
    fn test_qos2_sender_table() {
        let mut hs = Handshake::sender(QoS::ExactlyOnce);
        assert_eq!(hs.advance(Input::PubComp), None);

        let step = hs.advance(Input::PubRec).unwrap();
        assert_eq!(step.reply, Some(Reply::PubRel));
        assert!(step.progressed);
        assert_eq!(hs, Handshake::Qos2Sender(Qos2Sender::AwaitingCompleted));

        // Duplicate PUBREC re-sends PUBREL and stays put
        let step = hs.advance(Input::PubRec).unwrap();
        assert_eq!(step.reply, Some(Reply::PubRel));
        assert!(!step.progressed);
        assert_eq!(step.timer, TimerOp::Keep);

        // PUBREL retransmissions never carry DUP
        let step = hs.advance(Input::Timeout).unwrap();
        assert_eq!(step.reply, Some(Reply::PubRel));

        assert!(hs.advance(Input::PubComp).unwrap().terminal);
        assert_eq!(hs.advance(Input::PubComp), None);
    }

    #[test]
    fn test_qos2_receiver_table() {
        let mut hs = Handshake::receiver(QoS::ExactlyOnce);
        let step = hs.advance(Input::Publish).unwrap();
        assert_eq!(step.reply, Some(Reply::PubRec));
        assert!(!step.deliver);

        let step = hs.advance(Input::PubRel).unwrap();
        assert!(step.deliver);
        assert!(step.terminal);
        assert_eq!(step.reply, Some(Reply::PubComp));

        for input in [Input::Publish, Input::PubRel] {
            let step = hs.advance(input).unwrap();
            assert_eq!(step.reply, Some(Reply::PubComp));
            assert!(!step.deliver);
        }
        assert_eq!(hs.advance(Input::Timeout), None);
    }

    #[test]
    fn test_qos1_receiver_delivers_every_copy() {
        for _ in 0..2 {
            let mut hs = Handshake::receiver(QoS::AtLeastOnce);
            let step = hs.advance(Input::Publish).unwrap();
            assert!(step.deliver);
            assert_eq!(step.reply, Some(Reply::PubAck));
        }
    }

    #[test]
    fn test_reply_packets_carry_exchange_identity() {
        let message = Message::new("plant/line1", "42", QoS::ExactlyOnce);
        let exchange =
            InFlightExchange::new(5, QoS::ExactlyOnce, Direction::Outbound, message, Instant::now());

        match exchange.packet(Reply::Publish { dup: true }) {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(5));
                assert_eq!(p.qos, QoS::ExactlyOnce);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        assert_eq!(exchange.packet(Reply::PubRel), Packet::PubRel(PubRel::new(5)));
        assert_eq!(
            exchange.timer_key(),
            TimerKey::Retransmit(Direction::Outbound, 5)
        );
    }
}

//! Point-to-point message passing between workers.
//!
//! [`Communicator`] is the only channel through which workers coordinate.
//! Every primitive is bounded by a timeout: a peer that never answers turns
//! into [`CommError::Timeout`], a peer that went away into
//! [`CommError::Disconnected`]. Both are fatal for the run.
//!
//! [`LocalComm`] wires `size` in-process workers into a full mesh of
//! `std::sync::mpsc` channels, one channel per ordered (source, dest) pair, so
//! messages from one source are received in the order they were sent.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::{debug, trace};
use thiserror::Error;

pub type Tag = u32;

/// Reserved for [`Communicator::barrier`].
pub const BARRIER_TAG: Tag = u32::MAX;

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Rows of a sketch summary.
    Sketch(Vec<Vec<f64>>),
    /// Empty synchronisation token.
    Token,
    Text(String),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::Sketch(_) => "Sketch",
            Message::Token => "Token",
            Message::Text(_) => "Text",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    #[error("rank {rank}: no message from rank {peer} with tag {tag} within {after:?}")]
    Timeout {
        rank: usize,
        peer: usize,
        tag: Tag,
        after: Duration,
    },

    #[error("rank {rank}: rank {peer} disconnected")]
    Disconnected { rank: usize, peer: usize },

    #[error("rank {rank}: unexpected message: {detail}")]
    UnexpectedMessage { rank: usize, detail: String },

    #[error("rank {rank} is out of range for a group of size {size}")]
    InvalidRank { rank: usize, size: usize },
}

pub type CommResult<T> = std::result::Result<T, CommError>;

/// Rank-addressed messaging with collective helpers built on top.
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, dest: usize, tag: Tag, message: Message) -> CommResult<()>;

    /// Block until a message with `tag` arrives from `source`, or time out.
    fn recv(&mut self, source: usize, tag: Tag) -> CommResult<Message>;

    /// Gather a token at rank 0, then release every rank.
    fn barrier(&mut self) -> CommResult<()> {
        let (rank, size) = (self.rank(), self.size());
        trace!("rank {}: entering barrier", rank);
        if rank == 0 {
            for peer in 1..size {
                expect_token(self.recv(peer, BARRIER_TAG)?, rank)?;
            }
            for peer in 1..size {
                self.send(peer, BARRIER_TAG, Message::Token)?;
            }
        } else {
            self.send(0, BARRIER_TAG, Message::Token)?;
            expect_token(self.recv(0, BARRIER_TAG)?, rank)?;
        }
        trace!("rank {}: left barrier", rank);
        Ok(())
    }

    /// Send `message` from `root` to every rank. Non-root ranks pass `None`
    /// and receive the root's copy.
    fn broadcast(&mut self, root: usize, tag: Tag, message: Option<Message>) -> CommResult<Message> {
        let (rank, size) = (self.rank(), self.size());
        if root >= size {
            return Err(CommError::InvalidRank { rank: root, size });
        }
        if rank == root {
            let message = message.ok_or_else(|| CommError::UnexpectedMessage {
                rank,
                detail: "broadcast root has no payload".to_string(),
            })?;
            for peer in (0..size).filter(|&p| p != root) {
                self.send(peer, tag, message.clone())?;
            }
            Ok(message)
        } else {
            self.recv(root, tag)
        }
    }
}

fn expect_token(message: Message, rank: usize) -> CommResult<()> {
    match message {
        Message::Token => Ok(()),
        other => Err(CommError::UnexpectedMessage {
            rank,
            detail: format!("expected Token in barrier, got {}", other.kind()),
        }),
    }
}

#[derive(Debug)]
struct Envelope {
    tag: Tag,
    message: Message,
}

/// One endpoint of an in-process mesh built by [`local_mesh`].
#[derive(Debug)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    timeout: Duration,
    // outboxes[dest], inboxes[source]
    outboxes: Vec<Sender<Envelope>>,
    inboxes: Vec<Receiver<Envelope>>,
    // received from a source but not yet asked for (tag mismatch)
    pending: HashMap<usize, VecDeque<Envelope>>,
}

/// Build `size` connected endpoints. Endpoint `i` has rank `i`.
pub fn local_mesh(size: usize, timeout: Duration) -> Vec<LocalComm> {
    debug!("Building local mesh: size={}, timeout={:?}", size, timeout);

    // channels[source][dest]
    let mut senders: Vec<Vec<Sender<Envelope>>> = Vec::with_capacity(size);
    let mut receivers: Vec<Vec<Option<Receiver<Envelope>>>> =
        (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
    for source in 0..size {
        let mut row = Vec::with_capacity(size);
        for dest_inboxes in receivers.iter_mut() {
            let (tx, rx) = mpsc::channel();
            row.push(tx);
            dest_inboxes[source] = Some(rx);
        }
        senders.push(row);
    }

    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (outboxes, inboxes))| LocalComm {
            rank,
            size,
            timeout,
            outboxes,
            inboxes: inboxes.into_iter().flatten().collect(),
            pending: HashMap::new(),
        })
        .collect()
}

impl LocalComm {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn check_rank(&self, peer: usize) -> CommResult<()> {
        if peer >= self.size {
            return Err(CommError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        Ok(())
    }

    fn take_pending(&mut self, source: usize, tag: Tag) -> Option<Message> {
        let queue = self.pending.get_mut(&source)?;
        let pos = queue.iter().position(|e| e.tag == tag)?;
        queue.remove(pos).map(|e| e.message)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, tag: Tag, message: Message) -> CommResult<()> {
        self.check_rank(dest)?;
        trace!(
            "rank {} -> {}: tag={} {}",
            self.rank,
            dest,
            tag,
            message.kind()
        );
        self.outboxes[dest]
            .send(Envelope { tag, message })
            .map_err(|_| CommError::Disconnected {
                rank: self.rank,
                peer: dest,
            })
    }

    fn recv(&mut self, source: usize, tag: Tag) -> CommResult<Message> {
        self.check_rank(source)?;
        if let Some(message) = self.take_pending(source, tag) {
            return Ok(message);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inboxes[source].recv_timeout(remaining) {
                Ok(envelope) if envelope.tag == tag => {
                    trace!("rank {} <- {}: tag={}", self.rank, source, tag);
                    return Ok(envelope.message);
                }
                Ok(envelope) => {
                    trace!(
                        "rank {} <- {}: deferring tag={} while waiting for {}",
                        self.rank,
                        source,
                        envelope.tag,
                        tag
                    );
                    self.pending.entry(source).or_default().push_back(envelope);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CommError::Timeout {
                        rank: self.rank,
                        peer: source,
                        tag,
                        after: self.timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected {
                        rank: self.rank,
                        peer: source,
                    });
                }
            }
        }
    }
}

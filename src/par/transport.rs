//! Transport implementations for the dispatcher.
//!
//! [`ChannelTransport`] wires master and workers through in-process
//! channels; tests use it to drive dispatch scenarios deterministically,
//! and single-host runs use it with worker threads. [`TcpMaster`] and
//! [`TcpWorker`] carry the same protocol across hosts as line-delimited
//! JSON over TCP, one connection per worker, with a reader thread per
//! connection feeding a common inbox.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use crate::par::{Message, NodeId, Transport, MASTER};
use crate::util::{GridAlignError, GridAlignResult};

fn transport_err(reason: impl std::fmt::Display) -> GridAlignError {
    GridAlignError::Transport {
        reason: reason.to_string(),
    }
}

/// In-process transport endpoint over std channels.
pub struct ChannelTransport {
    id: NodeId,
    inbox: Receiver<(Message, NodeId)>,
    peers: HashMap<NodeId, Sender<(Message, NodeId)>>,
}

/// Builds a fully connected mesh: index 0 is the master endpoint,
/// indices `1..=workers` the worker endpoints.
pub fn channel_mesh(workers: usize) -> Vec<ChannelTransport> {
    let nodes = workers + 1;
    let mut senders = Vec::with_capacity(nodes);
    let mut inboxes = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        let (tx, rx) = channel();
        senders.push(tx);
        inboxes.push(rx);
    }
    inboxes
        .into_iter()
        .enumerate()
        .map(|(id, inbox)| ChannelTransport {
            id,
            inbox,
            peers: senders
                .iter()
                .enumerate()
                .map(|(peer, tx)| (peer, tx.clone()))
                .collect(),
        })
        .collect()
}

impl Transport for ChannelTransport {
    fn send(&self, msg: Message, dest: NodeId) -> GridAlignResult<()> {
        let peer = self
            .peers
            .get(&dest)
            .ok_or_else(|| transport_err(format!("unknown node {dest}")))?;
        peer.send((msg, self.id))
            .map_err(|_| transport_err(format!("node {dest} hung up")))
    }

    fn recv(&self) -> GridAlignResult<(Message, NodeId)> {
        self.inbox
            .recv()
            .map_err(|_| transport_err("all peers hung up"))
    }

    fn recv_timeout(&self, timeout: Duration) -> GridAlignResult<Option<(Message, NodeId)>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(pair) => Ok(Some(pair)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(transport_err("all peers hung up")),
        }
    }
}

fn write_message(stream: &Mutex<TcpStream>, msg: &Message) -> GridAlignResult<()> {
    let mut line = serde_json::to_string(msg).map_err(transport_err)?;
    line.push('\n');
    let mut stream = stream.lock().expect("stream lock");
    stream
        .write_all(line.as_bytes())
        .map_err(|err| transport_err(format!("tcp write: {err}")))
}

fn spawn_line_reader(stream: TcpStream, src: NodeId, tx: Sender<(Message, NodeId)>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let Ok(msg) = serde_json::from_str::<Message>(&line) else {
                break;
            };
            if tx.send((msg, src)).is_err() {
                break;
            }
        }
    });
}

/// Master endpoint of the TCP transport.
///
/// Worker node ids are assigned by accept order, starting at 1.
pub struct TcpMaster {
    streams: Vec<Mutex<TcpStream>>,
    inbox: Receiver<(Message, NodeId)>,
}

impl TcpMaster {
    /// Binds `addr` and waits for `workers` connections.
    pub fn bind(addr: impl ToSocketAddrs, workers: usize) -> GridAlignResult<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|err| transport_err(format!("tcp bind: {err}")))?;
        let (tx, inbox) = channel();
        let mut streams = Vec::with_capacity(workers);
        for node in 1..=workers {
            let (stream, _) = listener
                .accept()
                .map_err(|err| transport_err(format!("tcp accept: {err}")))?;
            let reader = stream
                .try_clone()
                .map_err(|err| transport_err(format!("tcp clone: {err}")))?;
            spawn_line_reader(reader, node, tx.clone());
            streams.push(Mutex::new(stream));
        }
        Ok(Self { streams, inbox })
    }

    /// Node ids of the connected workers.
    pub fn workers(&self) -> Vec<NodeId> {
        (1..=self.streams.len()).collect()
    }
}

impl Transport for TcpMaster {
    fn send(&self, msg: Message, dest: NodeId) -> GridAlignResult<()> {
        let stream = self
            .streams
            .get(dest.wrapping_sub(1))
            .ok_or_else(|| transport_err(format!("unknown worker {dest}")))?;
        write_message(stream, &msg)
    }

    fn recv(&self) -> GridAlignResult<(Message, NodeId)> {
        self.inbox
            .recv()
            .map_err(|_| transport_err("all workers disconnected"))
    }

    fn recv_timeout(&self, timeout: Duration) -> GridAlignResult<Option<(Message, NodeId)>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(pair) => Ok(Some(pair)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(transport_err("all workers disconnected"))
            }
        }
    }
}

/// Worker endpoint of the TCP transport.
pub struct TcpWorker {
    stream: Mutex<TcpStream>,
    inbox: Receiver<(Message, NodeId)>,
}

impl TcpWorker {
    /// Connects to the master.
    pub fn connect(addr: impl ToSocketAddrs) -> GridAlignResult<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|err| transport_err(format!("tcp connect: {err}")))?;
        let reader = stream
            .try_clone()
            .map_err(|err| transport_err(format!("tcp clone: {err}")))?;
        let (tx, inbox) = channel();
        spawn_line_reader(reader, MASTER, tx);
        Ok(Self {
            stream: Mutex::new(stream),
            inbox,
        })
    }
}

impl Transport for TcpWorker {
    fn send(&self, msg: Message, dest: NodeId) -> GridAlignResult<()> {
        if dest != MASTER {
            return Err(transport_err(format!(
                "workers only talk to the master, not node {dest}"
            )));
        }
        write_message(&self.stream, &msg)
    }

    fn recv(&self) -> GridAlignResult<(Message, NodeId)> {
        self.inbox
            .recv()
            .map_err(|_| transport_err("master disconnected"))
    }

    fn recv_timeout(&self, timeout: Duration) -> GridAlignResult<Option<(Message, NodeId)>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(pair) => Ok(Some(pair)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(transport_err("master disconnected")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::channel_mesh;
    use crate::par::{Message, Transport, MASTER};
    use std::time::Duration;

    #[test]
    fn mesh_routes_messages_with_source_ids() {
        let mut mesh = channel_mesh(2);
        let worker2 = mesh.pop().unwrap();
        let worker1 = mesh.pop().unwrap();
        let master = mesh.pop().unwrap();

        worker1.send(Message::Ready, MASTER).unwrap();
        worker2.send(Message::Ready, MASTER).unwrap();
        let (msg, src) = master.recv().unwrap();
        assert!(matches!(msg, Message::Ready));
        assert_eq!(src, 1);
        let (_, src) = master.recv().unwrap();
        assert_eq!(src, 2);

        master.send(Message::Exit, 2).unwrap();
        let (msg, src) = worker2.recv().unwrap();
        assert!(matches!(msg, Message::Exit));
        assert_eq!(src, MASTER);
    }

    #[test]
    fn recv_timeout_expires_quietly() {
        let mesh = channel_mesh(1);
        let got = mesh[0].recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn send_to_unknown_node_is_a_transport_error() {
        let mesh = channel_mesh(1);
        assert!(mesh[0].send(Message::Ready, 9).is_err());
    }
}

use crate::message::Message;
use crate::ring::Member;
use crate::transport::Transport;
use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const MAX_FRAME: usize = 10 * 1024 * 1024;
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY: Duration = Duration::from_millis(500);
const OUTBOX_DEPTH: usize = 256;
const INBOX_DEPTH: usize = 1024;

// peer identification exchanged before replication traffic flows
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Hello(Member);

/// TCP mesh endpoint. Reader tasks funnel every peer's frames into one
/// inbox; `send` hands frames to per-peer writer tasks without blocking and
/// drops on backpressure, which the engine tolerates as wire loss.
pub struct TcpNet {
    me: Member,
    inbox: mpsc::Receiver<Message>,
    // self-sends loop straight back into the inbox
    loopback: mpsc::Sender<Message>,
    outboxes: HashMap<Member, mpsc::Sender<Message>>,
}

impl Transport for TcpNet {
    fn send(&mut self, to: &Member, msg: Message) {
        let outbox = if *to == self.me {
            &self.loopback
        } else {
            match self.outboxes.get(to) {
                Some(outbox) => outbox,
                None => {
                    warn!("[{}] no route to {}, dropping message", self.me, to);
                    return;
                }
            }
        };
        if outbox.try_send(msg).is_err() {
            warn!("[{}] outbox to {} full, dropping message", self.me, to);
        }
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut inbound = Vec::new();
        while let Ok(msg) = self.inbox.try_recv() {
            inbound.push(msg);
        }
        inbound
    }
}

async fn writer_task(
    peer: Member,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Message>,
) {
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = send_frame(&mut write_half, &msg).await {
            error!("[{}] write error: {}", peer, e);
            break;
        }
    }
}

async fn reader_task(
    peer: Member,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    inbox: mpsc::Sender<Message>,
) {
    loop {
        match recv_frame::<Message, _>(&mut read_half).await {
            Ok(msg) => {
                if inbox.send(msg).await.is_err() {
                    break; // endpoint dropped
                }
            }
            Err(e) => {
                error!("[{}] read error: {}", peer, e);
                break;
            }
        }
    }
}

// length-prefixed bincode framing
async fn send_frame<M, W>(stream: &mut W, msg: &M) -> Result<()>
where
    M: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let encoded = bincode::serialize(msg)?;
    let len = u32::try_from(encoded.len())?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    Ok(())
}

async fn recv_frame<M, R>(stream: &mut R) -> Result<M>
where
    M: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(anyhow!("frame of {} bytes exceeds limit", len));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(bincode::deserialize(&buffer)?)
}

/// Build the full mesh: listen on our own address, dial every peer, and keep
/// whichever stream per peer lands first. Blocks until all peers are
/// connected.
pub async fn connect_all(me: &Member, peer_addrs: &[String]) -> Result<TcpNet> {
    let listener = TcpListener::bind(me.addr()).await?;
    info!("[{}] listening", me);

    let (conn_tx, mut conn_rx) = mpsc::channel::<(Member, TcpStream)>(64);

    // accept half: peers identify themselves with a Hello frame
    let accept_tx = conn_tx.clone();
    let me_label = me.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    match recv_frame::<Hello, _>(&mut stream).await {
                        Ok(Hello(from)) => {
                            info!("[{}] accepted {} ({})", me_label, from, addr);
                            let _ = accept_tx.send((from, stream)).await;
                        }
                        Err(e) => error!("[{}] bad handshake: {}", me_label, e),
                    }
                }
                Err(e) => error!("[{}] accept failed: {}", me_label, e),
            }
        }
    });

    // dial half
    for peer_addr in peer_addrs {
        let peer = Member::new(peer_addr.clone());
        let conn_tx = conn_tx.clone();
        let me = me.clone();
        tokio::spawn(async move {
            match connect_with_retry(peer.addr(), CONNECT_ATTEMPTS, CONNECT_RETRY).await {
                Ok(mut stream) => {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) = send_frame(&mut stream, &Hello(me.clone())).await {
                        error!("[{}] handshake to {} failed: {}", me, peer, e);
                        return;
                    }
                    info!("[{}] connected to {}", me, peer);
                    let _ = conn_tx.send((peer, stream)).await;
                }
                Err(e) => error!("[{}] failed to reach {}: {}", me, peer, e),
            }
        });
    }

    // both halves race per peer; the first stream in wins
    let mut streams: HashMap<Member, TcpStream> = HashMap::new();
    while streams.len() < peer_addrs.len() {
        match conn_rx.recv().await {
            Some((peer, stream)) => {
                streams.entry(peer).or_insert(stream);
            }
            None => break,
        }
    }
    info!("[{}] all {} peers connected", me, streams.len());

    let (inbox_tx, inbox_rx) = mpsc::channel::<Message>(INBOX_DEPTH);
    let mut outboxes = HashMap::new();
    for (peer, stream) in streams {
        let (read_half, write_half) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel::<Message>(OUTBOX_DEPTH);

        let reader_inbox = inbox_tx.clone();
        let reader_peer = peer.clone();
        tokio::spawn(async move { reader_task(reader_peer, read_half, reader_inbox).await });

        let writer_peer = peer.clone();
        tokio::spawn(async move { writer_task(writer_peer, write_half, outbox_rx).await });

        outboxes.insert(peer, outbox_tx);
    }

    Ok(TcpNet {
        me: me.clone(),
        inbox: inbox_rx,
        loopback: inbox_tx,
        outboxes,
    })
}

async fn connect_with_retry(addr: &str, max_attempts: u32, delay: Duration) -> Result<TcpStream> {
    let mut attempts = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(e.into());
                }
                warn!("connection to {} failed (attempt {}), retrying", addr, attempts);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message {
            txn: Some(7),
            from: Member::new("10.1.0.1:7400"),
            kind: MessageKind::Reply { success: true },
        };

        send_frame(&mut a, &msg).await.unwrap();
        let decoded: Message = recv_frame(&mut b).await.unwrap();

        assert_eq!(decoded.txn, Some(7));
        assert_eq!(decoded.from, Member::new("10.1.0.1:7400"));
        assert!(matches!(decoded.kind, MessageKind::Reply { success: true }));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(recv_frame::<Message, _>(&mut b).await.is_err());
    }
}

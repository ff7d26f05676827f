//! Broker links: one per accepted broker TCP connection.
//!
//! The reader side turns frames into jobs for the worker; the writer side drains an
//! unbounded channel so handlers never block on a slow broker.

use std::fmt;
use std::net::SocketAddr;

use relayproto::frame::{Envelope, FrameReader, FrameWriter};
use relayproto::msg::Outbound;
use relayproto::ConnId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::{Job, Queued};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a broker link; cheap to clone into connections.
#[derive(Debug, Clone)]
pub struct BrokerLink {
    id: LinkId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl BrokerLink {
    pub fn channel(id: LinkId) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue `msg` for the broker. Returns false once the link is gone.
    pub fn send(&self, conn: ConnId, msg: &Outbound) -> bool {
        let env = match msg.encode(conn) {
            Ok(env) => env,
            Err(e) => {
                warn!(link = %self.id, conn = %conn, err = %e, "failed to encode outbound message");
                return false;
            }
        };
        self.tx.send(env).is_ok()
    }

    pub fn send_control(&self, msg: &Outbound) -> bool {
        self.send(ConnId::CONTROL, msg)
    }
}

pub async fn serve_broker(
    stream: TcpStream,
    peer: SocketAddr,
    id: LinkId,
    jobs: mpsc::UnboundedSender<Job>,
) -> anyhow::Result<()> {
    let (rd, wr) = stream.into_split();
    let mut fr = FrameReader::new(rd);
    let (link, rx) = BrokerLink::channel(id);

    tokio::spawn(write_loop(FrameWriter::new(wr), rx, id));
    let _ = jobs.send(Job::Attach(link));

    let res = read_loop(&mut fr, id, &jobs).await;

    // Whatever ended the read side, the worker must drop this link's players.
    info!(link = %id, peer = %peer, "broker link closed");
    let _ = jobs.send(Job::Command(Queued::control(
        serde_json::json!({"cmd": "disconnect"}),
        Some(id),
    )));
    res
}

async fn read_loop<R>(
    fr: &mut FrameReader<R>,
    id: LinkId,
    jobs: &mpsc::UnboundedSender<Job>,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    while let Some(env) = fr.read_envelope().await? {
        let payload = match relayproto::msg::parse_body(&env.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(link = %id, conn = %env.conn, err = %e, "dropping undecodable frame");
                continue;
            }
        };
        let q = Queued {
            conn: env.conn,
            link: Some(id),
            payload,
        };
        if jobs.send(Job::Command(q)).is_err() {
            anyhow::bail!("worker queue closed");
        }
    }
    Ok(())
}

async fn write_loop<W>(
    mut fw: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    id: LinkId,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(env) = rx.recv().await {
        if let Err(e) = fw.write_envelope(&env).await {
            warn!(link = %id, err = %e, "broker write failed");
            return;
        }
        // Batch whatever is already queued before flushing.
        while let Ok(env) = rx.try_recv() {
            if let Err(e) = fw.write_envelope(&env).await {
                warn!(link = %id, err = %e, "broker write failed");
                return;
            }
        }
        if let Err(e) = fw.flush().await {
            warn!(link = %id, err = %e, "broker flush failed");
            return;
        }
    }
}

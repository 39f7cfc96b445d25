//! Wire protocol for node-to-node and client-to-router RPCs.
//!
//! Every RPC is one TCP connection carrying length-delimited,
//! bincode-encoded frames. Client-streaming calls (upload) send a run of
//! `Request::Upload` frames terminated by `Request::UploadDone`;
//! server-streaming calls (download) send `Response::Data` frames and end
//! by closing the write half. Frame payloads never exceed
//! [`MAX_FRAME_SIZE`]; larger buffers are split into sub-frames that all
//! carry the same `seq_no` and `replica_node`.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{StoreError, StoreResult};

/// Maximum payload bytes per wire frame.
pub const MAX_FRAME_SIZE: usize = 4_000_000;

/// Envelope overhead allowance on top of the payload cap.
const CODEC_HEADROOM: usize = 64 * 1024;

/// One frame of an upload or download stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub user: String,
    pub name: String,
    pub data: Vec<u8>,
    /// Shard sequence number; 0 marks a whole-file client upload or the
    /// not-found sentinel on download.
    pub seq_no: u64,
    /// Replica address for chunk-store uploads; empty otherwise.
    pub replica_node: String,
}

/// Identity of a file (and optionally one shard) for unary calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub user: String,
    pub name: String,
    pub seq_no: u64,
}

/// Generic success/failure reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// Heartbeat stat triple, each component a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub cpu: f64,
    pub disk: f64,
    pub mem: f64,
}

/// Leader self-announcement to the supernode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub ip: String,
    pub port: u16,
    pub cluster: String,
}

/// Frames sent by the calling side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// One frame of an upload stream
    Upload(FileData),
    /// End of an upload stream
    UploadDone,
    /// Whole-file (leader) or single-chunk (follower) download
    Download(FileInfo),
    /// Metadata presence check
    Search(FileInfo),
    /// File deletion; `seq_no` selects a chunk on follower nodes
    Delete(FileInfo),
    /// Names of the user's files
    List { user: String },
    /// Best-effort metadata broadcast payload
    Metadata { file_key: String, payload: Vec<u8> },
    /// Averaged stats for the whole cluster
    ClusterStats,
    /// Liveness and load probe
    IsAlive,
    /// Leader registration with the supernode
    RegisterLeader(ClusterInfo),
}

/// Frames sent by the serving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ack(Ack),
    /// One frame of a download stream
    Data(FileData),
    Files { names: Vec<String> },
    Stats(NodeStats),
}

/// A framed RPC connection.
pub type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Wrap a TCP stream with the length-delimited frame codec.
pub fn frame_connection(stream: TcpStream) -> Connection {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE + CODEC_HEADROOM)
        .new_codec();
    Framed::new(stream, codec)
}

async fn send_frame<T: Serialize>(conn: &mut Connection, frame: &T) -> StoreResult<()> {
    let bytes = bincode::serialize(frame)?;
    conn.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn next_frame<T: DeserializeOwned>(conn: &mut Connection) -> StoreResult<Option<T>> {
    match conn.next().await {
        Some(Ok(bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
        Some(Err(e)) => Err(StoreError::Io(e)),
        None => Ok(None),
    }
}

pub async fn send_request(conn: &mut Connection, request: &Request) -> StoreResult<()> {
    send_frame(conn, request).await
}

pub async fn next_request(conn: &mut Connection) -> StoreResult<Option<Request>> {
    next_frame(conn).await
}

pub async fn send_response(conn: &mut Connection, response: &Response) -> StoreResult<()> {
    send_frame(conn, response).await
}

pub async fn next_response(conn: &mut Connection) -> StoreResult<Option<Response>> {
    next_frame(conn).await
}

/// Reply with an ack frame.
pub async fn send_ack(conn: &mut Connection, success: bool, message: &str) -> StoreResult<()> {
    send_response(
        conn,
        &Response::Ack(Ack {
            success,
            message: message.to_string(),
        }),
    )
    .await
}

/// Split a buffer into wire-sized sub-frames.
pub fn sub_frames(data: &[u8]) -> std::slice::Chunks<'_, u8> {
    data.chunks(MAX_FRAME_SIZE)
}

/// Stream a buffer to the caller as `Response::Data` sub-frames, all
/// carrying the given `seq_no`.
pub async fn send_data_stream(
    conn: &mut Connection,
    user: &str,
    name: &str,
    seq_no: u64,
    data: &[u8],
) -> StoreResult<()> {
    for chunk in sub_frames(data) {
        send_response(
            conn,
            &Response::Data(FileData {
                user: user.to_string(),
                name: name.to_string(),
                data: chunk.to_vec(),
                seq_no,
                replica_node: String::new(),
            }),
        )
        .await?;
    }
    Ok(())
}

/// Consume the rest of an upload stream without storing it.
///
/// Used on rejection paths: the caller may still be writing frames, and
/// closing the connection under it would turn the rejection ack into a
/// transport error on its side.
pub async fn drain_upload_stream(conn: &mut Connection) {
    loop {
        match next_request(conn).await {
            Ok(Some(Request::Upload(_))) => continue,
            _ => break,
        }
    }
}

/// Send the single empty frame that signals "not found" to a downloader.
pub async fn send_not_found_sentinel(
    conn: &mut Connection,
    user: &str,
    name: &str,
) -> StoreResult<()> {
    send_response(
        conn,
        &Response::Data(FileData {
            user: user.to_string(),
            name: name.to_string(),
            data: Vec::new(),
            seq_no: 0,
            replica_node: String::new(),
        }),
    )
    .await
}

/// Logical long-lived connection to a peer address.
///
/// The handle is 1:1 with an address; the membership tracker creates one
/// when an address appears and drops it when the address leaves. Each RPC
/// opens its own TCP connection, so readiness is probed by a
/// deadline-bounded connect.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    addr: String,
}

impl PeerChannel {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the peer accepts connections within the deadline.
    pub async fn is_ready(&self, deadline: Duration) -> bool {
        matches!(
            timeout(deadline, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }

    /// Open a fresh framed connection to the peer.
    pub async fn open(&self) -> StoreResult<Connection> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| StoreError::Unavailable(format!("connect to {}: {}", self.addr, e)))?;
        Ok(frame_connection(stream))
    }

    /// Single-request, single-response call bounded by a deadline.
    pub async fn call_unary(&self, request: Request, deadline: Duration) -> StoreResult<Response> {
        let call = async {
            let mut conn = self.open().await?;
            send_request(&mut conn, &request).await?;
            match next_response(&mut conn).await? {
                Some(response) => Ok(response),
                None => Err(StoreError::Unavailable(format!(
                    "connection to {} closed before reply",
                    self.addr
                ))),
            }
        };
        timeout(deadline, call).await.map_err(|_| {
            StoreError::Unavailable(format!("deadline exceeded calling {}", self.addr))
        })?
    }

    /// Unary call whose reply must be an ack.
    pub async fn call_for_ack(&self, request: Request, deadline: Duration) -> StoreResult<Ack> {
        match self.call_unary(request, deadline).await? {
            Response::Ack(ack) => Ok(ack),
            other => Err(StoreError::Internal(format!(
                "unexpected reply from {}: {:?}",
                self.addr, other
            ))),
        }
    }

    /// Stream a buffer to the peer as an upload, in wire-sized sub-frames
    /// that all carry the same `seq_no` and `replica_node`.
    pub async fn upload_bytes(
        &self,
        user: &str,
        name: &str,
        seq_no: u64,
        replica_node: &str,
        data: &[u8],
        deadline: Duration,
    ) -> StoreResult<Ack> {
        self.upload_bytes_framed(user, name, seq_no, replica_node, data, MAX_FRAME_SIZE, deadline)
            .await
    }

    /// Upload with a caller-chosen frame size (capped at the wire limit).
    pub async fn upload_bytes_framed(
        &self,
        user: &str,
        name: &str,
        seq_no: u64,
        replica_node: &str,
        data: &[u8],
        frame_size: usize,
        deadline: Duration,
    ) -> StoreResult<Ack> {
        let frame_size = frame_size.clamp(1, MAX_FRAME_SIZE);
        let call = async {
            let mut conn = self.open().await?;
            let mut sent_any = false;
            for chunk in data.chunks(frame_size) {
                send_request(
                    &mut conn,
                    &Request::Upload(FileData {
                        user: user.to_string(),
                        name: name.to_string(),
                        data: chunk.to_vec(),
                        seq_no,
                        replica_node: replica_node.to_string(),
                    }),
                )
                .await?;
                sent_any = true;
            }
            if !sent_any {
                // The receiving side still needs the stream identity.
                send_request(
                    &mut conn,
                    &Request::Upload(FileData {
                        user: user.to_string(),
                        name: name.to_string(),
                        data: Vec::new(),
                        seq_no,
                        replica_node: replica_node.to_string(),
                    }),
                )
                .await?;
            }
            send_request(&mut conn, &Request::UploadDone).await?;
            match next_response(&mut conn).await? {
                Some(Response::Ack(ack)) => Ok(ack),
                Some(other) => Err(StoreError::Internal(format!(
                    "unexpected upload reply from {}: {:?}",
                    self.addr, other
                ))),
                None => Err(StoreError::Unavailable(format!(
                    "connection to {} closed before upload ack",
                    self.addr
                ))),
            }
        };
        timeout(deadline, call).await.map_err(|_| {
            StoreError::Unavailable(format!("upload deadline exceeded for {}", self.addr))
        })?
    }

    /// Download a whole stream into memory.
    ///
    /// The not-found sentinel (a single empty frame with `seq_no == 0`)
    /// surfaces as [`StoreError::NotFound`].
    pub async fn download_bytes(
        &self,
        user: &str,
        name: &str,
        seq_no: u64,
        deadline: Duration,
    ) -> StoreResult<Vec<u8>> {
        let call = async {
            let mut conn = self.open().await?;
            send_request(
                &mut conn,
                &Request::Download(FileInfo {
                    user: user.to_string(),
                    name: name.to_string(),
                    seq_no,
                }),
            )
            .await?;

            let mut buffer = Vec::new();
            let mut frames = 0usize;
            let mut sentinel = false;
            while let Some(response) = next_response(&mut conn).await? {
                match response {
                    Response::Data(frame) => {
                        frames += 1;
                        sentinel = frames == 1 && frame.data.is_empty() && frame.seq_no == 0;
                        buffer.extend_from_slice(&frame.data);
                    }
                    other => {
                        return Err(StoreError::Internal(format!(
                            "unexpected download reply from {}: {:?}",
                            self.addr, other
                        )))
                    }
                }
            }
            if frames == 0 {
                return Err(StoreError::Unavailable(format!(
                    "connection to {} closed without data",
                    self.addr
                )));
            }
            if sentinel && frames == 1 {
                return Err(StoreError::NotFound(format!("{}_{}", user, name)));
            }
            Ok(buffer)
        };
        timeout(deadline, call).await.map_err(|_| {
            StoreError::Unavailable(format!("download deadline exceeded for {}", self.addr))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_frames_respect_the_wire_limit() {
        let data = vec![0u8; MAX_FRAME_SIZE * 2 + 123];
        let frames: Vec<&[u8]> = sub_frames(&data).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), MAX_FRAME_SIZE);
        assert_eq!(frames[1].len(), MAX_FRAME_SIZE);
        assert_eq!(frames[2].len(), 123);
        assert!(frames.iter().all(|f| f.len() <= MAX_FRAME_SIZE));
    }

    #[test]
    fn sub_frames_of_empty_data_is_empty() {
        assert_eq!(sub_frames(&[]).count(), 0);
    }

    #[test]
    fn probing_a_closed_port_reports_not_ready() {
        let channel = PeerChannel::new("127.0.0.1:1");
        let ready = tokio_test::block_on(channel.is_ready(Duration::from_millis(200)));
        assert!(!ready);
    }

    #[test]
    fn frames_round_trip_through_bincode() {
        let request = Request::Upload(FileData {
            user: "alice".into(),
            name: "a.txt".into(),
            data: vec![1, 2, 3],
            seq_no: 4,
            replica_node: "10.0.0.2:7000".into(),
        });
        let bytes = bincode::serialize(&request).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);

        let response = Response::Stats(NodeStats {
            cpu: 10.0,
            disk: 20.0,
            mem: 30.0,
        });
        let bytes = bincode::serialize(&response).unwrap();
        let decoded: Response = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, response);
    }
}

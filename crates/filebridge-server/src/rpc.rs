//! JSON-lines request dispatch.
//!
//! One request per line, one reply per line:
//!
//! ```text
//! → {"id": 1, "op": "create", "path": "docs/a.txt"}
//! ← {"id": 1, "error_code": 0, "handle": 1, "metadata": {...}}
//! ```
//!
//! Requests run concurrently, so replies can come back out of order; the
//! `id` ties them together.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use filebridge_kernel::{BridgeHandle, Errno, OpenFlags, ReadDirRequest};

fn default_true() -> bool {
    true
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Stat {
        path: String,
    },
    Mkdir {
        path: String,
    },
    Rmdir {
        path: String,
    },
    Unlink {
        path: String,
    },
    Truncate {
        path: String,
        length: u64,
    },
    Open {
        path: String,
        #[serde(default = "default_true")]
        read: bool,
        #[serde(default)]
        write: bool,
    },
    Create {
        path: String,
    },
    Read {
        handle: u64,
        offset: u64,
        length: u32,
    },
    Write {
        handle: u64,
        offset: u64,
        data: Vec<u8>,
    },
    Close {
        handle: u64,
    },
    ReadDir(ReadDirRequest),
    MakeTempDir,
    RemoveTempDir {
        virtual_path: String,
    },
    ListStorages,
    Debug,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: u64,
    #[serde(flatten)]
    request: Request,
}

/// Run one request against the bridge and render its reply.
pub async fn dispatch(bridge: &BridgeHandle, request: Request) -> Result<Value> {
    let reply = match request {
        Request::Stat { path } => serde_json::to_value(bridge.stat(&path).await?)?,
        Request::Mkdir { path } => serde_json::to_value(bridge.mkdir(&path).await?)?,
        Request::Rmdir { path } => serde_json::to_value(bridge.rmdir(&path).await?)?,
        Request::Unlink { path } => serde_json::to_value(bridge.unlink(&path).await?)?,
        Request::Truncate { path, length } => {
            serde_json::to_value(bridge.truncate(&path, length).await?)?
        }
        Request::Open { path, read, write } => {
            serde_json::to_value(bridge.open(&path, OpenFlags { read, write }).await?)?
        }
        Request::Create { path } => serde_json::to_value(bridge.create(&path).await?)?,
        Request::Read {
            handle,
            offset,
            length,
        } => serde_json::to_value(bridge.read(handle, offset, length).await?)?,
        Request::Write {
            handle,
            offset,
            data,
        } => serde_json::to_value(bridge.write(handle, offset, data).await?)?,
        Request::Close { handle } => serde_json::to_value(bridge.close(handle).await?)?,
        Request::ReadDir(request) => serde_json::to_value(bridge.read_dir(request).await?)?,
        Request::MakeTempDir => serde_json::to_value(bridge.make_temp_dir().await?)?,
        Request::RemoveTempDir { virtual_path } => {
            bridge.remove_temp_dir(&virtual_path).await?;
            json!({ "error_code": 0 })
        }
        Request::ListStorages => {
            json!({ "error_code": 0, "storages": bridge.list_storages().await? })
        }
        Request::Debug => json!({ "error_code": 0, "tables": bridge.debug_tables().await? }),
    };
    Ok(reply)
}

/// Handle one input line and produce the reply line (without newline).
pub async fn handle_line(bridge: &BridgeHandle, line: &str) -> String {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable request");
            return json!({ "id": null, "error_code": Errno::Einval.code() }).to_string();
        }
    };

    let id = envelope.id;
    let mut reply = match dispatch(bridge, envelope.request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(id, error = %e, "request failed");
            json!({ "error_code": Errno::Eio.code(), "error": e.to_string() })
        }
    };
    if let Value::Object(map) = &mut reply {
        map.insert("id".to_string(), json!(id));
    }
    reply.to_string()
}

/// Serve requests from `reader` until EOF, writing replies to `writer`.
///
/// Every request runs in its own task. Returns once all replies for the
/// input have been written.
pub async fn serve<R, W>(bridge: BridgeHandle, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut lines = reader.lines();
    let mut input_open = true;

    while input_open {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let bridge = bridge.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let reply = handle_line(&bridge, &line).await;
                        let _ = tx.send(reply);
                    });
                }
                None => input_open = false,
            },
            Some(reply) = rx.recv() => write_line(&mut writer, &reply).await?,
        }
    }

    // Drain replies still in flight.
    drop(tx);
    while let Some(reply) = rx.recv().await {
        write_line(&mut writer, &reply).await?;
    }
    tracing::debug!("input closed");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_requests() {
        let env: Envelope = serde_json::from_str(r#"{"id":3,"op":"open","path":"docs/a"}"#).unwrap();
        assert_eq!(env.id, 3);
        assert_eq!(
            env.request,
            Request::Open {
                path: "docs/a".into(),
                read: true,
                write: false
            }
        );

        let env: Envelope =
            serde_json::from_str(r#"{"id":4,"op":"read_dir","path":"docs","cookie":7}"#).unwrap();
        assert_eq!(env.request, Request::ReadDir(ReadDirRequest::next("docs", 7)));

        let env: Envelope = serde_json::from_str(r#"{"id":5,"op":"make_temp_dir"}"#).unwrap();
        assert_eq!(env.request, Request::MakeTempDir);
    }

    #[test]
    fn test_reject_unknown_op() {
        assert!(serde_json::from_str::<Envelope>(r#"{"id":1,"op":"chmod"}"#).is_err());
        assert!(serde_json::from_str::<Envelope>(r#"{"op":"stat","path":"x"}"#).is_err());
    }
}

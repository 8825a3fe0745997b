//! Line-delimited JSON request loop in front of a [`Node`]
//!
//! Each input line is one request, each output line one response:
//!
//! ```text
//! {"op":"provision","plan":"free"}
//! {"ok":true,"result":{"hostname":"10.0.0.5","name":"maglev-…","pid":4242}}
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::core::{Node, NodeError};

/// A request from the broker
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Announcement,
    Provision {
        plan: String,
    },
    Unprovision {
        name: String,
        #[serde(default)]
        bindings: Vec<Value>,
    },
    Bind {
        name: String,
        #[serde(default)]
        bind_opts: Value,
    },
    Unbind {
        credentials: Value,
    },
}

/// Failure description on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

/// Reply to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    fn success(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                ok: true,
                result,
                error: None,
            },
            Err(e) => Self::failure("serialization", e.to_string()),
        }
    }

    fn failure(kind: &str, message: String) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(WireError {
                kind: kind.to_string(),
                message,
            }),
        }
    }

    fn from_error(err: &NodeError) -> Self {
        Self::failure(err.kind(), err.to_string())
    }
}

/// Run one request against the node. Blocks for provision/unprovision.
pub fn handle(node: &Node, request: Request) -> Response {
    match request {
        Request::Announcement => Response::success(node.announcement()),
        Request::Provision { plan } => match node.provision(&plan) {
            Ok(response) => Response::success(response),
            Err(e) => Response::from_error(&e),
        },
        Request::Unprovision { name, bindings } => match node.unprovision(&name, &bindings) {
            Ok(()) => Response::success(Value::Null),
            Err(e) => Response::from_error(&e),
        },
        // bind and unbind report failures as a null result
        Request::Bind { name, bind_opts } => Response::success(node.bind(&name, &bind_opts)),
        Request::Unbind { credentials } => Response::success(
            node.unbind(&credentials)
                .map(|()| Value::Object(Default::default())),
        ),
    }
}

/// Serve requests from `input` until it is exhausted or `shutdown`
/// completes.
///
/// `shutdown` is only checked between requests: a request that has been
/// read is always handled and answered before this returns.
pub async fn serve<R, W, S>(
    node: Arc<Node>,
    input: R,
    mut output: W,
    shutdown: S,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    tokio::pin!(shutdown);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("No longer accepting requests");
                break;
            }
            next = lines.next_line() => next?,
        };
        let Some(line) = next else {
            info!("Input closed");
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                debug!("Request: {:?}", request);
                let node = Arc::clone(&node);
                tokio::task::spawn_blocking(move || handle(&node, request))
                    .await
                    .unwrap_or_else(|e| Response::failure("internal", e.to_string()))
            }
            Err(e) => {
                warn!("Unparsable request {:?}: {}", line, e);
                Response::failure("bad_request", e.to_string())
            }
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }

    Ok(())
}

//! Scripted instruments on in-memory duplex streams.

use crate::transport::Link;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

/// Commands received by a scripted instrument, terminators included.
pub(crate) type CommandLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// Instrument that answers each `delimiter`-terminated command with `respond`.
pub(crate) fn line_instrument<F>(delimiter: u8, mut respond: F) -> (Link, CommandLog)
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let (host, device) = tokio::io::duplex(4096);
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::clone(&log);

    tokio::spawn(async move {
        let (rd, mut wr) = tokio::io::split(host);
        let mut rd = BufReader::new(rd);
        loop {
            let mut cmd = Vec::new();
            match rd.read_until(delimiter, &mut cmd).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            received.lock().push(cmd.clone());
            if let Some(reply) = respond(&cmd) {
                if wr.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });

    (Link::new(Box::new(device)), log)
}

/// Instrument that answers fixed-size binary requests.
pub(crate) fn frame_instrument<F>(request_len: usize, mut respond: F) -> (Link, CommandLog)
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let (host, device) = tokio::io::duplex(4096);
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::clone(&log);

    tokio::spawn(async move {
        let (mut rd, mut wr) = tokio::io::split(host);
        loop {
            let mut request = vec![0u8; request_len];
            if rd.read_exact(&mut request).await.is_err() {
                break;
            }
            received.lock().push(request.clone());
            if let Some(reply) = respond(&request) {
                if wr.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });

    (Link::new(Box::new(device)), log)
}

/// Received commands as lossy text.
pub(crate) fn commands(log: &CommandLog) -> Vec<String> {
    log.lock()
        .iter()
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

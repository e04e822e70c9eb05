//! DCC CHAT: a line protocol over the session socket.
//!
//! Inbound lines go to the dispatcher's `In` handlers and then to the
//! command table. Lines queued with [`SessionHandle::send_line`] are written
//! with a CRLF terminator and mirrored to the `Out` handlers.
//!
//! [`SessionHandle::send_line`]: crate::dcc::session::SessionHandle::send_line

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::dcc::dispatcher::IoType;
use crate::dcc::error::DccError;
use crate::dcc::session::{Connected, Endpoint, SessionCore};
use crate::dcc::signal::Outcome;

pub(crate) async fn run(mut core: SessionCore, endpoint: Endpoint) {
    let outcome = match core.connect(endpoint).await {
        Ok(connected) => converse(&mut core, connected).await,
        Err(e) => Err(e),
    };
    core.finish(outcome);
}

async fn converse(core: &mut SessionCore, connected: Connected) -> Outcome<()> {
    let (reader, mut writer) = connected.stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut interrupt = core.interrupt();
    let handle = core.handle.clone();
    let mask = handle.mask().to_owned();

    loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => {
                if read.map_err(DccError::transport)? == 0 {
                    if core.is_started() {
                        tracing::debug!(%mask, "DCC chat closed by peer");
                        return Ok(());
                    }
                    return Err(DccError::transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the chat before any line",
                    )));
                }
                let line = decode_line(&buf);
                buf.clear();
                core.idle().touch();
                core.mark_started();

                let dispatcher = core.dispatcher();
                dispatcher.dispatch_line(IoType::In, &mask, &handle, &line);
                dispatcher.dispatch_command(&mask, &handle, &line);
            }
            Some(line) = core.lines.recv() => {
                writer
                    .write_all(format!("{line}\r\n").as_bytes())
                    .await
                    .map_err(DccError::transport)?;
                core.idle().touch();
                core.mark_started();
                core.dispatcher().dispatch_line(IoType::Out, &mask, &handle, &line);
            }
            err = interrupt.wait() => return Err(err),
        }
    }
}

/// Strip the line terminator. Invalid UTF-8 is replaced, not rejected.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"no terminator"), "no terminator");
        assert_eq!(decode_line(b"\x01ACTION syn\x01\r\n"), "\x01ACTION syn\x01");
        assert_eq!(decode_line(b"caf\xff\n"), "caf\u{fffd}");
    }
}

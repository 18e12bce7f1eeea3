use anyhow::Result;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;

/// Splits a chunked byte stream into text lines.
///
/// Lines are returned without their `\n` / `\r\n` terminator. A trailing
/// fragment with no terminator is returned as the last line.
pub(crate) struct LineReader<S> {
    inner: S,
    buf: Vec<u8>,
    finished: bool,
}

impl<S, B, E> LineReader<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            finished: false,
        }
    }

    /// `Ok(None)` once the underlying stream is exhausted.
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..pos]);
                return Ok(Some(line.trim_end_matches('\r').to_string()));
            }

            if self.finished {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buf);
                let line = String::from_utf8_lossy(&rest);
                return Ok(Some(line.trim_end_matches('\r').to_string()));
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => anyhow::bail!("stream read failed: {e}"),
                None => self.finished = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    #[tokio::test]
    async fn joins_lines_split_across_chunks() {
        let chunks = vec![
            Ok::<_, Infallible>("data: {\"a\"".as_bytes()),
            Ok(":1}\r\n\nda".as_bytes()),
            Ok("ta: tail".as_bytes()),
        ];
        let mut reader = LineReader::new(stream::iter(chunks));

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("data: {\"a\":1}"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("data: tail"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_error_is_reported() {
        let chunks = vec![Ok("partial".as_bytes()), Err("connection reset")];
        let mut reader = LineReader::new(stream::iter(chunks));
        let err = reader.next_line().await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}

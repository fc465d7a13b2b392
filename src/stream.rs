//! Generic line-framed stream decoder.
//!
//! [`StreamReader::spawn`] moves an upstream byte stream and a
//! [`LineHandler`] onto one background task. The task splits the bytes into
//! lines, lets the handler suppress, rewrite or decode each one, and forwards
//! results over two channels: decoded items and errors. Both senders live on
//! the task, so both channels close on every exit path, including panics and
//! [`StreamReader::close`].

use crate::error::RelayError;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long the decoder waits to hand an error to a stalled consumer.
pub const ERROR_SEND_TIMEOUT: Duration = Duration::from_millis(1000);

const DATA_CAPACITY: usize = 64;

/// One line as seen by a [`LineHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Data(Vec<u8>),
    /// Dropped by the handler.
    Suppressed,
    /// The vendor signalled the end of the stream.
    Closed,
}

impl RawLine {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            RawLine::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn suppress(&mut self) {
        *self = RawLine::Suppressed;
    }

    pub fn replace(&mut self, bytes: Vec<u8>) {
        *self = RawLine::Data(bytes);
    }

    pub fn close(&mut self) {
        *self = RawLine::Closed;
    }
}

/// Output collected while handling one line.
#[derive(Debug)]
pub struct StreamSink<T> {
    data: Vec<T>,
    errors: Vec<RelayError>,
}

impl<T> Default for StreamSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StreamSink<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn send(&mut self, item: T) {
        self.data.push(item);
    }

    pub fn error(&mut self, err: RelayError) {
        self.errors.push(err);
    }

    pub fn into_parts(self) -> (Vec<T>, Vec<RelayError>) {
        (self.data, self.errors)
    }
}

/// Per-vendor line processing.
pub trait LineHandler<T>: Send + 'static {
    fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<T>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Strip surrounding whitespace and skip blank lines.
    Trimmed,
    /// Keep line endings; a trailing line without `\n` is never delivered.
    Untrimmed,
}

pub struct StreamReader<T, H> {
    pub data: mpsc::Receiver<T>,
    pub errors: mpsc::Receiver<RelayError>,
    task: JoinHandle<H>,
}

enum Flow {
    Continue,
    Stop,
}

impl<T, H> StreamReader<T, H>
where
    T: Send + 'static,
    H: LineHandler<T>,
{
    pub fn spawn<S, E>(body: S, handler: H, mode: LineMode) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (data_tx, data) = mpsc::channel(DATA_CAPACITY);
        let (err_tx, errors) = mpsc::channel(1);
        let task = tokio::spawn(decode(body, handler, mode, data_tx, err_tx));
        Self { data, errors, task }
    }

    /// Stop decoding now. Both channels close once the task is torn down.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Wait for the decode task and take the handler back (for its usage).
    /// `None` if the task was aborted.
    pub async fn finish(self) -> Option<H> {
        drop(self.data);
        drop(self.errors);
        self.task.await.ok()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<T>, mpsc::Receiver<RelayError>, JoinHandle<H>) {
        (self.data, self.errors, self.task)
    }
}

async fn decode<T, H, S, E>(
    mut body: S,
    mut handler: H,
    mode: LineMode,
    data_tx: mpsc::Sender<T>,
    err_tx: mpsc::Sender<RelayError>,
) -> H
where
    T: Send + 'static,
    H: LineHandler<T>,
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let mut buf = BytesMut::new();

    loop {
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line = buf.split_to(pos + 1);
            if let Flow::Stop = process(&line, mode, &mut handler, &data_tx, &err_tx).await {
                return handler;
            }
        }

        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => {
                if let Flow::Continue = flush_tail(&buf, mode, &mut handler, &data_tx, &err_tx).await {
                    send_error(&err_tx, RelayError::transport(e.to_string())).await;
                }
                return handler;
            }
            None => {
                flush_tail(&buf, mode, &mut handler, &data_tx, &err_tx).await;
                return handler;
            }
        }
    }
}

/// Hand over whatever is left once the body ends. Only trimmed streams
/// deliver a line that never saw its `\n`.
async fn flush_tail<T, H>(
    buf: &[u8],
    mode: LineMode,
    handler: &mut H,
    data_tx: &mpsc::Sender<T>,
    err_tx: &mpsc::Sender<RelayError>,
) -> Flow
where
    H: LineHandler<T>,
{
    if buf.is_empty() {
        return Flow::Continue;
    }
    match mode {
        LineMode::Trimmed => process(buf, mode, handler, data_tx, err_tx).await,
        LineMode::Untrimmed => {
            tracing::debug!(len = buf.len(), "Withholding incomplete trailing line");
            Flow::Continue
        }
    }
}

async fn process<T, H>(
    line: &[u8],
    mode: LineMode,
    handler: &mut H,
    data_tx: &mpsc::Sender<T>,
    err_tx: &mpsc::Sender<RelayError>,
) -> Flow
where
    H: LineHandler<T>,
{
    let line = match mode {
        LineMode::Trimmed => line.trim_ascii(),
        LineMode::Untrimmed => line,
    };
    if line.is_empty() {
        return Flow::Continue;
    }

    let mut raw = RawLine::Data(line.to_vec());
    let mut sink = StreamSink::new();

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut raw, &mut sink)));
    if let Err(payload) = outcome {
        let detail = panic_message(payload.as_ref());
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(panic = %detail, backtrace = %backtrace, "Stream handler panicked");
        send_error(err_tx, RelayError::stream_panic(detail)).await;
        return Flow::Stop;
    }

    for item in sink.data {
        if data_tx.send(item).await.is_err() {
            tracing::debug!("Stream consumer dropped; stopping decoder");
            return Flow::Stop;
        }
    }

    if let Some(err) = sink.errors.into_iter().next() {
        send_error(err_tx, err).await;
        return Flow::Stop;
    }

    match raw {
        RawLine::Closed => Flow::Stop,
        _ => Flow::Continue,
    }
}

async fn send_error(err_tx: &mpsc::Sender<RelayError>, err: RelayError) {
    match tokio::time::timeout(ERROR_SEND_TIMEOUT, err_tx.send(err)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::debug!("Error consumer dropped"),
        Err(_) => tracing::error!("Error consumer stalled; abandoning stream"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn body_of(chunks: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    struct JsonLines;

    impl LineHandler<Value> for JsonLines {
        fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<Value>) {
            let Some(bytes) = line.bytes() else { return };
            let Some(payload) = bytes.strip_prefix(b"data: ") else {
                line.suppress();
                return;
            };
            match serde_json::from_slice(payload) {
                Ok(v) => sink.send(v),
                Err(e) => sink.error(RelayError::from(e)),
            }
        }
    }

    /// Records every line it sees, verbatim.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl LineHandler<String> for Recorder {
        fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<String>) {
            if let Some(bytes) = line.bytes() {
                let text = String::from_utf8_lossy(bytes).to_string();
                self.seen.push(text.clone());
                sink.send(text);
            }
        }
    }

    #[tokio::test]
    async fn test_trimmed_json_lines() {
        let body = body_of(&["data: {\"x\":1}\n\ndata: {\"x\":2}\n\n"]);
        let mut reader = StreamReader::spawn(body, JsonLines, LineMode::Trimmed);

        assert_eq!(reader.data.recv().await, Some(serde_json::json!({"x": 1})));
        assert_eq!(reader.data.recv().await, Some(serde_json::json!({"x": 2})));
        assert_eq!(reader.data.recv().await, None);
        assert!(reader.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let body = body_of(&["data: {\"x\"", ":1}\n", "\ndata: {\"x\":2}\n"]);
        let mut reader = StreamReader::spawn(body, JsonLines, LineMode::Trimmed);

        assert_eq!(reader.data.recv().await, Some(serde_json::json!({"x": 1})));
        assert_eq!(reader.data.recv().await, Some(serde_json::json!({"x": 2})));
        assert_eq!(reader.data.recv().await, None);
    }

    #[tokio::test]
    async fn test_trimmed_processes_trailing_partial_line() {
        let body = body_of(&["data: {\"x\":1}"]);
        let mut reader = StreamReader::spawn(body, JsonLines, LineMode::Trimmed);
        assert_eq!(reader.data.recv().await, Some(serde_json::json!({"x": 1})));
        assert_eq!(reader.data.recv().await, None);
    }

    #[tokio::test]
    async fn test_untrimmed_withholds_partial_line() {
        let body = body_of(&["data: a\n", "\n", "data: trunc"]);
        let mut reader = StreamReader::spawn(body, Recorder::default(), LineMode::Untrimmed);

        assert_eq!(reader.data.recv().await.as_deref(), Some("data: a\n"));
        assert_eq!(reader.data.recv().await.as_deref(), Some("\n"));
        assert_eq!(reader.data.recv().await, None);

        let handler = reader.finish().await.unwrap();
        assert!(handler.seen.iter().all(|l| !l.contains("trunc")));
    }

    struct CloseOnStop;

    impl LineHandler<String> for CloseOnStop {
        fn handle(&mut self, line: &mut RawLine, sink: &mut StreamSink<String>) {
            match line.bytes() {
                Some(b"stop") => line.close(),
                Some(bytes) => sink.send(String::from_utf8_lossy(bytes).to_string()),
                None => {}
            }
        }
    }

    #[tokio::test]
    async fn test_sentinel_ends_stream() {
        let body = body_of(&["one\nstop\ntwo\n"]);
        let mut reader = StreamReader::spawn(body, CloseOnStop, LineMode::Trimmed);
        assert_eq!(reader.data.recv().await.as_deref(), Some("one"));
        assert_eq!(reader.data.recv().await, None);
        assert!(reader.errors.recv().await.is_none());
    }

    struct Exploding;

    impl LineHandler<String> for Exploding {
        fn handle(&mut self, _line: &mut RawLine, _sink: &mut StreamSink<String>) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_stream_panic_error() {
        let body = body_of(&["x\n"]);
        let mut reader = StreamReader::spawn(body, Exploding, LineMode::Trimmed);

        let err = reader.errors.recv().await.unwrap();
        assert!(matches!(err, RelayError::StreamPanic { ref detail } if detail == "boom"));
        assert_eq!(reader.data.recv().await, None);
        assert!(reader.finish().await.is_some());
    }

    #[tokio::test]
    async fn test_read_error_reported() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let mut reader = StreamReader::spawn(body, Recorder::default(), LineMode::Trimmed);

        assert_eq!(reader.data.recv().await.as_deref(), Some("a"));
        let err = reader.errors.recv().await.unwrap();
        assert!(matches!(err, RelayError::UpstreamTransport { .. }));
    }

    #[tokio::test]
    async fn test_read_error_flushes_trimmed_tail() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a\nb")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let mut reader = StreamReader::spawn(body, Recorder::default(), LineMode::Trimmed);

        assert_eq!(reader.data.recv().await.as_deref(), Some("a"));
        assert_eq!(reader.data.recv().await.as_deref(), Some("b"));
        let err = reader.errors.recv().await.unwrap();
        assert!(matches!(err, RelayError::UpstreamTransport { .. }));
    }

    #[tokio::test]
    async fn test_close_tears_down_channels() {
        let body = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let mut reader = StreamReader::spawn(body, Recorder::default(), LineMode::Trimmed);
        reader.close();
        assert_eq!(reader.data.recv().await, None);
        assert!(reader.errors.recv().await.is_none());
        assert!(reader.finish().await.is_none());
    }
}

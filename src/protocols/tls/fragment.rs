//! The fragmenting stream adapter.
//!
//! [`FragmentStream`] sits between the TLS engine and the socket. The
//! first write it sees from the engine is the full ClientHello record
//! (rustls buffers the record before flushing it to the transport). The
//! adapter re-frames that one record as two valid TLS records split at a
//! configured payload offset and pushes each through the underlying
//! stream as its own flushed write, so the TCP stack gets the chance to
//! emit them as distinct segments. Every later write, and every read,
//! passes through untouched.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{RecordHeader, CONTENT_TYPE_HANDSHAKE, TLS_RECORD_HEADER_LEN};

/// Byte-stream wrapper that splits the first outbound TLS handshake
/// record into two records, then becomes inert.
#[derive(Debug)]
pub struct FragmentStream<S> {
    inner: S,
    first_fragment_len: u8,
    write_state: WriteState,
}

#[derive(Debug)]
enum WriteState {
    /// No handshake bytes written yet.
    Fresh,
    /// Mid-split: the re-framed records still being drained into `inner`.
    /// `written` tracks progress inside the front chunk; `flushing` means
    /// the front chunk is fully written and awaiting its flush.
    FirstFlight {
        chunks: VecDeque<Bytes>,
        written: usize,
        flushing: bool,
        reported: usize,
    },
    /// Split drained and flushed; the originating `poll_write` still has
    /// to report its consumed length before the stream goes inert.
    SplitDone { reported: usize },
    /// Inert: every write forwards unmodified.
    Passthrough,
}

impl<S> FragmentStream<S> {
    /// Wrap `inner`, splitting the first handshake record so that its
    /// first `first_fragment_len` payload bytes travel in their own
    /// record. A length of zero disables the split entirely.
    pub fn new(inner: S, first_fragment_len: u8) -> Self {
        Self {
            inner,
            first_fragment_len,
            write_state: WriteState::Fresh,
        }
    }

    /// Wrap `inner` without ever splitting. Keeps the stream type uniform
    /// for callers that retry a handshake unfragmented.
    pub fn passthrough(inner: S) -> Self {
        Self {
            inner,
            first_fragment_len: 0,
            write_state: WriteState::Passthrough,
        }
    }

    pub fn first_fragment_len(&self) -> u8 {
        self.first_fragment_len
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Re-frame the handshake record at the front of `buf` into the two
    /// split records, plus whatever trailed it in the same buffer.
    ///
    /// Returns `None` when the buffer is not a complete handshake record
    /// or the configured length cannot produce two non-empty records; the
    /// caller then forwards the bytes unmodified.
    fn split_chunks(buf: &[u8], first_fragment_len: u8) -> Option<VecDeque<Bytes>> {
        if first_fragment_len == 0 {
            return None;
        }
        let hdr = RecordHeader::parse(buf)?;
        if hdr.content_type != CONTENT_TYPE_HANDSHAKE
            || hdr.payload_len < 2
            || !hdr.is_complete_in(buf)
        {
            return None;
        }

        // Clamp so both records carry at least one payload byte.
        let split = usize::from(first_fragment_len).min(hdr.payload_len - 1);
        let payload = &buf[TLS_RECORD_HEADER_LEN..TLS_RECORD_HEADER_LEN + hdr.payload_len];
        let trailing = &buf[TLS_RECORD_HEADER_LEN + hdr.payload_len..];

        let mut first = BytesMut::with_capacity(TLS_RECORD_HEADER_LEN + split);
        first.put_slice(&hdr.encode_with_len(split));
        first.put_slice(&payload[..split]);

        let mut second =
            BytesMut::with_capacity(TLS_RECORD_HEADER_LEN + hdr.payload_len - split + trailing.len());
        second.put_slice(&hdr.encode_with_len(hdr.payload_len - split));
        second.put_slice(&payload[split..]);
        second.put_slice(trailing);

        Some(VecDeque::from([first.freeze(), second.freeze()]))
    }
}

impl<S: AsyncWrite + Unpin> FragmentStream<S> {
    /// Drain the queued split records into `inner`, flushing after each
    /// one so the writes cannot coalesce into a single segment-sized
    /// burst. Transitions to `SplitDone` when everything is out.
    fn poll_drive_split(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let WriteState::FirstFlight {
            chunks,
            written,
            flushing,
            reported,
        } = &mut self.write_state
        else {
            return Poll::Ready(Ok(()));
        };

        let reported = loop {
            if *flushing {
                ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
                *flushing = false;
                chunks.pop_front();
                *written = 0;
                if chunks.is_empty() {
                    break *reported;
                }
            } else {
                let front = chunks.front().expect("non-empty while splitting");
                let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &front[*written..]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                *written += n;
                if *written == front.len() {
                    *flushing = true;
                }
            }
        };

        self.write_state = WriteState::SplitDone { reported };
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.write_state {
                WriteState::Fresh => {
                    match Self::split_chunks(buf, this.first_fragment_len) {
                        Some(chunks) => {
                            this.write_state = WriteState::FirstFlight {
                                chunks,
                                written: 0,
                                flushing: false,
                                reported: buf.len(),
                            };
                        }
                        // Not a splittable handshake record: stay out of
                        // the way for the rest of the connection.
                        None => this.write_state = WriteState::Passthrough,
                    }
                }
                WriteState::FirstFlight { .. } => {
                    ready!(this.poll_drive_split(cx))?;
                }
                WriteState::SplitDone { reported } => {
                    let reported = *reported;
                    this.write_state = WriteState::Passthrough;
                    return Poll::Ready(Ok(reported));
                }
                WriteState::Passthrough => return Pin::new(&mut this.inner).poll_write(cx, buf),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drive_split(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drive_split(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// What the inner stream observed, in order.
    #[derive(Debug, PartialEq)]
    enum Event {
        Write(Vec<u8>),
        Flush,
    }

    /// Write-only stream that records every write boundary and flush.
    #[derive(Default)]
    struct RecordingStream {
        events: Vec<Event>,
    }

    impl RecordingStream {
        fn writes(&self) -> Vec<&[u8]> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Write(w) => Some(w.as_slice()),
                    Event::Flush => None,
                })
                .collect()
        }
    }

    impl AsyncWrite for RecordingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.get_mut().events.push(Event::Write(buf.to_vec()));
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.get_mut().events.push(Event::Flush);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    // ClientHello carrying SNI "example.com", small enough to eyeball.
    fn sample_client_hello() -> Vec<u8> {
        vec![
            // Record header
            0x16, 0x03, 0x01, 0x00, 0x43,
            // Handshake header (ClientHello, length 0x3f)
            0x01, 0x00, 0x00, 0x3f,
            // Client version
            0x03, 0x03,
            // Random (32 bytes)
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
            0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
            // Session id length
            0x00,
            // Cipher suites
            0x00, 0x02, 0x00, 0xff,
            // Compression methods
            0x01, 0x00,
            // Extensions length
            0x00, 0x14,
            // SNI extension: "example.com"
            0x00, 0x00, 0x00, 0x10, 0x00, 0x0e, 0x00, 0x00, 0x0b,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ]
    }

    #[tokio::test]
    async fn splits_first_record_into_two_flushed_writes() {
        let hello = sample_client_hello();
        let payload_len = hello.len() - TLS_RECORD_HEADER_LEN;

        let mut stream = FragmentStream::new(RecordingStream::default(), 4);
        stream.write_all(&hello).await.unwrap();

        let events = &stream.get_ref().events;
        assert_eq!(events.len(), 4, "write, flush, write, flush: {events:?}");
        assert!(matches!(events[1], Event::Flush));
        assert!(matches!(events[3], Event::Flush));

        let writes = stream.get_ref().writes();
        assert_eq!(writes.len(), 2);

        // Record #1: same content type and version, 4 payload bytes.
        assert_eq!(&writes[0][..5], &[0x16, 0x03, 0x01, 0x00, 0x04]);
        assert_eq!(&writes[0][5..], &hello[5..9]);

        // Record #2: the rest, with a matching header.
        let rest = (payload_len - 4) as u16;
        assert_eq!(writes[1][0], 0x16);
        assert_eq!(&writes[1][1..3], &hello[1..3]);
        assert_eq!(u16::from_be_bytes([writes[1][3], writes[1][4]]), rest);
        assert_eq!(&writes[1][5..], &hello[9..]);

        // The two payloads reassemble to the original handshake message.
        let mut reassembled = writes[0][5..].to_vec();
        reassembled.extend_from_slice(&writes[1][5..]);
        assert_eq!(reassembled, &hello[5..]);
    }

    #[tokio::test]
    async fn later_writes_pass_through_unmodified() {
        let hello = sample_client_hello();
        let mut stream = FragmentStream::new(RecordingStream::default(), 4);
        stream.write_all(&hello).await.unwrap();

        let finished = [0x16, 0x03, 0x03, 0x00, 0x03, 0xaa, 0xbb, 0xcc];
        stream.write_all(&finished).await.unwrap();
        let app_data = [0x17, 0x03, 0x03, 0x00, 0x02, 0x01, 0x02];
        stream.write_all(&app_data).await.unwrap();

        let writes = stream.get_ref().writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[2], &finished[..]);
        assert_eq!(writes[3], &app_data[..]);
    }

    #[tokio::test]
    async fn zero_fragment_len_disables_the_split() {
        let hello = sample_client_hello();
        let mut stream = FragmentStream::new(RecordingStream::default(), 0);
        stream.write_all(&hello).await.unwrap();

        let writes = stream.get_ref().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], &hello[..]);
    }

    #[tokio::test]
    async fn oversized_fragment_len_clamps_to_payload_minus_one() {
        let hello = sample_client_hello();
        let payload_len = hello.len() - TLS_RECORD_HEADER_LEN;

        let mut stream = FragmentStream::new(RecordingStream::default(), u8::MAX);
        stream.write_all(&hello).await.unwrap();

        let writes = stream.get_ref().writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), TLS_RECORD_HEADER_LEN + payload_len - 1);
        assert_eq!(writes[1].len(), TLS_RECORD_HEADER_LEN + 1);
    }

    #[tokio::test]
    async fn non_handshake_first_write_is_untouched() {
        let app_data = [0x17, 0x03, 0x03, 0x00, 0x02, 0x01, 0x02];
        let mut stream = FragmentStream::new(RecordingStream::default(), 4);
        stream.write_all(&app_data).await.unwrap();

        let writes = stream.get_ref().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], &app_data[..]);
    }

    #[tokio::test]
    async fn passthrough_wrapper_never_splits() {
        let hello = sample_client_hello();
        let mut stream = FragmentStream::passthrough(RecordingStream::default());
        stream.write_all(&hello).await.unwrap();

        let writes = stream.get_ref().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], &hello[..]);
    }

    #[test]
    fn split_keeps_both_records_non_empty() {
        // 2-byte payload: the only valid split is 1/1.
        let record = [0x16, 0x03, 0x03, 0x00, 0x02, 0x01, 0x00];
        let chunks = FragmentStream::<RecordingStream>::split_chunks(&record, 200).unwrap();
        assert_eq!(chunks[0].len(), TLS_RECORD_HEADER_LEN + 1);
        assert_eq!(chunks[1].len(), TLS_RECORD_HEADER_LEN + 1);

        // 1-byte payload cannot be split at all.
        let tiny = [0x16, 0x03, 0x03, 0x00, 0x01, 0x01];
        assert!(FragmentStream::<RecordingStream>::split_chunks(&tiny, 4).is_none());
    }

    #[test]
    fn incomplete_record_is_not_split() {
        let mut hello = sample_client_hello();
        hello.truncate(20);
        assert!(FragmentStream::<RecordingStream>::split_chunks(&hello, 4).is_none());
    }
}

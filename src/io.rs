//! Wire-level IO: the error type, request serialization, and the
//! response decoding primitives the client state machine is built from.

use core::fmt::Display;
use core::str;

use embedded_io_async::{ErrorKind, Read, Write};

use crate::{Header, HeaderParseError, MAX_RECV_BUF};

pub mod client;

/// An error in connecting, decoding a response, or the underlying
/// transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error<E> {
    /// The request was abandoned: its queue was cleared, its client went
    /// away, or the connection was torn down underneath it
    Cancelled,
    /// A deadline elapsed: the per-request timer, the resolve timer, or
    /// the idle timer with requests still queued
    Timeout,
    /// A declared body length, a single chunk plus buffered surplus, or a
    /// buffered block exceeds [`MAX_RECV_BUF`](crate::MAX_RECV_BUF)
    FileTooLarge,
    /// The header block is malformed
    HeaderParse(HeaderParseError),
    /// The body framing is malformed: a bad chunk-size line, a chunk not
    /// terminated by CRLF, or an unsupported transfer coding
    InvalidBody,
    /// The peer closed the connection where more data was required
    ConnectionClosed,
    /// Transport-level failure
    Io(E),
}

impl<E> Error<E>
where
    E: embedded_io_async::Error,
{
    pub fn erase(&self) -> Error<ErrorKind> {
        match self {
            Self::Cancelled => Error::Cancelled,
            Self::Timeout => Error::Timeout,
            Self::FileTooLarge => Error::FileTooLarge,
            Self::HeaderParse(e) => Error::HeaderParse(*e),
            Self::InvalidBody => Error::InvalidBody,
            Self::ConnectionClosed => Error::ConnectionClosed,
            Self::Io(e) => Error::Io(e.kind()),
        }
    }
}

impl<E> From<HeaderParseError> for Error<E> {
    fn from(e: HeaderParseError) -> Self {
        Self::HeaderParse(e)
    }
}

impl<E> embedded_io_async::Error for Error<E>
where
    E: embedded_io_async::Error,
{
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) => e.kind(),
            Self::Timeout => ErrorKind::TimedOut,
            _ => ErrorKind::Other,
        }
    }
}

impl<E> Display for Error<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "Request cancelled"),
            Self::Timeout => write!(f, "Timed out"),
            Self::FileTooLarge => write!(f, "Response exceeds the receive buffer bound"),
            Self::HeaderParse(e) => write!(f, "Header parse error: {e}"),
            Self::InvalidBody => write!(f, "Invalid HTTP body"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl<E> std::error::Error for Error<E> where E: std::error::Error {}

/// The body framing selected by a response's headers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum BodyKind {
    Chunked,
    ContentLen(u64),
    UntilClose,
}

impl BodyKind {
    /// Select the framing: `Transfer-Encoding` wins over `Content-Length`,
    /// and only the `chunked` coding is supported.
    pub(crate) fn from_header<E>(header: &Header) -> Result<Self, Error<E>> {
        if let Some(coding) = header.transfer_encoding()? {
            if coding.eq_ignore_ascii_case(b"chunked") {
                return Ok(Self::Chunked);
            }

            return Err(Error::InvalidBody);
        }

        if let Some(len) = header.content_length()? {
            return Ok(Self::ContentLen(len));
        }

        Ok(Self::UntilClose)
    }
}

/// Serialize a GET request line plus the `Host` field.
///
/// The wire format is exactly:
///
/// ```text
/// GET <resource> HTTP/1.1\r\n
/// Host: <host>\r\n
/// \r\n
/// ```
pub(crate) async fn send_request<W>(
    resource: &str,
    host: &str,
    output: &mut W,
) -> Result<(), Error<W::Error>>
where
    W: Write,
{
    // RFC 9112:   request-line   = method SP request-target SP HTTP-version

    output.write_all(b"GET ").await.map_err(Error::Io)?;
    output
        .write_all(resource.as_bytes())
        .await
        .map_err(Error::Io)?;
    output
        .write_all(b" HTTP/1.1\r\n")
        .await
        .map_err(Error::Io)?;
    output.write_all(b"Host: ").await.map_err(Error::Io)?;
    output.write_all(host.as_bytes()).await.map_err(Error::Io)?;
    output.write_all(b"\r\n\r\n").await.map_err(Error::Io)?;
    output.flush().await.map_err(Error::Io)?;

    Ok(())
}

/// Read from `input` into `buf` until `pat` appears; the index just past
/// the pattern is returned. Bytes already buffered are scanned first, and
/// read-ahead past the pattern stays in the buffer for later stages.
pub(crate) async fn read_until<R>(
    input: &mut R,
    buf: &mut Vec<u8>,
    pat: &[u8],
) -> Result<usize, Error<R::Error>>
where
    R: Read,
{
    let mut scanned = 0;

    loop {
        if buf.len() >= pat.len() {
            if let Some(pos) = buf[scanned..]
                .windows(pat.len())
                .position(|window| window == pat)
            {
                return Ok(scanned + pos + pat.len());
            }

            // A partial match may straddle the read boundary
            scanned = buf.len() - (pat.len() - 1);
        }

        if buf.len() >= MAX_RECV_BUF {
            return Err(Error::FileTooLarge);
        }

        let mut read_buf = [0; 2048];

        let read = input.read(&mut read_buf).await.map_err(Error::Io)?;

        if read == 0 {
            return Err(Error::ConnectionClosed);
        }

        buf.extend_from_slice(&read_buf[..read]);
    }
}

/// Split the header block off the front of `buf`.
///
/// `end` is the index just past the `CRLF CRLF` terminator. The status
/// line is discarded unparsed; the returned [`Header`] owns the field
/// block between it and the terminating blank line. Read-ahead surplus
/// stays in `buf` as the first body bytes.
pub(crate) fn take_header(buf: &mut Vec<u8>, end: usize) -> Header {
    let status_end = buf[..end]
        .windows(2)
        .position(|window| window == b"\r\n")
        .unwrap_or(end - 2);

    let raw = buf[usize::min(status_end + 2, end - 2)..end - 2].to_vec();

    buf.drain(..end);

    Header::new(raw)
}

/// Grow `buf` with reads from `input` until it holds `need` bytes.
///
/// Never reads past `need`, so bytes belonging to the next protocol
/// element stay in the transport.
pub(crate) async fn read_exact_buffered<R>(
    input: &mut R,
    buf: &mut Vec<u8>,
    need: usize,
) -> Result<(), Error<R::Error>>
where
    R: Read,
{
    while buf.len() < need {
        let mut read_buf = [0; 4096];
        let want = usize::min(read_buf.len(), need - buf.len());

        let read = input.read(&mut read_buf[..want]).await.map_err(Error::Io)?;

        if read == 0 {
            return Err(Error::ConnectionClosed);
        }

        buf.extend_from_slice(&read_buf[..read]);
    }

    Ok(())
}

/// Read from `input` into `buf` until the peer closes the connection.
pub(crate) async fn read_to_close<R>(
    input: &mut R,
    buf: &mut Vec<u8>,
) -> Result<(), Error<R::Error>>
where
    R: Read,
{
    loop {
        if buf.len() > MAX_RECV_BUF {
            return Err(Error::FileTooLarge);
        }

        let mut read_buf = [0; 4096];

        let read = input.read(&mut read_buf).await.map_err(Error::Io)?;

        if read == 0 {
            return Ok(());
        }

        buf.extend_from_slice(&read_buf[..read]);
    }
}

/// Parse the hex size off a chunk-size line (CRLF already stripped).
///
/// Anything after the hex digits is a chunk extension and is discarded
/// wholesale [RFC7230§4.1.1].
pub(crate) fn parse_chunk_size<E>(line: &[u8]) -> Result<u64, Error<E>> {
    let digits = line
        .iter()
        .take_while(|b| b.is_ascii_hexdigit())
        .count();

    if digits == 0 {
        return Err(Error::InvalidBody);
    }

    // This is safe because hex digits are always valid UTF-8
    let digits = unsafe { str::from_utf8_unchecked(&line[..digits]) };

    u64::from_str_radix(digits, 16).map_err(|_| Error::InvalidBody)
}

/// Discard the optional trailer section following the final chunk, up to
/// and including the blank line that ends the body [RFC7230§4.1.2].
pub(crate) async fn discard_trailer<R>(
    input: &mut R,
    buf: &mut Vec<u8>,
) -> Result<(), Error<R::Error>>
where
    R: Read,
{
    loop {
        let end = read_until(input, buf, b"\r\n").await?;
        let empty = end == 2;

        buf.drain(..end);

        if empty {
            return Ok(());
        }
    }
}

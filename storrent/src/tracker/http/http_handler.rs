use native_tls::HandshakeError;
use native_tls::TlsConnector;
use std::io::Error as IOError;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use super::query_params::QueryParams;
use super::url_parser::TrackerUrl;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking HTTP/HTTPS GET against an announce endpoint.
///
/// To make a **HTTPS** request use `https_request()`, for plain **HTTP**
/// use `http_request()`. Both return the raw response body.
#[derive(Debug)]
pub struct HttpHandler {
    tracker_url: TrackerUrl,
    query_params: QueryParams,
}

/// Posible `HttpHandler` errors.
#[derive(Debug)]
pub enum HttpHandlerError {
    CreateTlsConnectorError(native_tls::Error),
    TcpStreamConnectError(IOError),
    TlsStreamConnectError,
    ErrorWritingStream(IOError),
    ErrorReadingStream(IOError),
}

impl HttpHandler {
    pub fn new(tracker_url: TrackerUrl, query_params: QueryParams) -> Self {
        Self {
            tracker_url,
            query_params,
        }
    }

    /// Makes a **HTTPS** request to the tracker url.
    ///
    /// It returns an `HttpHandlerError` if:
    /// - There was a problem creating a TlsConnector.
    /// - There was a problem connecting to the tracker.
    /// - There was a problem writing or reading the stream.
    pub fn https_request(&self) -> Result<Vec<u8>, HttpHandlerError> {
        let connector =
            TlsConnector::new().map_err(HttpHandlerError::CreateTlsConnectorError)?;
        let stream = self.connect_tcp_stream()?;
        let stream = match connector.connect(self.tracker_url.host.as_str(), stream) {
            Ok(stream) => stream,
            Err(HandshakeError::Failure(_)) | Err(HandshakeError::WouldBlock(_)) => {
                return Err(HttpHandlerError::TlsStreamConnectError)
            }
        };
        self.request_and_decode(stream)
    }

    /// Makes a plain **HTTP** request to the tracker url.
    pub fn http_request(&self) -> Result<Vec<u8>, HttpHandlerError> {
        self.request_and_decode(self.connect_tcp_stream()?)
    }

    fn connect_tcp_stream(&self) -> Result<TcpStream, HttpHandlerError> {
        let connect_url = format!("{}:{}", self.tracker_url.host, self.tracker_url.port);
        let stream =
            TcpStream::connect(connect_url).map_err(HttpHandlerError::TcpStreamConnectError)?;
        let _ = stream.set_read_timeout(Some(REQUEST_TIMEOUT));
        let _ = stream.set_write_timeout(Some(REQUEST_TIMEOUT));
        Ok(stream)
    }

    fn request_and_decode<S>(&self, mut stream: S) -> Result<Vec<u8>, HttpHandlerError>
    where
        S: Write + Read,
    {
        let request = format!(
            "GET /{}{} HTTP/1.1\r\nHost: {}\r\nUser-Agent: storrent/0.1\r\nConnection: close\r\n\r\n",
            self.tracker_url.endpoint,
            self.query_params.build(),
            self.tracker_url.host,
        );

        stream
            .write_all(request.as_bytes())
            .map_err(HttpHandlerError::ErrorWritingStream)?;

        let mut response = vec![];
        stream
            .read_to_end(&mut response)
            .map_err(HttpHandlerError::ErrorReadingStream)?;

        Ok(Self::strip_headers(&response).to_vec())
    }

    /// Returns the body: everything after the first blank line.
    fn strip_headers(response: &[u8]) -> &[u8] {
        response
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|position| &response[position + 4..])
            .unwrap_or(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::http::url_parser::ConnectionProtocol;
    use std::io;

    /// In-memory stream that records what was written and replays a canned
    /// response.
    struct FakeStream {
        written: Vec<u8>,
        response: io::Cursor<Vec<u8>>,
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    #[test]
    fn test_request_line_and_body_split() {
        let handler = HttpHandler::new(
            TrackerUrl {
                protocol: ConnectionProtocol::Http,
                host: "tracker.example".to_string(),
                port: 80,
                endpoint: "announce".to_string(),
            },
            QueryParams::new("aa".repeat(20), "-qB4250-abcdefghijkl".to_string(), 6881),
        );

        let stream = FakeStream {
            written: vec![],
            response: io::Cursor::new(
                b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nd8:completei1ee".to_vec(),
            ),
        };
        let body = handler.request_and_decode(stream).unwrap();

        assert_eq!(body, b"d8:completei1ee".to_vec());
    }

    #[test]
    fn test_request_contains_query() {
        let handler = HttpHandler::new(
            TrackerUrl {
                protocol: ConnectionProtocol::Http,
                host: "tracker.example".to_string(),
                port: 80,
                endpoint: "announce".to_string(),
            },
            QueryParams::new("aa".repeat(20), "-qB4250-abcdefghijkl".to_string(), 6881),
        );

        let mut stream = FakeStream {
            written: vec![],
            response: io::Cursor::new(b"\r\n\r\n".to_vec()),
        };
        handler.request_and_decode(&mut stream).unwrap();

        let request = String::from_utf8(stream.written).unwrap();
        assert!(request.starts_with("GET /announce?info_hash="));
        assert!(request.contains("Host: tracker.example"));
        assert!(request.contains("&port=6881"));
    }

    #[test]
    fn test_strip_headers_without_blank_line() {
        assert_eq!(HttpHandler::strip_headers(b"no headers"), b"no headers");
    }
}

// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Just enough HTTP/1.0 to ask for the image size and fetch it in ranges.

use core::fmt::Write;

use heapless::String;
#[allow(unused_imports)]
use log::{debug, error, info, warn};

/// Capacity of a request line plus headers
pub const MAX_REQUEST_LEN: usize = 512;
/// Largest response head accepted
pub const MAX_HEAD_LEN: usize = 1024;

pub type Request = String<MAX_REQUEST_LEN>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request does not fit [`MAX_REQUEST_LEN`]
    RequestTooLong,
    /// The response head does not fit [`MAX_HEAD_LEN`]
    HeadTooLong,
    /// Status line missing or not HTTP
    BadStatusLine,
    BadContentLength,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u32>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Builds the size probe sent on a fresh connection.
pub fn head_request(out: &mut Request, path: &str, host: &str) -> Result<(), HttpError> {
    out.clear();
    write!(
        out,
        "HEAD {path} HTTP/1.0\r\nHost: {host}\r\nConnection: keep-alive\r\n\r\n"
    )
    .map_err(|_| HttpError::RequestTooLong)
}

/// Builds a GET for the inclusive byte range `start..=end`. The final range
/// asks the server to close the connection afterwards.
pub fn range_request(
    out: &mut Request,
    path: &str,
    host: &str,
    start: u32,
    end: u32,
    last: bool,
) -> Result<(), HttpError> {
    let connection = if last { "close" } else { "keep-alive" };
    out.clear();
    write!(
        out,
        "GET {path} HTTP/1.0\r\nRange: bytes={start}-{end}\r\nHost: {host}\r\nConnection: {connection}\r\n\r\n"
    )
    .map_err(|_| HttpError::RequestTooLong)
}

/// Headers inspected per response, more is treated as an oversized head
const MAX_HEADERS: usize = 24;

/// Parses the response head at the start of `buf`.
///
/// Returns `None` until the blank line ending the head has arrived, then the
/// parsed head and its length including the blank line. Bytes after it belong
/// to the body.
pub fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(HttpError::HeadTooLong),
        Err(e) => {
            debug!("Unparsable response head: {:?}", e);
            return Err(HttpError::BadStatusLine);
        }
    };
    let status = response.code.ok_or(HttpError::BadStatusLine)?;

    let mut content_length = None;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value =
                core::str::from_utf8(header.value).map_err(|_| HttpError::BadContentLength)?;
            content_length = Some(
                value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| HttpError::BadContentLength)?,
            );
        }
    }

    Ok(Some((
        ResponseHead {
            status,
            content_length,
        },
        head_len,
    )))
}

#[cfg(test)]
mod http_tests {
    use super::*;

    #[test]
    fn range_request_layout() {
        let mut req = Request::new();
        range_request(&mut req, "/fw/app.bin", "example.com", 4096, 8191, false).unwrap();
        assert_eq!(
            req.as_str(),
            "GET /fw/app.bin HTTP/1.0\r\nRange: bytes=4096-8191\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n"
        );

        range_request(&mut req, "/fw/app.bin", "example.com", 8192, 9000, true).unwrap();
        assert!(req.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut req = Request::new();
        let long = [b'a'; MAX_REQUEST_LEN];
        let long = core::str::from_utf8(&long).unwrap();
        assert_eq!(
            head_request(&mut req, long, "h"),
            Err(HttpError::RequestTooLong)
        );
    }

    fn complete(buf: &[u8]) -> (ResponseHead, usize) {
        parse_head(buf).unwrap().unwrap()
    }

    #[test]
    fn head_end_needs_blank_line() {
        assert_eq!(parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n"), Ok(None));
        assert_eq!(parse_head(b""), Ok(None));
        assert_eq!(complete(b"HTTP/1.1 200 OK\r\n\r\nbody").1, 19);
        assert_eq!(complete(b"HTTP/1.0 200 OK\n\nxy").1, 17);
    }

    #[test]
    fn content_length_is_case_insensitive() {
        let (head, _) = complete(
            b"HTTP/1.1 206 Partial Content\r\ncontent-LENGTH:  4096\r\nServer: x\r\n\r\n",
        );
        assert_eq!(
            head,
            ResponseHead {
                status: 206,
                content_length: Some(4096)
            }
        );
        assert!(head.is_success());
    }

    #[test]
    fn missing_length_and_bad_status() {
        let (head, _) = complete(b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert_eq!(head.content_length, None);
        assert!(!head.is_success());

        assert_eq!(parse_head(b"SSH-2.0-x\r\n\r\n"), Err(HttpError::BadStatusLine));
        assert_eq!(
            parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: many\r\n\r\n"),
            Err(HttpError::BadContentLength)
        );
    }

    #[test]
    fn too_many_headers_is_an_oversized_head() {
        let mut head = std::string::String::from("HTTP/1.1 200 OK\r\n");
        for i in 0..=MAX_HEADERS {
            head.push_str(&format!("X-Filler-{i}: y\r\n"));
        }
        head.push_str("\r\n");
        assert_eq!(parse_head(head.as_bytes()), Err(HttpError::HeadTooLong));
    }
}

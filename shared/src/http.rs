//! Minimal HTTP/1.1 client pieces used to fetch firmware images.

use core::fmt::Write;

use heapless::String;

pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HttpError {
    /// Only plain `http://` downloads are supported
    UnsupportedScheme,
    InvalidUrl,
    /// Request did not fit the buffer
    RequestTooLong,
    /// Response head could not be parsed
    InvalidResponse,
    /// Server answered with something other than 200
    Status(u16),
}

impl core::fmt::Display for HttpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnsupportedScheme => write!(f, "unsupported url scheme"),
            Self::InvalidUrl => write!(f, "invalid url"),
            Self::RequestTooLong => write!(f, "request too long"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::Status(status) => write!(f, "http status {}", status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Url<'a> {
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
}

impl<'a> Url<'a> {
    pub fn parse(url: &'a str) -> Result<Self, HttpError> {
        let rest = match url.split_once("://") {
            Some(("http", rest)) => rest,
            Some(_) => return Err(HttpError::UnsupportedScheme),
            None => return Err(HttpError::InvalidUrl),
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| HttpError::InvalidUrl)?,
            ),
            None => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(HttpError::InvalidUrl);
        }

        Ok(Self { host, port, path })
    }

    /// Renders a `GET` request for this URL.
    pub fn get_request<const N: usize>(&self) -> Result<String<N>, HttpError> {
        let mut request = String::new();
        write!(
            request,
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: application/octet-stream\r\nConnection: close\r\n\r\n",
            self.path, self.host
        )
        .map_err(|_| HttpError::RequestTooLong)?;
        Ok(request)
    }
}

/// Status line and the headers we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u32>,
    /// Bytes taken by the head including the blank line, the body starts right after.
    pub len: usize,
}

impl ResponseHead {
    /// Parses the head once `received` holds all of it, `Ok(None)` means more data is needed.
    pub fn parse(received: &[u8]) -> Result<Option<Self>, HttpError> {
        let end = match received.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(end) => end,
            None => return Ok(None),
        };
        let head = core::str::from_utf8(&received[..end]).map_err(|_| HttpError::InvalidResponse)?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().ok_or(HttpError::InvalidResponse)?;
        let mut parts = status_line.split(' ');
        if !parts.next().is_some_and(|version| version.starts_with("HTTP/1.")) {
            return Err(HttpError::InvalidResponse);
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or(HttpError::InvalidResponse)?;

        let mut content_length = None;
        for line in lines {
            let (name, value) = line.split_once(':').ok_or(HttpError::InvalidResponse)?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| HttpError::InvalidResponse)?,
                );
            }
        }

        Ok(Some(Self {
            status,
            content_length,
            len: end + 4,
        }))
    }

    pub fn ensure_ok(&self) -> Result<(), HttpError> {
        match self.status {
            200 => Ok(()),
            status => Err(HttpError::Status(status)),
        }
    }
}

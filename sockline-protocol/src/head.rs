//! Head-block framing.
//!
//! A unit is a head of CRLF separated lines, an empty line, then the body. The first head line is
//! `METHOD TARGET ...`, every following line a `Name: Value` header.

const LINE_END: &str = "\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// First token of the request line.
    pub method: String,

    /// Second token of the request line, `/` when absent.
    pub target: String,

    /// Headers in wire order.
    pub headers: Vec<(String, String)>,

    /// Everything after the empty line.
    pub body: Vec<u8>,
}

impl Request {
    /// Decodes one unit.
    ///
    /// Without an empty line the whole input is taken as the head and the body is empty.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeadDecodeError> {
        let (head, body) = match bytes.windows(HEAD_END.len()).position(|window| window == HEAD_END) {
            Some(end) => (&bytes[..end], &bytes[end + HEAD_END.len()..]),
            None => (bytes, &[][..]),
        };
        let head = std::str::from_utf8(head).map_err(|_| HeadDecodeError::NonUtf8Head)?;

        let mut lines = head.lines();
        let mut request_line = lines.next().unwrap_or_default().split_whitespace();
        let method = request_line.next().ok_or(HeadDecodeError::MissingRequestLine)?;
        let target = request_line.next().unwrap_or("/");

        let headers = lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                let (name, value) = line
                    .split_once(':')
                    .ok_or_else(|| HeadDecodeError::MalformedHeader(line.to_owned()))?;
                Ok((name.trim().to_owned(), value.trim().to_owned()))
            })
            .collect::<Result<_, HeadDecodeError>>()?;

        Ok(Self {
            method: method.to_owned(),
            target: target.to_owned(),
            headers,
            body: body.to_vec(),
        })
    }

    /// Returns the first header called `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The status line, e.g. `HTTP/1.1 200 OK`.
    pub status: String,

    /// Headers in wire order.
    pub headers: Vec<(String, String)>,

    /// The body.
    pub body: Vec<u8>,
}

impl Response {
    /// Creates a response without headers or body.
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first header called `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Encodes the response: status line, headers, empty line, body.
    pub fn encode(&self) -> Vec<u8> {
        let mut head = self.status.clone();
        for (name, value) in &self.headers {
            head.push_str(LINE_END);
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
        }
        head.push_str(LINE_END);
        head.push_str(LINE_END);

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Errors decoding a head block.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HeadDecodeError {
    /// The head is not valid UTF-8.
    #[error("head is not valid utf-8")]
    NonUtf8Head,

    /// The unit has no request line.
    #[error("missing request line")]
    MissingRequestLine,

    /// A header line has no `:` separator.
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
}

// Redis Serialization Protocol v3.0

use crate::parser_error;

/// Largest string value, in bytes. Bulk strings declaring more are refused
/// before any of their payload is buffered.
pub const PROTO_MAX_STRING: usize = 512 * 1024 * 1024;

/// Produces the byte representation of a RESP3 null bulk string.
///
/// # Examples
/// ```rust
/// use quiver_core::null;
///
/// let n = null!();
/// assert_eq!(n, b"$-1\r\n".to_vec());
/// ```
#[macro_export]
macro_rules! null {
    () => {
        b"$-1\r\n".to_vec()
    };
}

/// Converts a byte slice expression to the byte representation of a RESP3
/// bulk string.
///
/// # Examples
/// ```rust
/// use quiver_core::bulkstring;
///
/// let bulk = bulkstring!(b"Mike");
/// assert_eq!(bulk, b"$4\r\nMike\r\n".to_vec());
/// ```
#[macro_export]
macro_rules! bulkstring {
    ($data:expr) => {{
        let data: &[u8] = &$data[..];
        let mut s = Vec::with_capacity(data.len() + 16);
        s.push(b'$');
        s.extend_from_slice(data.len().to_string().as_bytes());
        s.extend_from_slice(b"\r\n");
        s.extend_from_slice(data);
        s.extend_from_slice(b"\r\n");
        s
    }};
}

/// Converts a string expression to the byte representation of a RESP3
/// bulk error.
///
/// # Examples
/// ```rust
/// use quiver_core::bulkerror;
///
/// let err = "error";
/// let bulk_error = bulkerror!(err);
/// assert_eq!(bulk_error, b"!5\r\nerror\r\n".to_vec());
/// ```
#[macro_export]
macro_rules! bulkerror {
    ($err:expr) => {{
        let mut s = String::new();
        s.push('!');
        let len = $err.len();
        s.push_str(&len.to_string());
        s.push_str("\r\n");
        s.push_str($err);
        s.push_str("\r\n");

        s.as_bytes().to_vec()
    }};
}

/// Converts an integer expression to the byte representation of a RESP3
/// integer.
///
/// # Examples
/// ```rust
/// use quiver_core::integer;
///
/// let n = -10;
/// assert_eq!(integer!(n), b":-10\r\n".to_vec());
/// ```
#[macro_export]
macro_rules! integer {
    ($i:expr) => {
        format!(":{}\r\n", $i).as_bytes().to_vec()
    };
}

/// A command reply, encoded with [`Reply::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`
    Ok,
    Status(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Null,
    Array(Vec<Reply>),
    Error(String),
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Ok => out.extend_from_slice(b"+OK\r\n"),
            Reply::Status(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Integer(i) => out.extend(integer!(i)),
            Reply::Bulk(data) => out.extend(bulkstring!(data)),
            Reply::Null => out.extend(null!()),
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode_into(out);
                }
            }
            Reply::Error(e) => out.extend(bulkerror!(e.as_str())),
        }
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl From<crate::Error> for Reply {
    fn from(value: crate::Error) -> Self {
        Reply::Error(value.to_string())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequestType<'re> {
    SimpleString { data: &'re [u8] },
    SimpleError { data: &'re [u8] },
    Integer { data: &'re [u8] },
    BulkString { data: &'re [u8] },
    Null,
    Array { children: Vec<RequestType<'re>> },
}

impl RequestType<'_> {
    /// Flattens a command array into its argument vector. Only arrays of
    /// strings and integers are commands.
    pub fn into_args(self) -> Result<Vec<Vec<u8>>, crate::Error> {
        let RequestType::Array { children } = self else {
            return parser_error!("Expected a command array", 0);
        };
        children
            .into_iter()
            .map(|child| match child {
                RequestType::BulkString { data }
                | RequestType::SimpleString { data }
                | RequestType::Integer { data } => Ok(data.to_vec()),
                other => parser_error!(format!("Unexpected `{other:?}` in command"), 0),
            })
            .collect()
    }
}

/// Identifies different RequestTypes based on their first byte.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DataType {
    SimpleString,
    SimpleError,
    Integer,
    BulkString,
    Array,
    Null,
    Unknown,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::SimpleString => write!(f, "SimpleString"),
            DataType::SimpleError => write!(f, "SimpleError"),
            DataType::Integer => write!(f, "Integer"),
            DataType::BulkString => write!(f, "BulkString"),
            DataType::Array => write!(f, "Array"),
            DataType::Null => write!(f, "Null"),
            DataType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Matches a provided byte to a known Resp datatype.
/// Returns Unknown if the byte value is invalid or unknown.
fn get_data_type(byte: u8) -> DataType {
    match byte {
        b'+' => DataType::SimpleString,
        b'-' => DataType::SimpleError,
        b':' => DataType::Integer,
        b'$' => DataType::BulkString,
        b'*' => DataType::Array,
        b'_' => DataType::Null,
        _ => DataType::Unknown,
    }
}

type Parsed<'re> = Result<Option<(RequestType<'re>, usize)>, crate::Error>;

/// Scans a `<type><line>\r\n` header. Returns the line and the bytes consumed,
/// or `None` when the terminator has not arrived yet.
fn read_line<'re>(
    data: &'re [u8],
    byte_offset: usize,
) -> Result<Option<(&'re [u8], usize)>, crate::Error> {
    let mut i = 1;
    while i < data.len() && data[i] != b'\r' {
        i += 1;
    }
    if i + 1 >= data.len() {
        return Ok(None);
    }
    if data[i + 1] != b'\n' {
        return parser_error!("No proper termination", byte_offset + i);
    }
    Ok(Some((&data[1..i], i + 2)))
}

/// Parses the signed decimal length field of bulk strings and arrays.
fn parse_length(field: &[u8], byte_offset: usize) -> Result<i64, crate::Error> {
    let Ok(field) = std::str::from_utf8(field) else {
        return parser_error!("Length field contains non-utf8 characters", byte_offset);
    };
    match field.parse::<i64>() {
        Ok(len) => Ok(len),
        Err(_) => parser_error!(
            "Failed to parse the `length` field from ascii",
            byte_offset
        ),
    }
}

/// Parse a series of bytes into `RequestType::SimpleString`
/// The format of simplestring bytes representation is:
///     +<data>\r\n
fn parse_simple_strings(data: &[u8], byte_offset: usize) -> Parsed<'_> {
    Ok(read_line(data, byte_offset)?
        .map(|(line, used)| (RequestType::SimpleString { data: line }, used)))
}

/// Parse a series of bytes into `RequestType::SimpleError`
/// The format of simpleerror bytes representation is:
///     -<data>\r\n
fn parse_simple_errors(data: &[u8], byte_offset: usize) -> Parsed<'_> {
    Ok(read_line(data, byte_offset)?
        .map(|(line, used)| (RequestType::SimpleError { data: line }, used)))
}

/// Parse a series of bytes into a `RequestType::Integer`
/// The format of bytes representation is:
///     :[<+|->]<value>\r\n
fn parse_integers(data: &[u8], byte_offset: usize) -> Parsed<'_> {
    let Some((line, used)) = read_line(data, byte_offset)? else {
        return Ok(None);
    };
    let digits = line.strip_prefix(b"-").or_else(|| line.strip_prefix(b"+")).unwrap_or(line);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return parser_error!("Invalid integer", byte_offset + 1);
    }
    Ok(Some((RequestType::Integer { data: line }, used)))
}

/// Parse a series of bytes into `RequestType::BulkString`
/// The format of bulkstring bytes representation is:
///     $<0..9>\r\n<data>\r\n
///
/// A negative length is the null bulk string.
fn parse_bulk_strings(data: &[u8], byte_offset: usize) -> Parsed<'_> {
    let Some((field, mut i)) = read_line(data, byte_offset)? else {
        return Ok(None);
    };
    let length = parse_length(field, byte_offset + 1)?;
    if length < 0 {
        return Ok(Some((RequestType::Null, i)));
    }

    let length = match usize::try_from(length) {
        Ok(n) if n <= PROTO_MAX_STRING => n,
        _ => return parser_error!("Bulk string length exceeds the limit", byte_offset + 1),
    };
    if data.len() < i + length + 2 {
        return Ok(None);
    }
    let content = &data[i..i + length];
    i += length;
    if &data[i..i + 2] != b"\r\n" {
        return parser_error!("No proper termination", byte_offset + i);
    }
    Ok(Some((RequestType::BulkString { data: content }, i + 2)))
}

/// Parse a series of bytes into `RequestType::Array`
/// The format of array bytes representation is:
///     *<number-of-elements>\r\n<element-1>...<element-n>
fn parse_arrays(data: &[u8], byte_offset: usize) -> Parsed<'_> {
    let Some((field, mut i)) = read_line(data, byte_offset)? else {
        return Ok(None);
    };
    let length = parse_length(field, byte_offset + 1)?;
    if length < 0 {
        return Ok(Some((RequestType::Null, i)));
    }

    let mut children = Vec::with_capacity(length.min(1024) as usize);
    for _ in 0..length {
        let Some((child, used)) = match_parser_against_datatype(&data[i..], byte_offset + i)?
        else {
            return Ok(None);
        };
        children.push(child);
        i += used;
    }
    Ok(Some((RequestType::Array { children }, i)))
}

/// Parse a series of bytes into `RequestType::Null`
/// The format of null bytes representation is:
///     _\r\n
fn parse_null(data: &[u8], byte_offset: usize) -> Parsed<'_> {
    match read_line(data, byte_offset)? {
        None => Ok(None),
        Some((line, used)) if line.is_empty() => Ok(Some((RequestType::Null, used))),
        Some(_) => parser_error!("Invalid null format", byte_offset),
    }
}

/// Dispatches to the parser for the type announced by the first byte.
/// Returns `Ok(None)` when the data ends before the frame does.
fn match_parser_against_datatype(data: &[u8], current_offset: usize) -> Parsed<'_> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };

    match get_data_type(first) {
        DataType::Integer => parse_integers(data, current_offset),
        DataType::BulkString => parse_bulk_strings(data, current_offset),
        DataType::SimpleString => parse_simple_strings(data, current_offset),
        DataType::SimpleError => parse_simple_errors(data, current_offset),
        DataType::Array => parse_arrays(data, current_offset),
        DataType::Null => parse_null(data, current_offset),
        DataType::Unknown => parser_error!("Unknown data type", current_offset),
    }
}

/// Parses one frame from the front of `data`.
///
/// # Returns
/// * `Ok(Some((frame, consumed)))` - a complete frame and its length in bytes
/// * `Ok(None)` - the buffer holds only a prefix of a frame
/// * `Err(_)` - the bytes can never form a valid frame
pub fn parse_frame(data: &[u8]) -> Parsed<'_> {
    match_parser_against_datatype(data, 0)
}

use quiver_core::Reply;

/// Enum representing all supported commands.
/// This provides a type-safe way to route and execute requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // String reads
    Get,
    GetRange,
    Substr,
    MGet,
    StrLen,

    // String writes
    Set,
    SetNx,
    SetEx,
    PSetEx,
    GetSet,
    Append,
    SetRange,
    MSet,
    MSetNx,

    // Integer and float arithmetic
    Incr,
    Decr,
    IncrBy,
    DecrBy,
    IncrByFloat,

    // Generic key commands
    Del,
    Exists,
    Ttl,
    PTtl,
}

/// Every command, in table order.
pub const COMMANDS: [Command; 23] = [
    Command::Get,
    Command::Set,
    Command::SetNx,
    Command::SetEx,
    Command::PSetEx,
    Command::GetSet,
    Command::Append,
    Command::SetRange,
    Command::GetRange,
    Command::Substr,
    Command::MGet,
    Command::MSet,
    Command::MSetNx,
    Command::Incr,
    Command::Decr,
    Command::IncrBy,
    Command::DecrBy,
    Command::IncrByFloat,
    Command::StrLen,
    Command::Del,
    Command::Exists,
    Command::Ttl,
    Command::PTtl,
];

impl Command {
    /// Resolves a command name, ignoring ASCII case.
    pub fn lookup(name: &[u8]) -> Option<Command> {
        COMMANDS
            .into_iter()
            .find(|cmd| cmd.name().as_bytes().eq_ignore_ascii_case(name))
    }

    /// Lowercase name, as used in error replies and notifications.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get => "get",
            Command::GetRange => "getrange",
            Command::Substr => "substr",
            Command::MGet => "mget",
            Command::StrLen => "strlen",
            Command::Set => "set",
            Command::SetNx => "setnx",
            Command::SetEx => "setex",
            Command::PSetEx => "psetex",
            Command::GetSet => "getset",
            Command::Append => "append",
            Command::SetRange => "setrange",
            Command::MSet => "mset",
            Command::MSetNx => "msetnx",
            Command::Incr => "incr",
            Command::Decr => "decr",
            Command::IncrBy => "incrby",
            Command::DecrBy => "decrby",
            Command::IncrByFloat => "incrbyfloat",
            Command::Del => "del",
            Command::Exists => "exists",
            Command::Ttl => "ttl",
            Command::PTtl => "pttl",
        }
    }

    /// Argument count including the command name. Negative values mean
    /// "at least that many".
    pub fn arity(&self) -> i32 {
        match self {
            Command::Get | Command::Incr | Command::Decr | Command::StrLen => 2,
            Command::Ttl | Command::PTtl => 2,
            Command::SetNx | Command::GetSet | Command::Append => 3,
            Command::IncrBy | Command::DecrBy | Command::IncrByFloat => 3,
            Command::SetEx | Command::PSetEx | Command::SetRange => 4,
            Command::GetRange | Command::Substr => 4,
            Command::Set | Command::MSet | Command::MSetNx => -3,
            Command::MGet | Command::Del | Command::Exists => -2,
        }
    }

    /// Whether the command may mutate the keyspace, and so must run on the
    /// writer thread.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Command::Get
                | Command::GetRange
                | Command::Substr
                | Command::MGet
                | Command::StrLen
                | Command::Exists
                | Command::Ttl
                | Command::PTtl
        )
    }

    pub fn check_arity(&self, argc: usize) -> bool {
        let arity = self.arity();
        let required = arity.unsigned_abs() as usize;
        if arity >= 0 {
            argc == required
        } else {
            argc >= required
        }
    }
}

/// The outcome of a write command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub reply: Reply,
    /// Canonical form to propagate instead of the command as received
    pub rewrite: Option<Vec<Vec<u8>>>,
}

impl From<Reply> for Executed {
    fn from(reply: Reply) -> Self {
        Executed {
            reply,
            rewrite: None,
        }
    }
}

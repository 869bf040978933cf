//! String command executor.
//!
//! Write commands run on the writer thread against the [`KeyspaceWriter`];
//! read commands run on any reader thread inside a [`ReadView`].
//!
//! Commands that change an existing string in place (APPEND, SETRANGE) never
//! touch a buffer readers may hold. They unshare the value, build the new
//! buffer aside, publish it, wait for a grace period and only then free the
//! old buffer. Integer counters outside the shared pool are updated with a
//! single atomic store instead.

use std::sync::Arc;

use quiver_core::{
    Error, EventClass, KeyspaceWriter, LongFloat, Object, PROTO_MAX_STRING, ReadView, Reply,
    SHARED_INTEGERS, StringRef, now_ms, parse_i64_strict, range_error,
};

use crate::command::Executed;

fn check_string_length(size: Option<usize>) -> Result<usize, Error> {
    match size {
        Some(n) if n <= PROTO_MAX_STRING => Ok(n),
        _ => Err(Error::string_too_long()),
    }
}

fn parse_i64_arg(arg: &[u8]) -> Result<i64, Error> {
    parse_i64_strict(arg).ok_or_else(Error::not_an_integer)
}

fn parse_float_arg(arg: &[u8]) -> Result<LongFloat, Error> {
    LongFloat::parse(arg).ok_or_else(Error::not_a_float)
}

/// Canonical integers are stored integer-encoded, small ones shared.
fn encode_value(ks: &KeyspaceWriter, value: &[u8]) -> Arc<Object> {
    match parse_i64_strict(value) {
        Some(v) => ks.create_integer(v),
        None => Arc::new(Object::raw(value)),
    }
}

/// Looks `key` up for writing: expires it if due, then checks that it holds
/// a string.
fn lookup_string<'a>(
    ks: &'a mut KeyspaceWriter,
    key: &[u8],
) -> Result<Option<StringRef<'a>>, Error> {
    ks.expire_if_needed(key);
    let ks: &'a KeyspaceWriter = ks;
    match ks.get(key) {
        None => Ok(None),
        Some(obj) => obj.as_string(ks).map(Some).ok_or_else(Error::wrong_type),
    }
}

fn read_string<'v>(view: &'v ReadView<'_>, key: &[u8]) -> Result<Option<StringRef<'v>>, Error> {
    match view.lookup(key) {
        None => Ok(None),
        Some(obj) => obj
            .as_string(view.guard())
            .map(Some)
            .ok_or_else(Error::wrong_type),
    }
}

/// Rewrites the string at `key` through a private copy.
///
/// The sequence is unshare, copy, edit, publish, grace period, free. The
/// change is counted as dirty the moment it becomes visible to readers.
///
/// # Returns
/// The length of the new value
fn edit_in_place(
    ks: &mut KeyspaceWriter,
    key: &[u8],
    edit: impl FnOnce(&mut Vec<u8>),
) -> Result<usize, Error> {
    let token = ks.unshare_string(key).ok_or_else(Error::wrong_type)?;
    let mut buf = token
        .object()
        .as_string(&*ks)
        .map(|s| s.to_vec())
        .unwrap_or_default();
    edit(&mut buf);
    let len = buf.len();

    match ks.publish_bytes(&token, buf) {
        Ok(old) => {
            ks.mark_dirty(1);
            ks.reclaim(old);
        }
        Err(buf) => {
            ks.overwrite(key, Arc::new(Object::raw(buf)));
            ks.mark_dirty(1);
        }
    }
    Ok(len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Always,
    /// Only set if the key does not exist
    Nx,
    /// Only set if the key already exists
    Xx,
}

#[derive(Debug, Clone, Copy)]
enum ExpireUnit {
    Seconds,
    Milliseconds,
}

struct SetArgs<'a> {
    command: &'static str,
    condition: Condition,
    key: &'a [u8],
    value: &'a [u8],
    expire: Option<(&'a [u8], ExpireUnit)>,
    ok_reply: Reply,
    abort_reply: Reply,
}

fn set_generic(ks: &mut KeyspaceWriter, args: SetArgs<'_>) -> Result<Executed, Error> {
    let mut ttl_ms = None;
    if let Some((arg, unit)) = args.expire {
        let invalid = || Error::out_of_range(format!("invalid expire time in {}", args.command));
        let n = parse_i64_arg(arg)?;
        if n <= 0 {
            return Err(invalid());
        }
        ttl_ms = Some(match unit {
            ExpireUnit::Seconds => n.checked_mul(1000).ok_or_else(invalid)?,
            ExpireUnit::Milliseconds => n,
        });
    }

    if args.condition != Condition::Always {
        ks.expire_if_needed(args.key);
        let exists = ks.get(args.key).is_some();
        let abort = match args.condition {
            Condition::Nx => exists,
            Condition::Xx => !exists,
            Condition::Always => false,
        };
        if abort {
            return Ok(args.abort_reply.into());
        }
    }

    let object = encode_value(ks, args.value);
    ks.set_key(args.key, object);
    ks.mark_dirty(1);
    if let Some(ms) = ttl_ms {
        ks.set_expire(args.key, now_ms().saturating_add(ms as u64));
    }
    ks.notify(EventClass::String, "set", args.key);
    if ttl_ms.is_some() {
        ks.notify(EventClass::Generic, "expire", args.key);
    }
    Ok(args.ok_reply.into())
}

/// SET key value [NX] [XX] [EX seconds] [PX milliseconds]
pub fn set_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let mut condition = Condition::Always;
    let mut expire = None;

    let mut j = 3;
    while j < argv.len() {
        let opt = argv[j].as_slice();
        let next = argv.get(j + 1);
        let ex = matches!(expire, Some((_, ExpireUnit::Seconds)));
        let px = matches!(expire, Some((_, ExpireUnit::Milliseconds)));

        if opt.eq_ignore_ascii_case(b"nx") && condition != Condition::Xx {
            condition = Condition::Nx;
        } else if opt.eq_ignore_ascii_case(b"xx") && condition != Condition::Nx {
            condition = Condition::Xx;
        } else if opt.eq_ignore_ascii_case(b"ex")
            && !px
            && let Some(next) = next
        {
            expire = Some((next.as_slice(), ExpireUnit::Seconds));
            j += 1;
        } else if opt.eq_ignore_ascii_case(b"px")
            && !ex
            && let Some(next) = next
        {
            expire = Some((next.as_slice(), ExpireUnit::Milliseconds));
            j += 1;
        } else {
            return Err(Error::syntax());
        }
        j += 1;
    }

    set_generic(
        ks,
        SetArgs {
            command: "set",
            condition,
            key: &argv[1],
            value: &argv[2],
            expire,
            ok_reply: Reply::Ok,
            abort_reply: Reply::Null,
        },
    )
}

/// SETNX key value
pub fn setnx_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    set_generic(
        ks,
        SetArgs {
            command: "setnx",
            condition: Condition::Nx,
            key: &argv[1],
            value: &argv[2],
            expire: None,
            ok_reply: Reply::Integer(1),
            abort_reply: Reply::Integer(0),
        },
    )
}

/// SETEX key seconds value
pub fn setex_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    set_generic(
        ks,
        SetArgs {
            command: "setex",
            condition: Condition::Always,
            key: &argv[1],
            value: &argv[3],
            expire: Some((&argv[2], ExpireUnit::Seconds)),
            ok_reply: Reply::Ok,
            abort_reply: Reply::Null,
        },
    )
}

/// PSETEX key milliseconds value
pub fn psetex_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    set_generic(
        ks,
        SetArgs {
            command: "psetex",
            condition: Condition::Always,
            key: &argv[1],
            value: &argv[3],
            expire: Some((&argv[2], ExpireUnit::Milliseconds)),
            ok_reply: Reply::Ok,
            abort_reply: Reply::Null,
        },
    )
}

/// GETSET key value
pub fn getset_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let key = &argv[1];
    let old = match lookup_string(ks, key)? {
        Some(s) => Reply::Bulk(s.to_vec()),
        None => Reply::Null,
    };

    let object = encode_value(ks, &argv[2]);
    ks.set_key(key, object);
    ks.mark_dirty(1);
    ks.notify(EventClass::String, "set", key);
    Ok(old.into())
}

/// SETRANGE key offset value
pub fn setrange_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let key = &argv[1];
    let value = &argv[3];
    let offset = parse_i64_arg(&argv[2])?;
    if offset < 0 {
        return range_error!("offset is out of range");
    }
    let offset = usize::try_from(offset).map_err(|_| Error::string_too_long())?;

    let total = match lookup_string(ks, key)?.map(|s| s.len()) {
        None => {
            if value.is_empty() {
                return Ok(Reply::Integer(0).into());
            }
            let total = check_string_length(offset.checked_add(value.len()))?;
            let mut buf = vec![0u8; total];
            buf[offset..].copy_from_slice(value);
            ks.add(key, Arc::new(Object::raw(buf)));
            ks.mark_dirty(1);
            total
        }
        Some(len) => {
            if value.is_empty() {
                return Ok(Reply::Integer(len as i64).into());
            }
            let end = check_string_length(offset.checked_add(value.len()))?;
            edit_in_place(ks, key, |buf| {
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[offset..end].copy_from_slice(value);
            })?
        }
    };

    ks.notify(EventClass::String, "setrange", key);
    Ok(Reply::Integer(total as i64).into())
}

/// APPEND key value
pub fn append_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let key = &argv[1];
    let value = &argv[2];

    let total = match lookup_string(ks, key)?.map(|s| s.len()) {
        None if value.is_empty() => return Ok(Reply::Integer(0).into()),
        None => {
            ks.add(key, Arc::new(Object::raw(value.as_slice())));
            ks.mark_dirty(1);
            value.len()
        }
        Some(len) => {
            check_string_length(len.checked_add(value.len()))?;
            edit_in_place(ks, key, |buf| buf.extend_from_slice(value))?
        }
    };

    ks.notify(EventClass::String, "append", key);
    Ok(Reply::Integer(total as i64).into())
}

/// MSET and MSETNX share everything but the existence check.
fn mset_generic(ks: &mut KeyspaceWriter, argv: &[Vec<u8>], nx: bool) -> Result<Executed, Error> {
    if argv.len() % 2 == 0 {
        return range_error!("wrong number of arguments for MSET");
    }

    if nx {
        let mut busy = 0;
        for key in argv[1..].iter().step_by(2) {
            ks.expire_if_needed(key);
            if ks.get(key).is_some() {
                busy += 1;
            }
        }
        if busy > 0 {
            return Ok(Reply::Integer(0).into());
        }
    }

    for pair in argv[1..].chunks_exact(2) {
        let object = encode_value(ks, &pair[1]);
        ks.set_key(&pair[0], object);
        ks.notify(EventClass::String, "set", &pair[0]);
    }
    ks.mark_dirty(((argv.len() - 1) / 2) as u64);

    Ok(if nx { Reply::Integer(1) } else { Reply::Ok }.into())
}

/// MSET key value [key value ...]
pub fn mset_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    mset_generic(ks, argv, false)
}

/// MSETNX key value [key value ...]
pub fn msetnx_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    mset_generic(ks, argv, true)
}

fn incr_decr(ks: &mut KeyspaceWriter, key: &[u8], incr: i64) -> Result<Executed, Error> {
    let (exists, old) = match lookup_string(ks, key)? {
        Some(s) => (true, s.parse_i64()?),
        None => (false, 0),
    };

    if (incr < 0 && old < 0 && incr < i64::MIN - old)
        || (incr > 0 && old > 0 && incr > i64::MAX - old)
    {
        return range_error!("increment or decrement would overflow");
    }
    let value = old + incr;

    // Shared integers must never change under another key.
    let in_place = exists
        && !(0..SHARED_INTEGERS).contains(&value)
        && match ks.exclusive(key) {
            Some(token) => ks.set_int(&token, value),
            None => false,
        };
    if !in_place {
        let object = ks.create_integer(value);
        if exists {
            ks.overwrite(key, object);
        } else {
            ks.add(key, object);
        }
    }

    ks.mark_dirty(1);
    ks.notify(EventClass::String, "incrby", key);
    Ok(Reply::Integer(value).into())
}

/// INCR key
pub fn incr_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    incr_decr(ks, &argv[1], 1)
}

/// DECR key
pub fn decr_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    incr_decr(ks, &argv[1], -1)
}

/// INCRBY key increment
pub fn incrby_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let incr = parse_i64_arg(&argv[2])?;
    incr_decr(ks, &argv[1], incr)
}

/// DECRBY key decrement
pub fn decrby_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let decr = parse_i64_arg(&argv[2])?;
    let incr = decr
        .checked_neg()
        .ok_or_else(|| Error::out_of_range("decrement would overflow"))?;
    incr_decr(ks, &argv[1], incr)
}

/// INCRBYFLOAT key increment
///
/// Propagated as `SET key <result>` so replaying the journal never depends
/// on float formatting of the increment.
pub fn incrbyfloat_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let key = &argv[1];
    let (exists, old) = match lookup_string(ks, key)? {
        Some(s) => (true, s.parse_long_float()?),
        None => (false, LongFloat::ZERO),
    };
    let incr = parse_float_arg(&argv[2])?;

    let Some(value) = old.checked_add(incr) else {
        return range_error!("increment would produce NaN or Infinity");
    };

    let formatted = value.format().into_bytes();
    let object = Arc::new(Object::raw(formatted.as_slice()));
    if exists {
        ks.overwrite(key, object);
    } else {
        ks.add(key, object);
    }
    ks.mark_dirty(1);
    ks.notify(EventClass::String, "incrbyfloat", key);

    Ok(Executed {
        reply: Reply::Bulk(formatted.clone()),
        rewrite: Some(vec![b"SET".to_vec(), key.to_vec(), formatted]),
    })
}

/// GET key
pub fn get_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    Ok(match read_string(view, &argv[1])? {
        Some(s) => Reply::Bulk(s.to_vec()),
        None => Reply::Null,
    })
}

/// Normalizes an inclusive `start..=end` range the way GETRANGE does:
/// negative indexes count from the end, out of range indexes are clamped.
pub fn substr(bytes: &[u8], mut start: i64, mut end: i64) -> &[u8] {
    let len = bytes.len() as i64;
    if start < 0 && end < 0 && start > end {
        return &[];
    }
    if start < 0 {
        start += len;
    }
    if end < 0 {
        end += len;
    }
    start = start.max(0);
    end = end.max(0);
    if end >= len {
        end = len - 1;
    }
    if start > end || len == 0 {
        return &[];
    }
    &bytes[start as usize..=end as usize]
}

/// GETRANGE key start end (SUBSTR is an alias)
pub fn getrange_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    let start = parse_i64_arg(&argv[2])?;
    let end = parse_i64_arg(&argv[3])?;

    let Some(s) = read_string(view, &argv[1])? else {
        return Ok(Reply::Bulk(Vec::new()));
    };
    let digits;
    let bytes: &[u8] = match s {
        StringRef::Int(v) => {
            digits = v.to_string();
            digits.as_bytes()
        }
        StringRef::Raw(bytes) => bytes,
    };
    Ok(Reply::Bulk(substr(bytes, start, end).to_vec()))
}

/// MGET key [key ...]
///
/// Missing keys and keys of another type read as null.
pub fn mget_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    let items = argv[1..]
        .iter()
        .map(|key| {
            view.lookup(key)
                .and_then(|obj| obj.as_string(view.guard()))
                .map_or(Reply::Null, |s| Reply::Bulk(s.to_vec()))
        })
        .collect();
    Ok(Reply::Array(items))
}

/// STRLEN key
pub fn strlen_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    let len = read_string(view, &argv[1])?.map_or(0, |s| s.len());
    Ok(Reply::Integer(len as i64))
}

#[cfg(test)]
mod tests {
    use quiver_core::{EventLog, Keyspace, KeyspaceReader};

    use super::*;

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    struct Fixture {
        ks: KeyspaceWriter,
        reader: KeyspaceReader,
        log: Arc<EventLog>,
    }

    impl Fixture {
        fn new() -> Self {
            let log = Arc::new(EventLog::new());
            let ks = Keyspace::new(0, log.clone());
            let reader = ks.handle().reader();
            Fixture { ks, reader, log }
        }

        fn write(
            &mut self,
            f: fn(&mut KeyspaceWriter, &[Vec<u8>]) -> Result<Executed, Error>,
            parts: &[&str],
        ) -> Result<Reply, Error> {
            f(&mut self.ks, &args(parts)).map(|e| e.reply)
        }

        fn read(
            &self,
            f: fn(&ReadView<'_>, &[Vec<u8>]) -> Result<Reply, Error>,
            parts: &[&str],
        ) -> Result<Reply, Error> {
            let view = self.reader.view();
            f(&view, &args(parts))
        }

        fn get(&self, key: &str) -> Reply {
            self.read(get_command, &["GET", key]).unwrap()
        }
    }

    #[test]
    fn test_set_and_get() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(set_command, &["SET", "k", "v"]), Ok(Reply::Ok));
        assert_eq!(fx.get("k"), Reply::bulk("v"));
        assert_eq!(fx.get("missing"), Reply::Null);
        assert_eq!(fx.ks.dirty(), 1);
        assert_eq!(fx.log.names(), vec!["set"]);
    }

    #[test]
    fn test_set_options() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(set_command, &["SET", "k", "v", "XX"]), Ok(Reply::Null));
        assert_eq!(fx.write(set_command, &["SET", "k", "v", "nx"]), Ok(Reply::Ok));
        assert_eq!(fx.write(set_command, &["SET", "k", "w", "NX"]), Ok(Reply::Null));
        assert_eq!(fx.write(set_command, &["SET", "k", "w", "XX"]), Ok(Reply::Ok));
        assert_eq!(fx.get("k"), Reply::bulk("w"));

        assert_eq!(
            fx.write(set_command, &["SET", "k", "v", "NX", "XX"]),
            Err(Error::syntax())
        );
        assert_eq!(
            fx.write(set_command, &["SET", "k", "v", "EX", "10", "PX", "100"]),
            Err(Error::syntax())
        );
        assert_eq!(fx.write(set_command, &["SET", "k", "v", "EX"]), Err(Error::syntax()));
        assert_eq!(
            fx.write(set_command, &["SET", "k", "v", "bogus"]),
            Err(Error::syntax())
        );
        assert_eq!(
            fx.write(set_command, &["SET", "k", "v", "EX", "0"]),
            Err(Error::out_of_range("invalid expire time in set"))
        );
        assert_eq!(
            fx.write(set_command, &["SET", "k", "v", "PX", "abc"]),
            Err(Error::not_an_integer())
        );
    }

    #[test]
    fn test_set_with_expire() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(set_command, &["SET", "k", "v", "EX", "100"]), Ok(Reply::Ok));
        let when = fx.ks.get_expire(b"k").unwrap();
        assert!(when > now_ms() + 90_000);
        assert_eq!(fx.log.names(), vec!["set", "expire"]);

        // plain SET clears the time to live
        fx.write(set_command, &["SET", "k", "v2"]).unwrap();
        assert_eq!(fx.ks.get_expire(b"k"), None);

        assert_eq!(fx.write(psetex_command, &["PSETEX", "p", "1500", "v"]), Ok(Reply::Ok));
        assert!(fx.ks.get_expire(b"p").is_some());
        assert_eq!(
            fx.write(setex_command, &["SETEX", "s", "-1", "v"]),
            Err(Error::out_of_range("invalid expire time in setex"))
        );
        assert_eq!(
            fx.write(setex_command, &["SETEX", "s", "9223372036854775807", "v"]),
            Err(Error::out_of_range("invalid expire time in setex"))
        );
    }

    #[test]
    fn test_setnx() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(setnx_command, &["SETNX", "k", "a"]), Ok(Reply::Integer(1)));
        assert_eq!(fx.write(setnx_command, &["SETNX", "k", "b"]), Ok(Reply::Integer(0)));
        assert_eq!(fx.get("k"), Reply::bulk("a"));
        assert_eq!(fx.ks.dirty(), 1);
    }

    #[test]
    fn test_getset() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(getset_command, &["GETSET", "k", "a"]), Ok(Reply::Null));
        fx.write(set_command, &["SET", "k", "a", "EX", "100"]).unwrap();
        assert_eq!(
            fx.write(getset_command, &["GETSET", "k", "b"]),
            Ok(Reply::bulk("a"))
        );
        assert_eq!(fx.ks.get_expire(b"k"), None);
        assert_eq!(fx.get("k"), Reply::bulk("b"));
    }

    #[test]
    fn test_append() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(append_command, &["APPEND", "k", "Hello"]), Ok(Reply::Integer(5)));
        assert_eq!(
            fx.write(append_command, &["APPEND", "k", " World"]),
            Ok(Reply::Integer(11))
        );
        assert_eq!(fx.get("k"), Reply::bulk("Hello World"));
        assert_eq!(fx.log.names(), vec!["append", "append"]);
        assert_eq!(fx.ks.dirty(), 2);
        // the replaced buffer was freed after its grace period
        assert_eq!(fx.ks.stats().rcu.pending(), 0);
    }

    #[test]
    fn test_append_to_integer_keeps_ttl() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "n", "12", "EX", "100"]).unwrap();
        assert_eq!(fx.write(append_command, &["APPEND", "n", "34"]), Ok(Reply::Integer(4)));
        assert_eq!(fx.get("n"), Reply::bulk("1234"));
        assert!(fx.ks.get_expire(b"n").is_some());
    }

    #[test]
    fn test_append_to_shared_integer_leaves_pool_alone() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "a", "5"]).unwrap();
        fx.write(set_command, &["SET", "b", "5"]).unwrap();
        fx.write(append_command, &["APPEND", "a", "x"]).unwrap();
        assert_eq!(fx.get("a"), Reply::bulk("5x"));
        assert_eq!(fx.get("b"), Reply::bulk("5"));
    }

    #[test]
    fn test_setrange() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "k", "Hello World"]).unwrap();
        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "k", "6", "Redis"]),
            Ok(Reply::Integer(11))
        );
        assert_eq!(fx.get("k"), Reply::bulk("Hello Redis"));

        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "pad", "3", "ab"]),
            Ok(Reply::Integer(5))
        );
        assert_eq!(fx.get("pad"), Reply::Bulk(b"\0\0\0ab".to_vec()));

        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "k", "13", "!"]),
            Ok(Reply::Integer(14))
        );
        assert_eq!(fx.get("k"), Reply::Bulk(b"Hello Redis\0\0!".to_vec()));
    }

    #[test]
    fn test_setrange_edge_cases() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "none", "5", ""]),
            Ok(Reply::Integer(0))
        );
        assert_eq!(fx.get("none"), Reply::Null);

        fx.write(set_command, &["SET", "k", "abc"]).unwrap();
        let dirty = fx.ks.dirty();
        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "k", "10", ""]),
            Ok(Reply::Integer(3))
        );
        assert_eq!(fx.ks.dirty(), dirty);

        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "k", "-1", "x"]),
            Err(Error::out_of_range("offset is out of range"))
        );
        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "k", "536870911", "xx"]),
            Err(Error::string_too_long())
        );
        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "k", "1.5", "x"]),
            Err(Error::not_an_integer())
        );
        assert_eq!(fx.get("k"), Reply::bulk("abc"));
    }

    #[test]
    fn test_append_empty_to_missing_key() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.write(append_command, &["APPEND", "none", ""]),
            Ok(Reply::Integer(0))
        );
        assert_eq!(fx.get("none"), Reply::Null);
        assert_eq!(fx.ks.len(), 0);
        assert_eq!(fx.ks.dirty(), 0);
        assert!(fx.log.names().is_empty());
    }

    #[test]
    fn test_wrong_type() {
        let mut fx = Fixture::new();
        fx.ks.set_key(b"list", Arc::new(Object::list(vec![b"a".to_vec()])));
        assert_eq!(fx.write(append_command, &["APPEND", "list", "v"]), Err(Error::wrong_type()));
        assert_eq!(fx.write(getset_command, &["GETSET", "list", "v"]), Err(Error::wrong_type()));
        assert_eq!(fx.write(incr_command, &["INCR", "list"]), Err(Error::wrong_type()));
        assert_eq!(
            fx.write(setrange_command, &["SETRANGE", "list", "0", "x"]),
            Err(Error::wrong_type())
        );
        assert_eq!(fx.read(get_command, &["GET", "list"]), Err(Error::wrong_type()));
        assert_eq!(fx.read(strlen_command, &["STRLEN", "list"]), Err(Error::wrong_type()));
        assert_eq!(
            fx.read(getrange_command, &["GETRANGE", "list", "0", "1"]),
            Err(Error::wrong_type())
        );
        assert!(fx.log.is_empty());
    }

    #[test]
    fn test_getrange() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "k", "This is a string"]).unwrap();
        let range = |fx: &Fixture, s: &str, e: &str| {
            fx.read(getrange_command, &["GETRANGE", "k", s, e]).unwrap()
        };
        assert_eq!(range(&fx, "0", "3"), Reply::bulk("This"));
        assert_eq!(range(&fx, "-3", "-1"), Reply::bulk("ing"));
        assert_eq!(range(&fx, "0", "-1"), Reply::bulk("This is a string"));
        assert_eq!(range(&fx, "10", "100"), Reply::bulk("string"));
        assert_eq!(range(&fx, "-1", "-5"), Reply::bulk(""));
        assert_eq!(range(&fx, "5", "3"), Reply::bulk(""));
        assert_eq!(range(&fx, "-100", "2"), Reply::bulk("Thi"));

        fx.write(set_command, &["SET", "n", "12345"]).unwrap();
        assert_eq!(
            fx.read(getrange_command, &["SUBSTR", "n", "1", "2"]),
            Ok(Reply::bulk("23"))
        );
        assert_eq!(
            fx.read(getrange_command, &["GETRANGE", "missing", "0", "1"]),
            Ok(Reply::bulk(""))
        );
        assert_eq!(
            fx.read(getrange_command, &["GETRANGE", "k", "a", "1"]),
            Err(Error::not_an_integer())
        );
    }

    #[test]
    fn test_substr_normalization() {
        assert_eq!(substr(b"", 0, -1), b"");
        assert_eq!(substr(b"abc", i64::MIN, i64::MAX), b"abc");
        assert_eq!(substr(b"abc", 3, 5), b"");
        assert_eq!(substr(b"abc", -2, -2), b"b");
    }

    #[test]
    fn test_mset_mget() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.write(mset_command, &["MSET", "a", "1", "b", "2"]),
            Ok(Reply::Ok)
        );
        assert_eq!(fx.ks.dirty(), 2);
        fx.ks.set_key(b"l", Arc::new(Object::list(vec![])));
        assert_eq!(
            fx.read(mget_command, &["MGET", "a", "nope", "l", "b"]),
            Ok(Reply::Array(vec![
                Reply::bulk("1"),
                Reply::Null,
                Reply::Null,
                Reply::bulk("2"),
            ]))
        );
        assert_eq!(
            fx.write(mset_command, &["MSET", "a", "1", "b"]),
            Err(Error::out_of_range("wrong number of arguments for MSET"))
        );
    }

    #[test]
    fn test_msetnx() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.write(msetnx_command, &["MSETNX", "a", "1", "b", "2"]),
            Ok(Reply::Integer(1))
        );
        assert_eq!(
            fx.write(msetnx_command, &["MSETNX", "c", "3", "a", "9"]),
            Ok(Reply::Integer(0))
        );
        assert_eq!(fx.get("a"), Reply::bulk("1"));
        assert_eq!(fx.get("c"), Reply::Null);
    }

    #[test]
    fn test_incr_family() {
        let mut fx = Fixture::new();
        assert_eq!(fx.write(incr_command, &["INCR", "n"]), Ok(Reply::Integer(1)));
        assert_eq!(fx.write(incrby_command, &["INCRBY", "n", "41"]), Ok(Reply::Integer(42)));
        assert_eq!(fx.write(decr_command, &["DECR", "n"]), Ok(Reply::Integer(41)));
        assert_eq!(
            fx.write(decrby_command, &["DECRBY", "n", "50"]),
            Ok(Reply::Integer(-9))
        );
        assert_eq!(fx.get("n"), Reply::bulk("-9"));
        assert_eq!(fx.log.names(), vec!["incrby"; 4]);

        fx.write(set_command, &["SET", "s", "abc"]).unwrap();
        assert_eq!(fx.write(incr_command, &["INCR", "s"]), Err(Error::not_an_integer()));
        fx.write(set_command, &["SET", "z", "007"]).unwrap();
        assert_eq!(fx.write(incr_command, &["INCR", "z"]), Err(Error::not_an_integer()));
        assert_eq!(
            fx.write(incrby_command, &["INCRBY", "n", "+1"]),
            Err(Error::not_an_integer())
        );
    }

    #[test]
    fn test_incr_overflow() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "max", "9223372036854775807"]).unwrap();
        assert_eq!(
            fx.write(incr_command, &["INCR", "max"]),
            Err(Error::out_of_range("increment or decrement would overflow"))
        );
        fx.write(set_command, &["SET", "min", "-9223372036854775808"]).unwrap();
        assert_eq!(
            fx.write(decr_command, &["DECR", "min"]),
            Err(Error::out_of_range("increment or decrement would overflow"))
        );
        assert_eq!(
            fx.write(decrby_command, &["DECRBY", "x", "-9223372036854775808"]),
            Err(Error::out_of_range("decrement would overflow"))
        );
        assert_eq!(fx.get("max"), Reply::bulk("9223372036854775807"));
    }

    #[test]
    fn test_incr_in_place_outside_shared_range() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "big", "20000"]).unwrap();
        let before = fx.ks.get(b"big").map(|o| o as *const Object);
        fx.write(incr_command, &["INCR", "big"]).unwrap();
        let after = fx.ks.get(b"big").map(|o| o as *const Object);
        assert_eq!(before, after);
        assert_eq!(fx.get("big"), Reply::bulk("20001"));

        // crossing into the shared range swaps in the pooled object
        fx.write(set_command, &["SET", "edge", "10001"]).unwrap();
        fx.write(decrby_command, &["DECRBY", "edge", "2"]).unwrap();
        assert_eq!(fx.get("edge"), Reply::bulk("9999"));
        let pooled = fx.ks.create_integer(9999);
        assert!(std::ptr::eq(fx.ks.get(b"edge").unwrap(), &*pooled));
    }

    #[test]
    fn test_incrbyfloat() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "f", "10.50"]).unwrap();
        let executed = incrbyfloat_command(&mut fx.ks, &args(&["INCRBYFLOAT", "f", "0.1"])).unwrap();
        assert_eq!(executed.reply, Reply::bulk("10.6"));
        assert_eq!(executed.rewrite, Some(args(&["SET", "f", "10.6"])));

        assert_eq!(
            fx.write(incrbyfloat_command, &["INCRBYFLOAT", "f", "-10.6"]),
            Ok(Reply::bulk("0"))
        );
        assert_eq!(
            fx.write(incrbyfloat_command, &["INCRBYFLOAT", "new", "5.0e3"]),
            Ok(Reply::bulk("5000"))
        );
        assert_eq!(
            fx.write(incrbyfloat_command, &["INCRBYFLOAT", "f", "inf"]),
            Err(Error::out_of_range("increment would produce NaN or Infinity"))
        );
        assert_eq!(
            fx.write(incrbyfloat_command, &["INCRBYFLOAT", "f", "abc"]),
            Err(Error::not_a_float())
        );
        fx.write(set_command, &["SET", "s", "x"]).unwrap();
        assert_eq!(
            fx.write(incrbyfloat_command, &["INCRBYFLOAT", "s", "1"]),
            Err(Error::not_a_float())
        );
    }

    #[test]
    fn test_incrbyfloat_keeps_decimal_precision() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "f", "0.1"]).unwrap();
        let executed = incrbyfloat_command(&mut fx.ks, &args(&["INCRBYFLOAT", "f", "0.2"])).unwrap();
        assert_eq!(executed.reply, Reply::bulk("0.3"));
        assert_eq!(executed.rewrite, Some(args(&["SET", "f", "0.3"])));
        assert_eq!(fx.get("f"), Reply::bulk("0.3"));

        fx.write(set_command, &["SET", "n", "3"]).unwrap();
        assert_eq!(
            fx.write(incrbyfloat_command, &["INCRBYFLOAT", "n", "1.1"]),
            Ok(Reply::bulk("4.1"))
        );
    }

    #[test]
    fn test_strlen() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "k", "hello"]).unwrap();
        fx.write(set_command, &["SET", "n", "-123"]).unwrap();
        assert_eq!(fx.read(strlen_command, &["STRLEN", "k"]), Ok(Reply::Integer(5)));
        assert_eq!(fx.read(strlen_command, &["STRLEN", "n"]), Ok(Reply::Integer(4)));
        assert_eq!(fx.read(strlen_command, &["STRLEN", "x"]), Ok(Reply::Integer(0)));
    }

    #[test]
    fn test_expired_key_reads_as_missing() {
        let mut fx = Fixture::new();
        fx.write(set_command, &["SET", "k", "v"]).unwrap();
        fx.ks.set_expire(b"k", now_ms().saturating_sub(5));
        assert_eq!(fx.get("k"), Reply::Null);
        assert_eq!(fx.write(append_command, &["APPEND", "k", "w"]), Ok(Reply::Integer(1)));
        assert_eq!(fx.get("k"), Reply::bulk("w"));
        assert!(fx.log.names().contains(&"expired"));
    }
}

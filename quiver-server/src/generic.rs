//! Key commands that work on any type.

use quiver_core::{Error, EventClass, KeyTtl, KeyspaceWriter, ReadView, Reply};

use crate::command::Executed;

/// DEL key [key ...]
pub fn del_command(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Result<Executed, Error> {
    let mut deleted = 0;
    for key in &argv[1..] {
        if ks.remove(key) {
            ks.mark_dirty(1);
            ks.notify(EventClass::Generic, "del", key);
            deleted += 1;
        }
    }
    Ok(Reply::Integer(deleted).into())
}

/// EXISTS key [key ...]
///
/// A key named more than once is counted every time.
pub fn exists_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    let count = argv[1..]
        .iter()
        .filter(|key| view.lookup(key).is_some())
        .count();
    Ok(Reply::Integer(count as i64))
}

fn ttl_generic(view: &ReadView<'_>, key: &[u8], millis: bool) -> Reply {
    match view.ttl_ms(key) {
        KeyTtl::Missing => Reply::Integer(-2),
        KeyTtl::Persistent => Reply::Integer(-1),
        KeyTtl::ExpiresIn(ms) if millis => Reply::Integer(ms as i64),
        KeyTtl::ExpiresIn(ms) => Reply::Integer(((ms + 500) / 1000) as i64),
    }
}

/// TTL key
pub fn ttl_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    Ok(ttl_generic(view, &argv[1], false))
}

/// PTTL key
pub fn pttl_command(view: &ReadView<'_>, argv: &[Vec<u8>]) -> Result<Reply, Error> {
    Ok(ttl_generic(view, &argv[1], true))
}

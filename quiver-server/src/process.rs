use quiver_core::{Error, KeyspaceReader, KeyspaceWriter, Reply};

use crate::{
    command::{Command, Executed},
    generic::{del_command, exists_command, pttl_command, ttl_command},
    strings::{
        append_command, decr_command, decrby_command, get_command, getrange_command,
        getset_command, incr_command, incrby_command, incrbyfloat_command, mget_command,
        mset_command, msetnx_command, psetex_command, set_command, setex_command, setnx_command,
        setrange_command, strlen_command,
    },
};

/// Where a request has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Mutating command, only the writer thread may run it
    Write,
    /// Read-only command; requests with equal `shard_key` land on the same
    /// reader
    Read { shard_key: u64 },
    /// Answered without touching the keyspace
    Reject(Reply),
}

/// Resolves the command and checks its arity.
///
/// # Arguments
/// * `argv` - Command name followed by its arguments
///
/// # Returns
/// The `Route` the request should take. Unknown commands and wrong argument
/// counts are rejected here so they never cross a thread boundary.
pub fn route(argv: &[Vec<u8>]) -> Route {
    let Some(name) = argv.first() else {
        return Route::Reject(Error::unknown_command(b"").into());
    };
    let Some(cmd) = Command::lookup(name) else {
        return Route::Reject(Error::unknown_command(name).into());
    };
    if !cmd.check_arity(argv.len()) {
        return Route::Reject(Error::arity(cmd.name()).into());
    }

    if cmd.is_write() {
        Route::Write
    } else {
        Route::Read {
            shard_key: shard_key(&argv[1]),
        }
    }
}

/// FNV-1a over the key, then folded the way per-core dispatch folds ids.
fn shard_key(key: &[u8]) -> u64 {
    let hash = key.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, &b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    });
    let mixed = hash.wrapping_mul(0x517c_c1b7_2722_0a95);
    mixed ^ (mixed >> 32)
}

/// Runs a mutating command on the writer.
///
/// Read-only commands are accepted too, so a writer without reader threads
/// can serve everything.
pub fn process_write(ks: &mut KeyspaceWriter, argv: &[Vec<u8>]) -> Executed {
    let name = argv.first().map_or(&[][..], Vec::as_slice);
    let cmd = match Command::lookup(name) {
        Some(cmd) if cmd.check_arity(argv.len()) => cmd,
        Some(cmd) => return Reply::from(Error::arity(cmd.name())).into(),
        None => return Reply::from(Error::unknown_command(name)).into(),
    };

    let result = match cmd {
        Command::Set => set_command(ks, argv),
        Command::SetNx => setnx_command(ks, argv),
        Command::SetEx => setex_command(ks, argv),
        Command::PSetEx => psetex_command(ks, argv),
        Command::GetSet => getset_command(ks, argv),
        Command::Append => append_command(ks, argv),
        Command::SetRange => setrange_command(ks, argv),
        Command::MSet => mset_command(ks, argv),
        Command::MSetNx => msetnx_command(ks, argv),
        Command::Incr => incr_command(ks, argv),
        Command::Decr => decr_command(ks, argv),
        Command::IncrBy => incrby_command(ks, argv),
        Command::DecrBy => decrby_command(ks, argv),
        Command::IncrByFloat => incrbyfloat_command(ks, argv),
        Command::Del => del_command(ks, argv),
        _ => {
            // The view closes before the writer can synchronize again.
            let reader = ks.handle().reader();
            return read_command(cmd, &reader, argv).into();
        }
    };

    result.unwrap_or_else(|e| Reply::from(e).into())
}

/// Runs a read-only command inside one read section.
pub fn process_read(reader: &KeyspaceReader, argv: &[Vec<u8>]) -> Reply {
    let name = argv.first().map_or(&[][..], Vec::as_slice);
    match Command::lookup(name) {
        Some(cmd) if cmd.is_write() => Error::out_of_range(format!(
            "'{}' cannot run on a reader thread",
            cmd.name()
        ))
        .into(),
        Some(cmd) if !cmd.check_arity(argv.len()) => Error::arity(cmd.name()).into(),
        Some(cmd) => read_command(cmd, reader, argv),
        None => Error::unknown_command(name).into(),
    }
}

fn read_command(cmd: Command, reader: &KeyspaceReader, argv: &[Vec<u8>]) -> Reply {
    let view = reader.view();
    let result = match cmd {
        Command::Get => get_command(&view, argv),
        Command::GetRange | Command::Substr => getrange_command(&view, argv),
        Command::MGet => mget_command(&view, argv),
        Command::StrLen => strlen_command(&view, argv),
        Command::Exists => exists_command(&view, argv),
        Command::Ttl => ttl_command(&view, argv),
        Command::PTtl => pttl_command(&view, argv),
        _ => Err(Error::unknown_command(cmd.name().as_bytes())),
    };
    result.unwrap_or_else(Reply::from)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quiver_core::{Keyspace, TracingNotifier};

    use super::*;

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_route() {
        assert_eq!(route(&args(&["SET", "k", "v"])), Route::Write);
        assert_eq!(route(&args(&["del", "k"])), Route::Write);
        assert!(matches!(route(&args(&["GET", "k"])), Route::Read { .. }));
        assert_eq!(
            route(&args(&["GET", "k"])),
            route(&args(&["STRLEN", "k"]))
        );
        assert_eq!(
            route(&args(&["NOPE", "k"])),
            Route::Reject(Reply::Error("ERR unknown command 'NOPE'".to_string()))
        );
        assert_eq!(
            route(&args(&["get"])),
            Route::Reject(Reply::Error(
                "ERR wrong number of arguments for 'get' command".to_string()
            ))
        );
        assert!(matches!(route(&[]), Route::Reject(_)));
    }

    #[test]
    fn test_shard_keys_spread() {
        let keys: std::collections::HashSet<u64> = (0..64)
            .map(|i| shard_key(format!("key:{i}").as_bytes()) % 4)
            .collect();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn test_process_write_and_read() {
        let mut ks = Keyspace::new(0, Arc::new(TracingNotifier));
        let reader = ks.handle().reader();

        let executed = process_write(&mut ks, &args(&["SET", "k", "hello"]));
        assert_eq!(executed.reply, Reply::Ok);
        assert_eq!(process_read(&reader, &args(&["GET", "k"])), Reply::bulk("hello"));
        assert_eq!(
            process_write(&mut ks, &args(&["GET", "k"])).reply,
            Reply::bulk("hello")
        );
        assert!(process_read(&reader, &args(&["SET", "k", "v"])).is_error());
        assert!(process_write(&mut ks, &args(&["INCR", "k"])).reply.is_error());
        assert!(process_write(&mut ks, &args(&["SET", "k"])).reply.is_error());
    }
}

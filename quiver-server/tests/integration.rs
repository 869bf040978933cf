#[cfg(test)]
mod integration {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread,
        time::Duration,
    };

    use libquiver::{Engine, EngineOptions, Route, process_read, process_write, route};
    use quiver_core::{EventLog, Keyspace, Reply, StringRef, TracingNotifier};

    const PATTERN: &[u8] = b"abcdefgh";

    macro_rules! argv {
        ($($s:expr),*) => {
            vec![$($s.as_bytes().to_vec()),*]
        };
    }

    #[test]
    fn append_under_concurrent_readers() {
        let mut ks = Keyspace::new(0, Arc::new(TracingNotifier));
        let handle = ks.handle();
        let stop = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicU64::new(0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                let stop = Arc::clone(&stop);
                let observed = Arc::clone(&observed);
                thread::spawn(move || {
                    let reader = handle.reader();
                    let mut last_len = 0;
                    while !stop.load(Ordering::Relaxed) {
                        let view = reader.view();
                        let Some(obj) = view.lookup(b"log") else {
                            continue;
                        };
                        let Some(StringRef::Raw(bytes)) = obj.as_string(view.guard()) else {
                            panic!("log must stay a raw string");
                        };
                        assert_eq!(bytes.len() % PATTERN.len(), 0);
                        assert!(bytes.chunks(PATTERN.len()).all(|c| c == PATTERN));
                        assert!(bytes.len() >= last_len);
                        last_len = bytes.len();
                        observed.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        let rounds = 2000;
        for i in 1..=rounds {
            let executed = process_write(&mut ks, &argv!["APPEND", "log", "abcdefgh"]);
            assert_eq!(executed.reply, Reply::Integer(i * PATTERN.len() as i64));
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        ks.synchronize();
        let stats = ks.stats();
        assert_eq!(stats.rcu.pending(), 0);
        assert_eq!(stats.rcu.published, stats.rcu.reclaimed);
        assert_eq!(stats.dirty, rounds as u64);
    }

    #[test]
    fn incr_under_concurrent_readers() {
        let mut ks = Keyspace::new(0, Arc::new(TracingNotifier));
        process_write(&mut ks, &argv!["SET", "n", "100000"]);
        let handle = ks.handle();
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let reader = handle.reader();
                let mut last = 0;
                while !stop.load(Ordering::Relaxed) {
                    let Reply::Bulk(value) = process_read(&reader, &argv!["GET", "n"]) else {
                        panic!("counter vanished");
                    };
                    let n: i64 = String::from_utf8(value).unwrap().parse().unwrap();
                    assert!(n >= last);
                    last = n;
                }
            })
        };

        for _ in 0..5000 {
            process_write(&mut ks, &argv!["INCR", "n"]);
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();

        let reader = ks.handle().reader();
        assert_eq!(process_read(&reader, &argv!["GET", "n"]), Reply::bulk("105000"));
    }

    #[test]
    fn routing_follows_command_table() {
        for write in [
            argv!["SET", "k", "v"],
            argv!["APPEND", "k", "v"],
            argv!["INCRBYFLOAT", "k", "1.5"],
            argv!["MSETNX", "a", "1"],
            argv!["DEL", "k"],
        ] {
            assert_eq!(route(&write), Route::Write);
        }
        for read in [
            argv!["GET", "k"],
            argv!["GETRANGE", "k", "0", "1"],
            argv!["MGET", "a", "b"],
            argv!["STRLEN", "k"],
            argv!["TTL", "k"],
        ] {
            assert!(matches!(route(&read), Route::Read { .. }));
        }
    }

    #[test]
    fn scenario_through_engine() {
        let (journal_tx, journal_rx) = crossbeam_channel::unbounded();
        let events = Arc::new(EventLog::new());
        let options = EngineOptions::default()
            .readers(2)
            .expire_interval(Duration::from_millis(20));
        let engine = Engine::start(options, events.clone(), Some(journal_tx)).unwrap();
        let run = |argv: Vec<Vec<u8>>| engine.execute_blocking(argv);

        assert_eq!(run(argv!["SETRANGE", "pad", "5", "hello"]), Reply::Integer(10));
        assert_eq!(
            run(argv!["GET", "pad"]),
            Reply::Bulk(b"\0\0\0\0\0hello".to_vec())
        );

        run(argv!["SET", "greeting", "Hello World"]);
        assert_eq!(run(argv!["GETRANGE", "greeting", "-3", "-1"]), Reply::bulk("rld"));
        assert_eq!(run(argv!["GETRANGE", "greeting", "5", "2"]), Reply::bulk(""));

        assert_eq!(run(argv!["INCR", "c"]), Reply::Integer(1));
        assert_eq!(run(argv!["INCR", "c"]), Reply::Integer(2));
        assert_eq!(run(argv!["INCRBY", "c", "-5"]), Reply::Integer(-3));

        assert_eq!(run(argv!["MSETNX", "a", "1", "b", "2"]), Reply::Integer(1));
        assert_eq!(run(argv!["MSETNX", "a", "9", "c2", "3"]), Reply::Integer(0));
        assert_eq!(run(argv!["GET", "a"]), Reply::bulk("1"));
        assert_eq!(run(argv!["EXISTS", "c2"]), Reply::Integer(0));

        run(argv!["SET", "max", "9223372036854775807"]);
        assert!(run(argv!["INCRBY", "max", "1"]).is_error());
        assert_eq!(run(argv!["GET", "max"]), Reply::bulk("9223372036854775807"));

        assert_eq!(run(argv!["INCRBYFLOAT", "f", "10.5"]), Reply::bulk("10.5"));
        engine.shutdown();

        let journal: Vec<_> = journal_rx.try_iter().map(|p| p.argv).collect();
        assert!(journal.contains(&argv!["SET", "f", "10.5"]));
        assert!(!journal.iter().any(|argv| argv[0] == b"INCRBYFLOAT"));
        assert_eq!(
            journal.iter().filter(|argv| argv[0] == b"MSETNX").count(),
            1
        );
        assert!(events.names().contains(&"setrange"));
    }

    #[test]
    fn set_is_idempotent() {
        let mut ks = Keyspace::new(0, Arc::new(TracingNotifier));
        let reader = ks.handle().reader();
        process_write(&mut ks, &argv!["SET", "k", "v"]);
        process_write(&mut ks, &argv!["SET", "k", "v"]);
        assert_eq!(ks.len(), 1);
        assert_eq!(process_read(&reader, &argv!["GET", "k"]), Reply::bulk("v"));
        assert_eq!(process_read(&reader, &argv!["TTL", "k"]), Reply::Integer(-1));

        let binary = vec![b"SET".to_vec(), b"bin".to_vec(), vec![0, 255, b'\r', b'\n']];
        process_write(&mut ks, &binary);
        assert_eq!(
            process_read(&reader, &argv!["GET", "bin"]),
            Reply::Bulk(vec![0, 255, b'\r', b'\n'])
        );
        process_write(&mut ks, &argv!["SET", "empty", ""]);
        assert_eq!(process_read(&reader, &argv!["GET", "empty"]), Reply::bulk(""));
    }

    #[tokio::test]
    async fn async_execute() {
        let engine = Engine::start(
            EngineOptions::default().readers(1),
            Arc::new(TracingNotifier),
            None,
        )
        .unwrap();

        assert_eq!(engine.execute(argv!["SET", "k", "v"]).await, Reply::Ok);
        assert_eq!(engine.execute(argv!["APPEND", "k", "w"]).await, Reply::Integer(2));
        assert_eq!(engine.execute(argv!["GET", "k"]).await, Reply::bulk("vw"));
        assert_eq!(
            engine.execute(argv!["GET"]).await,
            Reply::Error("ERR wrong number of arguments for 'get' command".to_string())
        );

        // joining blocks, keep it off the runtime threads
        tokio::task::spawn_blocking(move || engine.shutdown())
            .await
            .unwrap();
    }
}

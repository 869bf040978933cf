use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use libquiver::{Engine, EngineOptions};
use quiver_core::{Reply, TracingNotifier};
use rand::Rng;

#[derive(Debug, Parser)]
struct Cli {
    #[arg(short = 't', long = "threads", help = "Client threads issuing requests")]
    threads: Option<usize>,
    #[arg(short = 'd', long = "duration", help = "Test duration in seconds")]
    duration: Option<u64>,
    #[arg(long = "ratio", help = "Fraction of requests that are reads")]
    ratio: Option<f64>,
    #[arg(short = 'r', long = "readers", help = "Pinned reader threads in the engine")]
    readers: Option<usize>,
    #[arg(long = "value-size", help = "Upper bound of generated value sizes in bytes")]
    value_size: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Get,
    Set,
    Append,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Get => "GET",
            Op::Set => "SET",
            Op::Append => "APPEND",
        }
    }
}

fn random_data(max: usize) -> Vec<u8> {
    let allowed = ('a'..='z').map(|c| c as u8).collect::<Vec<u8>>();
    let n = rand::random_range(..max.max(1));
    (0..n)
        .map(|_| allowed[rand::random_range(..allowed.len())])
        .collect()
}

fn get_key() -> Vec<u8> {
    let mut allowed = ('a'..='z').collect::<Vec<char>>();
    let caps = ('A'..='Z').collect::<Vec<char>>();
    allowed.extend(caps);

    (0..5)
        .map(|_| allowed[rand::random_range(..allowed.len())] as u8)
        .collect()
}

struct Config {
    duration: Duration,
    operation_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
    read_latencies: Arc<parking_lot::Mutex<Vec<Duration>>>,
    write_latencies: Arc<parking_lot::Mutex<Vec<Duration>>>,
    mixed_ratio: f64,
    value_size: usize,
}

fn worker_thread(engine: &Engine, config: &Config) {
    let mut rng = rand::rng();
    let start_time = Instant::now();

    // pre generate some keys
    let keys: Vec<_> = (0..1000).map(|_| get_key()).collect();

    while start_time.elapsed() < config.duration {
        let key = keys[rng.random_range(..keys.len())].clone();
        let op = if rng.random::<f64>() < config.mixed_ratio {
            Op::Get
        } else if rng.random_bool(0.5) {
            Op::Set
        } else {
            Op::Append
        };

        let argv = match op {
            Op::Get => vec![op.name().as_bytes().to_vec(), key],
            Op::Set | Op::Append => vec![
                op.name().as_bytes().to_vec(),
                key,
                random_data(config.value_size),
            ],
        };

        let op_start = Instant::now();
        let reply = engine.execute_blocking(argv);
        let latency = op_start.elapsed();

        if let Reply::Error(_) = reply {
            config.error_count.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        match op {
            Op::Get => config.read_latencies.lock().push(latency),
            Op::Set | Op::Append => config.write_latencies.lock().push(latency),
        }
        config.operation_count.fetch_add(1, Ordering::Relaxed);
    }
}

fn average_micros(latencies: &[Duration]) -> f64 {
    latencies.iter().sum::<Duration>().as_micros() as f64 / latencies.len() as f64
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let thread_count = args.threads.unwrap_or(4);
    let duration_secs = args.duration.unwrap_or(10);
    let mixed_ratio = args.ratio.unwrap_or(0.7); // 70% read, 30% writes
    let value_size = args.value_size.unwrap_or(256);

    let mut options = EngineOptions::default();
    if let Some(readers) = args.readers {
        options = options.readers(readers);
    }

    println!("Starting performance test with:");
    println!("  - {thread_count} client threads");
    println!("  - {} reader threads", options.readers);
    println!("  - {duration_secs} seconds duration");
    println!(
        "  - {}% reads / {}% writes",
        (mixed_ratio * 100.0) as u32,
        ((1.0 - mixed_ratio) * 100.0) as u32
    );
    println!();

    let engine = Arc::new(Engine::start(options, Arc::new(TracingNotifier), None)?);

    let duration = Duration::from_secs(duration_secs);
    let operation_count = Arc::new(AtomicUsize::new(0));
    let error_count = Arc::new(AtomicUsize::new(0));
    let read_latencies = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let write_latencies = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut handles = Vec::new();

    let start_time = Instant::now();

    //create and start worker threads
    for _ in 0..thread_count {
        let config = Config {
            duration,
            operation_count: Arc::clone(&operation_count),
            error_count: Arc::clone(&error_count),
            read_latencies: Arc::clone(&read_latencies),
            write_latencies: Arc::clone(&write_latencies),
            mixed_ratio,
            value_size,
        };
        let engine = Arc::clone(&engine);

        let handle = thread::spawn(move || worker_thread(&engine, &config));
        handles.push(handle);
    }

    // show progress
    let progress_interval = Duration::from_secs(1);
    let mut last_ops = 0;

    while start_time.elapsed() < duration {
        thread::sleep(progress_interval);
        let current_ops = operation_count.load(Ordering::Relaxed);
        let ops_delta = current_ops - last_ops;
        last_ops = current_ops;

        println!(
            "Progress: {:.1}s / {:.1}s | Operations: {} | Rate: {} ops/sec",
            start_time.elapsed().as_secs_f64(),
            duration.as_secs_f64(),
            current_ops,
            ops_delta
        );
    }

    // wait for threads
    for handle in handles {
        if handle.join().is_err() {
            eprintln!("A client thread panicked");
        }
    }

    let total_time = start_time.elapsed();
    let total_errors = error_count.load(Ordering::Relaxed);
    let total_ops = operation_count.load(Ordering::Relaxed);

    // Calculate statistics
    println!("\n=== PERFORMANCE TEST RESULTS ===");
    println!("Total operations: {total_ops}");
    println!("Total errors: {total_errors}");
    println!("Total time: {:.2} seconds", total_time.as_secs_f64());
    println!(
        "Throughput: {:.2} operations/second",
        total_ops as f64 / total_time.as_secs_f64()
    );

    let read_lats = read_latencies.lock();
    if !read_lats.is_empty() {
        println!("\nREAD Latency:");
        println!("  Average: {:.2} µs", average_micros(&read_lats));
    }

    let write_lats = write_latencies.lock();
    if !write_lats.is_empty() {
        println!("\nWRITE Latency:");
        println!("  Average: {:.2} µs", average_micros(&write_lats));
    }

    println!("\n=== ENGINE ===");
    println!("{}", engine.stats());

    if let Ok(engine) = Arc::try_unwrap(engine) {
        engine.shutdown();
    }
    Ok(())
}

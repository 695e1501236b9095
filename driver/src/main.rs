use std::{
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use anyhow::{anyhow, bail};
use clap::Parser;
use pcq::Queue;
use rand::Rng;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

pub mod cli;
pub mod workload;

use cli::Args;
use workload::{consume, produce, Message, Tally};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if args.producers == 0 || args.consumers == 0 {
        bail!("need at least one producer and one consumer");
    }

    let exit_signal = Arc::new(AtomicBool::new(false));

    let e = exit_signal.clone();
    ctrlc::set_handler(move || {
        if e.swap(true, Ordering::Relaxed) {
            eprintln!("Killing");
            process::exit(1);
        } else {
            eprintln!("CTRL-C received, stopping producers (press again to kill)");
        }
    })?;

    let seed: u64 = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    println!("Seed: {seed}");

    let queue: Queue<Message> = Queue::new(args.capacity)?;
    info!(
        capacity = args.capacity,
        producers = args.producers,
        consumers = args.consumers,
        "queue ready"
    );

    let items = args.items;
    let start = Instant::now();
    let (produced, consumed) = thread::scope(|s| {
        let consumers: Vec<_> = (0..args.consumers)
            .map(|c| {
                let queue = &queue;
                s.spawn(move || consume(queue, c))
            })
            .collect();

        let producers: Vec<_> = (0..args.producers)
            .map(|p| {
                let (queue, exit_signal) = (&queue, &*exit_signal);
                s.spawn(move || produce(queue, p, items, seed, exit_signal))
            })
            .collect();

        let mut produced = Tally::default();
        for handle in producers {
            let Ok(tally) = handle.join() else {
                queue.close();
                bail!("producer panicked");
            };
            produced = produced.merge(tally);
        }

        // Every job is queued ahead of these, one per consumer
        for _ in 0..args.consumers {
            if queue.insert(Message::Stop).is_err() {
                break;
            }
        }

        let mut consumed = Tally::default();
        for handle in consumers {
            let tally = handle.join().map_err(|_| anyhow!("consumer panicked"))??;
            consumed = consumed.merge(tally);
        }

        anyhow::Ok((produced, consumed))
    })?;
    let elapsed = start.elapsed();

    // All threads are joined, nothing can reach the queue any more
    queue.destroy()?;

    if produced != consumed {
        bail!("delivery mismatch: produced {produced:?}, consumed {consumed:?}");
    }

    println!(
        "Moved {} items in {:.3}s ({:.0} items/s)",
        consumed.count,
        elapsed.as_secs_f64(),
        consumed.count as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}

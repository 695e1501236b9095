use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::bail;
use pcq::Queue;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Job {
    pub producer: usize,
    pub seq: usize,
    pub payload: u64,
}

#[derive(Debug)]
pub enum Message {
    Job(Box<Job>),
    /// Tells exactly one consumer to return.
    Stop,
}

/// Item count plus wrapping payload sum, compared between both sides.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub count: usize,
    pub checksum: u64,
}

impl Tally {
    fn add(&mut self, payload: u64) {
        self.count += 1;
        self.checksum = self.checksum.wrapping_add(payload);
    }

    pub fn merge(self, other: Tally) -> Tally {
        Tally {
            count: self.count + other.count,
            checksum: self.checksum.wrapping_add(other.checksum),
        }
    }
}

/// Inserts `items` jobs (unbounded when 0) until `exit_signal` is raised or
/// the queue is closed.
pub fn produce(
    queue: &Queue<Message>,
    producer: usize,
    items: usize,
    seed: u64,
    exit_signal: &AtomicBool,
) -> Tally {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(producer as u64));
    let mut tally = Tally::default();
    let mut seq = 0;

    while (items == 0 || seq < items) && !exit_signal.load(Ordering::Relaxed) {
        let payload: u64 = rng.gen();
        let job = Box::new(Job {
            producer,
            seq,
            payload,
        });

        if queue.insert(Message::Job(job)).is_err() {
            warn!(producer, seq, "queue closed, producer stopping early");
            break;
        }

        tally.add(payload);
        seq += 1;
    }

    debug!(producer, count = tally.count, "producer done");
    tally
}

/// Retrieves jobs until a stop message arrives.
///
/// A consumer that fails closes the queue so nobody stays blocked on it.
pub fn consume(queue: &Queue<Message>, consumer: usize) -> anyhow::Result<Tally> {
    let res = consume_until_stop(queue, consumer);
    if res.is_err() {
        queue.close();
    }
    res
}

fn consume_until_stop(queue: &Queue<Message>, consumer: usize) -> anyhow::Result<Tally> {
    let mut tally = Tally::default();
    let mut last_seq: HashMap<usize, usize> = HashMap::new();

    loop {
        let job = match queue.retrieve()? {
            Message::Job(job) => job,
            Message::Stop => break,
        };

        // retrievals by one consumer follow queue order, so each producer's
        // sequence numbers must strictly increase
        if let Some(prev) = last_seq.insert(job.producer, job.seq) {
            if prev >= job.seq {
                bail!(
                    "consumer {consumer} saw producer {} out of order: {prev} before {}",
                    job.producer,
                    job.seq
                );
            }
        }
        tally.add(job.payload);
    }

    debug!(consumer, count = tally.count, "consumer done");
    Ok(tally)
}

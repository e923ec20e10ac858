//! Benchmark: timer list under a keep-alive workload.
//!
//! Each round touches a random live timer (pushing it to the tail), as every
//! request on a connection does, and periodically expires the oldest ones.

use std::hint::black_box;
use std::time::{Duration, Instant};

use rand::Rng;

use tinyweb::timer::{TimerKey, TimerList};

const CONNECTIONS: usize = 10_000;
const TARGET_DURATION: Duration = Duration::from_secs(2);

fn main() {
    let mut rng = rand::thread_rng();
    let base = Instant::now();
    let mut list = TimerList::with_capacity(CONNECTIONS);
    let mut keys: Vec<TimerKey> = (0..CONNECTIONS)
        .map(|i| list.insert(base + Duration::from_micros(i as u64), i))
        .collect();

    let mut clock = base + Duration::from_micros(CONNECTIONS as u64);
    let start = Instant::now();
    let mut adjusts: u64 = 0;
    let mut expired: u64 = 0;

    while start.elapsed() < TARGET_DURATION {
        let slot = rng.gen_range(0..keys.len());
        clock += Duration::from_micros(1);
        black_box(list.adjust(keys[slot], clock));
        adjusts += 1;

        if adjusts % 1_000 == 0 {
            let cutoff = clock - Duration::from_micros(CONNECTIONS as u64 / 2);
            let mut gone = Vec::new();
            expired += list.tick(cutoff, |owner| gone.push(owner)) as u64;
            for owner in gone {
                keys[owner] = list.insert(clock, owner);
            }
        }
    }

    let elapsed = start.elapsed();
    eprintln!("timer_list: {adjusts} adjusts, {expired} expiries in {elapsed:?}");
    eprintln!(
        "  {:.0} adjust/s with {} live timers",
        adjusts as f64 / elapsed.as_secs_f64(),
        list.len()
    );
}

//! Randomised operation sequences against the timer list ordering invariant.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::seq::IteratorRandom;

use tinyweb::timer::{TimerKey, TimerList};

fn assert_sorted(list: &TimerList<u32>) {
    let expiries: Vec<Instant> = list.iter().map(|(at, _)| at).collect();
    assert!(
        expiries.windows(2).all(|w| w[0] <= w[1]),
        "timer list out of order"
    );
    assert_eq!(expiries.len(), list.len());
}

#[test]
fn random_operations_keep_list_sorted() {
    let base = Instant::now();
    let mut rng = rand::thread_rng();
    let mut list = TimerList::new();
    let mut live: HashMap<u32, TimerKey> = HashMap::new();
    let mut next_id = 0u32;

    for _ in 0..5_000 {
        match rng.gen_range(0..10) {
            0..=3 => {
                let at = base + Duration::from_millis(rng.gen_range(0..500));
                live.insert(next_id, list.insert(at, next_id));
                next_id += 1;
            }
            4..=6 => {
                if let Some((&id, &key)) = live.iter().choose(&mut rng) {
                    let current = list.expire_of(key).unwrap();
                    let later = current + Duration::from_millis(rng.gen_range(0..200));
                    assert!(list.adjust(key, later));
                    assert_eq!(list.owner(key), Some(&id));
                }
            }
            7..=8 => {
                if let Some(&id) = live.keys().choose(&mut rng) {
                    let key = live.remove(&id).unwrap();
                    assert_eq!(list.remove(key), Some(id));
                    assert_eq!(list.remove(key), None);
                }
            }
            _ => {
                let now = base + Duration::from_millis(rng.gen_range(0..300));
                let mut fired = Vec::new();
                list.tick(now, |id| fired.push(id));
                for id in &fired {
                    live.remove(id);
                }
                assert!(list.iter().all(|(at, _)| at > now));
            }
        }
        assert_sorted(&list);
        assert_eq!(list.len(), live.len());
    }
}

#[test]
fn tick_preserves_order_of_survivors() {
    let base = Instant::now();
    let mut list = TimerList::new();
    for (id, ms) in [(0u32, 40u64), (1, 10), (2, 30), (3, 10), (4, 50), (5, 30)] {
        list.insert(base + Duration::from_millis(ms), id);
    }
    let mut fired = Vec::new();
    list.tick(base + Duration::from_millis(30), |id| fired.push(id));
    assert_eq!(fired, vec![1, 3, 2, 5]);
    let rest: Vec<u32> = list.iter().map(|(_, id)| *id).collect();
    assert_eq!(rest, vec![0, 4]);
}

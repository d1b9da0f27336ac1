//! Integration tests of the operator vocabulary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quickcheck::{quickcheck, TestResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rivulet::testing::{StepVerifier, TestSubscriber};
use rivulet::{
    BufferOverflowStrategy, BufferPolicy, ErrorKind, Flux, FluxError, OverflowStrategy,
    VirtualTimeScheduler,
};

fn pipelines() -> Vec<(&'static str, Flux<i32>)> {
    vec![
        ("map", Flux::range(0, 50).map(|x| x * 2)),
        ("filter", Flux::range(0, 50).filter(|x| x % 3 == 0)),
        ("buffer", Flux::range(0, 50).buffer(4).map(|chunk| chunk.len() as i32)),
        ("flat_map", Flux::range(0, 10).flat_map(|x| Flux::range(x * 10, 3))),
        ("concat_map", Flux::range(0, 10).concat_map(|x| Flux::range(x, 4))),
        (
            "flat_map_sequential",
            Flux::range(0, 10).flat_map_sequential(|x| Flux::range(x, 2)),
        ),
        ("switch_map", Flux::range(0, 10).switch_map(|x| Flux::just(x))),
        ("merge", Flux::merge(vec![Flux::range(0, 10), Flux::range(100, 10)])),
        ("concat", Flux::concat(vec![Flux::range(0, 10), Flux::range(100, 10)])),
        (
            "zip",
            Flux::zip(vec![Flux::range(0, 20), Flux::range(100, 15)]).map(|pair| pair[0] + pair[1]),
        ),
        ("take", Flux::range(0, 50).take(7)),
        ("window", Flux::range(0, 23).window(5).concat_map(|w| w)),
        (
            "group_by",
            Flux::range(0, 30)
                .group_by(|x| x % 4)
                .flat_map(|group| group.collect_list().map(|items| items.len() as i32)),
        ),
        (
            "on_error_resume",
            Flux::range(0, 5)
                .concat_with(Flux::error(FluxError::msg("cut")))
                .on_error_resume(|_| Flux::range(10, 5)),
        ),
    ]
}

/// Random request patterns never make a stage deliver more than asked for,
/// and every pipeline ends with exactly one terminal signal.
#[test]
fn delivery_never_exceeds_demand() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for (name, flux) in pipelines() {
        for _ in 0..20 {
            let probe = TestSubscriber::with_request(0);
            flux.subscribe(probe.clone());
            let mut rounds = 0;
            while !probe.is_terminated() && rounds < 1000 {
                probe.request(rng.gen_range(0..4));
                rounds += 1;
            }
            assert!(probe.is_terminated(), "{} did not terminate", name);
            assert_eq!(probe.verify_contract(), Ok(()), "{}", name);
        }
    }
}

#[test]
fn one_terminal_signal_after_error() {
    fn check(len: u8, take: u8) -> bool {
        let source = Flux::range(0, len as usize).concat_with(Flux::error(FluxError::msg("end")));
        let flux = source
            .map(|x| x + 1)
            .filter(|x| x % 2 == 0)
            .concat_map(|x| Flux::range(x, 2))
            .take(take as u64);
        let probe = TestSubscriber::new();
        flux.subscribe(probe.clone());
        probe.is_terminated() && probe.verify_contract().is_ok()
    }
    quickcheck(check as fn(u8, u8) -> bool);
}

#[test]
fn buffer_chunk_counts() {
    fn check(len: u8, size: u8) -> TestResult {
        if size == 0 {
            return TestResult::discard();
        }
        let (len, size) = (len as usize, size as usize);
        let chunks = Flux::range(0, len)
            .buffer(size)
            .collect_list()
            .block_last()
            .ok()
            .flatten()
            .unwrap_or_default();
        let expected = (len + size - 1) / size;
        let last_ok = match chunks.last() {
            None => len == 0,
            Some(last) => last.len() == if len % size == 0 { size } else { len % size },
        };
        TestResult::from_bool(chunks.len() == expected && last_ok)
    }
    quickcheck(check as fn(u8, u8) -> TestResult);
}

fn is_prime(n: i32) -> bool {
    n > 1 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

fn prime_windows(cut_before: bool) -> Vec<Vec<i32>> {
    Flux::range(101, 20)
        .window_until(|&x| is_prime(x), cut_before)
        .concat_map(|w| w.collect_list())
        .collect_list()
        .block_last()
        .unwrap()
        .unwrap()
}

#[test]
fn window_until_cut_before_starts_at_primes() {
    let windows = prime_windows(true);
    assert_eq!(windows.len(), 5);
    assert!(windows.iter().all(|w| is_prime(w[0])));
    assert_eq!(windows.concat(), (101..121).collect::<Vec<_>>());
}

#[test]
fn window_until_cut_after_ends_at_primes() {
    let windows = prime_windows(false);
    let (last, closed) = windows.split_last().unwrap();
    assert!(closed.iter().all(|w| is_prime(*w.last().unwrap())));
    assert_eq!(last, &vec![114, 115, 116, 117, 118, 119, 120]);
    assert_eq!(windows.concat(), (101..121).collect::<Vec<_>>());
}

#[test]
fn zip_is_as_long_as_shortest() {
    StepVerifier::create(Flux::zip(vec![Flux::range(0, 3), Flux::range(0, 5)]))
        .expect_next_count(3)
        .verify_complete()
        .unwrap();
}

#[test]
fn merge_completes_after_both_sources() {
    StepVerifier::with_virtual_time(|vts| {
        let fast = Flux::interval(Duration::from_secs(1), vts.clone()).take(3);
        let slow = Flux::interval(Duration::from_secs(3), vts)
            .take(3)
            .map(|x| x + 100);
        Flux::merge(vec![fast, slow])
    })
    .expect_subscription()
    .then_await(Duration::from_secs(8))
    .expect_next_count(5)
    .expect_no_event(Duration::from_secs(1))
    .expect_next(102)
    .expect_complete()
    .verify()
    .unwrap();
}

#[test]
fn merge_counts_all_items() {
    StepVerifier::create(Flux::merge(vec![Flux::range(0, 3), Flux::range(10, 3)]))
        .expect_next_count(6)
        .verify_complete()
        .unwrap();
}

#[test]
fn retry_resubscribes_once() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = Flux::defer(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Flux::error(FluxError::msg("first attempt"))
        } else {
            Flux::from_iter(vec![1, 2])
        }
    });
    StepVerifier::create(flaky.retry(1))
        .expect_next_values(vec![1, 2])
        .verify_complete()
        .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn retry_gives_up() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let broken = Flux::defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Flux::<i32>::error(FluxError::msg("always"))
    });
    StepVerifier::create(broken.retry(1))
        .expect_error_matches(|e| e.to_string() == "always")
        .verify()
        .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn on_error_return_appends_fallback_value() {
    let source = Flux::from_iter(vec![100, 50]).concat_with(Flux::error(FluxError::msg("boom")));
    StepVerifier::create(source.on_error_return(0))
        .expect_next_values(vec![100, 50, 0])
        .verify_complete()
        .unwrap();
}

fn quotients() -> Flux<i32> {
    Flux::from_iter(vec![1, 2, 0, 5])
        .try_map(|x| 100i32.checked_div(x).ok_or_else(|| FluxError::msg("division by zero")))
}

#[test]
fn division_by_zero_fails() {
    StepVerifier::create(quotients())
        .expect_next_values(vec![100, 50])
        .expect_error_kind(ErrorKind::Upstream)
        .verify()
        .unwrap();
}

#[test]
fn on_error_continue_skips_failing_element() {
    let skipped = Arc::new(Mutex::new(Vec::new()));
    let log = skipped.clone();
    let flux = quotients().on_error_continue(move |error, element| {
        log.lock()
            .unwrap()
            .push((error.to_string(), element.downcast_ref::<i32>().copied()));
    });
    StepVerifier::create(flux)
        .expect_next_values(vec![100, 50, 20])
        .verify_complete()
        .unwrap();
    assert_eq!(
        *skipped.lock().unwrap(),
        vec![("division by zero".to_string(), Some(0))]
    );
}

#[test]
fn timeout_fires_before_late_item() {
    StepVerifier::with_virtual_time(|vts| {
        Flux::just(1)
            .delay_elements(Duration::from_millis(1000), vts.clone())
            .timeout(Duration::from_millis(500), vts)
    })
    .expect_subscription()
    .expect_no_event(Duration::from_millis(500))
    .expect_error_kind(ErrorKind::Timeout)
    .then_await(Duration::from_secs(1))
    .verify()
    .unwrap();
}

#[test]
fn finished_timeouts_leave_no_timers_behind() {
    let vts = VirtualTimeScheduler::new();
    for _ in 0..1000 {
        let last = Flux::just(1)
            .timeout(Duration::from_secs(3600), vts.clone())
            .block_last();
        assert_eq!(last.ok().flatten(), Some(1));
    }
    assert_eq!(vts.pending(), 0);
}

#[test]
fn switch_map_drops_superseded_items_under_bounded_demand() {
    StepVerifier::create(Flux::range(0, 2).switch_map(|x| Flux::range(x * 10, 3)))
        .with_initial_request(1)
        .expect_next(0)
        .then_request(10)
        .expect_next_values(vec![10, 11, 12])
        .verify_complete()
        .unwrap();
}

#[test]
fn interval_take_two() {
    StepVerifier::with_virtual_time(|vts| Flux::interval(Duration::from_secs(1), vts).take(2))
        .expect_subscription()
        .expect_no_event(Duration::from_secs(1))
        .expect_next(0)
        .expect_no_event(Duration::from_secs(1))
        .expect_next(1)
        .verify_complete()
        .unwrap();
}

fn counted(calls: &Arc<AtomicUsize>) -> Flux<i32> {
    let calls = calls.clone();
    Flux::generate(
        || 0,
        move |n, sink| {
            calls.fetch_add(1, Ordering::SeqCst);
            sink.next(n);
            if n == 2 {
                sink.complete();
            }
            Ok(n + 1)
        },
    )
}

#[test]
fn generate_runs_once_per_item() {
    let calls = Arc::new(AtomicUsize::new(0));
    StepVerifier::create(counted(&calls))
        .with_initial_request(2)
        .expect_next_values(vec![0, 1])
        .then_request(1)
        .expect_next(2)
        .verify_complete()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn take_and_limit_request_cap_upstream_demand() {
    for limit in [true, false] {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counted(&calls);
        let flux = if limit { source.limit_request(2) } else { source.take(2) };
        StepVerifier::create(flux)
            .expect_next_values(vec![0, 1])
            .verify_complete()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

fn one_to_ten(strategy: OverflowStrategy<i32>) -> Flux<i32> {
    Flux::create(
        |sink| {
            for i in 1..=10 {
                sink.next(i);
            }
            sink.complete();
            Ok(())
        },
        strategy,
    )
}

#[test]
fn create_with_error_strategy() {
    StepVerifier::create(one_to_ten(OverflowStrategy::Error))
        .with_initial_request(1)
        .expect_next(1)
        .expect_error_kind(ErrorKind::Overflow)
        .verify()
        .unwrap();
}

#[test]
fn create_with_bounded_buffer_drops_latest() {
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let log = dropped.clone();
    let policy = BufferPolicy::bounded(2)
        .strategy(BufferOverflowStrategy::DropLatest)
        .on_overflow(move |item| log.lock().unwrap().push(item));
    StepVerifier::create(one_to_ten(OverflowStrategy::Buffer(policy)))
        .with_initial_request(0)
        .expect_subscription()
        .then_request(10)
        .expect_next_values(vec![1, 2])
        .verify_complete()
        .unwrap();
    assert_eq!(*dropped.lock().unwrap(), (3..=10).collect::<Vec<_>>());
}

#[test]
fn group_by_splits_by_key() {
    let mut groups = Flux::from_iter(vec!["apple", "avocado", "banana", "cherry", "blueberry"])
        .group_by(|word| word.chars().next())
        .flat_map(|group| {
            let key = *group.key();
            group.collect_list().map(move |words| (key, words))
        })
        .collect_list()
        .block_last()
        .unwrap()
        .unwrap();
    groups.sort();
    assert_eq!(
        groups,
        vec![
            (Some('a'), vec!["apple", "avocado"]),
            (Some('b'), vec!["banana", "blueberry"]),
            (Some('c'), vec!["cherry"]),
        ]
    );
}

//! Execution contexts and concurrent producers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rivulet::testing::{StepVerifier, TestSubscriber};
use rivulet::{Flux, OverflowStrategy, Schedulers};

fn thread_name() -> String {
    thread::current().name().unwrap_or("").to_string()
}

#[test]
fn only_first_subscribe_on_moves_the_source() {
    let names = Arc::new(Mutex::new(Vec::new()));
    let log = names.clone();
    let flux = Flux::range(0, 5)
        .do_on_next(move |_| log.lock().unwrap().push(thread_name()))
        .subscribe_on(Schedulers::new_single("near"))
        .map(|x| x * 2)
        .subscribe_on(Schedulers::new_single("far"));
    StepVerifier::create(flux)
        .expect_next_values(vec![0, 2, 4, 6, 8])
        .verify_complete()
        .unwrap();
    let names = names.lock().unwrap();
    assert_eq!(names.len(), 5);
    assert!(names.iter().all(|name| name.contains("near")), "{:?}", names);
}

#[test]
fn each_publish_on_owns_its_segment() {
    let segments = Arc::new(Mutex::new(Vec::new()));
    let (first, second) = (segments.clone(), segments.clone());
    let flux = Flux::range(0, 3)
        .publish_on(Schedulers::new_single("alpha"))
        .do_on_next(move |_| first.lock().unwrap().push(("a", thread_name())))
        .publish_on(Schedulers::new_single("beta"))
        .do_on_next(move |_| second.lock().unwrap().push(("b", thread_name())));
    StepVerifier::create(flux)
        .expect_next_count(3)
        .verify_complete()
        .unwrap();
    for (segment, name) in segments.lock().unwrap().iter() {
        let expected = if *segment == "a" { "alpha" } else { "beta" };
        assert!(name.contains(expected), "{} ran on {}", segment, name);
    }
}

#[test]
fn merge_of_sources_on_different_threads() {
    let left = Flux::range(0, 100).subscribe_on(Schedulers::new_single("left"));
    let right = Flux::range(1000, 100).subscribe_on(Schedulers::new_single("right"));
    let probe = TestSubscriber::new();
    Flux::merge(vec![left, right]).subscribe(probe.clone());
    assert!(probe.await_terminal(Duration::from_secs(10)));
    assert!(probe.is_complete());
    let mut values = probe.values();
    values.sort();
    let mut expected: Vec<i32> = (0..100).chain(1000..1100).collect();
    expected.sort();
    assert_eq!(values, expected);
    assert_eq!(probe.verify_contract(), Ok(()));
}

#[test]
fn concurrent_sink_calls_are_serialized() {
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let (flag, count) = (in_flight.clone(), overlaps.clone());
    let flux = Flux::create(
        |sink| {
            let producers: Vec<_> = (0..4)
                .map(|p| {
                    let sink = sink.clone();
                    thread::spawn(move || {
                        for i in 0..250 {
                            sink.next(p * 1000 + i);
                        }
                    })
                })
                .collect();
            thread::spawn(move || {
                for producer in producers {
                    let _ = producer.join();
                }
                sink.complete();
            });
            Ok(())
        },
        OverflowStrategy::Buffer(Default::default()),
    )
    .do_on_next(move |_| {
        if flag.swap(true, Ordering::SeqCst) {
            count.fetch_add(1, Ordering::SeqCst);
        }
        thread::yield_now();
        flag.store(false, Ordering::SeqCst);
    });
    let probe = TestSubscriber::new();
    flux.subscribe(probe.clone());
    assert!(probe.await_terminal(Duration::from_secs(10)));
    assert_eq!(probe.values().len(), 1000);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_from_another_thread_stops_delivery() {
    let probe = TestSubscriber::with_request(10);
    Flux::range(0, 1_000_000)
        .subscribe_on(Schedulers::new_single("producer"))
        .publish_on(Schedulers::new_single("consumer"))
        .subscribe(probe.clone());
    assert!(probe.await_count(10, Duration::from_secs(10)));
    probe.cancel();
    probe.request(1_000);
    thread::sleep(Duration::from_millis(50));
    assert!(probe.values().len() < 1_000_000);
    assert!(!probe.is_terminated());
}

#[test]
fn blocking_iterator_pulls_across_threads() {
    let items: Vec<i32> = Flux::range(0, 50)
        .subscribe_on(Schedulers::parallel())
        .into_blocking_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(items, (0..50).collect::<Vec<_>>());
}

#[test]
fn real_time_timeout() {
    let flux = Flux::<i32>::never()
        .timeout(Duration::from_millis(20), Schedulers::parallel());
    StepVerifier::create(flux)
        .expect_subscription()
        .expect_error()
        .verify_timeout(Duration::from_secs(5))
        .unwrap();
}

#[test]
fn zero_timeout_racing_subscription_switches_once() {
    for _ in 0..100 {
        let probe = TestSubscriber::new();
        Flux::<i32>::never()
            .timeout_or(Duration::ZERO, Flux::just(7), Schedulers::parallel())
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.values(), vec![7]);
        assert!(probe.is_complete());
    }
}

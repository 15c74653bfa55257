use std::time::Duration;

use futures::stream::StreamExt;
use testpump::{adapt_to_sync, AnyValue, AsyncSequence, Error, Value};

mod utils;
use utils::init_log;

fn as_u32(v: Value) -> u32 {
    *v.downcast_ref::<u32>().unwrap()
}

#[test]
fn async_stream_yields_every_element_in_order() {
    init_log();
    let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();
    let producer = std::thread::spawn(move || {
        for i in [10, 20, 30] {
            std::thread::sleep(Duration::from_millis(5));
            tx.unbounded_send(i).unwrap();
        }
    });

    let seq = adapt_to_sync(Some(AnyValue::new(AsyncSequence::new(rx))), "cases")
        .unwrap()
        .unwrap();
    let items: Vec<u32> = seq.map(|v| as_u32(v.unwrap())).collect();
    producer.join().unwrap();
    assert_eq!(items, vec![10, 20, 30]);
}

#[test]
fn elements_are_driven_on_the_consuming_thread() {
    init_log();
    let consumer = std::thread::current().id();
    let stream = futures::stream::iter(0..3u32).then(|i| async move { (i, std::thread::current().id()) });

    let seq = adapt_to_sync(Some(AnyValue::new(AsyncSequence::new(stream))), "cases")
        .unwrap()
        .unwrap();
    for item in seq {
        let item = item.unwrap();
        let (_, polled_on) = item
            .downcast_ref::<(u32, std::thread::ThreadId)>()
            .unwrap();
        assert_eq!(*polled_on, consumer);
    }
}

#[test]
fn failing_element_ends_the_sequence() {
    init_log();
    let stream = futures::stream::iter(0..5u32).map(|i| {
        if i == 2 {
            panic!("element {} is broken", i);
        }
        i
    });

    let mut seq = adapt_to_sync(Some(AnyValue::new(AsyncSequence::new(stream))), "cases")
        .unwrap()
        .unwrap();
    assert_eq!(as_u32(seq.next().unwrap().unwrap()), 0);
    assert_eq!(as_u32(seq.next().unwrap().unwrap()), 1);
    match seq.next() {
        Some(Err(Error::Failed(failure))) => {
            assert!(failure.is_panic());
            assert_eq!(failure.message(), "element 2 is broken");
        }
        other => panic!("unexpected {:?}", other.map(|r| r.map(|_| ()))),
    }
    assert!(seq.next().is_none());
}

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Token;
use warden::io::timeout::{MIN_DELAY, Timeout, TimeoutQueue};

fn counting(counter: &Rc<Cell<usize>>) -> impl FnOnce() + 'static {
    let counter = Rc::clone(counter);
    move || counter.set(counter.get() + 1)
}

#[test]
fn test_equal_deadlines_all_fire_once() {
    let mut queue = TimeoutQueue::new();
    let fired = Rc::new(Cell::new(0));
    let now = Instant::now();
    let deadline = now + Duration::from_secs(1);

    for _ in 0..1000 {
        queue.schedule(Timeout::new(deadline, counting(&fired)));
    }
    assert_eq!(queue.len(), 1000);

    queue.sweep(now);
    assert_eq!(fired.get(), 0, "nothing may fire before its deadline");

    let next = queue.sweep(deadline);
    assert_eq!(fired.get(), 1000);
    assert!(queue.is_empty());
    assert_eq!(next, None);

    queue.sweep(deadline + Duration::from_secs(1));
    assert_eq!(fired.get(), 1000);
}

#[test]
fn test_timeouts_fire_in_deadline_order() {
    let mut queue = TimeoutQueue::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let now = Instant::now();

    for (label, offset) in [("c", 30), ("a", 10), ("b", 20)] {
        let order = Rc::clone(&order);
        queue.schedule(Timeout::new(now + Duration::from_millis(offset), move || {
            order.borrow_mut().push(label)
        }));
    }
    let keep_alive_order = Rc::clone(&order);
    queue.schedule_keep_alive(
        Token(7),
        Timeout::new(now + Duration::from_millis(15), move || {
            keep_alive_order.borrow_mut().push("k")
        }),
    );

    queue.sweep(now + Duration::from_millis(40));
    assert_eq!(*order.borrow(), ["a", "k", "b", "c"]);
}

#[test]
fn test_second_keep_alive_replaces_first() {
    let mut queue = TimeoutQueue::new();
    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));
    let now = Instant::now();
    let conn = Token(3);

    queue.schedule_keep_alive(conn, Timeout::new(now + Duration::from_millis(5), counting(&first)));
    queue.schedule_keep_alive(conn, Timeout::new(now + Duration::from_millis(10), counting(&second)));

    assert!(queue.has_keep_alive(conn));
    assert_eq!(queue.keep_alive_len(), 1);
    assert_eq!(queue.len(), 1);

    queue.sweep(now + Duration::from_millis(20));
    assert_eq!(first.get(), 0);
    assert_eq!(second.get(), 1);
    assert!(!queue.has_keep_alive(conn));
}

#[test]
fn test_cancel_keep_alive() {
    let mut queue = TimeoutQueue::new();
    let fired = Rc::new(Cell::new(0));
    let now = Instant::now();

    queue.schedule_keep_alive(Token(1), Timeout::new(now, counting(&fired)));
    assert!(queue.cancel_keep_alive(Token(1)));
    assert!(!queue.cancel_keep_alive(Token(1)));

    queue.sweep(now + Duration::from_millis(1));
    assert_eq!(fired.get(), 0);
}

#[test]
fn test_cancelled_timeout_is_removed_without_running() {
    let mut queue = TimeoutQueue::new();
    let fired = Rc::new(Cell::new(0));
    let now = Instant::now();

    let handle = queue.schedule(Timeout::new(now, counting(&fired)));
    handle.cancel();
    assert!(handle.is_cancelled());
    assert_eq!(queue.len(), 1);

    queue.sweep(now);
    assert_eq!(fired.get(), 0);
    assert!(queue.is_empty());
}

#[test]
fn test_next_delay_is_floored() {
    let mut queue = TimeoutQueue::new();
    let now = Instant::now();

    assert_eq!(queue.next_delay(now), None);

    queue.schedule(Timeout::new(now + Duration::from_secs(5), || {}));
    let delay = queue.next_delay(now).unwrap();
    assert!(delay <= Duration::from_secs(5) && delay > Duration::from_secs(4));

    queue.schedule(Timeout::new(now, || {}));
    assert_eq!(queue.next_delay(now + Duration::from_millis(3)), Some(MIN_DELAY));
}

#[test]
fn test_panicking_timeout_does_not_stop_sweep() {
    let mut queue = TimeoutQueue::new();
    let fired = Rc::new(Cell::new(0));
    let now = Instant::now();

    queue.schedule(Timeout::new(now, || panic!("boom")));
    queue.schedule(Timeout::new(now, counting(&fired)));

    queue.sweep(now);
    assert_eq!(fired.get(), 1);
}

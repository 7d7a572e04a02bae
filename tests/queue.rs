use anyhow::Result;
use gyre::Reactor;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

fn wait_until_running(reactor: &Reactor) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !reactor.running() {
        assert!(Instant::now() < deadline, "reactor never started");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn queue_delivers_fifo_on_the_loop_thread() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let queue = reactor.create_queue::<u32>();
    let (tx, rx) = mpsc::channel();

    // Consumers first, values later, pushed from a foreign thread.
    for _ in 0..3 {
        let tx = tx.clone();
        queue.pop(move |r, value| {
            tx.send((value, r.in_loop_thread().unwrap())).unwrap();
        })?;
    }

    let pusher = {
        let queue = queue.clone();
        thread::spawn(move || {
            for value in [1, 2, 3] {
                queue.push(value).unwrap();
            }
        })
    };
    pusher.join().unwrap();

    for expected in [1, 2, 3] {
        let (value, on_loop) = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(value, expected);
        assert!(on_loop);
    }

    // A value with no consumer waits in the queue.
    queue.push(9)?;
    assert_eq!(queue.len(), 1);

    let (tx, rx) = mpsc::channel();
    queue.pop(move |_, value| {
        tx.send(value).unwrap();
    })?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 9);
    assert!(queue.is_empty());

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

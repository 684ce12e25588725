use std::time;

use linkwire::{Host, Terminal};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Binds a terminal on an ephemeral loopback port which admits every host.
pub fn bind_open() -> Terminal {
    Terminal::bind(("127.0.0.1", 0), |_: &Host| true).expect("failed to bind terminal")
}

/// Runs upkeep and drains inbound control traffic on every terminal until `done` returns true or
/// `timeout_ms` elapses. Returns the final value of `done`.
pub fn pump_until<F>(terminals: &mut [&mut Terminal], timeout_ms: u64, mut done: F) -> bool
where
    F: FnMut(&[&mut Terminal]) -> bool,
{
    let begin = time::Instant::now();

    while begin.elapsed() < time::Duration::from_millis(timeout_ms) {
        for terminal in terminals.iter_mut() {
            let now_ms = terminal.time_now_ms();
            terminal.upkeep(now_ms);

            if let Some(message) = terminal.receive().expect("receive failed") {
                panic!("unexpected message {:?}", message);
            }
        }

        if done(terminals) {
            return true;
        }

        std::thread::sleep(time::Duration::from_millis(1));
    }

    return done(terminals);
}

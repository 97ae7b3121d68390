use super::CancellationToken;
use nix::sys::signal::{SigSet, Signal};
use std::{io, process, thread};
use tracing::{error, warn};

/// exit code used when a second signal cuts the process short
pub const INTERRUPTED: i32 = 130;

/// Turn SIGINT and SIGTERM into a cancel of `token`.
///
/// Both signals are blocked for the calling thread and every thread spawned
/// afterwards, so this has to run before any other thread is started. A
/// dedicated thread then waits for them synchronously. The first signal
/// cancels the token, the dispatch stops at the next poll boundary. A second
/// one exits immediately.
pub fn cancel_on_signals(token: CancellationToken) -> io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;

    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let mut received = 0;

            loop {
                match signals.wait() {
                    Ok(signal) if received == 0 => {
                        received += 1;
                        warn!("Received {signal}, stopping after the current poll. Send it again to exit immediately");
                        token.cancel();
                    }
                    Ok(signal) => {
                        error!("Received {signal} again, exiting without waiting for the dispatch loop");
                        process::exit(INTERRUPTED);
                    }
                    Err(errno) => {
                        error!(errno = ?errno, "Failed to wait for signals");
                        return;
                    }
                }
            }
        })?;

    Ok(())
}

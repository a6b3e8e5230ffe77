use std::{io, sync::Once, thread};

use bft_views::types::data_types::ReplicaID;
use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with level `level` and above.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

// Log a step of a test, optionally on behalf of a replica.
pub(crate) fn log_with_context(replica: Option<ReplicaID>, message: &str) {
    match replica {
        Some(replica) => log::debug!("Replica {}: {}", replica, message),
        None => log::debug!("{}", message),
    }
}

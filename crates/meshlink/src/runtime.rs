//! Worker runtime for hosts that don't already run inside Tokio.

use std::io;

/// Builds a multi-threaded Tokio runtime whose threads are named
/// `meshlink-worker`.
///
/// `threads == 0` picks one worker per available core.
pub fn worker_runtime(threads: usize) -> io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("meshlink-worker");
    if threads > 0 {
        builder.worker_threads(threads);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_runtime_runs_tasks() {
        let runtime = worker_runtime(2).unwrap();
        let name = runtime.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .unwrap()
        });
        assert_eq!(name.as_deref(), Some("meshlink-worker"));
    }
}

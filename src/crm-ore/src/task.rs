//! A thin wrapper over `tokio::spawn` that names the task for `tracing`.

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns `f` as a named background task. The name is emitted as a `tracing`
/// span so it shows up in logs without every call site having to instrument
/// itself.
pub fn spawn<Name, Fut>(name: impl FnOnce() -> Name, f: Fut) -> JoinHandle<Fut::Output>
where
    Name: Into<String>,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = name().into();
    let span = tracing::info_span!("task", name = %name);
    tokio::spawn(tracing::Instrument::instrument(f, span))
}

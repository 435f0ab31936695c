use std::sync::LazyLock;

/// Tokio runtime used by async-backed storage adapters (native SFTP) to
/// bridge into synchronous call sites. Created lazily on first use.
pub(crate) static ASYNC_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime for storage backends")
});

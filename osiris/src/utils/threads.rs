use std::thread;

/// Spawns a thread carrying a name, so hung runs can be diagnosed from a
/// thread dump.
pub fn spawn_named_thread<F, T, S>(name: S, f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    S: ToString,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("thread config should be valid")
}

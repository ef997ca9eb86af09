/// Configuration passed to [`ServeContext::init`].
///
/// All fields have sensible defaults via [`Default`].
///
/// [`ServeContext::init`]: crate::api::ServeContext::init
#[derive(Debug, Clone)]
pub struct Config {
    /// Advisory upper bound, in bytes, on payloads held in router queues.
    /// Crossing it logs a warning; nothing is rejected. Defaults to 100 MiB.
    pub object_store_memory: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object_store_memory: 100 * 1024 * 1024,
        }
    }
}

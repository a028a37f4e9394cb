use crate::config::ClientConfig;

mod async_client;

fn memory_config() -> ClientConfig {
    ClientConfig::new("http://memory.test")
}

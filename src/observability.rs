//! Logging setup
//!
//! The library only emits `tracing` events; binaries and FFI hosts install a
//! subscriber through [`init_tracing`].

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global fmt subscriber at `level`.
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(LevelFilter::from_level(level))
        .try_init()
        .is_ok()
}

/// Map the C ABI's numeric levels, 0 (error) through 4 (trace)
pub fn level_from_index(index: i32) -> Level {
    match index {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        4 => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_index() {
        assert_eq!(level_from_index(0), Level::ERROR);
        assert_eq!(level_from_index(4), Level::TRACE);
        assert_eq!(level_from_index(42), Level::INFO);
    }

    #[test]
    fn test_second_init_reports_failure() {
        init_tracing(Level::WARN);
        assert!(!init_tracing(Level::DEBUG));
    }
}

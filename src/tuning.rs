//! Auto-tuning module
//!
//! Detects installed memory and picks a chunk cache ceiling when the
//! configuration leaves it at zero.

use sysinfo::System;

/// Share of physical RAM handed to the chunk cache
const CACHE_RAM_PERCENT: u64 = 25;

/// Never size the cache below this, even on tiny hosts
const MIN_CACHE_MB: u64 = 64;

/// Upper bound for the auto-tuned ceiling
const MAX_CACHE_MB: u64 = 64 * 1024;

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024
}

/// Cache ceiling for a host with `ram_mb` of memory
pub fn cache_mb_for(ram_mb: u64) -> u64 {
    // Operators and query executors need the rest of the memory
    (ram_mb * CACHE_RAM_PERCENT / 100).clamp(MIN_CACHE_MB, MAX_CACHE_MB)
}

/// Auto-tuned cache ceiling in MB for this host
pub fn auto_cache_mb() -> u64 {
    let ram_mb = detect_ram_mb();
    let cache_mb = cache_mb_for(ram_mb);
    tracing::debug!("Auto-tuned chunk cache: {} MB of {} MB RAM", cache_mb, ram_mb);
    cache_mb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mb_for() {
        assert_eq!(cache_mb_for(16 * 1024), 4 * 1024);
        assert_eq!(cache_mb_for(100), MIN_CACHE_MB);
        assert_eq!(cache_mb_for(1024 * 1024), MAX_CACHE_MB);
    }

    #[test]
    fn test_auto_cache_is_bounded() {
        let mb = auto_cache_mb();
        assert!(mb >= MIN_CACHE_MB && mb <= MAX_CACHE_MB);
    }
}
